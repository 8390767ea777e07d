//! Single-flight supervision of background prediction/training tasks.
//!
//! At most one worker thread runs at a time. Results and progress flow back
//! over an internal channel that the control thread drains via
//! [`TaskSupervisor::poll_events`]; the supervisor transitions back to idle
//! *before* handing out a terminal event, so an observer reacting to "task
//! finished" can immediately start the next task. Worker panics become error
//! events; they never take the supervisor down with them.

use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    path::PathBuf,
    sync::{
        Arc,
        mpsc::{Receiver, Sender, channel},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::pipeline::{CancelToken, Pipeline, Suggestion, TrainingDataset};
use crate::trigger::TrainingRequest;

/// How long [`TaskSupervisor::poll_events`] waits for a worker that already
/// sent its terminal event to actually return.
const JOIN_GRACE: Duration = Duration::from_secs(5);

/// The two kinds of background work the supervisor runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Prediction,
    Training,
}

/// Notifications delivered to observers, in order: any number of
/// `Progress`, then exactly one terminal variant per task instance.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    Progress(TaskKind, String),
    /// Terminal: candidate boxes for the requested image.
    PredictionFinished(Vec<Suggestion>),
    /// Terminal: the completed run's output directory.
    TrainingFinished(PathBuf),
    /// Terminal: the worker reported or raised an error.
    Failed(TaskKind, String),
    /// Terminal: the worker stopped on request.
    Cancelled(TaskKind),
}

impl TaskEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskEvent::Progress(..))
    }

    pub fn kind(&self) -> TaskKind {
        match self {
            TaskEvent::Progress(kind, _)
            | TaskEvent::Failed(kind, _)
            | TaskEvent::Cancelled(kind) => *kind,
            TaskEvent::PredictionFinished(_) => TaskKind::Prediction,
            TaskEvent::TrainingFinished(_) => TaskKind::Training,
        }
    }
}

/// Why a `start_*` call was refused. A refusal changes no state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StartRefusal {
    #[error("Busy: another background task is running")]
    Busy,
    #[error("No model backend is configured")]
    PipelineUnavailable,
    #[error("No approved images available for training")]
    NoApprovedImages,
}

struct WorkerMessage {
    task_id: u64,
    event: TaskEvent,
}

struct RunningTask {
    kind: TaskKind,
    id: u64,
    cancel: CancelToken,
    handle: JoinHandle<()>,
}

/// Owner of the single background worker slot.
pub struct TaskSupervisor {
    pipeline: Arc<dyn Pipeline>,
    message_tx: Sender<WorkerMessage>,
    message_rx: Receiver<WorkerMessage>,
    running: Option<RunningTask>,
    pending: Vec<TaskEvent>,
    next_task_id: u64,
}

impl TaskSupervisor {
    pub fn new(pipeline: Arc<dyn Pipeline>) -> Self {
        let (message_tx, message_rx) = channel();
        Self {
            pipeline,
            message_tx,
            message_rx,
            running: None,
            pending: Vec::new(),
            next_task_id: 1,
        }
    }

    /// Non-blocking query of the task slot.
    pub fn is_active(&self) -> bool {
        self.running.is_some()
    }

    /// Launch a prediction for `image`. Never blocks; results arrive as
    /// events.
    pub fn start_prediction(
        &mut self,
        image: PathBuf,
        confidence_threshold: f32,
    ) -> Result<(), StartRefusal> {
        self.ensure_ready(TaskKind::Prediction)?;
        let id = self.next_id();
        let tx = self.message_tx.clone();
        let pipeline = Arc::clone(&self.pipeline);
        let cancel = CancelToken::new();
        let worker_cancel = cancel.clone();
        debug!("Starting prediction for {}", image.display());
        let handle = thread::spawn(move || {
            let send = |event: TaskEvent| {
                let _ = tx.send(WorkerMessage { task_id: id, event });
            };
            send(TaskEvent::Progress(
                TaskKind::Prediction,
                format!("Predicting boxes for {}", image.display()),
            ));
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                pipeline.predict(&image, confidence_threshold)
            }));
            send(terminal_event(TaskKind::Prediction, outcome, &worker_cancel, |suggestions| {
                TaskEvent::PredictionFinished(suggestions)
            }));
        });
        self.running = Some(RunningTask {
            kind: TaskKind::Prediction,
            id,
            cancel,
            handle,
        });
        Ok(())
    }

    /// Launch a training run over the approved snapshot. Refused while busy,
    /// without a backend, or with an empty snapshot (training on no data is
    /// refused, not silently run on stale data).
    pub fn start_training(
        &mut self,
        dataset: TrainingDataset,
        request: TrainingRequest,
    ) -> Result<(), StartRefusal> {
        self.ensure_ready(TaskKind::Training)?;
        if dataset.is_empty() {
            warn!(
                "Refusing training run '{}': no approved images",
                request.run_name_prefix
            );
            return Err(StartRefusal::NoApprovedImages);
        }
        let id = self.next_id();
        let tx = self.message_tx.clone();
        let pipeline = Arc::clone(&self.pipeline);
        let cancel = CancelToken::new();
        let worker_cancel = cancel.clone();
        info!(
            "Starting training run '{}' on {} approved images ({} epochs, lr {})",
            request.run_name_prefix,
            dataset.len(),
            request.epochs,
            request.learning_rate
        );
        let handle = thread::spawn(move || {
            let send = |event: TaskEvent| {
                let _ = tx.send(WorkerMessage { task_id: id, event });
            };
            send(TaskEvent::Progress(
                TaskKind::Training,
                format!(
                    "Training '{}' on {} images",
                    request.run_name_prefix,
                    dataset.len()
                ),
            ));
            let progress = |message: String| {
                let _ = tx.send(WorkerMessage {
                    task_id: id,
                    event: TaskEvent::Progress(TaskKind::Training, message),
                });
            };
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                pipeline.train(&dataset, &request, &progress, &worker_cancel)
            }));
            send(terminal_event(TaskKind::Training, outcome, &worker_cancel, |run_dir| {
                TaskEvent::TrainingFinished(run_dir)
            }));
        });
        self.running = Some(RunningTask {
            kind: TaskKind::Training,
            id,
            cancel,
            handle,
        });
        Ok(())
    }

    /// Drain worker messages, performing the idle transition before any
    /// terminal event is exposed. Events from retired tasks are dropped.
    pub fn poll_events(&mut self) -> Vec<TaskEvent> {
        let mut events = std::mem::take(&mut self.pending);
        while let Ok(message) = self.message_rx.try_recv() {
            if Some(message.task_id) != self.running.as_ref().map(|task| task.id) {
                debug!("Dropping event from a retired task");
                continue;
            }
            if message.event.is_terminal() {
                self.retire_running();
            }
            events.push(message.event);
        }
        events
    }

    /// Cooperatively stop the running worker, waiting up to `timeout`.
    ///
    /// The supervisor is idle when this returns regardless of whether the
    /// worker obliged; a worker that overruns is disowned and its late
    /// messages are discarded. Exactly one terminal event for the cancelled
    /// task is queued for the next [`Self::poll_events`] call.
    pub fn cancel_and_wait(&mut self, timeout: Duration) {
        let Some(task) = self.running.take() else {
            return;
        };
        info!("Cancelling running {:?} task", task.kind);
        task.cancel.cancel();
        if !join_with_timeout(task.handle, timeout) {
            warn!(
                "{:?} worker did not stop within {timeout:?}; proceeding with teardown",
                task.kind
            );
        }
        // Prefer the terminal event the worker itself managed to send.
        let mut terminal = None;
        while let Ok(message) = self.message_rx.try_recv() {
            if message.task_id != task.id {
                continue;
            }
            if message.event.is_terminal() {
                terminal = Some(message.event);
                break;
            }
            self.pending.push(message.event);
        }
        self.pending
            .push(terminal.unwrap_or(TaskEvent::Cancelled(task.kind)));
    }

    fn ensure_ready(&self, kind: TaskKind) -> Result<(), StartRefusal> {
        if let Some(task) = &self.running {
            warn!(
                "Refusing {kind:?} start: a {:?} task is already running",
                task.kind
            );
            return Err(StartRefusal::Busy);
        }
        if !self.pipeline.is_available() {
            warn!("Refusing {kind:?} start: pipeline capability unavailable");
            return Err(StartRefusal::PipelineUnavailable);
        }
        Ok(())
    }

    fn retire_running(&mut self) {
        if let Some(task) = self.running.take()
            && !join_with_timeout(task.handle, JOIN_GRACE)
        {
            warn!("{:?} worker lingered past its terminal event", task.kind);
        }
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_task_id;
        self.next_task_id += 1;
        id
    }
}

fn terminal_event<T>(
    kind: TaskKind,
    outcome: Result<Result<T, String>, Box<dyn std::any::Any + Send>>,
    cancel: &CancelToken,
    on_success: impl FnOnce(T) -> TaskEvent,
) -> TaskEvent {
    match outcome {
        Ok(Ok(value)) => {
            if cancel.is_cancelled() {
                TaskEvent::Cancelled(kind)
            } else {
                on_success(value)
            }
        }
        Ok(Err(message)) => {
            if cancel.is_cancelled() {
                TaskEvent::Cancelled(kind)
            } else {
                TaskEvent::Failed(kind, message)
            }
        }
        Err(_) => TaskEvent::Failed(kind, format!("{kind:?} worker panicked")),
    }
}

fn join_with_timeout(handle: JoinHandle<()>, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
    let _ = handle.join();
    true
}
