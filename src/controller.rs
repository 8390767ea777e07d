//! Control-thread facade wiring settings, session, and tasks together.
//!
//! All mutation of the session aggregate funnels through this one
//! control-flow context; worker threads only ever talk back through the
//! supervisor's event channel. The embedding UI calls [`Controller::pump`]
//! regularly (per frame, per tick) to drain events: that is where scheduled
//! training requests actually start, where completed run directories land
//! back in the session, and where settings changes reach the model backend.

use std::{
    path::{Path, PathBuf},
    sync::{Arc, mpsc::Receiver},
    time::Duration,
};

use tracing::{info, warn};

use crate::app_dirs::{self, AppDirError};
use crate::export::{self, DatasetExporter, ExportError};
use crate::pipeline::{Pipeline, TrainingDataset};
use crate::session::{AnnotationRecord, SessionError, SessionEvent, SessionState};
use crate::settings::{SettingsEvent, SettingsStore, keys};
use crate::tasks::{StartRefusal, TaskEvent, TaskKind, TaskSupervisor};
use crate::trigger::{self, TrainingRequest};

/// Bounded wait for a cooperative worker stop during shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Settings keys the model backend cares about; changes to these are pushed
/// into the pipeline as they happen.
const PIPELINE_RELEVANT_KEYS: &[&str] = &[
    keys::BASE_MODEL,
    keys::IMG_SIZE,
    keys::EPOCHS_20,
    keys::LR_20,
    keys::EPOCHS_100,
    keys::LR_100,
    keys::AUG_FLIPUD,
    keys::AUG_FLIPLR,
    keys::AUG_DEGREES,
];

/// Notifications surfaced to the embedding layer by [`Controller::pump`].
#[derive(Debug, Clone)]
pub enum Notice {
    SettingsChanged { key: String },
    SessionChanged,
    /// A background task started (`true`) or reached a terminal state
    /// (`false`).
    TaskRunning(bool),
    Task(TaskEvent),
}

/// Owner of the whole session core composition.
pub struct Controller {
    settings: SettingsStore,
    session: SessionState,
    supervisor: TaskSupervisor,
    pipeline: Arc<dyn Pipeline>,
    settings_rx: Receiver<SettingsEvent>,
    session_rx: Receiver<SessionEvent>,
    queued: Vec<Notice>,
}

impl Controller {
    /// Build the composition rooted at the user's `.snowbox` directory.
    pub fn new(pipeline: Arc<dyn Pipeline>, initial_classes: &[String]) -> Result<Self, AppDirError> {
        let app_root = app_dirs::app_root_dir()?;
        Ok(Self::with_app_root(&app_root, pipeline, initial_classes))
    }

    /// Build the composition rooted at an explicit directory.
    pub fn with_app_root(
        app_root: &Path,
        pipeline: Arc<dyn Pipeline>,
        initial_classes: &[String],
    ) -> Self {
        let mut settings = SettingsStore::open(app_root);
        let settings_rx = settings.subscribe();
        let mut session = SessionState::new(settings.session_path(), initial_classes);
        let session_rx = session.subscribe();
        let supervisor = TaskSupervisor::new(Arc::clone(&pipeline));
        pipeline.update_classes(session.class_list());
        pipeline.update_settings(&settings.snapshot());
        info!(
            "Controller initialized; session path {}",
            session.session_path().display()
        );
        Self {
            settings,
            session,
            supervisor,
            pipeline,
            settings_rx,
            session_rx,
            queued: Vec::new(),
        }
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut SettingsStore {
        &mut self.settings
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut SessionState {
        &mut self.session
    }

    pub fn is_task_active(&self) -> bool {
        self.supervisor.is_active()
    }

    /// Drain all pending events and perform the plumbing they imply.
    pub fn pump(&mut self) -> Vec<Notice> {
        let mut notices = std::mem::take(&mut self.queued);

        while let Ok(SettingsEvent::Changed { key }) = self.settings_rx.try_recv() {
            self.apply_setting_change(&key);
            notices.push(Notice::SettingsChanged { key });
        }

        while let Ok(event) = self.session_rx.try_recv() {
            match event {
                SessionEvent::Changed => notices.push(Notice::SessionChanged),
                SessionEvent::TrainingDue(request) => {
                    self.launch_training(request, &mut notices);
                }
            }
        }

        for event in self.supervisor.poll_events() {
            if let TaskEvent::TrainingFinished(run_dir) = &event {
                self.session.set_last_run_dir(run_dir.clone());
            }
            let terminal = event.is_terminal();
            notices.push(Notice::Task(event));
            if terminal {
                notices.push(Notice::TaskRunning(false));
            }
        }

        notices
    }

    /// Load the session from the configured path, syncing the class list
    /// into the model backend when it changed.
    pub fn load_session(&mut self) -> Result<(), SessionError> {
        let path = self.settings.session_path();
        let classes_before = self.session.class_list().to_vec();
        self.session.load(&path)?;
        if self.session.class_list() != classes_before.as_slice() {
            self.pipeline.update_classes(self.session.class_list());
        }
        Ok(())
    }

    /// Synchronous save of the current aggregate.
    pub fn save_session(&self) {
        self.session.save();
    }

    /// Point the session at a directory of images. Propagates resource
    /// errors; see [`SessionState::load_images_from_directory`].
    pub fn load_images_from_directory(&mut self, dir: &Path) -> Result<(), SessionError> {
        self.session.load_images_from_directory(dir)?;
        self.settings.set(keys::LAST_IMAGE_DIR, dir);
        Ok(())
    }

    /// Store an annotation record. Trigger evaluation happens inside the
    /// session; any scheduled run starts on the next [`Self::pump`].
    pub fn add_annotation(&mut self, path: &Path, record: AnnotationRecord) -> bool {
        self.session.add_annotation(path, record, &self.settings)
    }

    /// Replace the class list, dropping orphaned boxes and informing the
    /// backend.
    pub fn update_classes(&mut self, classes: &[String]) {
        if self.session.update_classes(classes) {
            self.pipeline.update_classes(self.session.class_list());
        }
    }

    /// Ask the model for box suggestions on `image`.
    pub fn request_suggestion(&mut self, image: PathBuf) -> Result<(), StartRefusal> {
        let threshold = self.settings.get_f64(keys::CONFIDENCE_THRESHOLD, 0.25) as f32;
        self.supervisor.start_prediction(image, threshold)?;
        self.queued.push(Notice::TaskRunning(true));
        Ok(())
    }

    /// Manually start a minor-tier training run, bypassing the threshold
    /// check. Returns whether a run was started.
    pub fn force_mini_training(&mut self) -> bool {
        let Some(request) =
            trigger::forced_minor(&self.settings, self.session.approved_count())
        else {
            warn!("Force training aborted: no approved images");
            return false;
        };
        let mut notices = Vec::new();
        self.launch_training(request, &mut notices);
        let started = matches!(notices.first(), Some(Notice::TaskRunning(true)));
        self.queued.extend(notices);
        started
    }

    /// Export the approved subset through `exporter`.
    pub fn export_dataset(
        &self,
        exporter: &dyn DatasetExporter,
        output_dir: &Path,
    ) -> Result<PathBuf, ExportError> {
        export::run_export(&self.session, self.pipeline.as_ref(), exporter, output_dir)
    }

    /// Cooperatively stop any running worker, then save the session.
    pub fn shutdown(&mut self) {
        info!("Controller shutdown initiated");
        self.supervisor.cancel_and_wait(SHUTDOWN_TIMEOUT);
        self.session.save();
    }

    fn apply_setting_change(&mut self, key: &str) {
        if key == keys::SESSION_PATH {
            let path = self.settings.session_path();
            info!("Session path changed to {}", path.display());
            self.session.set_session_path(path);
        }
        if PIPELINE_RELEVANT_KEYS.contains(&key) {
            self.pipeline.update_settings(&self.settings.snapshot());
        }
    }

    fn launch_training(&mut self, request: TrainingRequest, notices: &mut Vec<Notice>) {
        let subset = self.session.export_approved_subset();
        let dataset = TrainingDataset {
            image_paths: subset.paths,
            annotations: subset.records,
        };
        let prefix = request.run_name_prefix.clone();
        match self.supervisor.start_training(dataset, request) {
            Ok(()) => notices.push(Notice::TaskRunning(true)),
            Err(refusal) => {
                warn!("Training run '{prefix}' not started: {refusal}");
                notices.push(Notice::Task(TaskEvent::Failed(
                    TaskKind::Training,
                    refusal.to_string(),
                )));
            }
        }
    }
}
