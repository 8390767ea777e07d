//! End-to-end flow through the public API: directory load, approvals,
//! threshold-triggered training, run-dir persistence across a restart,
//! suggestions, and dataset export.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use snowbox::controller::{Controller, Notice};
use snowbox::export::{DatasetExporter, ExportPlan};
use snowbox::pipeline::{CancelToken, Pipeline, Suggestion, TrainingDataset};
use snowbox::session::{AnnotationRecord, BoundingBox};
use snowbox::tasks::TaskEvent;
use snowbox::trigger::TrainingRequest;
use tempfile::TempDir;

/// Pipeline double that writes real run directories under `runs_root`.
struct FakeDetector {
    runs_root: PathBuf,
    train_log: Mutex<Vec<(String, usize)>>,
}

impl FakeDetector {
    fn new(runs_root: PathBuf) -> Self {
        Self {
            runs_root,
            train_log: Mutex::new(Vec::new()),
        }
    }
}

impl Pipeline for FakeDetector {
    fn predict(&self, image: &Path, threshold: f32) -> Result<Vec<Suggestion>, String> {
        assert!(!image.as_os_str().is_empty());
        Ok(vec![Suggestion {
            rect: [5.0, 5.0, 50.0, 40.0],
            class: "cat".to_string(),
            confidence: threshold.max(0.5),
        }])
    }

    fn train(
        &self,
        dataset: &TrainingDataset,
        request: &TrainingRequest,
        progress: &dyn Fn(String),
        _cancel: &CancelToken,
    ) -> Result<PathBuf, String> {
        self.train_log
            .lock()
            .unwrap()
            .push((request.run_name_prefix.clone(), dataset.len()));
        for epoch in 1..=request.epochs {
            progress(format!("epoch {epoch}/{} complete", request.epochs));
        }
        let run_dir = self.runs_root.join(&request.run_name_prefix);
        std::fs::create_dir_all(&run_dir).map_err(|err| err.to_string())?;
        std::fs::write(run_dir.join("metrics.json"), b"{}").map_err(|err| err.to_string())?;
        Ok(run_dir)
    }

    fn class_to_id_map(&self) -> BTreeMap<String, u32> {
        BTreeMap::from([("cat".to_string(), 0)])
    }

    fn update_classes(&self, _classes: &[String]) {}

    fn update_settings(&self, _settings: &BTreeMap<String, snowbox::settings::SettingValue>) {}
}

struct DescriptorExporter;

impl DatasetExporter for DescriptorExporter {
    fn export(&self, plan: &ExportPlan, output_dir: &Path) -> Result<PathBuf, String> {
        std::fs::create_dir_all(output_dir).map_err(|err| err.to_string())?;
        let descriptor = output_dir.join("dataset.yaml");
        let body = format!(
            "images: {}\nclasses: {}\n",
            plan.image_paths.len(),
            plan.class_to_id.len()
        );
        std::fs::write(&descriptor, body).map_err(|err| err.to_string())?;
        Ok(descriptor)
    }
}

struct Harness {
    temp: TempDir,
    pipeline: Arc<FakeDetector>,
    controller: Controller,
}

impl Harness {
    fn with_images(count: usize) -> Self {
        let temp = tempfile::tempdir().expect("create tempdir");
        let image_dir = temp.path().join("images");
        std::fs::create_dir_all(&image_dir).expect("create image dir");
        for index in 0..count {
            std::fs::write(image_dir.join(format!("img_{index:03}.jpg")), b"jpeg").unwrap();
        }

        let pipeline = Arc::new(FakeDetector::new(temp.path().join("runs")));
        let mut controller = Controller::with_app_root(
            temp.path(),
            Arc::clone(&pipeline) as Arc<dyn Pipeline>,
            &["cat".to_string()],
        );
        controller
            .load_images_from_directory(&image_dir)
            .expect("load images");
        Self {
            temp,
            pipeline,
            controller,
        }
    }

    fn approve_all(&mut self) {
        let paths = self.controller.session().image_list().to_vec();
        for path in paths {
            let record = AnnotationRecord {
                boxes: vec![BoundingBox {
                    x: 2.0,
                    y: 2.0,
                    width: 30.0,
                    height: 20.0,
                    class: "cat".to_string(),
                }],
                approved: true,
                negative: false,
            };
            assert!(self.controller.add_annotation(&path, record));
        }
    }

    fn pump_until(&mut self, mut done: impl FnMut(&Notice) -> bool) -> Vec<Notice> {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut notices = Vec::new();
        while Instant::now() < deadline {
            notices.extend(self.controller.pump());
            if notices.iter().any(&mut done) {
                return notices;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("expected notice did not arrive in time");
    }
}

#[test]
fn twenty_approvals_train_once_and_the_run_dir_survives_restart() {
    let mut h = Harness::with_images(20);
    h.approve_all();
    assert_eq!(h.controller.session().approved_count(), 20);

    let notices = h.pump_until(|notice| {
        matches!(notice, Notice::Task(TaskEvent::TrainingFinished(_)))
    });
    let progressed = notices
        .iter()
        .any(|notice| matches!(notice, Notice::Task(TaskEvent::Progress(..))));
    assert!(progressed, "training progress should be relayed");

    let trained = h.pipeline.train_log.lock().unwrap().clone();
    assert_eq!(trained, vec![("mini_20".to_string(), 20)]);

    let run_dir = h
        .controller
        .session()
        .last_successful_run_dir()
        .expect("run dir recorded")
        .to_path_buf();
    assert!(run_dir.ends_with("mini_20"));
    assert!(run_dir.is_dir());

    // Persist and come back as a fresh process would.
    h.controller.shutdown();
    let pipeline = Arc::new(FakeDetector::new(h.temp.path().join("runs")));
    let mut restarted = Controller::with_app_root(
        h.temp.path(),
        pipeline as Arc<dyn Pipeline>,
        &["cat".to_string()],
    );
    restarted.load_session().expect("reload session");
    assert_eq!(restarted.session().approved_count(), 20);
    assert_eq!(
        restarted.session().last_successful_run_dir(),
        Some(run_dir.as_path())
    );
}

#[test]
fn suggestion_requests_deliver_candidate_boxes() {
    let mut h = Harness::with_images(2);
    let image = h.controller.session().current_image().unwrap().to_path_buf();
    h.controller.request_suggestion(image).expect("start prediction");
    assert!(h.controller.is_task_active());

    let notices = h.pump_until(|notice| {
        matches!(notice, Notice::Task(TaskEvent::PredictionFinished(_)))
    });
    let suggestions = notices
        .iter()
        .find_map(|notice| match notice {
            Notice::Task(TaskEvent::PredictionFinished(suggestions)) => Some(suggestions.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(suggestions[0].class, "cat");
    assert!(!h.controller.is_task_active());
}

#[test]
fn export_writes_a_descriptor_for_the_approved_subset() {
    let mut h = Harness::with_images(3);
    h.approve_all();
    let out_dir = h.temp.path().join("export");
    let descriptor = h
        .controller
        .export_dataset(&DescriptorExporter, &out_dir)
        .expect("export succeeds");
    assert!(descriptor.exists());
    let body = std::fs::read_to_string(descriptor).unwrap();
    assert!(body.contains("images: 3"));
}

#[test]
fn export_is_refused_with_nothing_approved() {
    let h = Harness::with_images(2);
    let out_dir = h.temp.path().join("export");
    assert!(h
        .controller
        .export_dataset(&DescriptorExporter, &out_dir)
        .is_err());
}
