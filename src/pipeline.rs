//! The opaque model pipeline capability.
//!
//! Training and inference are external concerns: the session core only needs
//! a capability that can suggest boxes for an image and turn approved
//! annotations into a run directory. Deployments without a model backend
//! install [`NullPipeline`] at composition time instead of probing for one at
//! runtime.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use crate::session::AnnotationRecord;
use crate::settings::SettingValue;
use crate::trigger::TrainingRequest;

/// One candidate box proposed by the model for an image.
#[derive(Debug, Clone, PartialEq)]
pub struct Suggestion {
    /// `[x, y, width, height]` in source-image pixel space.
    pub rect: [f32; 4],
    pub class: String,
    pub confidence: f32,
}

/// Cooperative stop flag handed to long-running pipeline operations.
///
/// The supervisor never kills a worker; the pipeline is expected to poll the
/// token between units of work and bail out early when it trips.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// The approved-subset snapshot handed to a training run.
#[derive(Debug, Clone, Default)]
pub struct TrainingDataset {
    pub image_paths: Vec<PathBuf>,
    pub annotations: BTreeMap<PathBuf, AnnotationRecord>,
}

impl TrainingDataset {
    pub fn is_empty(&self) -> bool {
        self.image_paths.is_empty()
    }

    pub fn len(&self) -> usize {
        self.image_paths.len()
    }
}

/// External model capability consumed by the supervisor and export planner.
///
/// Implementations run on the supervisor's worker thread; errors are plain
/// strings destined for user-facing notifications.
pub trait Pipeline: Send + Sync {
    /// Whether a real backend is present. [`NullPipeline`] reports `false`,
    /// which makes the supervisor refuse to start work.
    fn is_available(&self) -> bool {
        true
    }

    /// Propose boxes for `image` at or above `confidence_threshold`.
    fn predict(
        &self,
        image: &Path,
        confidence_threshold: f32,
    ) -> Result<Vec<Suggestion>, String>;

    /// Run one training session over `dataset` and return the run directory.
    /// `progress` relays per-step messages; `cancel` is polled cooperatively.
    fn train(
        &self,
        dataset: &TrainingDataset,
        request: &TrainingRequest,
        progress: &dyn Fn(String),
        cancel: &CancelToken,
    ) -> Result<PathBuf, String>;

    /// The stable class-name to id mapping used for dataset export.
    fn class_to_id_map(&self) -> BTreeMap<String, u32>;

    /// Inform the backend that the session's class list changed.
    fn update_classes(&self, classes: &[String]);

    /// Push the current effective settings into the backend.
    fn update_settings(&self, settings: &BTreeMap<String, SettingValue>);
}

/// No-op stand-in used when no model backend is configured.
#[derive(Debug, Default)]
pub struct NullPipeline;

impl Pipeline for NullPipeline {
    fn is_available(&self) -> bool {
        false
    }

    fn predict(&self, _image: &Path, _confidence_threshold: f32) -> Result<Vec<Suggestion>, String> {
        Err("Prediction unavailable: no model backend configured".to_string())
    }

    fn train(
        &self,
        _dataset: &TrainingDataset,
        _request: &TrainingRequest,
        _progress: &dyn Fn(String),
        _cancel: &CancelToken,
    ) -> Result<PathBuf, String> {
        Err("Training unavailable: no model backend configured".to_string())
    }

    fn class_to_id_map(&self) -> BTreeMap<String, u32> {
        BTreeMap::new()
    }

    fn update_classes(&self, _classes: &[String]) {}

    fn update_settings(&self, _settings: &BTreeMap<String, SettingValue>) {}
}
