//! Read-only export planning for the approved annotation subset.
//!
//! The planner clones the approved entries and pairs them with the
//! pipeline's class-id mapping; the actual on-disk dataset layout belongs to
//! an external [`DatasetExporter`]. The plan is an independent view: export
//! never mutates the session, not even transiently.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use thiserror::Error;
use tracing::info;

use crate::pipeline::Pipeline;
use crate::session::{AnnotationRecord, SessionState};

/// Everything an exporter needs to lay a dataset down on disk.
#[derive(Debug, Clone)]
pub struct ExportPlan {
    /// Approved image paths, in deterministic order.
    pub image_paths: Vec<PathBuf>,
    /// The approved records, keyed by image path.
    pub annotations: BTreeMap<PathBuf, AnnotationRecord>,
    /// Class name to contiguous id, as the model understands it.
    pub class_to_id: BTreeMap<String, u32>,
}

/// Why an export could not be planned or performed.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("No approved annotations available to export")]
    NoApprovedImages,
    #[error("Class-id mapping unavailable from the model backend")]
    EmptyClassMap,
    #[error("Dataset export failed: {0}")]
    Exporter(String),
}

/// External collaborator that writes an [`ExportPlan`] to `output_dir` and
/// returns the path of the dataset descriptor it produced.
pub trait DatasetExporter {
    fn export(&self, plan: &ExportPlan, output_dir: &Path) -> Result<PathBuf, String>;
}

/// Build the approved-subset plan, or report why none can be built.
pub fn plan_export(
    session: &SessionState,
    pipeline: &dyn Pipeline,
) -> Result<ExportPlan, ExportError> {
    let subset = session.export_approved_subset();
    if subset.is_empty() {
        return Err(ExportError::NoApprovedImages);
    }
    let class_to_id = pipeline.class_to_id_map();
    if class_to_id.is_empty() {
        return Err(ExportError::EmptyClassMap);
    }
    Ok(ExportPlan {
        image_paths: subset.paths,
        annotations: subset.records,
        class_to_id,
    })
}

/// Plan and hand off to `exporter`, returning the descriptor path it reports.
pub fn run_export(
    session: &SessionState,
    pipeline: &dyn Pipeline,
    exporter: &dyn DatasetExporter,
    output_dir: &Path,
) -> Result<PathBuf, ExportError> {
    let plan = plan_export(session, pipeline)?;
    info!(
        "Exporting {} approved images to {}",
        plan.image_paths.len(),
        output_dir.display()
    );
    exporter
        .export(&plan, output_dir)
        .map_err(ExportError::Exporter)
}
