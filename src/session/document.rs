//! Serde types for the session JSON file.
//!
//! The document mirrors the on-disk shape exactly (including the `-1`
//! no-selection sentinel for `current_index`); repair of inconsistent
//! content happens in [`super::SessionState::load`], not here.

use std::{
    collections::BTreeMap,
    io::Write,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One axis-aligned box in source-image pixel space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    /// Class name; must appear in the session's class list to survive a
    /// class-list change.
    pub class: String,
}

impl BoundingBox {
    /// Geometry check: finite, non-negative origin, strictly positive size.
    pub fn is_well_formed(&self) -> bool {
        [self.x, self.y, self.width, self.height]
            .iter()
            .all(|value| value.is_finite())
            && self.x >= 0.0
            && self.y >= 0.0
            && self.width > 0.0
            && self.height > 0.0
    }
}

/// The reviewed annotation state of one image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnnotationRecord {
    #[serde(default)]
    pub boxes: Vec<BoundingBox>,
    /// Reviewed and final.
    #[serde(default)]
    pub approved: bool,
    /// Explicitly contains no object of interest. Implies empty `boxes`.
    #[serde(default)]
    pub negative: bool,
}

impl AnnotationRecord {
    /// Structural validity: every box has sane geometry.
    pub fn is_well_formed(&self) -> bool {
        self.boxes.iter().all(BoundingBox::is_well_formed)
    }

    /// Producer invariant: a negative image carries no boxes. Violations are
    /// flagged by callers rather than silently trusted.
    pub fn is_consistent(&self) -> bool {
        !self.negative || self.boxes.is_empty()
    }
}

/// Serialized form of the session aggregate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionDocument {
    #[serde(default)]
    pub image_list: Vec<PathBuf>,
    #[serde(default)]
    pub annotations: BTreeMap<PathBuf, AnnotationRecord>,
    #[serde(default = "no_selection")]
    pub current_index: i64,
    #[serde(default)]
    pub class_list: Vec<String>,
    #[serde(default)]
    pub last_successful_run_dir: Option<PathBuf>,
}

fn no_selection() -> i64 {
    -1
}

/// Errors from reading or writing the session file.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Failed to read session file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Session file {path} is not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Failed to write session file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to serialize session: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Image directory not found: {path}")]
    DirectoryNotFound { path: PathBuf },
    #[error("Failed to list image directory {path}: {source}")]
    ListDirectory {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Parse the document at `path`. The caller decides how a missing file is
/// treated, so this errors on it.
pub fn read_document(path: &Path) -> Result<SessionDocument, SessionError> {
    let text = std::fs::read_to_string(path).map_err(|source| SessionError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| SessionError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Write the document atomically, creating the parent directory if missing.
pub fn write_document(path: &Path, document: &SessionDocument) -> Result<(), SessionError> {
    let text = serde_json::to_string_pretty(document)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| SessionError::Write {
            path: path.to_path_buf(),
            source,
        })?;
    }
    let map_write = |source| SessionError::Write {
        path: path.to_path_buf(),
        source,
    };
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let mut file = tempfile::NamedTempFile::new_in(parent).map_err(map_write)?;
    file.write_all(text.as_bytes()).map_err(map_write)?;
    file.persist(path).map_err(|err| map_write(err.error))?;
    Ok(())
}
