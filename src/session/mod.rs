//! The annotation session aggregate and its persistence.
//!
//! `SessionState` owns the image list, per-image annotation records, class
//! list, the cached approved-count, and the last-successful-run pointer. All
//! mutation happens on the control thread; background work only flows back
//! in through the controller. The approved count is the derived value the
//! training triggers key off, so it is adjusted incrementally on every
//! annotation change and recomputed from scratch on every load and class
//! change.

mod autosave;
pub mod document;

pub use document::{AnnotationRecord, BoundingBox, SessionDocument, SessionError};

use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
    sync::mpsc::{Receiver, Sender, channel},
};

use tracing::{debug, error, info, warn};

use crate::settings::SettingsStore;
use crate::trigger::{self, TrainingRequest};
use autosave::DebouncedWriter;

/// File extensions (lowercase) recognized as images in directory scans.
pub const IMAGE_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "bmp", "gif", "tiff", "tif", "webp",
];

/// Notifications emitted by the session toward the control loop.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The aggregate was replaced or reshaped; observers should refresh.
    Changed,
    /// A fresh approval crossed a trigger threshold.
    TrainingDue(TrainingRequest),
}

/// Read-only view of the approved entries, cloned out of the aggregate.
#[derive(Debug, Clone, Default)]
pub struct ApprovedSubset {
    pub paths: Vec<PathBuf>,
    pub records: BTreeMap<PathBuf, AnnotationRecord>,
}

impl ApprovedSubset {
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }
}

/// The authoritative in-memory annotation session.
pub struct SessionState {
    image_list: Vec<PathBuf>,
    current_index: Option<usize>,
    annotations: BTreeMap<PathBuf, AnnotationRecord>,
    class_list: Vec<String>,
    approved_count: usize,
    last_successful_run_dir: Option<PathBuf>,
    session_path: PathBuf,
    autosave: DebouncedWriter,
    events: Option<Sender<SessionEvent>>,
}

impl SessionState {
    /// Create an empty session that saves to `session_path`.
    pub fn new(session_path: PathBuf, initial_classes: &[String]) -> Self {
        Self {
            image_list: Vec::new(),
            current_index: None,
            annotations: BTreeMap::new(),
            class_list: normalize_classes(initial_classes),
            approved_count: 0,
            last_successful_run_dir: None,
            session_path,
            autosave: DebouncedWriter::spawn(),
            events: None,
        }
    }

    /// Subscribe to session events. Only the most recent subscriber
    /// receives them; intended for the control loop.
    pub fn subscribe(&mut self) -> Receiver<SessionEvent> {
        let (tx, rx) = channel();
        self.events = Some(tx);
        rx
    }

    pub fn image_list(&self) -> &[PathBuf] {
        &self.image_list
    }

    pub fn current_index(&self) -> Option<usize> {
        self.current_index
    }

    /// The selected image path, if any.
    pub fn current_image(&self) -> Option<&Path> {
        self.current_index
            .and_then(|index| self.image_list.get(index))
            .map(PathBuf::as_path)
    }

    pub fn annotation(&self, path: &Path) -> Option<&AnnotationRecord> {
        self.annotations.get(path)
    }

    pub fn annotations(&self) -> &BTreeMap<PathBuf, AnnotationRecord> {
        &self.annotations
    }

    pub fn class_list(&self) -> &[String] {
        &self.class_list
    }

    pub fn approved_count(&self) -> usize {
        self.approved_count
    }

    pub fn last_successful_run_dir(&self) -> Option<&Path> {
        self.last_successful_run_dir.as_deref()
    }

    pub fn session_path(&self) -> &Path {
        &self.session_path
    }

    /// Point subsequent saves at a different file.
    pub fn set_session_path(&mut self, path: PathBuf) {
        self.session_path = path;
    }

    /// Load the aggregate from `path`, repairing inconsistencies.
    ///
    /// A missing file is not an error: the session resets to empty. A file
    /// that exists but fails to parse is an error and leaves the current
    /// in-memory state untouched.
    pub fn load(&mut self, path: &Path) -> Result<(), SessionError> {
        if !path.exists() {
            warn!(
                "Session file not found at {}; starting empty",
                path.display()
            );
            self.reset_empty();
            self.emit(SessionEvent::Changed);
            return Ok(());
        }
        let loaded = document::read_document(path)?;

        self.image_list = loaded.image_list;
        self.annotations = loaded.annotations;

        let loaded_classes = normalize_classes(&loaded.class_list);
        if loaded_classes.is_empty() {
            if !loaded.class_list.is_empty() {
                warn!("No valid class list in session file; keeping existing");
            }
        } else {
            self.class_list = loaded_classes;
        }

        let images: BTreeSet<PathBuf> = self.image_list.iter().cloned().collect();
        let before = self.annotations.len();
        self.annotations.retain(|path, _| images.contains(path));
        let pruned = before - self.annotations.len();
        if pruned > 0 {
            warn!("Removed {pruned} annotations for images missing from the list");
        }

        for (image, record) in &self.annotations {
            if !record.is_consistent() {
                warn!(
                    "Annotation for {} is negative but carries {} boxes",
                    image.display(),
                    record.boxes.len()
                );
            }
        }

        self.current_index = match usize::try_from(loaded.current_index) {
            Ok(index) if index < self.image_list.len() => Some(index),
            _ if self.image_list.is_empty() => None,
            _ => {
                warn!(
                    "Loaded index {} out of range; reset to 0",
                    loaded.current_index
                );
                Some(0)
            }
        };

        self.approved_count = self.count_approved();

        self.last_successful_run_dir = match loaded.last_successful_run_dir {
            Some(dir) if dir.is_dir() => Some(dir),
            Some(dir) => {
                warn!(
                    "Last run directory {} no longer exists; clearing",
                    dir.display()
                );
                None
            }
            None => None,
        };

        info!(
            "Session loaded: {} images, {} annotations, {} approved",
            self.image_list.len(),
            self.annotations.len(),
            self.approved_count
        );
        self.emit(SessionEvent::Changed);
        Ok(())
    }

    /// Serialize the aggregate to the session path. Failures are logged;
    /// the in-memory state is the ground truth either way.
    pub fn save(&self) {
        if let Err(err) = self.try_save() {
            error!("Failed to save session: {err}");
        }
    }

    /// Like [`Self::save`], but surfaces the error.
    pub fn try_save(&self) -> Result<(), SessionError> {
        document::write_document(&self.session_path, &self.snapshot_document())
    }

    /// Replace the image list with the supported images under `dir`.
    ///
    /// A directory whose content matches the current list (as a set) leaves
    /// the session untouched. Any other content starts a fresh session:
    /// annotating a different directory is a new task by design. A missing
    /// directory is an error; an empty one clears the session.
    pub fn load_images_from_directory(&mut self, dir: &Path) -> Result<(), SessionError> {
        if !dir.is_dir() {
            return Err(SessionError::DirectoryNotFound {
                path: dir.to_path_buf(),
            });
        }
        let map_list = |source| SessionError::ListDirectory {
            path: dir.to_path_buf(),
            source,
        };
        let mut files = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(map_list)? {
            let path = entry.map_err(map_list)?.path();
            if !path.is_file() {
                continue;
            }
            let Some(extension) = path.extension().and_then(|ext| ext.to_str()) else {
                continue;
            };
            if IMAGE_EXTENSIONS.contains(&extension.to_ascii_lowercase().as_str()) {
                files.push(std::path::absolute(&path).unwrap_or(path));
            }
        }
        files.sort();

        if files.is_empty() {
            warn!(
                "No supported images in {}; clearing session",
                dir.display()
            );
            self.reset_empty();
            self.emit(SessionEvent::Changed);
            return Ok(());
        }

        let same_content = {
            let new_set: BTreeSet<&PathBuf> = files.iter().collect();
            let old_set: BTreeSet<&PathBuf> = self.image_list.iter().collect();
            new_set == old_set
        };
        if same_content {
            info!("Directory reloaded with identical content; state unchanged");
            return Ok(());
        }

        info!(
            "Loaded {} images from {}; starting a fresh session",
            files.len(),
            dir.display()
        );
        self.image_list = files;
        self.current_index = Some(0);
        self.annotations.clear();
        self.approved_count = 0;
        self.last_successful_run_dir = None;
        self.emit(SessionEvent::Changed);
        Ok(())
    }

    /// Store or overwrite the record for `path`, maintain the approved
    /// count, schedule a debounced save, and evaluate the training trigger
    /// on a fresh approval.
    ///
    /// Returns `false` only on structurally invalid input; persistence
    /// failures are logged without rolling back the in-memory mutation.
    pub fn add_annotation(
        &mut self,
        path: &Path,
        record: AnnotationRecord,
        settings: &SettingsStore,
    ) -> bool {
        if path.as_os_str().is_empty() {
            error!("add_annotation refused: empty image path");
            return false;
        }
        if !record.is_well_formed() {
            error!(
                "add_annotation refused: malformed box geometry for {}",
                path.display()
            );
            return false;
        }
        if !record.is_consistent() {
            warn!(
                "Annotation for {} is negative but carries boxes",
                path.display()
            );
        }

        let was_approved = self.annotations.get(path).is_some_and(|r| r.approved);
        let is_approved = record.approved;
        let old_count = self.approved_count;
        self.annotations.insert(path.to_path_buf(), record);
        if is_approved && !was_approved {
            self.approved_count += 1;
        } else if !is_approved && was_approved {
            self.approved_count = self.approved_count.saturating_sub(1);
        }
        debug!("Approved count now {}", self.approved_count);

        self.autosave
            .schedule(self.snapshot_document(), self.session_path.clone());

        if is_approved && !was_approved
            && let Some(request) = trigger::evaluate(old_count, self.approved_count, settings)
        {
            info!(
                "Approved count {} schedules training run '{}'",
                self.approved_count, request.run_name_prefix
            );
            self.emit(SessionEvent::TrainingDue(request));
        }
        true
    }

    /// Replace the class list. Boxes whose class is no longer valid are
    /// dropped from non-negative records; approval flags are untouched
    /// (approval is independent of box validity). Returns whether the
    /// normalized list actually changed.
    pub fn update_classes(&mut self, new_classes: &[String]) -> bool {
        let normalized = normalize_classes(new_classes);
        if normalized == self.class_list {
            info!("Class list unchanged");
            return false;
        }
        info!(
            "Updating class list from {:?} to {:?}",
            self.class_list, normalized
        );
        self.class_list = normalized;
        let valid: BTreeSet<String> = self.class_list.iter().cloned().collect();

        let mut removed_boxes = 0usize;
        let mut affected_images = 0usize;
        for record in self.annotations.values_mut() {
            if record.negative {
                continue;
            }
            let before = record.boxes.len();
            record.boxes.retain(|b| valid.contains(&b.class));
            let removed = before - record.boxes.len();
            if removed > 0 {
                removed_boxes += removed;
                affected_images += 1;
            }
        }
        if removed_boxes > 0 {
            warn!("Removed {removed_boxes} boxes from {affected_images} images after class change");
        }

        self.approved_count = self.count_approved();
        self.save();
        self.emit(SessionEvent::Changed);
        true
    }

    /// Advance the selection. Returns `false` at the end of the list.
    pub fn next_image(&mut self) -> bool {
        match self.current_index {
            Some(index) if index + 1 < self.image_list.len() => {
                self.current_index = Some(index + 1);
                true
            }
            _ => false,
        }
    }

    /// Move the selection back. Returns `false` at the start of the list.
    pub fn prev_image(&mut self) -> bool {
        match self.current_index {
            Some(index) if index > 0 => {
                self.current_index = Some(index - 1);
                true
            }
            _ => false,
        }
    }

    /// Jump to `index`. Returns `false` when out of range.
    pub fn go_to_image(&mut self, index: usize) -> bool {
        if index < self.image_list.len() {
            self.current_index = Some(index);
            true
        } else {
            warn!(
                "Invalid goto index {index} (list size {})",
                self.image_list.len()
            );
            false
        }
    }

    /// Clone out the approved entries.
    pub fn export_approved_subset(&self) -> ApprovedSubset {
        let records: BTreeMap<PathBuf, AnnotationRecord> = self
            .annotations
            .iter()
            .filter(|(_, record)| record.approved)
            .map(|(path, record)| (path.clone(), record.clone()))
            .collect();
        let paths = records.keys().cloned().collect();
        ApprovedSubset { paths, records }
    }

    /// Record the output directory of a completed training run and schedule
    /// a debounced save.
    pub fn set_last_run_dir(&mut self, dir: PathBuf) {
        info!("Recording last successful run directory {}", dir.display());
        self.last_successful_run_dir = Some(dir);
        self.autosave
            .schedule(self.snapshot_document(), self.session_path.clone());
    }

    /// Serialize the aggregate into its on-disk form.
    pub fn snapshot_document(&self) -> SessionDocument {
        SessionDocument {
            image_list: self.image_list.clone(),
            annotations: self.annotations.clone(),
            current_index: self.current_index.map_or(-1, |index| index as i64),
            class_list: self.class_list.clone(),
            last_successful_run_dir: self.last_successful_run_dir.clone(),
        }
    }

    fn reset_empty(&mut self) {
        self.image_list.clear();
        self.annotations.clear();
        self.current_index = None;
        self.approved_count = 0;
        self.last_successful_run_dir = None;
    }

    fn count_approved(&self) -> usize {
        self.annotations
            .values()
            .filter(|record| record.approved)
            .count()
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

fn normalize_classes(classes: &[String]) -> Vec<String> {
    let mut cleaned: Vec<String> = classes
        .iter()
        .map(|class| class.trim().to_string())
        .filter(|class| !class.is_empty())
        .collect();
    cleaned.sort();
    cleaned.dedup();
    cleaned
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn boxed(class: &str) -> BoundingBox {
        BoundingBox {
            x: 10.0,
            y: 10.0,
            width: 20.0,
            height: 30.0,
            class: class.to_string(),
        }
    }

    fn approved(class: &str) -> AnnotationRecord {
        AnnotationRecord {
            boxes: vec![boxed(class)],
            approved: true,
            negative: false,
        }
    }

    fn harness() -> (tempfile::TempDir, SettingsStore, SessionState) {
        let root = tempdir().unwrap();
        let settings = SettingsStore::open(root.path());
        let session = SessionState::new(root.path().join(".snowbox/session.json"), &[
            "cat".to_string(),
            "dog".to_string(),
        ]);
        (root, settings, session)
    }

    fn image(name: &str) -> PathBuf {
        PathBuf::from(format!("/images/{name}"))
    }

    #[test]
    fn approved_count_matches_full_scan_after_any_sequence() {
        let (_root, settings, mut session) = harness();
        let steps: Vec<(PathBuf, bool)> = vec![
            (image("a.jpg"), true),
            (image("b.jpg"), true),
            (image("a.jpg"), true),  // overwrite, still approved
            (image("a.jpg"), false), // de-approve
            (image("c.jpg"), false),
            (image("b.jpg"), false),
            (image("b.jpg"), true),
        ];
        for (path, approve) in steps {
            let record = AnnotationRecord {
                boxes: vec![boxed("cat")],
                approved: approve,
                negative: false,
            };
            assert!(session.add_annotation(&path, record, &settings));
            let scan = session
                .annotations()
                .values()
                .filter(|r| r.approved)
                .count();
            assert_eq!(session.approved_count(), scan);
        }
    }

    #[test]
    fn rejects_empty_path_and_malformed_boxes() {
        let (_root, settings, mut session) = harness();
        assert!(!session.add_annotation(Path::new(""), approved("cat"), &settings));
        let mut record = approved("cat");
        record.boxes[0].width = 0.0;
        assert!(!session.add_annotation(&image("a.jpg"), record, &settings));
        assert_eq!(session.approved_count(), 0);
    }

    #[test]
    fn save_then_load_round_trips_the_aggregate() {
        let (root, settings, mut session) = harness();
        let dir = root.path().join("imgs");
        std::fs::create_dir_all(&dir).unwrap();
        for name in ["a.jpg", "b.jpg"] {
            std::fs::write(dir.join(name), b"img").unwrap();
        }
        session.load_images_from_directory(&dir).unwrap();
        let first = session.image_list()[0].clone();
        session.add_annotation(&first, approved("cat"), &settings);
        session.next_image();
        session.try_save().unwrap();

        let mut reloaded = SessionState::new(session.session_path().to_path_buf(), &[]);
        reloaded.load(session.session_path()).unwrap();
        assert_eq!(reloaded.image_list(), session.image_list());
        assert_eq!(reloaded.class_list(), session.class_list());
        assert_eq!(reloaded.current_index(), Some(1));
        assert_eq!(reloaded.annotation(&first), session.annotation(&first));
        assert_eq!(reloaded.approved_count(), 1);
    }

    #[test]
    fn load_of_missing_file_resets_to_empty() {
        let (root, settings, mut session) = harness();
        session.add_annotation(&image("a.jpg"), approved("cat"), &settings);
        session
            .load(&root.path().join("never_written.json"))
            .unwrap();
        assert!(session.image_list().is_empty());
        assert_eq!(session.approved_count(), 0);
        assert_eq!(session.current_index(), None);
    }

    #[test]
    fn load_of_unparseable_file_keeps_prior_state() {
        let (root, settings, mut session) = harness();
        session.add_annotation(&image("a.jpg"), approved("cat"), &settings);
        let bad = root.path().join("bad.json");
        std::fs::write(&bad, "not json at all").unwrap();
        assert!(session.load(&bad).is_err());
        assert_eq!(session.approved_count(), 1);
        assert!(session.annotation(&image("a.jpg")).is_some());
    }

    #[test]
    fn load_prunes_orphan_annotations_and_recounts() {
        let (root, _settings, mut session) = harness();
        let mut document = SessionDocument::default();
        document.image_list.push(image("kept.jpg"));
        document
            .annotations
            .insert(image("kept.jpg"), approved("cat"));
        document
            .annotations
            .insert(image("orphan.jpg"), approved("cat"));
        document.current_index = 5; // out of range
        document.class_list = vec!["cat".to_string()];
        let path = root.path().join("session.json");
        document::write_document(&path, &document).unwrap();

        session.load(&path).unwrap();
        assert!(session.annotation(&image("orphan.jpg")).is_none());
        assert_eq!(session.approved_count(), 1);
        assert_eq!(session.current_index(), Some(0));
    }

    #[test]
    fn load_clears_vanished_run_directory() {
        let (root, _settings, mut session) = harness();
        let runs = root.path().join("runs/mini_20");
        std::fs::create_dir_all(&runs).unwrap();
        let mut document = SessionDocument::default();
        document.last_successful_run_dir = Some(runs.clone());
        let path = root.path().join("session.json");
        document::write_document(&path, &document).unwrap();

        session.load(&path).unwrap();
        assert_eq!(session.last_successful_run_dir(), Some(runs.as_path()));

        std::fs::remove_dir_all(&runs).unwrap();
        session.load(&path).unwrap();
        assert_eq!(session.last_successful_run_dir(), None);
    }

    #[test]
    fn class_change_drops_foreign_boxes_but_keeps_approval() {
        let (_root, settings, mut session) = harness();
        let path = image("a.jpg");
        let record = AnnotationRecord {
            boxes: vec![boxed("cat"), boxed("C")],
            approved: true,
            negative: false,
        };
        session.add_annotation(&path, record, &settings);

        assert!(session.update_classes(&["A".to_string(), "B".to_string()]));
        let stored = session.annotation(&path).unwrap();
        assert!(stored.boxes.is_empty());
        assert!(stored.approved);
        assert_eq!(session.approved_count(), 1);
    }

    #[test]
    fn class_change_leaves_negative_records_alone() {
        let (_root, settings, mut session) = harness();
        let path = image("empty.jpg");
        let record = AnnotationRecord {
            boxes: Vec::new(),
            approved: true,
            negative: true,
        };
        session.add_annotation(&path, record.clone(), &settings);
        session.update_classes(&["other".to_string()]);
        assert_eq!(session.annotation(&path), Some(&record));
    }

    #[test]
    fn class_list_normalization_makes_reordered_input_a_noop() {
        let (_root, _settings, mut session) = harness();
        assert!(!session.update_classes(&[
            " dog ".to_string(),
            "cat".to_string(),
            "dog".to_string(),
        ]));
    }

    #[test]
    fn navigation_respects_boundaries() {
        let (root, _settings, mut session) = harness();
        let dir = root.path().join("imgs");
        std::fs::create_dir_all(&dir).unwrap();
        for name in ["a.jpg", "b.jpg", "c.jpg"] {
            std::fs::write(dir.join(name), b"img").unwrap();
        }
        session.load_images_from_directory(&dir).unwrap();

        assert!(!session.prev_image());
        assert!(session.next_image());
        assert!(session.next_image());
        assert!(!session.next_image());
        assert_eq!(session.current_index(), Some(2));
        assert!(session.go_to_image(0));
        assert!(!session.go_to_image(3));
        assert!(session.current_image().unwrap().ends_with("a.jpg"));
    }

    #[test]
    fn reloading_the_same_directory_preserves_annotations() {
        let (root, settings, mut session) = harness();
        let dir = root.path().join("imgs");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("a.jpg"), b"img").unwrap();
        std::fs::write(dir.join("notes.txt"), b"skip me").unwrap();
        session.load_images_from_directory(&dir).unwrap();
        assert_eq!(session.image_list().len(), 1);

        let first = session.image_list()[0].clone();
        session.add_annotation(&first, approved("cat"), &settings);
        session.load_images_from_directory(&dir).unwrap();
        assert_eq!(session.approved_count(), 1);

        // New content resets the session.
        std::fs::write(dir.join("b.jpg"), b"img").unwrap();
        session.load_images_from_directory(&dir).unwrap();
        assert_eq!(session.approved_count(), 0);
        assert!(session.annotations().is_empty());
        assert_eq!(session.current_index(), Some(0));
    }

    #[test]
    fn missing_directory_is_an_error_and_leaves_state() {
        let (root, settings, mut session) = harness();
        session.add_annotation(&image("a.jpg"), approved("cat"), &settings);
        let missing = root.path().join("nope");
        assert!(session.load_images_from_directory(&missing).is_err());
        assert_eq!(session.approved_count(), 1);
    }

    #[test]
    fn twentieth_distinct_approval_emits_a_minor_training_request() {
        let (_root, settings, mut session) = harness();
        let rx = session.subscribe();
        for index in 0..20 {
            let path = image(&format!("img_{index:03}.jpg"));
            session.add_annotation(&path, approved("cat"), &settings);
        }
        let requests: Vec<_> = rx
            .try_iter()
            .filter_map(|event| match event {
                SessionEvent::TrainingDue(request) => Some(request),
                _ => None,
            })
            .collect();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].run_name_prefix, "mini_20");
    }

    #[test]
    fn export_approved_subset_is_an_independent_view() {
        let (_root, settings, mut session) = harness();
        session.add_annotation(&image("a.jpg"), approved("cat"), &settings);
        let mut pending = approved("cat");
        pending.approved = false;
        session.add_annotation(&image("b.jpg"), pending, &settings);

        let subset = session.export_approved_subset();
        assert_eq!(subset.len(), 1);
        assert_eq!(subset.paths, vec![image("a.jpg")]);
        // Mutating the subset must not touch the session.
        let mut subset = subset;
        subset.records.clear();
        assert!(session.annotation(&image("a.jpg")).is_some());
    }
}
