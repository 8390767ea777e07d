//! Typed dotted-key settings with durable persistence.
//!
//! Every registered key carries a compiled-in default whose type is
//! authoritative: `set` coerces incoming values to that type and refuses the
//! mutation (with a logged warning) when coercion fails. The store persists
//! as a flat TOML table of dotted keys under the app root and merges the
//! stored file over the defaults on load, so a missing or corrupt file never
//! prevents startup.

use std::{
    collections::BTreeMap,
    io::Write,
    path::{Path, PathBuf},
    sync::mpsc::{Receiver, Sender, channel},
};

use thiserror::Error;
use tracing::{debug, warn};

use crate::app_dirs;

/// Filename of the settings file under the app root.
pub const SETTINGS_FILE_NAME: &str = "user_settings.toml";
/// Default filename of the session file under the app root.
pub const SESSION_FILE_NAME: &str = "annotation_session.json";

/// Registered setting keys. Dotted names double as the on-disk table keys.
pub mod keys {
    /// Path of the session JSON file.
    pub const SESSION_PATH: &str = "paths.session_path";
    /// Path where the fine-tuned model artifact is written.
    pub const MODEL_SAVE_PATH: &str = "paths.model_save_path";
    /// Directory receiving one subdirectory per training run.
    pub const RUNS_DIR: &str = "paths.runs_dir";
    /// Last directory the user loaded images from.
    pub const LAST_IMAGE_DIR: &str = "paths.last_image_dir";
    /// Identifier of the base model used for the first training run.
    pub const BASE_MODEL: &str = "prediction.base_model";
    /// Square image size used for prediction and training.
    pub const IMG_SIZE: &str = "prediction.img_size";
    /// Minimum confidence for box suggestions.
    pub const CONFIDENCE_THRESHOLD: &str = "prediction.confidence_threshold";
    /// Epochs for minor-tier (20-approval) training runs.
    pub const EPOCHS_20: &str = "training.epochs_20";
    /// Learning rate for minor-tier training runs.
    pub const LR_20: &str = "training.lr_20";
    /// Epochs for major-tier (100-approval) training runs.
    pub const EPOCHS_100: &str = "training.epochs_100";
    /// Learning rate for major-tier training runs.
    pub const LR_100: &str = "training.lr_100";
    /// Whether the 20-approval trigger fires automatically.
    pub const TRIGGER_20_ENABLED: &str = "training.trigger_20_enabled";
    /// Whether the 100-approval trigger fires automatically.
    pub const TRIGGER_100_ENABLED: &str = "training.trigger_100_enabled";
    /// Probability of a vertical flip during training augmentation.
    pub const AUG_FLIPUD: &str = "training.augment.flipud";
    /// Probability of a horizontal flip during training augmentation.
    pub const AUG_FLIPLR: &str = "training.augment.fliplr";
    /// Degrees of random rotation during training augmentation.
    pub const AUG_DEGREES: &str = "training.augment.degrees";
}

/// A scalar setting value. The variant fixes the key's type.
#[derive(Debug, Clone, PartialEq)]
pub enum SettingValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

/// The scalar type of a [`SettingValue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingKind {
    Bool,
    Int,
    Float,
    Text,
}

impl SettingValue {
    pub fn kind(&self) -> SettingKind {
        match self {
            SettingValue::Bool(_) => SettingKind::Bool,
            SettingValue::Int(_) => SettingKind::Int,
            SettingValue::Float(_) => SettingKind::Float,
            SettingValue::Text(_) => SettingKind::Text,
        }
    }

    /// Convert to `kind`, or `None` when the value cannot represent it.
    pub fn coerce(&self, kind: SettingKind) -> Option<SettingValue> {
        match (self, kind) {
            (value, kind) if value.kind() == kind => Some(value.clone()),
            (SettingValue::Int(value), SettingKind::Bool) => {
                Some(SettingValue::Bool(*value != 0))
            }
            (SettingValue::Text(text), SettingKind::Bool) => {
                match text.trim().to_ascii_lowercase().as_str() {
                    "true" => Some(SettingValue::Bool(true)),
                    "false" => Some(SettingValue::Bool(false)),
                    _ => None,
                }
            }
            (SettingValue::Bool(value), SettingKind::Int) => {
                Some(SettingValue::Int(i64::from(*value)))
            }
            (SettingValue::Float(value), SettingKind::Int) => {
                value.is_finite().then(|| SettingValue::Int(*value as i64))
            }
            (SettingValue::Text(text), SettingKind::Int) => {
                text.trim().parse().ok().map(SettingValue::Int)
            }
            (SettingValue::Int(value), SettingKind::Float) => {
                Some(SettingValue::Float(*value as f64))
            }
            (SettingValue::Text(text), SettingKind::Float) => {
                text.trim().parse().ok().map(SettingValue::Float)
            }
            (SettingValue::Bool(value), SettingKind::Text) => {
                Some(SettingValue::Text(value.to_string()))
            }
            (SettingValue::Int(value), SettingKind::Text) => {
                Some(SettingValue::Text(value.to_string()))
            }
            (SettingValue::Float(value), SettingKind::Text) => {
                Some(SettingValue::Text(value.to_string()))
            }
            _ => None,
        }
    }
}

impl From<bool> for SettingValue {
    fn from(value: bool) -> Self {
        SettingValue::Bool(value)
    }
}

impl From<i64> for SettingValue {
    fn from(value: i64) -> Self {
        SettingValue::Int(value)
    }
}

impl From<f64> for SettingValue {
    fn from(value: f64) -> Self {
        SettingValue::Float(value)
    }
}

impl From<&str> for SettingValue {
    fn from(value: &str) -> Self {
        SettingValue::Text(value.to_string())
    }
}

impl From<String> for SettingValue {
    fn from(value: String) -> Self {
        SettingValue::Text(value)
    }
}

impl From<&Path> for SettingValue {
    fn from(value: &Path) -> Self {
        SettingValue::Text(value.to_string_lossy().into_owned())
    }
}

impl From<PathBuf> for SettingValue {
    fn from(value: PathBuf) -> Self {
        SettingValue::Text(value.to_string_lossy().into_owned())
    }
}

/// Emitted after a successful, persisted mutation.
#[derive(Debug, Clone)]
pub enum SettingsEvent {
    /// The value stored under `key` changed.
    Changed { key: String },
}

#[derive(Debug, Error)]
enum SettingsIoError {
    #[error("Failed to create settings directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to write settings file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// The full default registry for an app rooted at `app_root`.
pub fn default_settings(app_root: &Path) -> BTreeMap<String, SettingValue> {
    let home = app_dirs::home_dir().unwrap_or_else(|| app_root.to_path_buf());
    let mut defaults = BTreeMap::new();
    let mut insert = |key: &str, value: SettingValue| {
        defaults.insert(key.to_string(), value);
    };
    insert(
        keys::SESSION_PATH,
        app_root.join(SESSION_FILE_NAME).into(),
    );
    insert(
        keys::MODEL_SAVE_PATH,
        app_root.join("detector_finetuned.bin").into(),
    );
    insert(keys::RUNS_DIR, app_root.join("runs").into());
    insert(keys::LAST_IMAGE_DIR, home.into());
    insert(keys::BASE_MODEL, "base-detector-small".into());
    insert(keys::IMG_SIZE, SettingValue::Int(640));
    insert(keys::CONFIDENCE_THRESHOLD, SettingValue::Float(0.25));
    insert(keys::EPOCHS_20, SettingValue::Int(3));
    insert(keys::LR_20, SettingValue::Float(0.005));
    insert(keys::EPOCHS_100, SettingValue::Int(7));
    insert(keys::LR_100, SettingValue::Float(0.001));
    insert(keys::TRIGGER_20_ENABLED, SettingValue::Bool(true));
    insert(keys::TRIGGER_100_ENABLED, SettingValue::Bool(true));
    insert(keys::AUG_FLIPUD, SettingValue::Float(0.0));
    insert(keys::AUG_FLIPLR, SettingValue::Float(0.5));
    insert(keys::AUG_DEGREES, SettingValue::Float(0.0));
    defaults
}

/// Typed settings store backed by a flat TOML file.
pub struct SettingsStore {
    path: PathBuf,
    defaults: BTreeMap<String, SettingValue>,
    values: BTreeMap<String, SettingValue>,
    events: Option<Sender<SettingsEvent>>,
}

impl SettingsStore {
    /// Open the store for an app rooted at `app_root`, merging any stored
    /// file over the defaults. Missing and corrupt files both yield a
    /// usable store.
    pub fn open(app_root: &Path) -> Self {
        let path = app_root.join(SETTINGS_FILE_NAME);
        let defaults = default_settings(app_root);
        let mut values = defaults.clone();
        for (key, value) in load_stored(&path) {
            match defaults.get(&key) {
                Some(default) => match value.coerce(default.kind()) {
                    Some(coerced) => {
                        values.insert(key, coerced);
                    }
                    None => warn!(
                        "Stored setting '{key}' has incompatible type {:?}; using default",
                        value.kind()
                    ),
                },
                None => {
                    warn!("Stored setting '{key}' is not a registered key");
                    values.insert(key, value);
                }
            }
        }
        Self {
            path,
            defaults,
            values,
            events: None,
        }
    }

    /// Subscribe to change events. Intended for the control thread; only the
    /// most recent subscriber receives events.
    pub fn subscribe(&mut self) -> Receiver<SettingsEvent> {
        let (tx, rx) = channel();
        self.events = Some(tx);
        rx
    }

    /// The stored value for `key`, else its registered default, else `None`.
    pub fn get(&self, key: &str) -> Option<SettingValue> {
        self.values
            .get(key)
            .or_else(|| self.defaults.get(key))
            .cloned()
    }

    pub fn get_bool(&self, key: &str, fallback: bool) -> bool {
        match self.get(key) {
            Some(SettingValue::Bool(value)) => value,
            _ => fallback,
        }
    }

    pub fn get_i64(&self, key: &str, fallback: i64) -> i64 {
        match self.get(key) {
            Some(SettingValue::Int(value)) => value,
            _ => fallback,
        }
    }

    pub fn get_f64(&self, key: &str, fallback: f64) -> f64 {
        match self.get(key) {
            Some(SettingValue::Float(value)) => value,
            Some(SettingValue::Int(value)) => value as f64,
            _ => fallback,
        }
    }

    pub fn get_text(&self, key: &str, fallback: &str) -> String {
        match self.get(key) {
            Some(SettingValue::Text(value)) => value,
            _ => fallback.to_string(),
        }
    }

    pub fn get_path(&self, key: &str, fallback: &Path) -> PathBuf {
        match self.get(key) {
            Some(SettingValue::Text(value)) => PathBuf::from(value),
            _ => fallback.to_path_buf(),
        }
    }

    /// Coerce `value` to the key's registered type and store it. On coercion
    /// failure the store is unchanged; on success the store persists and a
    /// change event is emitted. Never fails from the caller's perspective.
    pub fn set(&mut self, key: &str, value: impl Into<SettingValue>) {
        let incoming = value.into();
        let coerced = match self.defaults.get(key) {
            Some(default) => match incoming.coerce(default.kind()) {
                Some(coerced) => coerced,
                None => {
                    warn!(
                        "Rejecting value of type {:?} for setting '{key}' (expected {:?}); keeping previous value",
                        incoming.kind(),
                        default.kind()
                    );
                    return;
                }
            },
            None => {
                warn!("Setting unknown key '{key}'");
                incoming
            }
        };
        if self.get(key).as_ref() == Some(&coerced) {
            debug!("Setting '{key}' unchanged");
            return;
        }
        self.values.insert(key.to_string(), coerced);
        if let Err(err) = self.persist() {
            warn!("Failed to persist settings: {err}");
        }
        if let Some(tx) = &self.events {
            let _ = tx.send(SettingsEvent::Changed {
                key: key.to_string(),
            });
        }
    }

    /// The session file path, honoring the `paths.session_path` override.
    pub fn session_path(&self) -> PathBuf {
        let fallback = self
            .path
            .parent()
            .map(|dir| dir.join(SESSION_FILE_NAME))
            .unwrap_or_else(|| PathBuf::from(SESSION_FILE_NAME));
        self.get_path(keys::SESSION_PATH, &fallback)
    }

    /// Snapshot of every effective key/value pair, for handing to the
    /// pipeline capability.
    pub fn snapshot(&self) -> BTreeMap<String, SettingValue> {
        self.values.clone()
    }

    fn persist(&self) -> Result<(), SettingsIoError> {
        let mut table = toml::Table::new();
        for (key, value) in &self.values {
            table.insert(key.clone(), to_toml(value));
        }
        let text = toml::to_string_pretty(&table)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| SettingsIoError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let map_write = |source| SettingsIoError::Write {
            path: self.path.clone(),
            source,
        };
        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut file = tempfile::NamedTempFile::new_in(parent).map_err(map_write)?;
        file.write_all(text.as_bytes()).map_err(map_write)?;
        file.persist(&self.path).map_err(|err| map_write(err.error))?;
        Ok(())
    }
}

fn load_stored(path: &Path) -> BTreeMap<String, SettingValue> {
    let mut stored = BTreeMap::new();
    if !path.exists() {
        debug!("No settings file at {}; using defaults", path.display());
        return stored;
    }
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) => {
            warn!(
                "Failed to read settings file {}: {err}; using defaults",
                path.display()
            );
            return stored;
        }
    };
    let table = match text.parse::<toml::Table>() {
        Ok(table) => table,
        Err(err) => {
            warn!(
                "Settings file {} is not valid TOML: {err}; using defaults",
                path.display()
            );
            return stored;
        }
    };
    flatten_table(String::new(), table, &mut stored);
    stored
}

fn flatten_table(prefix: String, table: toml::Table, out: &mut BTreeMap<String, SettingValue>) {
    for (name, value) in table {
        let key = if prefix.is_empty() {
            name
        } else {
            format!("{prefix}.{name}")
        };
        match value {
            toml::Value::Boolean(value) => {
                out.insert(key, SettingValue::Bool(value));
            }
            toml::Value::Integer(value) => {
                out.insert(key, SettingValue::Int(value));
            }
            toml::Value::Float(value) => {
                out.insert(key, SettingValue::Float(value));
            }
            toml::Value::String(value) => {
                out.insert(key, SettingValue::Text(value));
            }
            toml::Value::Table(nested) => flatten_table(key, nested, out),
            other => warn!("Ignoring non-scalar setting '{key}' ({})", other.type_str()),
        }
    }
}

fn to_toml(value: &SettingValue) -> toml::Value {
    match value {
        SettingValue::Bool(value) => toml::Value::Boolean(*value),
        SettingValue::Int(value) => toml::Value::Integer(*value),
        SettingValue::Float(value) => toml::Value::Float(*value),
        SettingValue::Text(value) => toml::Value::String(value.clone()),
    }
}
