//! Session core for Snowbox, an interactive bounding-box annotator that
//! accumulates human-approved annotations and retrains a detector as
//! approval thresholds are crossed.
//!
//! The crate owns the authoritative session aggregate, the single-flight
//! background task supervisor, the training trigger logic, and settings
//! persistence. Rendering, dialogs, the real model pipeline, and the
//! on-disk dataset layout live in collaborating layers and are consumed
//! through the traits in [`pipeline`] and [`export`].

/// Application directory helpers anchored to the `.snowbox` folder.
pub mod app_dirs;
/// Control-thread facade wiring settings, session, and tasks together.
pub mod controller;
/// Read-only export planning for the approved annotation subset.
pub mod export;
/// Logging setup for embedding applications.
pub mod logging;
/// The opaque model pipeline capability and its null implementation.
pub mod pipeline;
/// The annotation session aggregate and its persistence.
pub mod session;
/// Typed dotted-key settings with durable persistence.
pub mod settings;
/// Single-flight supervision of background prediction/training tasks.
pub mod tasks;
/// Pure threshold logic deciding when training runs are scheduled.
pub mod trigger;
