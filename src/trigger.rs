//! Pure threshold logic deciding when training runs are scheduled.
//!
//! Evaluated exactly once per approval transition, on the control thread,
//! before the approval is observable anywhere else. De-approvals and
//! class-change recounts never re-evaluate and never retroactively cancel a
//! fired trigger; that asymmetry avoids retraining storms and is deliberate.

use tracing::debug;

use crate::settings::{SettingsStore, keys};

/// Approval count between minor-tier training runs.
pub const MINOR_INTERVAL: usize = 20;
/// Approval count between major-tier training runs.
pub const MAJOR_INTERVAL: usize = 100;

const FALLBACK_EPOCHS_20: i64 = 3;
const FALLBACK_LR_20: f64 = 0.005;
const FALLBACK_EPOCHS_100: i64 = 7;
const FALLBACK_LR_100: f64 = 0.001;

/// Hyperparameters for one scheduled training run.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingRequest {
    pub epochs: u32,
    pub learning_rate: f64,
    /// Names the run directory, e.g. `mini_20` or `major_100`.
    pub run_name_prefix: String,
}

/// Decide whether the approval transition `old_count -> new_count` schedules
/// a training run.
///
/// Fires only on fresh approvals (`new_count > old_count`). A count that is
/// a multiple of both intervals yields the major tier alone: the larger run
/// subsumes the smaller one.
pub fn evaluate(
    old_count: usize,
    new_count: usize,
    settings: &SettingsStore,
) -> Option<TrainingRequest> {
    if new_count <= old_count || new_count == 0 {
        return None;
    }
    let major_enabled = settings.get_bool(keys::TRIGGER_100_ENABLED, true);
    let minor_enabled = settings.get_bool(keys::TRIGGER_20_ENABLED, true);
    debug!(
        "Checking training triggers at count {new_count} (minor={minor_enabled}, major={major_enabled})"
    );
    if major_enabled && new_count % MAJOR_INTERVAL == 0 {
        return Some(major_request(settings, new_count));
    }
    if minor_enabled && new_count % MINOR_INTERVAL == 0 {
        return Some(minor_request(settings, format!("mini_{new_count}")));
    }
    None
}

/// Build a manually forced minor-tier request, bypassing the threshold check
/// but not the approved-data requirement.
pub fn forced_minor(settings: &SettingsStore, approved_count: usize) -> Option<TrainingRequest> {
    if approved_count == 0 {
        return None;
    }
    Some(minor_request(settings, "force_mini".to_string()))
}

fn major_request(settings: &SettingsStore, new_count: usize) -> TrainingRequest {
    TrainingRequest {
        epochs: settings.get_i64(keys::EPOCHS_100, FALLBACK_EPOCHS_100).max(1) as u32,
        learning_rate: settings.get_f64(keys::LR_100, FALLBACK_LR_100),
        run_name_prefix: format!("major_{new_count}"),
    }
}

fn minor_request(settings: &SettingsStore, run_name_prefix: String) -> TrainingRequest {
    TrainingRequest {
        epochs: settings.get_i64(keys::EPOCHS_20, FALLBACK_EPOCHS_20).max(1) as u32,
        learning_rate: settings.get_f64(keys::LR_20, FALLBACK_LR_20),
        run_name_prefix,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store() -> (tempfile::TempDir, SettingsStore) {
        let root = tempdir().unwrap();
        let store = SettingsStore::open(root.path());
        (root, store)
    }

    #[test]
    fn minor_tier_fires_at_each_twenty_below_one_hundred() {
        let (_root, settings) = store();
        for count in [20, 40, 60, 80] {
            let request = evaluate(count - 1, count, &settings).unwrap();
            assert_eq!(request.run_name_prefix, format!("mini_{count}"));
            assert_eq!(request.epochs, 3);
            assert_eq!(request.learning_rate, 0.005);
        }
    }

    #[test]
    fn major_tier_subsumes_minor_at_one_hundred() {
        let (_root, settings) = store();
        let request = evaluate(99, 100, &settings).unwrap();
        assert_eq!(request.run_name_prefix, "major_100");
        assert_eq!(request.epochs, 7);
        assert_eq!(request.learning_rate, 0.001);
    }

    #[test]
    fn off_threshold_counts_do_not_fire() {
        let (_root, settings) = store();
        for count in [1, 19, 21, 99, 101] {
            assert_eq!(evaluate(count - 1, count, &settings), None);
        }
    }

    #[test]
    fn de_approval_never_fires_even_on_a_threshold() {
        let (_root, settings) = store();
        assert_eq!(evaluate(21, 20, &settings), None);
        assert_eq!(evaluate(20, 20, &settings), None);
    }

    #[test]
    fn disabled_major_falls_through_to_minor() {
        let (_root, mut settings) = store();
        settings.set(keys::TRIGGER_100_ENABLED, false);
        let request = evaluate(99, 100, &settings).unwrap();
        assert_eq!(request.run_name_prefix, "mini_100");
    }

    #[test]
    fn disabling_both_triggers_silences_thresholds() {
        let (_root, mut settings) = store();
        settings.set(keys::TRIGGER_20_ENABLED, false);
        settings.set(keys::TRIGGER_100_ENABLED, false);
        assert_eq!(evaluate(19, 20, &settings), None);
        assert_eq!(evaluate(99, 100, &settings), None);
    }

    #[test]
    fn tier_parameters_follow_settings() {
        let (_root, mut settings) = store();
        settings.set(keys::EPOCHS_20, 5_i64);
        settings.set(keys::LR_20, 0.01);
        let request = evaluate(19, 20, &settings).unwrap();
        assert_eq!(request.epochs, 5);
        assert_eq!(request.learning_rate, 0.01);
    }

    #[test]
    fn forced_minor_requires_approved_images() {
        let (_root, settings) = store();
        assert_eq!(forced_minor(&settings, 0), None);
        let request = forced_minor(&settings, 7).unwrap();
        assert_eq!(request.run_name_prefix, "force_mini");
        assert_eq!(request.epochs, 3);
    }
}
