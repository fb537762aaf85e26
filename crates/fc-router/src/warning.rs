//! Operational warning registry.
//!
//! Bounded in-memory list of pipeline warnings (restarted group workers,
//! rate limiting, configuration failures, leak detection) surfaced through
//! manager snapshots.

use parking_lot::RwLock;
use tracing::warn;

use fc_common::{Warning, WarningCategory, WarningSeverity};

const MAX_WARNINGS: usize = 500;
const MAX_AGE_MINUTES: i64 = 60;

#[derive(Default)]
pub struct WarningService {
    warnings: RwLock<Vec<Warning>>,
}

impl WarningService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_warning(
        &self,
        category: WarningCategory,
        severity: WarningSeverity,
        message: String,
        source: String,
    ) {
        warn!(?category, ?severity, source = %source, "{message}");

        let mut warnings = self.warnings.write();
        warnings.push(Warning::new(category, severity, message, source));

        // Oldest first; trim from the front when the registry overflows.
        let len = warnings.len();
        if len > MAX_WARNINGS {
            warnings.drain(0..len - MAX_WARNINGS);
        }
    }

    pub fn active(&self) -> Vec<Warning> {
        self.warnings.read().clone()
    }

    pub fn count(&self) -> usize {
        self.warnings.read().len()
    }

    pub fn count_at_least(&self, severity: WarningSeverity) -> usize {
        self.warnings
            .read()
            .iter()
            .filter(|w| w.severity >= severity)
            .count()
    }

    /// Drop warnings older than the retention window.
    pub fn cleanup(&self) {
        self.warnings
            .write()
            .retain(|w| w.age_minutes() < MAX_AGE_MINUTES);
    }
}
