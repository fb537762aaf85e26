//! Block-on-error policy.

use std::collections::HashSet;
use std::sync::Arc;

use fc_store::JobStore;

use crate::Result;

/// Decides which message groups are gated by persisted ERROR jobs.
///
/// A group blocks while any of its jobs sits in ERROR; the block clears when
/// an operator retries (ERROR -> PENDING) or cancels the job.
pub struct BlockOnErrorChecker {
    store: Arc<dyn JobStore>,
}

impl BlockOnErrorChecker {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    pub async fn blocked_groups(&self, groups: &HashSet<String>) -> Result<HashSet<String>> {
        if groups.is_empty() {
            return Ok(HashSet::new());
        }
        Ok(self.store.blocked_groups(groups).await?)
    }
}
