//! Per-playbook write locks
//!
//! Writers to the same playbook (the curation applier and manual bullet
//! edits) take the playbook's lock; different playbooks never contend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;

/// Lock table keyed by playbook id
#[derive(Default, Clone)]
pub struct PlaybookLocks {
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl PlaybookLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `playbook_id`
    pub async fn lock(&self, playbook_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut table = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            // Drop entries nobody holds or waits on
            table.retain(|id, lock| id == playbook_id || Arc::strong_count(lock) > 1);
            table
                .entry(playbook_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Number of playbooks with a live lock entry
    pub fn len(&self) -> usize {
        self.locks
            .lock()
            .map(|table| table.len())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
