//! Curation applier
//!
//! Turns a curator's batch of operations into one atomic change to a
//! playbook. Operations are validated in order against the bullets that exist
//! when the batch starts; a single bad reference rejects the whole batch.

use chrono::{Duration, Utc};
use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, info};

use super::locks::PlaybookLocks;
use crate::error::{AceResult, ApplyError};
use crate::store::{BulletChange, PlaybookStore};
use crate::types::{validate_bullet_content, Bullet, Curation, Operation};

/// What a committed batch did
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ApplyReport {
    /// Ids of bullets created by `ADD`, in operation order
    pub added: Vec<String>,
    pub updated: usize,
    pub tagged: usize,
    pub removed: usize,
}

impl ApplyReport {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated == 0 && self.tagged == 0 && self.removed == 0
    }
}

/// Validate `operations` against `snapshot` and stage the resulting changes.
///
/// Referenced ids must be in the snapshot and not removed earlier in the
/// batch. Bullets added by the batch cannot be referenced by it.
pub fn plan(
    playbook_id: &str,
    snapshot: &[Bullet],
    operations: &[Operation],
) -> Result<(Vec<BulletChange>, ApplyReport), ApplyError> {
    let mut live: HashSet<&str> = snapshot.iter().map(|b| b.id.as_str()).collect();
    let mut changes = Vec::with_capacity(operations.len());
    let mut report = ApplyReport::default();
    let now = Utc::now();

    for (index, op) in operations.iter().enumerate() {
        if let Some(bullet_id) = op.bullet_id() {
            if !live.contains(bullet_id) {
                return Err(ApplyError::MissingBullet {
                    index,
                    kind: op.kind(),
                    bullet_id: bullet_id.to_string(),
                    playbook_id: playbook_id.to_string(),
                });
            }
        }

        if let Operation::Add { content } | Operation::Update { content, .. } = op {
            validate_bullet_content(content).map_err(|reason| ApplyError::InvalidContent {
                index,
                kind: op.kind(),
                reason,
            })?;
        }

        match op {
            Operation::Add { content } => {
                let mut bullet = Bullet::new(playbook_id, content.clone());
                // keep same-batch additions in operation order
                bullet.created_at = now + Duration::microseconds(report.added.len() as i64);
                bullet.modified_at = bullet.created_at;
                report.added.push(bullet.id.clone());
                changes.push(BulletChange::Insert(bullet));
            }
            Operation::Update { bullet_id, content } => {
                report.updated += 1;
                changes.push(BulletChange::UpdateContent {
                    bullet_id: bullet_id.clone(),
                    content: content.clone(),
                });
            }
            Operation::Tag { bullet_id, tag } => {
                report.tagged += 1;
                changes.push(BulletChange::Increment {
                    bullet_id: bullet_id.clone(),
                    tag: *tag,
                });
            }
            Operation::Remove { bullet_id } => {
                live.remove(bullet_id.as_str());
                report.removed += 1;
                changes.push(BulletChange::Delete {
                    bullet_id: bullet_id.clone(),
                });
            }
        }
    }

    Ok((changes, report))
}

/// Applies curations under the per-playbook lock
#[derive(Clone)]
pub struct CurationApplier {
    store: PlaybookStore,
    locks: PlaybookLocks,
}

impl CurationApplier {
    pub fn new(store: PlaybookStore, locks: PlaybookLocks) -> Self {
        Self { store, locks }
    }

    pub fn locks(&self) -> &PlaybookLocks {
        &self.locks
    }

    /// Apply a curation to a playbook, all or nothing
    pub async fn apply(&self, playbook_id: &str, curation: &Curation) -> AceResult<ApplyReport> {
        self.apply_inner(playbook_id, curation, None).await
    }

    /// Apply a curation and complete the learn job in the same commit
    pub async fn apply_for_job(
        &self,
        playbook_id: &str,
        job_id: &str,
        curation: &Curation,
    ) -> AceResult<ApplyReport> {
        self.apply_inner(playbook_id, curation, Some(job_id)).await
    }

    async fn apply_inner(
        &self,
        playbook_id: &str,
        curation: &Curation,
        complete_job: Option<&str>,
    ) -> AceResult<ApplyReport> {
        let _guard = self.locks.lock(playbook_id).await;

        let snapshot = self.store.list_bullets(playbook_id).await?;
        debug!(
            playbook_id,
            bullets = snapshot.len(),
            operations = curation.operations.len(),
            "Applying curation"
        );

        let (changes, report) = plan(playbook_id, &snapshot, &curation.operations)?;
        self.store
            .commit_curation(playbook_id, &changes, complete_job)
            .await?;

        info!(
            playbook_id,
            added = report.added.len(),
            updated = report.updated,
            tagged = report.tagged,
            removed = report.removed,
            "Curation applied"
        );
        Ok(report)
    }
}
