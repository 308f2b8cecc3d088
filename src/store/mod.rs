//! Persistent storage for playbooks, bullets and learn jobs

mod sqlite;

pub use sqlite::PlaybookStore;

use crate::types::{Bullet, Tag};

/// One staged bullet mutation.
///
/// A list of changes is committed together by
/// [`PlaybookStore::commit_curation`]; if any change fails, none are kept.
#[derive(Debug, Clone, PartialEq)]
pub enum BulletChange {
    Insert(Bullet),
    UpdateContent { bullet_id: String, content: String },
    Increment { bullet_id: String, tag: Tag },
    Delete { bullet_id: String },
}

impl BulletChange {
    pub fn bullet_id(&self) -> &str {
        match self {
            BulletChange::Insert(bullet) => &bullet.id,
            BulletChange::UpdateContent { bullet_id, .. }
            | BulletChange::Increment { bullet_id, .. }
            | BulletChange::Delete { bullet_id } => bullet_id,
        }
    }
}

/// Name given to playbooks that are created implicitly on first reference
pub fn default_playbook_name(playbook_id: &str) -> String {
    let prefix: String = playbook_id.chars().take(8).collect();
    format!("Playbook {}", prefix)
}
