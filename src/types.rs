//! Shared types used across modules
//!
//! Playbooks, bullets, learn jobs and the structured records the reflector
//! and curator produce. These are also the JSON shapes of the HTTP API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{AceError, AceResult};

/// A named collection of bullets for one agent or task domain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Playbook {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Counters describing how a bullet influenced past runs.
///
/// Unknown fields are kept in `extra` and written back untouched, so newer
/// writers can attach values older readers do not understand.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BulletMetadata {
    #[serde(default)]
    pub helpful_count: u64,
    #[serde(default)]
    pub harmful_count: u64,
    #[serde(default)]
    pub neutral_count: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl BulletMetadata {
    /// Bump the counter matching `tag` by one
    pub fn record(&mut self, tag: Tag) {
        match tag {
            Tag::Helpful => self.helpful_count += 1,
            Tag::Harmful => self.harmful_count += 1,
            Tag::Neutral => self.neutral_count += 1,
        }
    }

    pub fn count(&self, tag: Tag) -> u64 {
        match tag {
            Tag::Helpful => self.helpful_count,
            Tag::Harmful => self.harmful_count,
            Tag::Neutral => self.neutral_count,
        }
    }

    pub fn total(&self) -> u64 {
        self.helpful_count + self.harmful_count + self.neutral_count
    }
}

/// A single lesson learned from prior runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bullet {
    pub id: String,
    pub playbook_id: String,
    pub content: String,
    pub metadata: BulletMetadata,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl Bullet {
    /// Fresh bullet with zeroed counters and a generated id
    pub fn new(playbook_id: impl Into<String>, content: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            playbook_id: playbook_id.into(),
            content: content.into(),
            metadata: BulletMetadata::default(),
            created_at: now,
            modified_at: now,
        }
    }
}

/// How a bullet influenced the outcome of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tag {
    Helpful,
    Harmful,
    Neutral,
}

impl Tag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tag::Helpful => "helpful",
            Tag::Harmful => "harmful",
            Tag::Neutral => "neutral",
        }
    }
}

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Tag {
    type Err = AceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "helpful" => Ok(Tag::Helpful),
            "harmful" => Ok(Tag::Harmful),
            "neutral" => Ok(Tag::Neutral),
            other => Err(AceError::validation(format!(
                "invalid tag '{}' (expected helpful, harmful or neutral)",
                other
            ))),
        }
    }
}

/// A bullet the reflector judged against the run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulletTag {
    pub id: String,
    pub tag: Tag,
}

/// Post-mortem analysis of one trajectory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reflection {
    pub reasoning: String,
    pub error_identification: String,
    pub root_cause_analysis: String,
    pub correct_approach: String,
    pub key_insight: String,
    #[serde(default)]
    pub bullet_tags: Vec<BulletTag>,
}

/// One structural edit to a playbook
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum Operation {
    Add { content: String },
    Update { bullet_id: String, content: String },
    Tag { bullet_id: String, tag: Tag },
    Remove { bullet_id: String },
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Add { .. } => OperationKind::Add,
            Operation::Update { .. } => OperationKind::Update,
            Operation::Tag { .. } => OperationKind::Tag,
            Operation::Remove { .. } => OperationKind::Remove,
        }
    }

    /// The existing bullet this operation targets, if any
    pub fn bullet_id(&self) -> Option<&str> {
        match self {
            Operation::Add { .. } => None,
            Operation::Update { bullet_id, .. }
            | Operation::Tag { bullet_id, .. }
            | Operation::Remove { bullet_id } => Some(bullet_id),
        }
    }
}

/// Discriminant of an [`Operation`], used in error reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationKind {
    Add,
    Update,
    Tag,
    Remove,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationKind::Add => write!(f, "ADD"),
            OperationKind::Update => write!(f, "UPDATE"),
            OperationKind::Tag => write!(f, "TAG"),
            OperationKind::Remove => write!(f, "REMOVE"),
        }
    }
}

/// A batch of edits derived from one reflection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Curation {
    pub reasoning: String,
    #[serde(default)]
    pub operations: Vec<Operation>,
}

/// Learn job lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// Completed and failed jobs are never modified again
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = AceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(AceError::Internal(format!("unknown job status '{}'", other))),
        }
    }
}

/// Progress of one reflect → curate → apply run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnJob {
    pub id: String,
    pub playbook_id: String,
    pub status: JobStatus,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub reflection: Option<Reflection>,
    #[serde(default)]
    pub curation: Option<Curation>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

/// Everything a learn job needs to run. Persisted with the job so an
/// interrupted run can be resumed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LearnRequest {
    /// Original user instruction that kicked off the agent run
    pub user_message: String,
    /// Full reasoning trace, tool calls and outputs of the run
    pub trajectory: String,
    /// Playbook text the agent saw; recovered from the trajectory markers when absent
    #[serde(default)]
    pub retrieved_playbook: Option<String>,
    #[serde(default)]
    pub ground_truth: Option<String>,
    /// Execution feedback such as test results or grader output
    #[serde(default)]
    pub evaluation: Option<String>,
    #[serde(default)]
    pub reflector_additional_instructions: Option<String>,
    #[serde(default)]
    pub curator_additional_instructions: Option<String>,
}

impl LearnRequest {
    pub fn new(user_message: impl Into<String>, trajectory: impl Into<String>) -> Self {
        Self {
            user_message: user_message.into(),
            trajectory: trajectory.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> AceResult<()> {
        if self.user_message.trim().is_empty() {
            return Err(AceError::validation("user_message must not be empty"));
        }
        if self.trajectory.trim().is_empty() {
            return Err(AceError::validation("trajectory must not be empty"));
        }
        Ok(())
    }
}

/// Check the bullet content invariants: non-empty and free of playbook markers
pub fn validate_bullet_content(content: &str) -> Result<(), String> {
    if content.trim().is_empty() {
        return Err("content must not be empty".to_string());
    }
    if crate::prompt::contains_marker(content) {
        return Err("content must not contain playbook markers".to_string());
    }
    Ok(())
}
