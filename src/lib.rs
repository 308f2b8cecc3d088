//! ACE - Agentic Context Engineering service
//!
//! Keeps per-task playbooks of short, counted lessons ("bullets") and
//! improves them from agent runs:
//! - Top-k retrieval of relevant bullets, embedded into prompts between markers
//! - Background learn jobs: reflect on a trajectory, curate edits, apply atomically
//! - SQLite persistence with resumable job checkpoints
//! - HTTP API (axum) and a CLI
//!
//! # Example
//!
//! ```ignore
//! use ace_service::{prompt, retrieval, PlaybookStore};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = PlaybookStore::open_in_memory()?;
//!     store.get_or_create_playbook("coding").await?;
//!     store.create_bullet("coding", "Run the tests before committing").await?;
//!
//!     let bullets = store.list_bullets("coding").await?;
//!     let top = retrieval::rank(&bullets, "fix the failing test", 5);
//!     println!("{}", prompt::embed("Fix the failing test", &top));
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod types;
pub mod config;
pub mod prompt;
pub mod retrieval;
pub mod store;
pub mod llm;
pub mod learning;
pub mod server;
pub mod cli;

pub use config::Config;
pub use error::{AceError, AceResult, ApplyError, CapabilityError};
pub use learning::{
    ApplyReport, CurationApplier, Curator, CuratorInput, LearnOrchestrator, LlmCapabilities,
    OrchestratorSettings, PlaybookLocks, Reflector, ReflectorInput, RetryPolicy,
};
pub use server::{router, start as start_server, AppState};
pub use store::PlaybookStore;
pub use types::{
    Bullet, BulletMetadata, Curation, JobStatus, LearnJob, LearnRequest, Operation, Playbook,
    Reflection, Tag,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
