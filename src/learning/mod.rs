//! Playbook learning pipeline
//!
//! A learn job reflects on one agent run, curates edits from the reflection
//! and applies them to the playbook atomically.

pub mod applier;
pub mod capability;
pub mod locks;
pub mod orchestrator;
pub mod prompts;
pub mod retry;

pub use applier::{ApplyReport, CurationApplier};
pub use capability::{Curator, CuratorInput, LlmCapabilities, Reflector, ReflectorInput};
pub use locks::PlaybookLocks;
pub use orchestrator::{LearnOrchestrator, OrchestratorSettings};
pub use retry::RetryPolicy;
