//! Reflector and curator capabilities
//!
//! Both are remote generation calls that return validated structured data or
//! a [`CapabilityError`]. The orchestrator only sees the traits; the
//! LLM-backed implementation lives here too.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use super::prompts;
use crate::config::LlmConfig;
use crate::error::CapabilityError;
use crate::llm::structured::parse_reply;
use crate::llm::{ChatMessage, LlmClient};
use crate::types::{validate_bullet_content, Curation, Operation, Reflection};

pub const REFLECTOR: &str = "reflector";
pub const CURATOR: &str = "curator";

/// Everything the reflector looks at
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReflectorInput {
    pub playbook_id: String,
    /// Playbook text the agent saw, or `(None)`
    pub retrieved_playbook: String,
    pub trajectory: String,
    pub ground_truth: Option<String>,
    pub evaluation: Option<String>,
    pub additional_instructions: Option<String>,
}

/// Everything the curator looks at
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CuratorInput {
    pub playbook_id: String,
    pub user_message: String,
    /// Full current playbook, rendered as bullet lines
    pub global_playbook: String,
    pub trajectory: String,
    pub reflection: Reflection,
    pub additional_instructions: Option<String>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Reflector: Send + Sync {
    async fn reflect(&self, input: &ReflectorInput) -> Result<Reflection, CapabilityError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Curator: Send + Sync {
    async fn curate(&self, input: &CuratorInput) -> Result<Curation, CapabilityError>;
}

/// Every tagged bullet id must occur in the playbook text the agent saw
pub fn validate_reflection(reflection: &Reflection, retrieved_playbook: &str) -> Result<(), String> {
    let unknown: Vec<&str> = reflection
        .bullet_tags
        .iter()
        .map(|t| t.id.as_str())
        .filter(|id| id.trim().is_empty() || !retrieved_playbook.contains(id))
        .collect();

    if unknown.is_empty() {
        Ok(())
    } else {
        Err(format!(
            "bullet ids in bullet_tags do not exist in the retrieved playbook: {}",
            unknown.join(", ")
        ))
    }
}

/// Referenced ids must occur in the current playbook and new content must be usable
pub fn validate_curation(curation: &Curation, global_playbook: &str) -> Result<(), String> {
    let mut problems = Vec::new();

    for (index, op) in curation.operations.iter().enumerate() {
        if let Some(bullet_id) = op.bullet_id() {
            if bullet_id.trim().is_empty() || !global_playbook.contains(bullet_id) {
                problems.push(format!("{} {}: unknown bullet id", op.kind(), bullet_id));
            }
        }
        if let Operation::Add { content } | Operation::Update { content, .. } = op {
            if let Err(reason) = validate_bullet_content(content) {
                problems.push(format!("operation {} ({}): {}", index, op.kind(), reason));
            }
        }
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(problems.join("; "))
    }
}

/// Reflector and curator backed by a chat-completions model
#[derive(Clone)]
pub struct LlmCapabilities {
    client: LlmClient,
    reflector_model: String,
    curator_model: String,
    temperature: f32,
    max_tokens: u32,
}

impl LlmCapabilities {
    pub fn new(client: LlmClient, config: &LlmConfig) -> Self {
        Self {
            client,
            reflector_model: config.reflector_model().to_string(),
            curator_model: config.curator_model().to_string(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }

    pub fn from_config(config: &LlmConfig) -> Self {
        Self::new(LlmClient::from_config(config), config)
    }

    async fn generate<T: DeserializeOwned>(
        &self,
        capability: &'static str,
        model: &str,
        prompt: String,
    ) -> Result<T, CapabilityError> {
        let messages = [
            ChatMessage::system(prompts::SYSTEM_PROMPT),
            ChatMessage::user(prompt),
        ];

        let completion = self
            .client
            .complete_json(model, &messages, Some(self.max_tokens), Some(self.temperature))
            .await
            .map_err(|e| CapabilityError::Transport {
                capability,
                message: format!("{:#}", e),
            })?;

        if let Some(refusal) = completion.refusal {
            warn!(capability, "Model refused: {}", refusal);
            return Err(CapabilityError::Refused {
                capability,
                message: refusal,
            });
        }

        if completion.finish_reason.as_deref() == Some("length") {
            return Err(CapabilityError::Malformed {
                capability,
                message: format!("reply cut off at max_tokens ({})", self.max_tokens),
            });
        }

        debug!(capability, model, "Structured reply received");
        parse_reply(&completion.content)
            .map_err(|message| CapabilityError::Malformed { capability, message })
    }
}

#[async_trait]
impl Reflector for LlmCapabilities {
    async fn reflect(&self, input: &ReflectorInput) -> Result<Reflection, CapabilityError> {
        let prompt = prompts::render_reflector_prompt(input);
        let reflection: Reflection = self
            .generate(REFLECTOR, &self.reflector_model, prompt)
            .await?;

        validate_reflection(&reflection, &input.retrieved_playbook).map_err(|message| {
            CapabilityError::Invalid {
                capability: REFLECTOR,
                message,
            }
        })?;

        Ok(reflection)
    }
}

#[async_trait]
impl Curator for LlmCapabilities {
    async fn curate(&self, input: &CuratorInput) -> Result<Curation, CapabilityError> {
        let prompt = prompts::render_curator_prompt(input);
        let curation: Curation = self.generate(CURATOR, &self.curator_model, prompt).await?;

        validate_curation(&curation, &input.global_playbook).map_err(|message| {
            CapabilityError::Invalid {
                capability: CURATOR,
                message,
            }
        })?;

        Ok(curation)
    }
}
