//! Pipeline agents.
//!
//! Every agent consumes the shared state and returns a partial update:
//!
//! - `memory`: cross-iteration context
//! - `research`: style keywords and recommendations
//! - `script`: the executable plan
//! - `director`: bounded concurrent capability execution
//! - `critic`: scoring against the quality threshold
//!
//! Agents never fail a pass: recoverable errors degrade to a safe default
//! update inside the agent.
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::llm::{GenerateRequest, LlmBackend};
use crate::state::{LoopState, StateUpdate};

pub mod critic;
pub mod director;
pub mod memory;
pub mod research;
pub mod response;
pub mod script;

pub use critic::CriticAgent;
pub use director::DirectorAgent;
pub use memory::MemoryAgent;
pub use research::ResearchAgent;
pub use script::ScriptAgent;

#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, state: &LoopState) -> StateUpdate;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationSettings {
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            max_tokens: 4096,
            temperature: 0.7,
        }
    }
}

/// Language-model plumbing shared by the LLM-backed agents.
#[derive(Clone)]
pub struct AgentCore {
    agent: &'static str,
    llm: Arc<dyn LlmBackend>,
    system_prompt: String,
    settings: GenerationSettings,
}

impl AgentCore {
    pub fn new(
        agent: &'static str,
        llm: Arc<dyn LlmBackend>,
        system_prompt: impl Into<String>,
        settings: GenerationSettings,
    ) -> Self {
        Self {
            agent,
            llm,
            system_prompt: system_prompt.into(),
            settings,
        }
    }

    /// Build a core whose system prompt is read from
    /// `{prompts_dir}/{agent}_agent.md`, falling back to `fallback_prompt`.
    pub fn from_prompts_dir(
        agent: &'static str,
        llm: Arc<dyn LlmBackend>,
        prompts_dir: &Path,
        fallback_prompt: &str,
        settings: GenerationSettings,
    ) -> Self {
        let system_prompt = load_system_prompt(prompts_dir, agent, fallback_prompt);
        Self::new(agent, llm, system_prompt, settings)
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn llm(&self) -> &Arc<dyn LlmBackend> {
        &self.llm
    }

    pub fn request(&self, user_message: String) -> GenerateRequest {
        GenerateRequest {
            agent: self.agent.to_string(),
            system_prompt: self.system_prompt.clone(),
            user_message,
            max_tokens: self.settings.max_tokens,
            temperature: self.settings.temperature,
        }
    }

    pub async fn call(&self, user_message: String) -> Result<String> {
        self.llm.generate(&self.request(user_message)).await
    }

    /// Call the model and extract a JSON object from its reply.
    pub async fn call_json(&self, user_message: String) -> Result<Map<String, Value>> {
        let text = self.call(user_message).await?;
        Ok(response::parse_model_object(&text)?)
    }

    pub async fn call_json_with_images(
        &self,
        user_message: String,
        images: &[PathBuf],
    ) -> Result<Map<String, Value>> {
        let request = self.request(user_message);
        let text = if images.is_empty() {
            self.llm.generate(&request).await?
        } else {
            self.llm.generate_with_images(&request, images).await?
        };
        Ok(response::parse_model_object(&text)?)
    }
}

pub fn load_system_prompt(prompts_dir: &Path, agent: &str, fallback: &str) -> String {
    let path = prompts_dir.join(format!("{agent}_agent.md"));
    match std::fs::read_to_string(&path) {
        Ok(prompt) if !prompt.trim().is_empty() => prompt,
        Ok(_) | Err(_) => {
            tracing::debug!(agent, path = %path.display(), "prompt file not found, using built-in prompt");
            fallback.to_string()
        }
    }
}

/// Render a JSON value for inclusion in a prompt.
pub(crate) fn to_prompt_json<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

/// Non-empty check used for memory keys: empty strings, arrays, objects,
/// `null` and `false` all count as absent.
pub fn is_meaningful(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) | Some(Value::Bool(false)) => false,
        Some(Value::String(s)) => !s.trim().is_empty(),
        Some(Value::Array(items)) => !items.is_empty(),
        Some(Value::Object(map)) => !map.is_empty(),
        Some(_) => true,
    }
}
