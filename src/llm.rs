use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub struct GenerateRequest {
    /// Name of the agent issuing the call, used for routing and logging.
    pub agent: String,
    pub system_prompt: String,
    pub user_message: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// Language-model collaborator consumed by every agent.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, request: &GenerateRequest) -> Result<String>;

    fn supports_vision(&self) -> bool {
        false
    }

    /// Generate with attached images. Backends without vision support fall
    /// back to a text-only call.
    async fn generate_with_images(
        &self,
        request: &GenerateRequest,
        images: &[PathBuf],
    ) -> Result<String> {
        if !images.is_empty() {
            tracing::debug!(
                backend = self.name(),
                images = images.len(),
                "backend has no vision support, sending text only"
            );
        }
        self.generate(request).await
    }
}

const DEFAULT_QUEUE: &str = "default";

/// Deterministic replay backend.
///
/// Responses are queued per agent name. Once a queue holds a single response
/// it is repeated for every further call; agents without a queue of their own
/// draw from the `default` queue.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    queues: Mutex<HashMap<String, VecDeque<String>>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve the same response to every agent.
    pub fn always(response: impl Into<String>) -> Self {
        Self::new().with_responses(DEFAULT_QUEUE, [response.into()])
    }

    pub fn with_responses<I, S>(self, agent: &str, responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        {
            let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
            queues
                .entry(agent.to_string())
                .or_default()
                .extend(responses.into_iter().map(Into::into));
        }
        self
    }

    /// Load a replay file: an object mapping agent names to a response or a
    /// list of responses. String responses are used verbatim, any other JSON
    /// value is serialized.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read replay file '{}'", path.display()))?;
        let parsed = serde_json::from_str::<Value>(&content)
            .with_context(|| format!("replay file '{}' is not valid JSON", path.display()))?;
        let agents = parsed.as_object().ok_or_else(|| {
            anyhow::anyhow!(
                "replay file '{}' must map agent names to responses",
                path.display()
            )
        })?;

        let mut backend = Self::new();
        for (agent, value) in agents {
            let responses = match value {
                Value::Array(items) => items.iter().map(render_response).collect::<Vec<_>>(),
                other => vec![render_response(other)],
            };
            backend = backend.with_responses(agent, responses);
        }
        Ok(backend)
    }

    pub fn calls_for(&self, agent: &str) -> usize {
        let calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
        calls.get(agent).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        let calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
        calls.values().sum()
    }

    fn next_response(&self, agent: &str) -> Option<String> {
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        let key = if queues.get(agent).is_some_and(|q| !q.is_empty()) {
            agent
        } else {
            DEFAULT_QUEUE
        };
        let queue = queues.get_mut(key)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

fn render_response(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl LlmBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<String> {
        {
            let mut calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
            *calls.entry(request.agent.clone()).or_insert(0) += 1;
        }
        self.next_response(&request.agent).ok_or_else(|| {
            anyhow::anyhow!(
                "scripted language-model backend has no response for agent '{}'",
                request.agent
            )
        })
    }
}
