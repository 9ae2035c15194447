//! Generation capabilities and the registry the Director dispatches through.
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value, json};

use crate::error::CapabilityError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityKind {
    Image,
    Audio,
    Video,
    Other,
}

impl CapabilityKind {
    pub fn label(self) -> &'static str {
        match self {
            CapabilityKind::Image => "image",
            CapabilityKind::Audio => "audio",
            CapabilityKind::Video => "video",
            CapabilityKind::Other => "other",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            CapabilityKind::Image => "png",
            CapabilityKind::Audio => "wav",
            CapabilityKind::Video => "mp4",
            CapabilityKind::Other => "bin",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CapabilityInput {
    pub prompt: String,
    pub params: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionContext {
    /// Where the capability should write its primary asset.
    pub output_path: PathBuf,
    pub iteration: u32,
    pub step: u32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CapabilityOutput {
    pub success: bool,
    pub asset_paths: Vec<String>,
    pub metadata: Map<String, Value>,
    pub error: Option<String>,
}

impl CapabilityOutput {
    pub fn succeeded(asset_paths: Vec<String>, metadata: Map<String, Value>) -> Self {
        Self {
            success: true,
            asset_paths,
            metadata,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            asset_paths: Vec::new(),
            metadata: Map::new(),
            error: Some(error.into()),
        }
    }
}

#[async_trait]
pub trait Capability: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn kind(&self) -> CapabilityKind;

    async fn execute(
        &self,
        input: CapabilityInput,
        ctx: &ExecutionContext,
    ) -> Result<CapabilityOutput, CapabilityError>;
}

/// Built-in capability catalogue: name, kind, description.
pub const KNOWN_CAPABILITIES: &[(&str, CapabilityKind, &str)] = &[
    ("image_gen", CapabilityKind::Image, "Generate still images from a prompt"),
    ("img2img", CapabilityKind::Image, "Transform a reference image guided by a prompt"),
    ("upscale", CapabilityKind::Image, "Upscale a generated image"),
    ("audio_gen", CapabilityKind::Audio, "Generate music or ambient audio"),
    ("tts", CapabilityKind::Audio, "Synthesize narration from text"),
    ("video_gen", CapabilityKind::Video, "Generate short video clips"),
    ("editing", CapabilityKind::Video, "Assemble and edit clips into a sequence"),
    ("captions", CapabilityKind::Other, "Produce caption and subtitle tracks"),
];

pub const DEFAULT_CAPABILITIES: &[&str] = &["image_gen", "audio_gen", "video_gen"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based), doubling each time.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Lookup of capabilities by name. Populated at startup, read-only during a
/// run.
#[derive(Default, Clone)]
pub struct CapabilityRegistry {
    capabilities: HashMap<String, Arc<dyn Capability>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry from configured capability names, wrapping each
    /// built-in capability in the retry policy.
    pub fn from_config(names: &[String], retry: RetryPolicy) -> Self {
        let mut registry = Self::new();
        for name in names {
            let name = name.trim();
            let Some((known, kind, description)) = KNOWN_CAPABILITIES
                .iter()
                .find(|(known, _, _)| *known == name)
            else {
                tracing::warn!(capability = name, "unknown capability in configuration, skipping");
                continue;
            };
            let inner = Arc::new(PlaceholderCapability::new(*known, *kind, *description));
            registry.register(Arc::new(RetryingCapability::new(inner, retry)));
            tracing::debug!(capability = known, kind = kind.label(), "capability loaded");
        }
        registry
    }

    pub fn register(&mut self, capability: Arc<dyn Capability>) {
        self.capabilities
            .insert(capability.name().to_string(), capability);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.capabilities.get(name).cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.capabilities.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names = self.capabilities.keys().cloned().collect::<Vec<_>>();
        names.sort();
        names
    }

    pub fn details(&self) -> Vec<Value> {
        self.names()
            .into_iter()
            .filter_map(|name| self.capabilities.get(&name))
            .map(|capability| {
                json!({
                    "name": capability.name(),
                    "kind": capability.kind().label(),
                    "description": capability.description(),
                })
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }
}

/// Offline stand-in for a generation backend: writes a JSON manifest of the
/// request to the output path.
pub struct PlaceholderCapability {
    name: String,
    kind: CapabilityKind,
    description: String,
}

impl PlaceholderCapability {
    pub fn new(name: impl Into<String>, kind: CapabilityKind, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            description: description.into(),
        }
    }
}

#[async_trait]
impl Capability for PlaceholderCapability {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn kind(&self) -> CapabilityKind {
        self.kind
    }

    async fn execute(
        &self,
        input: CapabilityInput,
        ctx: &ExecutionContext,
    ) -> Result<CapabilityOutput, CapabilityError> {
        if let Some(parent) = ctx.output_path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let manifest = json!({
            "placeholder": true,
            "capability": self.name,
            "kind": self.kind.label(),
            "iteration": ctx.iteration,
            "step": ctx.step,
            "prompt": input.prompt,
            "params": input.params,
        });
        let body = serde_json::to_vec_pretty(&manifest)
            .map_err(|err| CapabilityError::Failed(format!("failed to encode placeholder: {err}")))?;
        tokio::fs::write(&ctx.output_path, body).await?;

        let mut metadata = Map::new();
        metadata.insert("source".to_string(), json!("placeholder"));
        Ok(CapabilityOutput::succeeded(
            vec![ctx.output_path.to_string_lossy().to_string()],
            metadata,
        ))
    }
}

/// Retries transient failures of the wrapped capability with exponential
/// backoff. Non-transient errors and `success=false` outputs pass through.
pub struct RetryingCapability {
    inner: Arc<dyn Capability>,
    policy: RetryPolicy,
}

impl RetryingCapability {
    pub fn new(inner: Arc<dyn Capability>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl Capability for RetryingCapability {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn description(&self) -> &str {
        self.inner.description()
    }

    fn kind(&self) -> CapabilityKind {
        self.inner.kind()
    }

    async fn execute(
        &self,
        input: CapabilityInput,
        ctx: &ExecutionContext,
    ) -> Result<CapabilityOutput, CapabilityError> {
        let attempts = self.policy.attempts.max(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.inner.execute(input.clone(), ctx).await {
                Err(err) if err.is_transient() && attempt < attempts => {
                    let delay = self.policy.delay_for(attempt);
                    tracing::warn!(
                        capability = self.inner.name(),
                        step = ctx.step,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient capability failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }
}
