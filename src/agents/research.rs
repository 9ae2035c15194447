//! Research agent - style keywords, negative prompts and recommendations.
use async_trait::async_trait;

use super::{Agent, AgentCore, to_prompt_json};
use crate::state::{LoopState, StateUpdate};

pub const RESEARCH_PROMPT: &str = "You are the research agent of a creative pipeline. Given a \
brief and the project memory, suggest visual and audio direction. Respond with a single JSON \
object with the keys style_keywords, negative_prompts and recommendations, each a list of short \
strings.";

/// Memory keys the research agent is allowed to write.
pub const RESEARCH_KEYS: &[&str] = &["style_keywords", "negative_prompts", "recommendations"];

pub struct ResearchAgent {
    core: AgentCore,
}

impl ResearchAgent {
    pub fn new(core: AgentCore) -> Self {
        Self { core }
    }

    fn user_message(state: &LoopState) -> String {
        format!(
            "Brief: {brief}\n\
             Reference assets: {references}\n\
             Project memory: {memory}\n\n\
             Respond with JSON:\n\
             {{\"style_keywords\": [..], \"negative_prompts\": [..], \"recommendations\": [..]}}",
            brief = state.brief().summary(),
            references = to_prompt_json(&state.brief().reference_assets),
            memory = to_prompt_json(&state.memory),
        )
    }
}

#[async_trait]
impl Agent for ResearchAgent {
    fn name(&self) -> &'static str {
        "research"
    }

    async fn run(&self, state: &LoopState) -> StateUpdate {
        tracing::info!(iteration = state.iteration, "research agent start");

        let response = match self.core.call_json(Self::user_message(state)).await {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(iteration = state.iteration, error = %err, "research failed, memory unchanged");
                return StateUpdate::new()
                    .with_message("[research] Research skipped (model response unusable).")
                    .with_last_error(format!("research: {err}"));
            }
        };

        let mut memory = state.memory.clone();
        let mut merged = Vec::new();
        for key in RESEARCH_KEYS {
            if let Some(value) = response.get(*key) {
                memory.insert((*key).to_string(), value.clone());
                merged.push(*key);
            }
        }
        tracing::debug!(keys = ?merged, "research keys merged into memory");

        StateUpdate::new()
            .with_memory(memory)
            .with_message(format!(
                "[research] Merged {} research key(s) into memory.",
                merged.len()
            ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::GenerationSettings;
    use crate::brief::Brief;
    use crate::llm::ScriptedBackend;
    use serde_json::json;
    use std::sync::Arc;

    fn agent(llm: Arc<ScriptedBackend>) -> ResearchAgent {
        ResearchAgent::new(AgentCore::new(
            "research",
            llm,
            RESEARCH_PROMPT,
            GenerationSettings::default(),
        ))
    }

    fn state_with_themes() -> LoopState {
        let mut state = LoopState::new(Brief::new("album cover"));
        state.iteration = 1;
        state.memory.insert("themes".into(), json!(["ocean"]));
        state
    }

    #[tokio::test]
    async fn merges_only_research_keys_present_in_response() {
        let llm = Arc::new(ScriptedBackend::always(
            r#"{"style_keywords": ["vaporwave"], "recommendations": ["use teal"], "themes": ["hijack"]}"#,
        ));
        let state = state_with_themes();

        let memory = agent(llm).run(&state).await.memory.unwrap();

        assert_eq!(memory["style_keywords"], json!(["vaporwave"]));
        assert_eq!(memory["recommendations"], json!(["use teal"]));
        assert_eq!(memory["themes"], json!(["ocean"]));
        assert!(!memory.contains_key("negative_prompts"));
    }

    #[tokio::test]
    async fn model_failure_passes_memory_through() {
        let llm = Arc::new(ScriptedBackend::new());
        let mut state = state_with_themes();

        let update = agent(llm).run(&state).await;
        assert!(update.memory.is_none());
        assert!(update.last_error.is_some());

        state.apply(update);
        assert_eq!(state.memory["themes"], json!(["ocean"]));
    }
}
