//! Memory agent - cross-iteration project context.
use async_trait::async_trait;
use serde_json::json;

use super::{Agent, AgentCore, to_prompt_json};
use crate::state::{LoopState, Memory, StateUpdate, Status};

pub const MEMORY_PROMPT: &str = "You are the memory agent of a creative pipeline. You keep a \
compact record of what has been tried across iterations. Respond with a single JSON object \
with the keys themes, successful_approaches, rejected_approaches and iteration_summaries, each \
a list of short strings.";

pub struct MemoryAgent {
    core: AgentCore,
}

impl MemoryAgent {
    pub fn new(core: AgentCore) -> Self {
        Self { core }
    }

    /// Memory skeleton used on the first iteration.
    pub fn initial_memory() -> Memory {
        let mut memory = Memory::new();
        for key in [
            "themes",
            "successful_approaches",
            "rejected_approaches",
            "iteration_summaries",
        ] {
            memory.insert(key.to_string(), json!([]));
        }
        memory
    }

    fn user_message(state: &LoopState) -> String {
        format!(
            "Iteration {iteration}. Update the project memory based on the last iteration's results.\n\n\
             Current memory: {memory}\n\
             Last critique: {critique}\n\n\
             Respond with JSON:\n\
             {{\"themes\": [..], \"successful_approaches\": [..], \"rejected_approaches\": [..], \
             \"iteration_summaries\": [..]}}",
            iteration = state.iteration,
            memory = to_prompt_json(&state.memory),
            critique = to_prompt_json(&state.critique),
        )
    }
}

#[async_trait]
impl Agent for MemoryAgent {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn run(&self, state: &LoopState) -> StateUpdate {
        tracing::info!(iteration = state.iteration, "memory agent start");

        if state.iteration <= 1 {
            return StateUpdate::new()
                .with_memory(Self::initial_memory())
                .with_status(Status::Planning)
                .with_message("[memory] Initialized memory for new project.");
        }

        match self.core.call_json(Self::user_message(state)).await {
            Ok(response) => {
                // Keys the model returns replace ours; keys it omits (for
                // example research results) survive.
                let mut memory = state.memory.clone();
                for (key, value) in response {
                    memory.insert(key, value);
                }
                StateUpdate::new()
                    .with_memory(memory)
                    .with_status(Status::Planning)
                    .with_message(format!(
                        "[memory] Updated memory for iteration {}.",
                        state.iteration
                    ))
            }
            Err(err) => {
                tracing::warn!(iteration = state.iteration, error = %err, "memory update failed, keeping previous memory");
                StateUpdate::new()
                    .with_status(Status::Planning)
                    .with_message("[memory] Kept existing memory (update failed).")
                    .with_last_error(format!("memory: {err}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::GenerationSettings;
    use crate::brief::Brief;
    use crate::llm::ScriptedBackend;
    use std::sync::Arc;

    fn agent(llm: Arc<ScriptedBackend>) -> MemoryAgent {
        MemoryAgent::new(AgentCore::new(
            "memory",
            llm,
            MEMORY_PROMPT,
            GenerationSettings::default(),
        ))
    }

    #[tokio::test]
    async fn first_iteration_initializes_without_model_call() {
        let llm = Arc::new(ScriptedBackend::always("{}"));
        let mut state = LoopState::new(Brief::new("poster"));
        state.iteration = 1;

        let update = agent(llm.clone()).run(&state).await;

        assert_eq!(update.memory, Some(MemoryAgent::initial_memory()));
        assert_eq!(llm.total_calls(), 0);
    }

    #[tokio::test]
    async fn later_iterations_merge_model_keys_over_previous_memory() {
        let llm = Arc::new(ScriptedBackend::always(
            r#"{"themes": ["neon"], "iteration_summaries": ["too dark"]}"#,
        ));
        let mut state = LoopState::new(Brief::new("poster"));
        state.iteration = 2;
        state.memory.insert("style_keywords".into(), json!(["noir"]));

        let update = agent(llm.clone()).run(&state).await;
        let memory = update.memory.unwrap();

        assert_eq!(memory["themes"], json!(["neon"]));
        assert_eq!(memory["style_keywords"], json!(["noir"]));
        assert_eq!(memory["iteration_summaries"], json!(["too dark"]));
        assert_eq!(llm.calls_for("memory"), 1);
    }

    #[tokio::test]
    async fn parse_failure_keeps_previous_memory() {
        let llm = Arc::new(ScriptedBackend::always("I cannot do that."));
        let mut state = LoopState::new(Brief::new("poster"));
        state.iteration = 3;
        state.memory.insert("themes".into(), json!(["retro"]));

        let update = agent(llm).run(&state).await;

        assert!(update.memory.is_none());
        state.apply(update);
        assert_eq!(state.memory["themes"], json!(["retro"]));
    }
}
