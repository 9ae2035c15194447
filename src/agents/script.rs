//! Script agent - turns the brief (and the last critique) into an executable
//! plan.
use std::collections::HashSet;

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use super::{Agent, AgentCore, to_prompt_json};
use crate::error::truncate_preview;
use crate::state::{LoopState, StateUpdate, Status, Task};

pub const SCRIPT_PROMPT: &str = "You are the script agent of a creative pipeline. Break the brief \
into an ordered list of generation steps. Respond with a single JSON object: {\"script\": \
\"narrative or shot list\", \"plan\": [{\"step\": 1, \"task\": \"what to make\", \"capability\": \
\"image_gen\", \"params\": {\"prompt\": \"...\"}}]}.";

/// Capability used by the fallback plan.
pub const DEFAULT_IMAGE_CAPABILITY: &str = "image_gen";

const SCRIPT_PREVIEW_CHARS: usize = 160;

pub struct ScriptAgent {
    core: AgentCore,
}

impl ScriptAgent {
    pub fn new(core: AgentCore) -> Self {
        Self { core }
    }

    /// Single-step plan built from the raw brief task.
    pub fn fallback_plan(state: &LoopState) -> Vec<Task> {
        let task = state.brief().task.clone();
        let mut params = Map::new();
        params.insert("prompt".to_string(), json!(task));
        vec![Task {
            step: 1,
            task,
            capability: DEFAULT_IMAGE_CAPABILITY.to_string(),
            params,
        }]
    }

    fn user_message(state: &LoopState) -> String {
        let mut message = format!(
            "Brief: {brief}\n\
             Constraints: {constraints}\n\
             Project memory: {memory}\n",
            brief = state.brief().summary(),
            constraints = to_prompt_json(&state.brief().constraints),
            memory = to_prompt_json(&state.memory),
        );

        if state.iteration > 1
            && let Some(critique) = &state.critique
        {
            message.push_str(&format!(
                "\nThis is revision {iteration}. The previous attempt scored {score:.2}.\n\
                 Feedback: {feedback}\n\
                 Priority fixes: {fixes}\n\
                 Revise the plan to address these points.\n",
                iteration = state.iteration,
                score = critique.score,
                feedback = critique.feedback,
                fixes = to_prompt_json(&critique.priority_fixes),
            ));
        }

        message.push_str(
            "\nRespond with JSON: {\"script\": \"..\", \"plan\": [{\"step\": 1, \"task\": \"..\", \
             \"capability\": \"..\", \"params\": {..}}]}",
        );
        message
    }

    fn parse_plan(response: &Map<String, Value>) -> Vec<Task> {
        let plan = response
            .get("plan")
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .enumerate()
                    .filter_map(|(position, entry)| Task::from_model_value(position, entry))
                    .collect()
            })
            .unwrap_or_default();
        unique_steps(plan)
    }

    fn fallback_update(state: &LoopState, reason: String) -> StateUpdate {
        tracing::warn!(iteration = state.iteration, reason = %reason, "script fallback plan used");
        StateUpdate::new()
            .with_plan(Self::fallback_plan(state))
            .with_status(Status::Generating)
            .with_message("[script] Using fallback single-step plan.")
            .with_last_error(format!("script: {reason}"))
    }
}

/// Step numbers name output files, so they must not repeat. The first entry
/// keeps a contested number; later ones move past the highest number in use.
fn unique_steps(mut plan: Vec<Task>) -> Vec<Task> {
    let mut next_free = plan.iter().map(|task| task.step).max().unwrap_or(0);
    let mut seen = HashSet::new();
    for task in &mut plan {
        if !seen.insert(task.step) {
            next_free += 1;
            tracing::warn!(step = task.step, renumbered = next_free, "duplicate plan step renumbered");
            task.step = next_free;
            seen.insert(next_free);
        }
    }
    plan
}

#[async_trait]
impl Agent for ScriptAgent {
    fn name(&self) -> &'static str {
        "script"
    }

    async fn run(&self, state: &LoopState) -> StateUpdate {
        tracing::info!(iteration = state.iteration, "script agent start");

        let response = match self.core.call_json(Self::user_message(state)).await {
            Ok(response) => response,
            Err(err) => return Self::fallback_update(state, err.to_string()),
        };

        let plan = Self::parse_plan(&response);
        if plan.is_empty() {
            return Self::fallback_update(state, "model returned an empty plan".to_string());
        }

        let script = response
            .get("script")
            .and_then(Value::as_str)
            .unwrap_or_default();
        tracing::info!(steps = plan.len(), "plan created");

        let mut update = StateUpdate::new()
            .with_status(Status::Generating)
            .with_message(format!("[script] Created plan with {} step(s).", plan.len()));
        if !script.trim().is_empty() {
            update = update.with_message(format!(
                "[script] {}",
                truncate_preview(script.trim(), SCRIPT_PREVIEW_CHARS)
            ));
        }
        update.with_plan(plan)
    }
}
