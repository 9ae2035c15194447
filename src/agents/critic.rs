//! Critic agent - scores the pass against the quality threshold.
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::director::asset_summary;
use super::{Agent, AgentCore, to_prompt_json};
use crate::state::{Critique, LoopState, StateUpdate, Status};

pub const CRITIC_PROMPT: &str = "You are the critic agent of a creative pipeline. Judge the \
generated assets against the brief. Respond with a single JSON object: {\"score\": 0.0-1.0, \
\"feedback\": \"..\", \"strengths\": [..], \"improvements\": [..], \"priority_fixes\": [..]}.";

pub const DEFAULT_QUALITY_THRESHOLD: f64 = 0.7;

/// Score used when the model reply cannot be interpreted.
pub const FALLBACK_SCORE: f64 = 0.5;

const MAX_PLAN_ENTRIES: usize = 10;
const MAX_VISION_IMAGES: usize = 10;
const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp"];

pub struct CriticAgent {
    core: AgentCore,
    threshold: f64,
}

impl CriticAgent {
    pub fn new(core: AgentCore, threshold: f64) -> Self {
        Self {
            core,
            threshold: threshold.clamp(0.0, 1.0),
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    fn user_message(&self, state: &LoopState) -> String {
        let plan = state
            .plan
            .iter()
            .take(MAX_PLAN_ENTRIES)
            .collect::<Vec<_>>();
        let assets = state.assets.iter().map(asset_summary).collect::<Vec<_>>();
        format!(
            "Brief: {brief}\n\
             Iteration: {iteration}\n\
             Plan: {plan}\n\
             Assets: {assets}\n\
             Quality threshold: {threshold:.2}\n\n\
             Score the result from 0.0 to 1.0. Respond with JSON:\n\
             {{\"score\": .., \"feedback\": \"..\", \"strengths\": [..], \"improvements\": [..], \
             \"priority_fixes\": [..]}}",
            brief = state.brief().summary(),
            iteration = state.iteration,
            plan = to_prompt_json(&plan),
            assets = to_prompt_json(&assets),
            threshold = self.threshold,
        )
    }

    fn vision_images(state: &LoopState) -> Vec<PathBuf> {
        state
            .assets
            .iter()
            .map(|asset| PathBuf::from(&asset.path))
            .filter(|path| is_image(path) && path.exists())
            .take(MAX_VISION_IMAGES)
            .collect()
    }

    fn critique_from_response(&self, response: &Map<String, Value>) -> Option<Critique> {
        let score = response
            .get("score")
            .and_then(score_value)
            .filter(|score| score.is_finite())?
            .clamp(0.0, 1.0);
        Some(Critique {
            score,
            pass: score >= self.threshold,
            feedback: response
                .get("feedback")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            strengths: string_list(response.get("strengths")),
            improvements: string_list(response.get("improvements")),
            priority_fixes: string_list(response.get("priority_fixes")),
        })
    }

    fn finish(critique: Critique, message: String) -> StateUpdate {
        let status = if critique.pass {
            Status::Complete
        } else {
            Status::Revising
        };
        StateUpdate::new()
            .with_critique(critique)
            .with_status(status)
            .with_message(message)
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
}

/// Models sometimes quote the score.
fn score_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(text) => Some(text.clone()),
                Value::Null => None,
                other => Some(other.to_string()),
            })
            .collect(),
        Some(Value::String(text)) if !text.trim().is_empty() => vec![text.clone()],
        _ => Vec::new(),
    }
}

#[async_trait]
impl Agent for CriticAgent {
    fn name(&self) -> &'static str {
        "critic"
    }

    async fn run(&self, state: &LoopState) -> StateUpdate {
        tracing::info!(
            iteration = state.iteration,
            assets = state.assets.len(),
            "critic agent start"
        );

        if state.assets.is_empty() {
            let critique = Critique {
                score: 0.0,
                pass: false,
                feedback: "No assets were generated in this pass.".to_string(),
                strengths: Vec::new(),
                improvements: Vec::new(),
                priority_fixes: vec!["Produce at least one asset.".to_string()],
            };
            return Self::finish(critique, "[critic] No assets to evaluate, score 0.00.".to_string());
        }

        let images = if self.core.llm().supports_vision() {
            Self::vision_images(state)
        } else {
            Vec::new()
        };

        let critique = match self
            .core
            .call_json_with_images(self.user_message(state), &images)
            .await
            .map_err(|err| err.to_string())
            .and_then(|response| {
                self.critique_from_response(&response)
                    .ok_or_else(|| "missing or non-numeric score".to_string())
            }) {
            Ok(critique) => critique,
            Err(reason) => {
                tracing::warn!(iteration = state.iteration, reason = %reason, "critique unusable, using fallback score");
                let critique = Critique {
                    score: FALLBACK_SCORE,
                    pass: false,
                    feedback: format!("Critique could not be parsed ({reason}); revising."),
                    strengths: Vec::new(),
                    improvements: Vec::new(),
                    priority_fixes: Vec::new(),
                };
                return Self::finish(
                    critique,
                    format!("[critic] Fallback score {FALLBACK_SCORE:.2}."),
                )
                .with_last_error(format!("critic: {reason}"));
            }
        };

        tracing::info!(
            iteration = state.iteration,
            score = critique.score,
            pass = critique.pass,
            threshold = self.threshold,
            images = images.len(),
            "critique complete"
        );
        let message = format!(
            "[critic] Score {:.2} ({}).",
            critique.score,
            if critique.pass { "pass" } else { "revise" }
        );
        Self::finish(critique, message)
    }
}
