//! Shared state threaded through one pipeline run, and the typed partial
//! updates agents return.
//!
//! Merge strategy applied by [`LoopState::apply`]:
//! - `plan`, `assets`, `critique`, `memory`, `status`, `director_retries`,
//!   `human_approval`, `last_error`: overwrite when the update carries a value.
//! - `messages`: append.
//! - `brief`, `iteration`: not updatable by agents.
//!
//! Accumulating assets across passes is the iteration controller's job.
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::brief::Brief;

pub type Memory = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub step: u32,
    pub task: String,
    pub capability: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl Task {
    /// Lenient conversion of one model-produced plan entry. Entries without
    /// a capability name are dropped; a missing step number falls back to
    /// the entry's 1-based position.
    pub fn from_model_value(position: usize, value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let capability = obj
            .get("capability")
            .or_else(|| obj.get("skill"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|name| !name.is_empty())?
            .to_string();
        let step = obj
            .get("step")
            .and_then(Value::as_u64)
            .and_then(|step| u32::try_from(step).ok())
            .unwrap_or(position as u32 + 1);
        let task = obj
            .get("task")
            .or_else(|| obj.get("description"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let params = obj
            .get("params")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        Some(Self {
            step,
            task,
            capability,
            params,
        })
    }

    /// Prompt handed to the capability: an explicit `params.prompt` wins over
    /// the task description.
    pub fn prompt(&self) -> String {
        self.params
            .get("prompt")
            .and_then(Value::as_str)
            .filter(|prompt| !prompt.trim().is_empty())
            .map(ToString::to_string)
            .unwrap_or_else(|| self.task.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    #[serde(rename = "type")]
    pub kind: String,
    pub path: String,
    pub step: u32,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Critique {
    pub score: f64,
    pub pass: bool,
    #[serde(default)]
    pub feedback: String,
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub improvements: Vec<String>,
    #[serde(default)]
    pub priority_fixes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HumanApproval {
    pub approved: bool,
    #[serde(default)]
    pub notes: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Planning,
    Generating,
    Critiquing,
    Revising,
    Complete,
}

impl Status {
    pub fn label(self) -> &'static str {
        match self {
            Status::Planning => "planning",
            Status::Generating => "generating",
            Status::Critiquing => "critiquing",
            Status::Revising => "revising",
            Status::Complete => "complete",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoopState {
    brief: Arc<Brief>,
    pub iteration: u32,
    pub plan: Vec<Task>,
    pub assets: Vec<Asset>,
    pub critique: Option<Critique>,
    pub messages: Vec<String>,
    pub memory: Memory,
    pub status: Status,
    pub director_retries: u32,
    pub human_approval: Option<HumanApproval>,
    pub last_error: Option<String>,
}

impl LoopState {
    pub fn new(brief: Brief) -> Self {
        Self {
            brief: Arc::new(brief),
            iteration: 0,
            plan: Vec::new(),
            assets: Vec::new(),
            critique: None,
            messages: Vec::new(),
            memory: Memory::new(),
            status: Status::Planning,
            director_retries: 0,
            human_approval: None,
            last_error: None,
        }
    }

    pub fn brief(&self) -> &Brief {
        &self.brief
    }

    pub fn score(&self) -> f64 {
        self.critique.as_ref().map(|c| c.score).unwrap_or(0.0)
    }

    pub fn passed(&self) -> bool {
        self.critique.as_ref().map(|c| c.pass).unwrap_or(false)
    }

    /// Reset the per-iteration scoped fields before a pass begins.
    pub fn begin_iteration(&mut self, iteration: u32) {
        self.iteration = iteration;
        self.director_retries = 0;
        self.human_approval = None;
    }

    pub fn apply(&mut self, update: StateUpdate) {
        let StateUpdate {
            plan,
            assets,
            critique,
            messages,
            memory,
            status,
            director_retries,
            human_approval,
            last_error,
        } = update;

        if let Some(plan) = plan {
            self.plan = plan;
        }
        if let Some(assets) = assets {
            self.assets = assets;
        }
        if let Some(critique) = critique {
            self.critique = Some(critique);
        }
        self.messages.extend(messages);
        if let Some(memory) = memory {
            self.memory = memory;
        }
        if let Some(status) = status {
            self.status = status;
        }
        if let Some(retries) = director_retries {
            self.director_retries = retries;
        }
        if let Some(approval) = human_approval {
            self.human_approval = Some(approval);
        }
        if let Some(error) = last_error {
            self.last_error = Some(error);
        }
    }

    /// Copy of the state with the diagnostic message log dropped.
    pub fn snapshot_without_messages(&self) -> Self {
        let mut snapshot = self.clone();
        snapshot.messages.clear();
        snapshot
    }
}

/// Partial state update returned by an agent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateUpdate {
    pub plan: Option<Vec<Task>>,
    pub assets: Option<Vec<Asset>>,
    pub critique: Option<Critique>,
    pub messages: Vec<String>,
    pub memory: Option<Memory>,
    pub status: Option<Status>,
    pub director_retries: Option<u32>,
    pub human_approval: Option<HumanApproval>,
    pub last_error: Option<String>,
}

impl StateUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plan(mut self, plan: Vec<Task>) -> Self {
        self.plan = Some(plan);
        self
    }

    pub fn with_assets(mut self, assets: Vec<Asset>) -> Self {
        self.assets = Some(assets);
        self
    }

    pub fn with_critique(mut self, critique: Critique) -> Self {
        self.critique = Some(critique);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.messages.push(message.into());
        self
    }

    pub fn with_memory(mut self, memory: Memory) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_status(mut self, status: Status) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_director_retries(mut self, retries: u32) -> Self {
        self.director_retries = Some(retries);
        self
    }

    pub fn with_human_approval(mut self, approval: HumanApproval) -> Self {
        self.human_approval = Some(approval);
        self
    }

    pub fn with_last_error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(error.into());
        self
    }
}
