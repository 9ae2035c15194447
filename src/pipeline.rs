//! Iteration controller.
//!
//! Runs up to `max_iterations` passes of the agent graph. Each pass runs on
//! its own task under a wall-clock timeout; a timed-out, panicking or
//! malformed pass is discarded whole and the loop moves on. Assets from
//! successful passes are tagged with their iteration and accumulated, the
//! best-scoring iteration is tracked, and every pass is checkpointed through
//! the versioning collaborator.
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::json;

use crate::agents::{
    AgentCore, CriticAgent, DirectorAgent, MemoryAgent, ResearchAgent, ScriptAgent, critic,
    memory, research, script,
};
use crate::brief::Brief;
use crate::capability::CapabilityRegistry;
use crate::config::RuntimeConfig;
use crate::error::PassError;
use crate::events::{self, Emitter};
use crate::graph::{AgentSet, HumanApprover, PassExecutor};
use crate::llm::LlmBackend;
use crate::state::{Asset, LoopState, Status};
use crate::versioning::{
    CommitHandle, GitVersioning, NoVersioning, Versioning, best_iteration_tag,
};

#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub output_dir: PathBuf,
    pub max_iterations: u32,
    pub iteration_timeout: Duration,
}

impl LoopSettings {
    pub fn from_config(cfg: &RuntimeConfig) -> Self {
        Self {
            output_dir: cfg.output_dir.clone(),
            max_iterations: cfg.max_iterations.max(1),
            iteration_timeout: cfg.iteration_timeout(),
        }
    }
}

/// Best-scoring iteration seen so far.
#[derive(Debug, Clone)]
pub struct BestIteration {
    pub iteration: u32,
    pub score: f64,
    /// State at the end of that pass, without the message log.
    pub snapshot: LoopState,
    pub commit: Option<CommitHandle>,
}

#[derive(Debug, Clone)]
pub struct LoopOutcome {
    pub output_dir: PathBuf,
    /// State after the last completed pass; `assets` holds every iteration's
    /// assets.
    pub final_state: LoopState,
    pub best: Option<BestIteration>,
    pub passed: bool,
    pub iterations_run: u32,
}

impl LoopOutcome {
    pub fn best_score(&self) -> f64 {
        self.best.as_ref().map(|best| best.score).unwrap_or(0.0)
    }

    pub fn best_iteration(&self) -> u32 {
        self.best.as_ref().map(|best| best.iteration).unwrap_or(0)
    }
}

pub struct Pipeline {
    executor: PassExecutor,
    registry: Arc<CapabilityRegistry>,
    versioning: Arc<dyn Versioning>,
    events: Emitter,
    settings: LoopSettings,
}

impl Pipeline {
    pub fn new(
        executor: PassExecutor,
        registry: Arc<CapabilityRegistry>,
        settings: LoopSettings,
    ) -> Self {
        Self {
            executor,
            registry,
            versioning: Arc::new(NoVersioning),
            events: Emitter::disabled(),
            settings,
        }
    }

    /// Wire the full agent set from resolved configuration.
    pub fn from_config(cfg: &RuntimeConfig, llm: Arc<dyn LlmBackend>) -> Self {
        let registry = Arc::new(CapabilityRegistry::from_config(
            &cfg.capabilities,
            cfg.retry_policy(),
        ));
        let agents = build_agents(cfg, llm, registry.clone());
        let versioning: Arc<dyn Versioning> = if cfg.versioning_enabled {
            Arc::new(GitVersioning::new(cfg.output_dir.clone()))
        } else {
            Arc::new(NoVersioning)
        };
        Self::new(
            PassExecutor::new(agents),
            registry,
            LoopSettings::from_config(cfg),
        )
        .with_versioning(versioning)
    }

    pub fn with_versioning(mut self, versioning: Arc<dyn Versioning>) -> Self {
        self.versioning = versioning;
        self
    }

    pub fn with_events(mut self, events: Emitter) -> Self {
        self.executor = self.executor.with_events(events.clone());
        self.events = events;
        self
    }

    pub fn with_approver(mut self, approver: Arc<dyn HumanApprover>) -> Self {
        self.executor = self.executor.with_approver(approver);
        self
    }

    pub fn settings(&self) -> &LoopSettings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    /// Run the loop for an already-loaded brief. Never fails: every pass-level
    /// problem is logged, reported as an event, and skipped.
    pub async fn run(&self, brief: Brief) -> LoopOutcome {
        let settings = &self.settings;
        tracing::info!(task = %brief.task, style = ?brief.style, "brief loaded");
        self.events.emit(
            events::BRIEF_LOADED,
            json!({"task": brief.task, "style": brief.style}),
        );

        let capabilities = self.registry.names();
        tracing::info!(count = capabilities.len(), capabilities = ?capabilities, "capabilities discovered");
        self.events.emit(
            events::CAPABILITIES_DISCOVERED,
            json!({"count": capabilities.len(), "capabilities": capabilities}),
        );

        if let Err(err) = self.versioning.init().await {
            tracing::warn!(error = %err, "versioning init failed, continuing without checkpoints");
        }

        let mut state = LoopState::new(brief);
        let mut all_assets = Vec::<Asset>::new();
        let mut best: Option<BestIteration> = None;
        let mut latest_commit: Option<CommitHandle> = None;
        let mut passed = false;
        let mut iterations_run = 0;

        for iteration in 1..=settings.max_iterations {
            iterations_run = iteration;
            state.begin_iteration(iteration);
            tracing::info!(iteration, max_iterations = settings.max_iterations, "iteration start");
            self.events.emit(
                events::ITERATION_START,
                json!({"iteration": iteration, "max_iterations": settings.max_iterations}),
            );

            let result = match self.run_pass_with_timeout(state.clone()).await {
                PassOutcome::Completed(result) => result,
                PassOutcome::TimedOut => {
                    tracing::warn!(
                        iteration,
                        timeout_secs = settings.iteration_timeout.as_secs(),
                        "iteration timed out, discarding pass"
                    );
                    self.events.emit(
                        events::ITERATION_TIMEOUT,
                        json!({
                            "iteration": iteration,
                            "timeout_secs": settings.iteration_timeout.as_secs(),
                        }),
                    );
                    continue;
                }
                PassOutcome::Invalid(err) => {
                    tracing::error!(iteration, error = %err, "invalid graph result, discarding pass");
                    self.events.emit(
                        events::INVALID_GRAPH_RESULT,
                        json!({"iteration": iteration, "error": err.to_string()}),
                    );
                    continue;
                }
            };

            // The critic has already scored the per-pass assets; only now
            // widen `assets` to the cumulative list.
            let pass_assets = result
                .assets
                .iter()
                .cloned()
                .map(|mut asset| {
                    asset.iteration = Some(iteration);
                    asset
                })
                .collect::<Vec<_>>();
            all_assets.extend(pass_assets.iter().cloned());
            state = result;
            state.assets = all_assets.clone();

            match self
                .versioning
                .commit_iteration(iteration, &pass_assets)
                .await
            {
                Ok(Some(handle)) => latest_commit = Some(handle),
                Ok(None) => {}
                Err(err) => tracing::warn!(iteration, error = %err, "iteration checkpoint failed"),
            }

            let score = state.score();
            if score > best.as_ref().map(|b| b.score).unwrap_or(0.0) {
                best = Some(BestIteration {
                    iteration,
                    score,
                    snapshot: state.snapshot_without_messages(),
                    commit: latest_commit.clone(),
                });
            }

            passed = state.passed();
            let (best_score, best_iteration) = best
                .as_ref()
                .map(|b| (b.score, b.iteration))
                .unwrap_or((0.0, 0));
            tracing::info!(
                iteration,
                score,
                passed,
                assets = pass_assets.len(),
                best_score,
                "iteration complete"
            );
            self.events.emit(
                events::ITERATION_COMPLETE,
                json!({
                    "iteration": iteration,
                    "score": score,
                    "passed": passed,
                    "assets": pass_assets.len(),
                    "total_assets": all_assets.len(),
                    "best_score": best_score,
                    "best_iteration": best_iteration,
                    "feedback": state.critique.as_ref().map(|c| c.feedback.clone()),
                }),
            );

            if passed {
                tracing::info!(iteration, score, "quality threshold met");
                break;
            }
        }

        state.status = Status::Complete;

        if !passed && let Some(best) = &best {
            let tag = best_iteration_tag(best.iteration);
            match self.versioning.tag(&tag, best.commit.as_ref()).await {
                Ok(()) => tracing::info!(tag = %tag, score = best.score, "best iteration tagged"),
                Err(err) => tracing::warn!(tag = %tag, error = %err, "best iteration tag failed"),
            }
        }

        let outcome = LoopOutcome {
            output_dir: settings.output_dir.clone(),
            final_state: state,
            best,
            passed,
            iterations_run,
        };
        tracing::info!(
            iterations = outcome.iterations_run,
            passed,
            best_score = outcome.best_score(),
            best_iteration = outcome.best_iteration(),
            "loop complete"
        );
        self.events.emit(
            events::LOOP_COMPLETE,
            json!({
                "iterations": outcome.iterations_run,
                "passed": passed,
                "best_score": outcome.best_score(),
                "best_iteration": outcome.best_iteration(),
                "total_assets": outcome.final_state.assets.len(),
                "output_dir": outcome.output_dir.display().to_string(),
            }),
        );
        outcome
    }

    async fn run_pass_with_timeout(&self, state: LoopState) -> PassOutcome {
        let executor = self.executor.clone();
        let mut handle = tokio::spawn(async move { executor.run_pass(state).await });

        match tokio::time::timeout(self.settings.iteration_timeout, &mut handle).await {
            Err(_) => {
                // A dropped handle would leave the pass running.
                handle.abort();
                PassOutcome::TimedOut
            }
            Ok(Err(join_err)) => PassOutcome::Invalid(PassError::Aborted(if join_err.is_panic() {
                "pass panicked".to_string()
            } else {
                join_err.to_string()
            })),
            Ok(Ok(Err(pass_err))) => PassOutcome::Invalid(pass_err),
            Ok(Ok(Ok(result))) => PassOutcome::Completed(result),
        }
    }
}

enum PassOutcome {
    Completed(LoopState),
    TimedOut,
    Invalid(PassError),
}

/// Build the five agents from configuration.
pub fn build_agents(
    cfg: &RuntimeConfig,
    llm: Arc<dyn LlmBackend>,
    registry: Arc<CapabilityRegistry>,
) -> AgentSet {
    let settings = cfg.generation_settings();
    let core = |agent: &'static str, fallback: &str| {
        AgentCore::from_prompts_dir(agent, llm.clone(), &cfg.prompts_dir, fallback, settings)
    };
    AgentSet {
        memory: Arc::new(MemoryAgent::new(core("memory", memory::MEMORY_PROMPT))),
        research: Arc::new(ResearchAgent::new(core("research", research::RESEARCH_PROMPT))),
        script: Arc::new(ScriptAgent::new(core("script", script::SCRIPT_PROMPT))),
        director: Arc::new(DirectorAgent::with_concurrency(
            registry,
            cfg.output_dir.clone(),
            cfg.max_concurrent_tasks,
        )),
        critic: Arc::new(CriticAgent::new(
            core("critic", critic::CRITIC_PROMPT),
            cfg.quality_threshold,
        )),
    }
}

/// Load the brief (failing fast on bad input) and run the loop.
pub async fn run_loop(brief_path: &Path, pipeline: &Pipeline) -> Result<LoopOutcome> {
    let brief = Brief::from_file(brief_path)?;
    Ok(pipeline.run(brief).await)
}
