//! Director agent - executes the plan against the capability registry.
//!
//! Steps run concurrently on a `JoinSet`, bounded by a semaphore. A failing
//! or panicking step becomes a log line; it never aborts its siblings.
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use super::Agent;
use crate::capability::{
    Capability, CapabilityInput, CapabilityKind, CapabilityOutput, CapabilityRegistry,
    ExecutionContext,
};
use crate::error::CapabilityError;
use crate::state::{Asset, LoopState, StateUpdate, Status, Task};

pub const DEFAULT_MAX_CONCURRENT_TASKS: usize = 4;

pub struct DirectorAgent {
    registry: Arc<CapabilityRegistry>,
    output_dir: PathBuf,
    limiter: Arc<Semaphore>,
}

impl DirectorAgent {
    pub fn new(registry: Arc<CapabilityRegistry>, output_dir: impl Into<PathBuf>) -> Self {
        Self::with_concurrency(registry, output_dir, DEFAULT_MAX_CONCURRENT_TASKS)
    }

    pub fn with_concurrency(
        registry: Arc<CapabilityRegistry>,
        output_dir: impl Into<PathBuf>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            registry,
            output_dir: output_dir.into(),
            limiter: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }
}

/// `{output_dir}/iteration-NNN/step-NNN-{capability}.{ext}`
pub fn asset_output_path(
    output_dir: &Path,
    iteration: u32,
    step: u32,
    capability: &str,
    kind: CapabilityKind,
) -> PathBuf {
    output_dir
        .join(format!("iteration-{iteration:03}"))
        .join(format!("step-{step:03}-{capability}.{}", kind.extension()))
}

fn asset_kind(capability: &dyn Capability) -> String {
    match capability.kind() {
        CapabilityKind::Other => capability
            .name()
            .trim_end_matches("_gen")
            .to_string(),
        kind => kind.label().to_string(),
    }
}

struct StepResult {
    step: u32,
    capability: String,
    kind: String,
    output_path: PathBuf,
    outcome: Result<CapabilityOutput, CapabilityError>,
}

async fn execute_step(
    limiter: Arc<Semaphore>,
    capability: Arc<dyn Capability>,
    task: Task,
    ctx: ExecutionContext,
) -> StepResult {
    let kind = asset_kind(capability.as_ref());
    let capability_name = capability.name().to_string();
    let outcome = match limiter.acquire_owned().await {
        Ok(_permit) => {
            tracing::debug!(step = task.step, capability = %capability_name, "step started");
            let input = CapabilityInput {
                prompt: task.prompt(),
                params: task.params.clone(),
            };
            capability.execute(input, &ctx).await
        }
        Err(_) => Err(CapabilityError::Failed("concurrency limiter closed".to_string())),
    };
    StepResult {
        step: task.step,
        capability: capability_name,
        kind,
        output_path: ctx.output_path,
        outcome,
    }
}

#[async_trait]
impl Agent for DirectorAgent {
    fn name(&self) -> &'static str {
        "director"
    }

    async fn run(&self, state: &LoopState) -> StateUpdate {
        tracing::info!(
            iteration = state.iteration,
            steps = state.plan.len(),
            attempt = state.director_retries + 1,
            "director agent start"
        );

        let mut messages = Vec::new();
        let mut tasks = JoinSet::new();
        for task in &state.plan {
            let Some(capability) = self.registry.get(&task.capability) else {
                tracing::warn!(step = task.step, capability = %task.capability, "capability unavailable, skipping step");
                messages.push(format!(
                    "[director] Skipped step {}: capability '{}' not available.",
                    task.step, task.capability
                ));
                continue;
            };
            let ctx = ExecutionContext {
                output_path: asset_output_path(
                    &self.output_dir,
                    state.iteration,
                    task.step,
                    &task.capability,
                    capability.kind(),
                ),
                iteration: state.iteration,
                step: task.step,
            };
            tasks.spawn(execute_step(
                self.limiter.clone(),
                capability,
                task.clone(),
                ctx,
            ));
        }

        let mut assets = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let result = match joined {
                Ok(result) => result,
                Err(err) => {
                    tracing::error!(error = %err, "step task aborted");
                    messages.push(format!("[director] Step task aborted: {err}"));
                    continue;
                }
            };
            match result.outcome {
                Ok(output) if output.success => {
                    // A success without paths still produced the hinted file.
                    let paths = if output.asset_paths.is_empty() {
                        vec![result.output_path.to_string_lossy().to_string()]
                    } else {
                        output.asset_paths
                    };
                    for path in paths {
                        let mut metadata = output.metadata.clone();
                        metadata.insert("capability".to_string(), json!(result.capability));
                        assets.push(Asset {
                            kind: result.kind.clone(),
                            path,
                            step: result.step,
                            metadata,
                            iteration: None,
                        });
                    }
                    messages.push(format!(
                        "[director] Step {} ({}) completed.",
                        result.step, result.capability
                    ));
                }
                Ok(output) => {
                    let error = output.error.unwrap_or_else(|| "unknown error".to_string());
                    tracing::warn!(step = result.step, capability = %result.capability, error = %error, "step reported failure");
                    messages.push(format!("[director] Step {} failed: {error}", result.step));
                }
                Err(err) => {
                    tracing::error!(step = result.step, capability = %result.capability, error = %err, "step raised");
                    messages.push(format!("[director] Step {} raised: {err}", result.step));
                }
            }
        }

        // Completion order is arbitrary; present assets in plan order.
        assets.sort_by_key(|asset| asset.step);
        tracing::info!(assets = assets.len(), "director finished");

        messages.push(format!(
            "[director] Generated {} asset(s) from {} step(s).",
            assets.len(),
            state.plan.len()
        ));

        let mut update = StateUpdate {
            messages,
            ..StateUpdate::new()
        }
        .with_status(Status::Critiquing);
        if assets.is_empty() {
            update = update
                .with_director_retries(state.director_retries + 1)
                .with_last_error("director: no assets generated");
        }
        update.with_assets(assets)
    }
}

/// Summary of an asset for prompts and events; never the file contents.
pub fn asset_summary(asset: &Asset) -> Value {
    json!({
        "type": asset.kind,
        "path": asset.path,
        "step": asset.step,
        "metadata": asset.metadata,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brief::Brief;
    use serde_json::Map;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::tempdir;

    struct Instrumented {
        name: &'static str,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
        fail_step: Option<u32>,
        report_paths: bool,
    }

    impl Instrumented {
        fn new(name: &'static str) -> Self {
            Self {
                name,
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
                fail_step: None,
                report_paths: true,
            }
        }
    }

    #[async_trait]
    impl Capability for Instrumented {
        fn name(&self) -> &str {
            self.name
        }

        fn description(&self) -> &str {
            "counts concurrent invocations"
        }

        fn kind(&self) -> CapabilityKind {
            CapabilityKind::Image
        }

        async fn execute(
            &self,
            _input: CapabilityInput,
            ctx: &ExecutionContext,
        ) -> Result<CapabilityOutput, CapabilityError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.fail_step == Some(ctx.step) {
                return Err(CapabilityError::Failed("model refused".into()));
            }
            let paths = if self.report_paths {
                vec![ctx.output_path.to_string_lossy().to_string()]
            } else {
                Vec::new()
            };
            Ok(CapabilityOutput::succeeded(paths, Map::new()))
        }
    }

    fn plan(steps: u32, capability: &str) -> Vec<Task> {
        (1..=steps)
            .map(|step| Task {
                step,
                task: format!("shot {step}"),
                capability: capability.to_string(),
                params: Map::new(),
            })
            .collect()
    }

    fn registry_with(capability: Arc<Instrumented>) -> Arc<CapabilityRegistry> {
        let mut registry = CapabilityRegistry::new();
        registry.register(capability);
        Arc::new(registry)
    }

    fn state(plan: Vec<Task>) -> LoopState {
        let mut state = LoopState::new(Brief::new("storyboard"));
        state.iteration = 2;
        state.plan = plan;
        state
    }

    #[tokio::test]
    async fn never_exceeds_concurrency_limit() {
        let capability = Arc::new(Instrumented::new("image_gen"));
        let dir = tempdir().unwrap();
        let director = DirectorAgent::with_concurrency(registry_with(capability.clone()), dir.path(), 4);

        let update = director.run(&state(plan(10, "image_gen"))).await;

        assert_eq!(capability.calls.load(Ordering::SeqCst), 10);
        assert_eq!(capability.peak.load(Ordering::SeqCst), 4);
        assert_eq!(update.assets.unwrap().len(), 10);
        assert_eq!(update.director_retries, None);
    }

    #[tokio::test]
    async fn failing_step_does_not_abort_siblings() {
        let mut capability = Instrumented::new("image_gen");
        capability.fail_step = Some(2);
        let capability = Arc::new(capability);
        let dir = tempdir().unwrap();
        let director = DirectorAgent::new(registry_with(capability), dir.path());

        let update = director.run(&state(plan(3, "image_gen"))).await;
        let assets = update.assets.unwrap();

        assert_eq!(assets.iter().map(|a| a.step).collect::<Vec<_>>(), vec![1, 3]);
        assert!(update.messages.iter().any(|m| m.contains("Step 2 raised")));
    }

    #[tokio::test]
    async fn success_without_paths_falls_back_to_output_path() {
        let mut capability = Instrumented::new("image_gen");
        capability.report_paths = false;
        let dir = tempdir().unwrap();
        let director = DirectorAgent::new(registry_with(Arc::new(capability)), dir.path());

        let update = director.run(&state(plan(1, "image_gen"))).await;
        let assets = update.assets.unwrap();

        assert_eq!(assets.len(), 1);
        assert_eq!(
            Path::new(&assets[0].path),
            asset_output_path(dir.path(), 2, 1, "image_gen", CapabilityKind::Image)
        );
        assert_eq!(update.director_retries, None);
    }

    #[tokio::test]
    async fn unavailable_capabilities_are_skipped_and_counted_as_retry() {
        let capability = Arc::new(Instrumented::new("image_gen"));
        let dir = tempdir().unwrap();
        let director = DirectorAgent::new(registry_with(capability.clone()), dir.path());
        let mut state = state(plan(2, "hologram"));
        state.director_retries = 1;

        let update = director.run(&state).await;

        assert_eq!(capability.calls.load(Ordering::SeqCst), 0);
        assert_eq!(update.assets, Some(Vec::new()));
        assert_eq!(update.director_retries, Some(2));
        assert_eq!(
            update
                .messages
                .iter()
                .filter(|m| m.contains("not available"))
                .count(),
            2
        );
    }

    #[test]
    fn output_paths_are_deterministic_per_step() {
        let root = Path::new("/out");
        assert_eq!(
            asset_output_path(root, 3, 7, "video_gen", CapabilityKind::Video),
            Path::new("/out/iteration-003/step-007-video_gen.mp4")
        );
        assert_eq!(
            asset_output_path(root, 1, 12, "captions", CapabilityKind::Other),
            Path::new("/out/iteration-001/step-012-captions.bin")
        );
        assert_eq!(
            asset_output_path(root, 1, 2, "tts", CapabilityKind::Audio),
            Path::new("/out/iteration-001/step-002-tts.wav")
        );
    }
}
