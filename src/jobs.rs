//! Background pipeline jobs.
//!
//! Each job wraps one `run_loop` invocation on a spawned task, with its own
//! event sink feeding a [`JobState`] record. Borderline critiques park the
//! pass until [`JobManager::approve_job`] resolves them.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::oneshot;

use crate::brief::Brief;
use crate::config::RuntimeConfig;
use crate::events::{self, CallbackSink, Emitter, EventSink, FanoutSink};
use crate::graph::HumanApprover;
use crate::llm::LlmBackend;
use crate::pipeline::{Pipeline, run_loop};
use crate::state::{HumanApproval, LoopState};
use crate::telemetry::{TelemetrySink, unix_ms_now};

const DEFAULT_JOB_DURATION_SECONDS: u32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    AwaitingApproval,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobEvent {
    pub event: String,
    pub data: Value,
    pub ts_unix_ms: u128,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobState {
    pub id: String,
    pub brief: Brief,
    pub status: JobStatus,
    pub iteration: u32,
    pub max_iterations: u32,
    pub score: f64,
    pub best_score: f64,
    pub best_iteration: u32,
    pub asset_count: usize,
    pub passed: bool,
    pub events: Vec<JobEvent>,
    pub error: Option<String>,
    pub output_dir: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobState {
    fn new(id: String, brief: Brief, max_iterations: u32, output_dir: String) -> Self {
        Self {
            id,
            brief,
            status: JobStatus::Pending,
            iteration: 0,
            max_iterations,
            score: 0.0,
            best_score: 0.0,
            best_iteration: 0,
            asset_count: 0,
            passed: false,
            events: Vec::new(),
            error: None,
            output_dir,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    fn record(&mut self, event: &str, data: &Value) {
        self.events.push(JobEvent {
            event: event.to_string(),
            data: data.clone(),
            ts_unix_ms: unix_ms_now(),
        });
        let u32_field = |key: &str| {
            data.get(key)
                .and_then(Value::as_u64)
                .and_then(|v| u32::try_from(v).ok())
        };
        match event {
            events::ITERATION_START => {
                self.iteration = u32_field("iteration").unwrap_or(self.iteration);
                self.status = JobStatus::Running;
            }
            events::ITERATION_COMPLETE => {
                self.score = data.get("score").and_then(Value::as_f64).unwrap_or(0.0);
                self.best_score = data
                    .get("best_score")
                    .and_then(Value::as_f64)
                    .unwrap_or(self.best_score);
                self.best_iteration = u32_field("best_iteration").unwrap_or(self.best_iteration);
                self.asset_count = data
                    .get("total_assets")
                    .and_then(Value::as_u64)
                    .map(|n| n as usize)
                    .unwrap_or(self.asset_count);
            }
            _ => {}
        }
    }

    /// Everything except the event log.
    pub fn summary(&self) -> Value {
        json!({
            "id": self.id,
            "task": self.brief.task,
            "status": self.status,
            "iteration": self.iteration,
            "max_iterations": self.max_iterations,
            "score": self.score,
            "best_score": self.best_score,
            "best_iteration": self.best_iteration,
            "asset_count": self.asset_count,
            "passed": self.passed,
            "error": self.error,
            "output_dir": self.output_dir,
            "created_at": self.created_at,
            "completed_at": self.completed_at,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobRequest {
    pub task: String,
    #[serde(default)]
    pub style: Option<String>,
    #[serde(default)]
    pub max_iterations: Option<u32>,
    #[serde(default)]
    pub quality_threshold: Option<f64>,
}

type JobTable = Arc<Mutex<HashMap<String, JobState>>>;
type ApprovalTable = Arc<Mutex<HashMap<String, oneshot::Sender<HumanApproval>>>>;

fn update_job(jobs: &JobTable, id: &str, apply: impl FnOnce(&mut JobState)) {
    let mut jobs = jobs.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(job) = jobs.get_mut(id) {
        apply(job);
    }
}

/// Parks a borderline pass until the job is approved or rejected.
pub struct JobApprover {
    job_id: String,
    jobs: JobTable,
    approvals: ApprovalTable,
}

/// Clears a parked approval when the review future goes away, including
/// when a timed-out pass is aborted mid-wait.
struct PendingApproval<'a> {
    approver: &'a JobApprover,
}

impl Drop for PendingApproval<'_> {
    fn drop(&mut self) {
        let JobApprover {
            job_id,
            jobs,
            approvals,
        } = self.approver;
        {
            let mut approvals = approvals.lock().unwrap_or_else(|e| e.into_inner());
            // Only our own sender: its receiver is already gone at this point.
            if approvals.get(job_id).is_some_and(|tx| tx.is_closed()) {
                approvals.remove(job_id);
            }
        }
        update_job(jobs, job_id, |job| {
            if job.status == JobStatus::AwaitingApproval {
                job.status = JobStatus::Running;
            }
        });
    }
}

#[async_trait]
impl HumanApprover for JobApprover {
    async fn review(&self, state: &LoopState) -> HumanApproval {
        let _pending = PendingApproval { approver: self };
        let (tx, rx) = oneshot::channel();
        {
            let mut approvals = self.approvals.lock().unwrap_or_else(|e| e.into_inner());
            approvals.insert(self.job_id.clone(), tx);
        }
        update_job(&self.jobs, &self.job_id, |job| {
            job.status = JobStatus::AwaitingApproval;
        });
        tracing::info!(job_id = %self.job_id, iteration = state.iteration, "job awaiting approval");

        rx.await.unwrap_or_else(|_| HumanApproval {
            approved: true,
            notes: "approval channel closed".to_string(),
        })
    }
}

pub struct JobManager {
    cfg: RuntimeConfig,
    llm: Arc<dyn LlmBackend>,
    jobs: JobTable,
    approvals: ApprovalTable,
    telemetry: Option<TelemetrySink>,
    counter: AtomicU64,
}

impl JobManager {
    pub fn new(cfg: RuntimeConfig, llm: Arc<dyn LlmBackend>) -> Self {
        Self {
            cfg,
            llm,
            jobs: Arc::new(Mutex::new(HashMap::new())),
            approvals: Arc::new(Mutex::new(HashMap::new())),
            telemetry: None,
            counter: AtomicU64::new(1),
        }
    }

    pub fn with_telemetry(mut self, telemetry: TelemetrySink) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Register a job and start it in the background.
    pub async fn create_job(&self, request: JobRequest) -> Result<JobState> {
        let task = request.task.trim();
        if task.is_empty() {
            return Err(anyhow::anyhow!("job task cannot be empty"));
        }

        let id = format!(
            "job-{}-{}",
            unix_ms_now(),
            self.counter.fetch_add(1, Ordering::SeqCst)
        );
        let mut brief = Brief::new(task);
        brief.style = request.style.filter(|s| !s.trim().is_empty());
        brief.duration_seconds = Some(DEFAULT_JOB_DURATION_SECONDS);

        let mut job_cfg = self.cfg.clone();
        job_cfg.output_dir = self.cfg.output_dir.join(&id);
        if let Some(max_iterations) = request.max_iterations {
            job_cfg.max_iterations = max_iterations.max(1);
        }
        if let Some(threshold) = request.quality_threshold.filter(|t| t.is_finite()) {
            job_cfg.quality_threshold = threshold.clamp(0.0, 1.0);
        }

        tokio::fs::create_dir_all(&job_cfg.output_dir)
            .await
            .with_context(|| {
                format!(
                    "failed to create job output directory '{}'",
                    job_cfg.output_dir.display()
                )
            })?;
        let brief_path = job_cfg.output_dir.join("brief.json");
        let body = serde_json::to_vec_pretty(&brief).context("failed to encode job brief")?;
        tokio::fs::write(&brief_path, body)
            .await
            .with_context(|| format!("failed to write job brief '{}'", brief_path.display()))?;

        let job = JobState::new(
            id.clone(),
            brief,
            job_cfg.max_iterations,
            job_cfg.output_dir.display().to_string(),
        );
        {
            let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
            jobs.insert(id.clone(), job.clone());
        }

        let pipeline = self.job_pipeline(&id, &job_cfg);
        let jobs = self.jobs.clone();
        tokio::spawn(async move {
            update_job(&jobs, &id, |job| job.status = JobStatus::Running);
            tracing::info!(job_id = %id, "job started");

            let result = run_loop(&brief_path, &pipeline).await;
            update_job(&jobs, &id, |job| {
                match result {
                    Ok(outcome) => {
                        job.status = JobStatus::Completed;
                        job.passed = outcome.passed;
                        job.best_score = outcome.best_score();
                        job.best_iteration = outcome.best_iteration();
                        job.asset_count = outcome.final_state.assets.len();
                    }
                    Err(err) => {
                        tracing::error!(job_id = %job.id, error = %err, "job failed");
                        job.status = JobStatus::Failed;
                        job.error = Some(format!("{err:#}"));
                    }
                }
                job.completed_at = Some(Utc::now());
            });
            tracing::info!(job_id = %id, "job finished");
        });

        Ok(job)
    }

    fn job_pipeline(&self, id: &str, job_cfg: &RuntimeConfig) -> Pipeline {
        let jobs = self.jobs.clone();
        let job_id = id.to_string();
        let recorder = CallbackSink::new(move |event, data| {
            update_job(&jobs, &job_id, |job| job.record(event, data));
        });

        let mut sink = FanoutSink::new().with(Arc::new(recorder));
        if let Some(telemetry) = &self.telemetry {
            sink = sink.with(Arc::new(telemetry.clone().with_run_id(id)) as Arc<dyn EventSink>);
        }

        Pipeline::from_config(job_cfg, self.llm.clone())
            .with_events(Emitter::new(Arc::new(sink)))
            .with_approver(Arc::new(JobApprover {
                job_id: id.to_string(),
                jobs: self.jobs.clone(),
                approvals: self.approvals.clone(),
            }))
    }

    pub fn get_job(&self, id: &str) -> Option<JobState> {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.get(id).cloned()
    }

    /// Job summaries, oldest first.
    pub fn list_jobs(&self) -> Vec<Value> {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let mut all = jobs.values().collect::<Vec<_>>();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        all.into_iter().map(JobState::summary).collect()
    }

    /// Resolve a pending approval. `false` when the job is not waiting.
    pub fn approve_job(&self, id: &str, approved: bool, notes: impl Into<String>) -> bool {
        let sender = {
            let mut approvals = self.approvals.lock().unwrap_or_else(|e| e.into_inner());
            approvals.remove(id)
        };
        let Some(sender) = sender else {
            return false;
        };

        let approval = HumanApproval {
            approved,
            notes: notes.into(),
        };
        let data = json!({"approved": approval.approved, "notes": approval.notes});
        if sender.send(approval).is_err() {
            tracing::warn!(job_id = id, "approval arrived after the pass was discarded");
            return false;
        }
        update_job(&self.jobs, id, |job| job.record("human_approval", &data));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedBackend;
    use std::time::Duration;
    use tempfile::tempdir;

    fn manager(dir: &std::path::Path, llm: ScriptedBackend) -> JobManager {
        let cfg = RuntimeConfig {
            output_dir: dir.to_path_buf(),
            prompts_dir: dir.join("no-prompts"),
            max_iterations: 1,
            versioning_enabled: false,
            capabilities: vec!["image_gen".to_string()],
            ..RuntimeConfig::default()
        };
        JobManager::new(cfg, Arc::new(llm))
    }

    async fn wait_for(manager: &JobManager, id: &str, status: JobStatus) -> JobState {
        for _ in 0..200 {
            if let Some(job) = manager.get_job(id)
                && job.status == status
            {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} never reached {status:?}");
    }

    fn replay(critic: &str) -> ScriptedBackend {
        ScriptedBackend::always("{}")
            .with_responses(
                "script",
                [r#"{"plan": [{"step": 1, "task": "cover", "capability": "image_gen"}]}"#],
            )
            .with_responses("critic", [critic])
    }

    #[tokio::test]
    async fn job_runs_to_completion_and_records_events() {
        let dir = tempdir().unwrap();
        let manager = manager(dir.path(), replay(r#"{"score": 0.95}"#));

        let job = manager
            .create_job(JobRequest {
                task: "lofi album cover".into(),
                style: Some("pastel".into()),
                max_iterations: None,
                quality_threshold: None,
            })
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(dir.path().join(&job.id).join("brief.json").exists());

        let done = wait_for(&manager, &job.id, JobStatus::Completed).await;
        assert!(done.passed);
        assert_eq!(done.best_iteration, 1);
        assert_eq!(done.asset_count, 1);
        assert!(done.events.iter().any(|e| e.event == events::LOOP_COMPLETE));
        assert_eq!(manager.list_jobs().len(), 1);
    }

    #[tokio::test]
    async fn borderline_job_waits_for_rejection() {
        let dir = tempdir().unwrap();
        let manager = manager(dir.path(), replay(r#"{"score": 0.8}"#));

        let job = manager
            .create_job(JobRequest {
                task: "poster".into(),
                style: None,
                max_iterations: Some(1),
                quality_threshold: Some(0.7),
            })
            .await
            .unwrap();

        wait_for(&manager, &job.id, JobStatus::AwaitingApproval).await;
        assert!(manager.approve_job(&job.id, false, "wrong palette"));
        assert!(!manager.approve_job(&job.id, true, "second answer"));

        let done = wait_for(&manager, &job.id, JobStatus::Completed).await;
        assert!(!done.passed);
        assert!(done.events.iter().any(|e| e.event == "human_approval"));
    }

    #[tokio::test]
    async fn aborted_review_releases_the_pending_approval() {
        let jobs: JobTable = Arc::new(Mutex::new(HashMap::new()));
        let approvals: ApprovalTable = Arc::new(Mutex::new(HashMap::new()));
        jobs.lock().unwrap().insert(
            "job-1".into(),
            JobState::new("job-1".into(), Brief::new("poster"), 1, "out".into()),
        );
        let approver = JobApprover {
            job_id: "job-1".into(),
            jobs: jobs.clone(),
            approvals: approvals.clone(),
        };

        let handle = tokio::spawn(async move {
            approver
                .review(&LoopState::new(Brief::new("poster")))
                .await
        });
        for _ in 0..200 {
            if approvals.lock().unwrap().contains_key("job-1") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(
            jobs.lock().unwrap()["job-1"].status,
            JobStatus::AwaitingApproval
        );

        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());

        assert!(approvals.lock().unwrap().is_empty());
        assert_eq!(jobs.lock().unwrap()["job-1"].status, JobStatus::Running);
    }

    #[tokio::test]
    async fn empty_task_is_rejected() {
        let dir = tempdir().unwrap();
        let manager = manager(dir.path(), ScriptedBackend::always("{}"));
        let err = manager
            .create_job(JobRequest {
                task: "  ".into(),
                style: None,
                max_iterations: None,
                quality_threshold: None,
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cannot be empty"));
    }
}
