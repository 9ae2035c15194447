use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router as AxumRouter};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::config::RuntimeConfig;
use crate::jobs::{JobManager, JobRequest};
use crate::llm::LlmBackend;
use crate::telemetry::TelemetrySink;

#[derive(Clone)]
pub struct ServerState {
    pub cfg: RuntimeConfig,
    pub jobs: Arc<JobManager>,
    pub telemetry: TelemetrySink,
    pub auth_token: Option<String>,
}

impl ServerState {
    pub fn new(cfg: RuntimeConfig, llm: Arc<dyn LlmBackend>, telemetry: TelemetrySink) -> Self {
        let jobs = JobManager::new(cfg.clone(), llm).with_telemetry(telemetry.clone());
        Self {
            auth_token: cfg.server_auth_token.clone(),
            cfg,
            jobs: Arc::new(jobs),
            telemetry,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ServerHealthResponse {
    pub status: &'static str,
    pub profile: String,
    pub jobs: usize,
}

#[derive(Debug, Deserialize)]
pub struct ApproveRequest {
    pub approved: bool,
    #[serde(default)]
    pub notes: Option<String>,
}

pub type ApiError = (StatusCode, Json<Value>);
pub type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

pub fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

pub fn check_server_auth(state: &ServerState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected_token) = state.auth_token.as_deref() else {
        return Ok(());
    };

    let provided_token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .strip_prefix("Bearer ")
        .unwrap_or_default()
        .trim();

    if provided_token.is_empty() || provided_token != expected_token {
        return Err(api_error(
            StatusCode::UNAUTHORIZED,
            "missing or invalid Authorization bearer token",
        ));
    }

    Ok(())
}

pub async fn handle_server_health(
    State(state): State<Arc<ServerState>>,
) -> Json<ServerHealthResponse> {
    Json(ServerHealthResponse {
        status: "ok",
        profile: state.cfg.profile.clone(),
        jobs: state.jobs.list_jobs().len(),
    })
}

pub async fn handle_create_job(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(request): Json<JobRequest>,
) -> std::result::Result<(StatusCode, Json<Value>), ApiError> {
    check_server_auth(&state, &headers)?;
    if request.task.trim().is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "task cannot be empty"));
    }

    let job = state.jobs.create_job(request).await.map_err(|err| {
        tracing::error!(error = %err, "job creation failed");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
    })?;
    state
        .telemetry
        .record("server.job_created", &json!({"job_id": job.id, "task": job.brief.task}));
    Ok((StatusCode::ACCEPTED, Json(job.summary())))
}

pub async fn handle_list_jobs(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
) -> ApiResult<Value> {
    check_server_auth(&state, &headers)?;
    Ok(Json(json!({ "jobs": state.jobs.list_jobs() })))
}

pub async fn handle_get_job(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Value> {
    check_server_auth(&state, &headers)?;
    state
        .jobs
        .get_job(&id)
        .map(|job| Json(job.summary()))
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("job '{id}' not found")))
}

pub async fn handle_job_events(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Value> {
    check_server_auth(&state, &headers)?;
    let job = state
        .jobs
        .get_job(&id)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("job '{id}' not found")))?;
    Ok(Json(json!({ "id": job.id, "events": job.events })))
}

pub async fn handle_approve_job(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(request): Json<ApproveRequest>,
) -> ApiResult<Value> {
    check_server_auth(&state, &headers)?;
    if state.jobs.get_job(&id).is_none() {
        return Err(api_error(
            StatusCode::NOT_FOUND,
            format!("job '{id}' not found"),
        ));
    }

    let notes = request.notes.unwrap_or_default();
    if !state.jobs.approve_job(&id, request.approved, notes) {
        return Err(api_error(
            StatusCode::CONFLICT,
            format!("job '{id}' is not awaiting approval"),
        ));
    }
    tracing::info!(job_id = %id, approved = request.approved, "job approval recorded");
    Ok(Json(json!({ "id": id, "approved": request.approved })))
}

pub fn build_server_router(state: Arc<ServerState>) -> AxumRouter {
    AxumRouter::new()
        .route("/healthz", get(handle_server_health))
        .route("/v1/jobs", post(handle_create_job).get(handle_list_jobs))
        .route("/v1/jobs/{id}", get(handle_get_job))
        .route("/v1/jobs/{id}/events", get(handle_job_events))
        .route("/v1/jobs/{id}/approve", post(handle_approve_job))
        .with_state(state)
}

pub async fn run_server(
    cfg: RuntimeConfig,
    llm: Arc<dyn LlmBackend>,
    host: String,
    port: u16,
    telemetry: &TelemetrySink,
) -> Result<()> {
    let addr = format!("{host}:{port}")
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid server bind address '{}:{}'", host, port))?;
    let state = Arc::new(ServerState::new(cfg.clone(), llm, telemetry.clone()));

    telemetry.record(
        "server.started",
        &json!({
            "host": host,
            "port": port,
            "profile": cfg.profile,
            "auth": state.auth_token.is_some(),
        }),
    );
    tracing::info!(%addr, profile = %cfg.profile, "server starting");
    println!(
        "Server mode listening on http://{} (health: /healthz, jobs: /v1/jobs)",
        addr
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind server listener")?;
    axum::serve(listener, build_server_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server runtime failed")
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { println!("\nReceived Ctrl+C, shutting down gracefully..."); }
        _ = terminate => { println!("\nReceived SIGTERM, shutting down gracefully..."); }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobStatus;
    use crate::llm::ScriptedBackend;
    use std::time::Duration;
    use tempfile::tempdir;

    fn state(dir: &std::path::Path, critic: &str, token: Option<&str>) -> Arc<ServerState> {
        let cfg = RuntimeConfig {
            output_dir: dir.join("jobs"),
            prompts_dir: dir.join("prompts"),
            max_iterations: 1,
            versioning_enabled: false,
            capabilities: vec!["image_gen".to_string()],
            server_auth_token: token.map(String::from),
            ..RuntimeConfig::default()
        };
        let llm = ScriptedBackend::always("{}")
            .with_responses(
                "script",
                [r#"{"plan": [{"step": 1, "task": "frame", "capability": "image_gen"}]}"#],
            )
            .with_responses("critic", [critic.to_string()]);
        let telemetry = TelemetrySink::new(&cfg, "serve".into());
        Arc::new(ServerState::new(cfg, Arc::new(llm), telemetry))
    }

    fn request(task: &str) -> Json<JobRequest> {
        Json(JobRequest {
            task: task.into(),
            style: None,
            max_iterations: None,
            quality_threshold: None,
        })
    }

    async fn wait_status(state: &ServerState, id: &str, status: JobStatus) {
        for _ in 0..200 {
            if state.jobs.get_job(id).map(|job| job.status) == Some(status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} never reached {status:?}");
    }

    #[tokio::test]
    async fn created_job_is_listed_and_completes() {
        let dir = tempdir().unwrap();
        let state = state(dir.path(), r#"{"score": 0.95}"#, None);

        let (status, Json(created)) =
            handle_create_job(State(state.clone()), HeaderMap::new(), request("city at dusk"))
                .await
                .unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);
        let id = created["id"].as_str().unwrap().to_string();

        wait_status(&state, &id, JobStatus::Completed).await;
        let Json(job) = handle_get_job(State(state.clone()), HeaderMap::new(), Path(id.clone()))
            .await
            .unwrap();
        assert_eq!(job["passed"], true);
        assert_eq!(job["status"], "completed");

        let Json(listed) = handle_list_jobs(State(state.clone()), HeaderMap::new())
            .await
            .unwrap();
        assert_eq!(listed["jobs"].as_array().unwrap().len(), 1);

        let Json(events) = handle_job_events(State(state), HeaderMap::new(), Path(id))
            .await
            .unwrap();
        assert!(!events["events"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let dir = tempdir().unwrap();
        let state = state(dir.path(), "{}", None);
        let err = handle_get_job(State(state), HeaderMap::new(), Path("job-missing".into()))
            .await
            .unwrap_err();
        assert_eq!(err.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn bearer_token_is_enforced() {
        let dir = tempdir().unwrap();
        let state = state(dir.path(), "{}", Some("secret"));

        let err = handle_list_jobs(State(state.clone()), HeaderMap::new())
            .await
            .unwrap_err();
        assert_eq!(err.0, StatusCode::UNAUTHORIZED);

        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            "Bearer secret".parse().unwrap(),
        );
        assert!(handle_list_jobs(State(state), headers).await.is_ok());
    }

    #[tokio::test]
    async fn borderline_job_accepts_rejection_over_http() {
        let dir = tempdir().unwrap();
        let state = state(dir.path(), r#"{"score": 0.75}"#, None);

        let (_, Json(created)) =
            handle_create_job(State(state.clone()), HeaderMap::new(), request("logo"))
                .await
                .unwrap();
        let id = created["id"].as_str().unwrap().to_string();

        wait_status(&state, &id, JobStatus::AwaitingApproval).await;
        let Json(ack) = handle_approve_job(
            State(state.clone()),
            HeaderMap::new(),
            Path(id.clone()),
            Json(ApproveRequest {
                approved: false,
                notes: Some("too busy".into()),
            }),
        )
        .await
        .unwrap();
        assert_eq!(ack["approved"], false);

        wait_status(&state, &id, JobStatus::Completed).await;
        assert!(!state.jobs.get_job(&id).unwrap().passed);

        let err = handle_approve_job(
            State(state),
            HeaderMap::new(),
            Path(id),
            Json(ApproveRequest {
                approved: true,
                notes: None,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.0, StatusCode::CONFLICT);
    }
}
