//! Reference bridge: health, job dispatch and SSE job streams
//!
//! `POST /query` only records a job; the work happens while the client holds
//! `GET /stream/:job_id` open. A job streams at most once.

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::block::DisplayBlock;
use crate::error::{Error, Result};
use crate::executor::{ExecOutcome, LocalSandbox};
use crate::models::BRIDGE_FALLBACK;
use crate::openrouter::OpenRouter;
use crate::planner::{ExecutionStep, Plan, Planner};
use crate::prober::{BackendCapability, Capabilities, ModelOption};

pub const DIRECT_BACKEND: &str = "direct";
pub const OPENROUTER_BACKEND: &str = "openrouter";

/// Jobs nobody streamed are forgotten after this long
const JOB_TTL_MINUTES: i64 = 10;

#[derive(Debug, Clone)]
struct Job {
    prompt: String,
    model: String,
    backend: String,
    created_at: DateTime<Utc>,
}

/// Shared bridge state
pub struct BridgeState {
    jobs: RwLock<HashMap<String, Job>>,
    planner: Planner,
    openrouter: Option<OpenRouter>,
    secure_port: Option<u16>,
}

impl BridgeState {
    pub fn new(planner: Planner, openrouter: Option<OpenRouter>, secure_port: Option<u16>) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            planner,
            openrouter,
            secure_port,
        }
    }

    /// Advertised backends; OpenRouter only when a key is configured
    pub fn backends(&self) -> Vec<BackendCapability> {
        BRIDGE_FALLBACK
            .iter()
            .filter(|c| c.backend == DIRECT_BACKEND || (c.backend == OPENROUTER_BACKEND && self.openrouter.is_some()))
            .map(|c| BackendCapability {
                name: c.backend.to_string(),
                display_name: Some(c.display_name.to_string()),
                models: c
                    .models
                    .iter()
                    .map(|m| ModelOption {
                        value: m.value.to_string(),
                        label: m.label.to_string(),
                    })
                    .collect(),
                default_model: c.models.first().map(|m| m.value.to_string()),
            })
            .collect()
    }

    async fn plan(&self, job: &Job) -> Result<Plan> {
        match job.backend.as_str() {
            DIRECT_BACKEND => direct_plan(&job.prompt),
            OPENROUTER_BACKEND => match &self.openrouter {
                Some(model) => self.planner.generate_plan(model, &job.prompt, &job.model).await,
                None => Err(Error::Config("OpenRouter is not configured on this bridge".into())),
            },
            other => Err(Error::Config(format!("Unknown backend: {}", other))),
        }
    }
}

/// One step per non-empty line; `#` lines are comments
pub fn direct_plan(prompt: &str) -> Result<Plan> {
    let steps: Vec<ExecutionStep> = prompt
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .enumerate()
        .map(|(i, expr)| ExecutionStep {
            label: format!("Step {}", i + 1),
            expr: expr.to_string(),
            explain: String::new(),
        })
        .collect();

    if steps.is_empty() {
        return Err(Error::MalformedPlan("No statements to run.".into()));
    }
    Ok(Plan {
        steps,
        final_text: String::new(),
    })
}

type ApiError = (StatusCode, Json<Value>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

// ═══════════════════════════════════════════════════════════════
// HANDLERS
// ═══════════════════════════════════════════════════════════════

async fn health(State(state): State<Arc<BridgeState>>) -> Json<Capabilities> {
    Json(Capabilities {
        backends: state.backends(),
    })
}

/// Where the secure listener lives, for clients that need https
async fn setup(State(state): State<Arc<BridgeState>>, headers: HeaderMap) -> Json<Value> {
    let host = headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.split(':').next())
        .unwrap_or("127.0.0.1");
    Json(json!({
        "securePort": state.secure_port,
        "secureUrl": state.secure_port.map(|port| format!("https://{}:{}", host, port)),
    }))
}

#[derive(Debug, Deserialize)]
struct QueryRequest {
    prompt: String,
    #[serde(default)]
    model: String,
    backend: String,
}

async fn query(
    State(state): State<Arc<BridgeState>>,
    Json(req): Json<QueryRequest>,
) -> std::result::Result<Json<Value>, ApiError> {
    let prompt = req.prompt.trim();
    if prompt.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "Prompt is required"));
    }
    let Some(backend) = state.backends().into_iter().find(|b| b.name == req.backend) else {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            format!("Unknown backend: {}", req.backend),
        ));
    };
    let model = if req.model.is_empty() {
        backend.default_model.unwrap_or_default()
    } else {
        req.model
    };

    let job_id = Uuid::new_v4().to_string();
    let now = Utc::now();
    {
        let mut jobs = state.jobs.write().await;
        jobs.retain(|_, job| now - job.created_at < chrono::Duration::minutes(JOB_TTL_MINUTES));
        jobs.insert(
            job_id.clone(),
            Job {
                prompt: prompt.to_string(),
                model,
                backend: req.backend,
                created_at: now,
            },
        );
    }
    tracing::info!(%job_id, "job queued");
    Ok(Json(json!({ "jobId": job_id })))
}

async fn stream(
    State(state): State<Arc<BridgeState>>,
    Path(job_id): Path<String>,
) -> std::result::Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>, ApiError> {
    let job = state
        .jobs
        .write()
        .await
        .remove(&job_id)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "Unknown job"))?;

    let (tx, rx) = mpsc::channel(32);
    tokio::spawn(run_job(state.clone(), job_id, job, Emitter(tx)));

    let events = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|event| (Ok(event), rx))
    });
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

// ═══════════════════════════════════════════════════════════════
// JOBS
// ═══════════════════════════════════════════════════════════════

struct Emitter(mpsc::Sender<Event>);

impl Emitter {
    /// False once the client has gone away
    async fn send(&self, name: &str, data: Value) -> bool {
        self.0
            .send(Event::default().event(name).data(data.to_string()))
            .await
            .is_ok()
    }
}

fn session_start_step() -> ExecutionStep {
    ExecutionStep {
        label: "Session Start".into(),
        expr: "import numthy as nt".into(),
        explain: "Import NumThy".into(),
    }
}

fn step_block(step: &ExecutionStep, outcome: &ExecOutcome) -> DisplayBlock {
    let mut block = DisplayBlock::step(&step.label, &step.explain, &step.expr);
    if let DisplayBlock::Step(inner) = &mut block {
        match outcome {
            ExecOutcome::Ok(blocks) => inner.result = blocks.clone(),
            ExecOutcome::Failed(error) => inner.error = Some(error.clone()),
        }
    }
    block
}

async fn run_job(state: Arc<BridgeState>, job_id: String, job: Job, out: Emitter) {
    let plan = match state.plan(&job).await {
        Ok(plan) => plan,
        Err(e) => {
            tracing::warn!(%job_id, error = %e, "planning failed");
            out.send("fail", json!({ "message": e.to_string() })).await;
            return;
        }
    };

    let sandbox = Arc::new(LocalSandbox::new());
    for step in std::iter::once(session_start_step()).chain(plan.steps) {
        let runner = sandbox.clone();
        let expr = step.expr.clone();
        let outcome = tokio::task::spawn_blocking(move || runner.execute_now(&expr))
            .await
            .unwrap_or_else(|e| ExecOutcome::Failed(format!("execution aborted: {}", e)));

        let sent = out
            .send("step", json!({ "block": step_block(&step, &outcome).to_value() }))
            .await;
        if let ExecOutcome::Failed(error) = outcome {
            tracing::info!(%job_id, step = %step.label, "step failed");
            let message = format!("Step \"{}\" failed: {}\n>>> {}", step.label, error, step.expr);
            out.send("fail", json!({ "message": message })).await;
            return;
        }
        if !sent {
            tracing::debug!(%job_id, "client went away");
            return;
        }
    }

    let final_text = plan.final_text.trim();
    if !final_text.is_empty() {
        out.send("final", json!({ "block": DisplayBlock::text(final_text).to_value() }))
            .await;
    }
    out.send("done", json!({})).await;
    tracing::info!(%job_id, "job finished");
}

/// The bridge's HTTP surface
pub fn router(state: Arc<BridgeState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/health", get(health))
        .route("/setup", get(setup))
        .route("/query", post(query))
        .route("/stream/:job_id", get(stream))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
