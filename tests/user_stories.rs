//! User Story Integration Tests
//!
//! These tests trace complete user workflows with logging to verify
//! the system behaves correctly from the user's perspective.
//!
//! Each test represents a real user story:
//! - "As a user, I want to..."
//! - Tests verify the expected output/behavior
//! - HTTP collaborators run in-process on 127.0.0.1:0

use async_trait::async_trait;
use axum::{
    extract::Path,
    http::{StatusCode, Uri},
    response::{
        sse::{Event, Sse},
        IntoResponse,
    },
    routing::{get, post},
    Form, Json, Router,
};
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ntquery::auth::Authenticator;
use ntquery::block::DisplayBlock;
use ntquery::bridge::{self, BridgeState};
use ntquery::codeassist::CodeAssist;
use ntquery::config::OAuthConfig;
use ntquery::docs;
use ntquery::executor::{ExecOutcome, LocalSandbox, Sandbox};
use ntquery::models::{default_catalogs, ModelRegistry};
use ntquery::orchestrator::{Components, Orchestrator, Overlay, Phase};
use ntquery::planner::{PlanModel, Planner};
use ntquery::prober::{Capabilities, Prober};
use ntquery::render::{MemorySink, RawMath, RenderQueue};
use ntquery::store::{KeyStore, MemoryStore};
use ntquery::worker::WorkerSandbox;

/// Test helper to capture and display trace logs
struct TestTracer {
    name: String,
    logs: Vec<String>,
}

impl TestTracer {
    fn new(name: &str) -> Self {
        eprintln!("\n╔═══════════════════════════════════════════════════════════════");
        eprintln!("║ USER STORY: {}", name);
        eprintln!("╚═══════════════════════════════════════════════════════════════\n");
        Self {
            name: name.to_string(),
            logs: vec![],
        }
    }

    fn step(&mut self, description: &str) {
        let msg = format!("  → {}", description);
        eprintln!("{}", msg);
        self.logs.push(msg);
    }

    fn expect(&mut self, condition: bool, description: &str) {
        let status = if condition { "✓" } else { "✗" };
        let msg = format!("    {} {}", status, description);
        eprintln!("{}", msg);
        self.logs.push(msg);
        assert!(condition, "FAILED: {}", description);
    }

    fn done(&self) {
        eprintln!("\n  ══════════════════════════════════════════════════════");
        eprintln!("  ✓ Story completed: {} ({} checks)", self.name, self.logs.len());
        eprintln!();
    }
}

// ═══════════════════════════════════════════════════════════════
// FIXTURES
// ═══════════════════════════════════════════════════════════════

const DIVISORS_OF_360: &str =
    "[1, 2, 3, 4, 5, 6, 8, 9, 10, 12, 15, 18, 20, 24, 30, 36, 40, 45, 60, 72, 90, 120, 180, 360]";

/// Bridge stories never plan client-side
struct NoModel;

#[async_trait]
impl PlanModel for NoModel {
    async fn complete(&self, _prompt: &str, _model: &str) -> ntquery::Result<String> {
        Err(ntquery::Error::Transport("no model in this story".into()))
    }
}

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    format!("http://{}", addr)
}

struct Rig {
    orchestrator: Orchestrator,
    sink: MemorySink,
    queue: RenderQueue,
    prober: Arc<Prober>,
    auth: Arc<Authenticator>,
}

fn rig(endpoint: &str, plan_model: Option<&str>, oauth: OAuthConfig) -> Rig {
    rig_with_store(endpoint, plan_model, oauth, Arc::new(MemoryStore::new()))
}

fn rig_with_store(
    endpoint: &str,
    plan_model: Option<&str>,
    oauth: OAuthConfig,
    store: Arc<dyn KeyStore>,
) -> Rig {
    let client = reqwest::Client::new();
    let sink = MemorySink::new();
    let queue = RenderQueue::new(
        Box::new(sink.clone()),
        Duration::from_millis(10),
        Arc::new(RawMath),
    );
    let prober = Prober::new(client.clone(), store.clone(), endpoint, Duration::from_millis(50));
    let auth = Arc::new(Authenticator::new(client.clone(), store.clone(), oauth));
    let model: Arc<dyn PlanModel> = match plan_model {
        Some(base) => Arc::new(CodeAssist::new(client.clone(), auth.clone(), base)),
        None => Arc::new(NoModel),
    };

    let orchestrator = Orchestrator::new(Components {
        client,
        registry: ModelRegistry::new(default_catalogs(), store),
        prober: prober.clone(),
        auth: auth.clone(),
        plan_model: model,
        planner: Planner::new(docs::builtin(), docs::DEFAULT_SNIPPET_LIMIT),
        sandbox: Arc::new(LocalSandbox::new()),
        queue: queue.clone(),
        session_start_delay: Duration::from_secs(1),
    });

    Rig {
        orchestrator,
        sink,
        queue,
        prober,
        auth,
    }
}

async fn settle(rig: &Rig) -> Phase {
    let wait = async {
        let mut phase = rig.orchestrator.phase();
        let settled = *phase.wait_for(|p| p.is_settled()).await.unwrap();
        rig.queue.flushed().await;
        settled
    };
    tokio::time::timeout(Duration::from_secs(10), wait)
        .await
        .expect("query did not settle")
}

fn rendered(sink: &MemorySink) -> Vec<String> {
    sink.fragments().iter().map(|f| f.plain()).collect()
}

// ═══════════════════════════════════════════════════════════════
// STORY: Bridge is down when the user asks
// ═══════════════════════════════════════════════════════════════

/// Real bridge behind a /health that fails until `healthy` flips
fn flaky_bridge(healthy: Arc<AtomicBool>) -> Router {
    let state = Arc::new(BridgeState::new(
        Planner::new(docs::builtin(), docs::DEFAULT_SNIPPET_LIMIT),
        None,
        None,
    ));
    let caps = state.clone();
    Router::new()
        .route(
            "/health",
            get(move || {
                let healthy = healthy.clone();
                let caps = caps.clone();
                async move {
                    if healthy.load(Ordering::SeqCst) {
                        Json(Capabilities {
                            backends: caps.backends(),
                        })
                        .into_response()
                    } else {
                        StatusCode::INTERNAL_SERVER_ERROR.into_response()
                    }
                }
            }),
        )
        .fallback_service(bridge::router(state))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn story_bridge_health_500_keeps_overlay_until_recovery() {
    let mut t = TestTracer::new("Bridge /health 500 keeps the overlay until a 2xx");

    t.step("Given a bridge whose /health answers 500");
    let healthy = Arc::new(AtomicBool::new(false));
    let base = serve(flaky_bridge(healthy.clone())).await;
    let rig = rig(&base, None, OAuthConfig::default());
    t.expect(!rig.prober.refresh().await, "Initial probe reports unreachable");

    t.step("When the user asks with the direct bridge model selected");
    rig.orchestrator.select_model("direct:statements", true);
    rig.orchestrator.submit("divisors(360)").await;

    t.expect(
        *rig.orchestrator.phase().borrow() == Phase::AwaitingConnectivity,
        "Query waits for connectivity",
    );
    t.expect(
        matches!(*rig.orchestrator.overlay().borrow(), Overlay::Connectivity { .. }),
        "Connectivity overlay is shown",
    );
    t.expect(rig.prober.is_retrying(), "Auto-retry is running");
    t.expect(
        rig.orchestrator.pending().map(|p| p.question) == Some("divisors(360)".into()),
        "Query is stored as pending",
    );

    t.step("And several retries still see 500");
    tokio::time::sleep(Duration::from_millis(300)).await;
    t.expect(!rig.prober.is_connected(), "Connection state stays unreachable");
    t.expect(
        matches!(*rig.orchestrator.overlay().borrow(), Overlay::Connectivity { .. }),
        "Overlay is still visible",
    );
    t.expect(rig.prober.is_retrying(), "Auto-retry is still running");

    t.step("When /health starts answering 200");
    healthy.store(true, Ordering::SeqCst);
    let settled = settle(&rig).await;

    t.expect(settled == Phase::Done, "Pending query replays and finishes");
    t.expect(*rig.orchestrator.overlay().borrow() == Overlay::Hidden, "Overlay is hidden");
    t.expect(!rig.prober.is_retrying(), "Auto-retry stopped itself");

    let shown = rendered(&rig.sink);
    t.expect(shown.len() == 2, "Session start and one step were rendered");
    t.expect(shown[0].starts_with("Session Start"), "Bridge session start shown once");
    t.expect(shown[1].contains(DIVISORS_OF_360), "Step shows every divisor of 360");

    t.done();
}

// ═══════════════════════════════════════════════════════════════
// STORY: User changes their mind mid-stream
// ═══════════════════════════════════════════════════════════════

fn text_event(content: &str) -> Result<Event, Infallible> {
    Ok(Event::default()
        .event("step")
        .data(json!({ "block": { "type": "text", "content": content } }).to_string()))
}

/// Job "a" streams one block, a late one, then hangs; job "b" completes
fn scripted_bridge() -> Router {
    async fn health() -> Json<Value> {
        Json(json!({ "backends": [{ "name": "direct", "models": [{ "value": "statements", "label": "Statements" }] }] }))
    }

    async fn query(Json(body): Json<Value>) -> Json<Value> {
        let id = if body["prompt"] == "A" { "a" } else { "b" };
        Json(json!({ "jobId": id }))
    }

    async fn stream_job(Path(id): Path<String>) -> Sse<BoxStream<'static, Result<Event, Infallible>>> {
        let events = if id == "a" {
            stream::iter(vec![text_event("A first")])
                .chain(stream::once(async {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    text_event("A late")
                }))
                .chain(stream::pending())
                .boxed()
        } else {
            stream::iter(vec![
                text_event("B first"),
                text_event("B second"),
                Ok(Event::default().event("done").data("{}")),
            ])
            .boxed()
        };
        Sse::new(events)
    }

    Router::new()
        .route("/health", get(health))
        .route("/query", post(query))
        .route("/stream/:id", get(stream_job))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn story_new_query_supersedes_open_stream() {
    let mut t = TestTracer::new("Submitting B while A streams shows only B");

    t.step("Given a connected bridge");
    let base = serve(scripted_bridge()).await;
    let rig = rig(&base, None, OAuthConfig::default());
    t.expect(rig.prober.refresh().await, "Bridge is reachable");
    rig.orchestrator.select_model("direct:statements", true);

    t.step("When query A starts streaming");
    rig.orchestrator.submit("A").await;
    let first = tokio::time::timeout(Duration::from_secs(5), async {
        while !rendered(&rig.sink).iter().any(|s| s.contains("A first")) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    t.expect(first.is_ok(), "A's first block is rendered");

    t.step("And the user submits B before A finishes");
    let before = rig.sink.fragments().len();
    rig.orchestrator.submit("B").await;
    let settled = settle(&rig).await;
    t.expect(settled == Phase::Done, "B completes");

    t.step("And A's late block would have arrived by now");
    tokio::time::sleep(Duration::from_millis(600)).await;
    let after: Vec<String> = rendered(&rig.sink).split_off(before);
    t.expect(
        after == vec!["Output\nB first".to_string(), "Output\nB second".to_string()],
        "Only B's blocks appear after B was submitted",
    );
    t.expect(*rig.orchestrator.phase().borrow() == Phase::Done, "Status stays done");

    t.done();
}

// ═══════════════════════════════════════════════════════════════
// STORY: Saved bridge model from a previous session
// ═══════════════════════════════════════════════════════════════

/// Advertises a backend absent from every static catalog
fn codex_bridge(seen: Arc<std::sync::Mutex<Vec<String>>>) -> Router {
    async fn health() -> Json<Value> {
        Json(json!({ "backends": [{ "name": "codex", "models": [{ "value": "gpt-5", "label": "GPT-5" }] }] }))
    }

    async fn stream_job(Path(_id): Path<String>) -> Sse<BoxStream<'static, Result<Event, Infallible>>> {
        Sse::new(
            stream::iter(vec![
                text_event("codex answered"),
                Ok(Event::default().event("done").data("{}")),
            ])
            .boxed(),
        )
    }

    Router::new()
        .route("/health", get(health))
        .route(
            "/query",
            post(move |Json(body): Json<Value>| {
                let seen = seen.clone();
                async move {
                    let backend = body["backend"].as_str().unwrap_or_default().to_string();
                    seen.lock().unwrap().push(backend);
                    Json(json!({ "jobId": "c" }))
                }
            }),
        )
        .route("/stream/:id", get(stream_job))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn story_saved_bridge_model_survives_late_probe() {
    let mut t = TestTracer::new("A saved bridge-only model is used once the bridge answers");

    t.step("Given codex:gpt-5 was selected in an earlier session");
    let store: Arc<dyn KeyStore> = Arc::new(MemoryStore::new());
    store.set(ntquery::store::keys::SELECTED_MODEL, "codex:gpt-5").unwrap();

    t.step("And the app starts before the bridge has been probed");
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let base = serve(codex_bridge(seen.clone())).await;
    let rig = rig_with_store(&base, None, OAuthConfig::default(), store);

    t.step("When the probe later finds the bridge");
    t.expect(rig.prober.refresh().await, "Bridge is reachable");

    t.step("And the user asks without touching the model picker");
    rig.orchestrator.submit("anything").await;
    t.expect(
        *rig.orchestrator.phase().borrow() != Phase::AwaitingAuth,
        "No sign-in is requested for the bridge model",
    );
    let settled = settle(&rig).await;

    t.expect(settled == Phase::Done, "Query finishes on the bridge");
    t.expect(
        *seen.lock().unwrap() == vec!["codex".to_string()],
        "The bridge received the saved backend",
    );
    t.expect(
        rendered(&rig.sink).iter().any(|s| s.contains("codex answered")),
        "The bridge's answer is rendered",
    );

    t.done();
}

// ═══════════════════════════════════════════════════════════════
// STORY: First question on the model-driven backend
// ═══════════════════════════════════════════════════════════════

/// Token endpoint plus the Code Assist methods the planner calls
fn fake_google() -> Router {
    async fn token(Form(form): Form<HashMap<String, String>>) -> Json<Value> {
        if form.get("code").map(String::as_str) == Some("good") {
            Json(json!({ "access_token": "at", "refresh_token": "rt", "expires_in": 3600 }))
        } else {
            Json(json!({ "error": "invalid_grant" }))
        }
    }

    async fn api(uri: Uri, Json(body): Json<Value>) -> Json<Value> {
        match uri.path() {
            "/v1internal:loadCodeAssist" => Json(json!({ "cloudaicompanionProject": "proj-1" })),
            "/v1internal:generateContent" => {
                assert_eq!(body["project"], "proj-1");
                let plan = concat!(
                    "Here is the plan:\n```json\n",
                    r#"{"steps": [{"label": "Divisors", "expr": "divisors(360)", "explain": "List them"}], "final": "360 has 24 divisors."}"#,
                    "\n```"
                );
                Json(json!({ "response": { "candidates": [{ "content": { "parts": [{ "text": plan }] } }] } }))
            }
            _ => Json(json!({})),
        }
    }

    Router::new().route("/token", post(token)).fallback(api)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn story_divisors_of_360_after_sign_in() {
    let mut t = TestTracer::new("Divisors of 360 on the model-driven backend");

    t.step("Given a signed-out user and a hosted model that answers in a fenced block");
    let base = serve(fake_google()).await;
    let oauth = OAuthConfig {
        client_id: "ntquery-test".into(),
        token_url: format!("{}/token", base),
        ..OAuthConfig::default()
    };
    let rig = rig("http://127.0.0.1:1", Some(&format!("{}/v1internal", base)), oauth);

    t.step("When the user asks \"Divisors of 360\"");
    rig.orchestrator.submit("Divisors of 360").await;
    t.expect(
        *rig.orchestrator.phase().borrow() == Phase::AwaitingAuth,
        "Query waits for sign-in",
    );
    let overlay = rig.orchestrator.overlay().borrow().clone();
    t.expect(
        matches!(&overlay, Overlay::Auth { url } if url.contains("code_challenge_method=S256")),
        "Consent URL uses PKCE",
    );

    t.step("And completes sign-in");
    t.expect(rig.auth.exchange_code("good").await.is_ok(), "Code exchange succeeds");
    rig.orchestrator.auth_completed();
    let settled = settle(&rig).await;

    t.expect(settled == Phase::Done, "Final status is done");
    let shown = rendered(&rig.sink);
    t.expect(shown.len() == 3, "Step, its output and the summary were rendered");
    t.expect(shown[0].starts_with("Divisors\nList them\n>>> divisors(360)"), "Step block comes first");
    t.expect(shown[1] == format!("Output\n{}", DIVISORS_OF_360), "Text block lists every divisor");
    t.expect(shown[2] == "Output\n360 has 24 divisors.", "Summary comes last");

    t.done();
}

// ═══════════════════════════════════════════════════════════════
// STORY: Runaway statement is cancelled by killing the worker
// ═══════════════════════════════════════════════════════════════

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn story_worker_terminate_cancels_and_respawns() {
    let mut t = TestTracer::new("Terminating the worker cancels a running statement");

    t.step("Given a worker process with some state");
    let sandbox = Arc::new(WorkerSandbox::new(env!("CARGO_BIN_EXE_ntquery")));
    sandbox.reset().await.unwrap();
    t.expect(sandbox.execute("n = 12").await.is_ok(), "Assignment runs");
    t.expect(
        sandbox.execute("totient(n)").await == ExecOutcome::Ok(vec![DisplayBlock::text("4")]),
        "State persists across statements",
    );

    t.step("When a long statement is terminated mid-flight");
    let killer = sandbox.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        killer.terminate().await;
    });
    let outcome = sandbox
        .execute("len([x for x in range(2000000) if is_prime(x)])")
        .await;
    t.expect(
        outcome == ExecOutcome::Failed("Execution cancelled".into()),
        "Statement reports cancellation",
    );

    t.step("Then the next statement runs in a fresh worker");
    t.expect(
        sandbox.execute("n").await == ExecOutcome::Failed("name 'n' is not defined".into()),
        "Old environment is gone",
    );
    t.expect(
        sandbox.execute("gcd(12, 18)").await == ExecOutcome::Ok(vec![DisplayBlock::text("6")]),
        "Respawned worker answers",
    );

    t.done();
}

// ═══════════════════════════════════════════════════════════════
// STORY: Mapping results arrive as tables
// ═══════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn story_mapping_renders_as_key_value_table() {
    let mut t = TestTracer::new("A mapping result renders as a key/value table");

    t.step("Given a statement that produces a mapping");
    let sandbox = LocalSandbox::new();
    let ExecOutcome::Ok(blocks) = sandbox.execute("{'a': 1, 'b': 2}").await else {
        panic!("mapping failed to evaluate");
    };
    t.expect(blocks.len() == 1, "One block is produced");

    t.step("When it goes through the render queue");
    let sink = MemorySink::new();
    let queue = RenderQueue::new(Box::new(sink.clone()), Duration::from_millis(500), Arc::new(RawMath));
    for block in blocks {
        queue.enqueue(block);
    }
    queue.flushed().await;

    let shown = rendered(&sink);
    t.expect(
        shown == vec!["Table\nkey  value\n───  ─────\na    1\nb    2".to_string()],
        "Headers are key/value and rows keep insertion order",
    );

    t.done();
}
