//! Query orchestration
//!
//! A query moves through named phases driven by the pure `transition`
//! function. `Orchestrator` owns the session (active query, pending query,
//! background tasks, generation) and performs the effects each transition
//! asks for. Background work reports back through one channel, tagged with
//! the generation it belongs to; anything from an older generation is dropped.

use serde_json::{json, Value};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::auth::Authenticator;
use crate::block::DisplayBlock;
use crate::error::{Error, Result};
use crate::executor::{ExecOutcome, Sandbox};
use crate::models::{resolve, BackendKind, ModelDescriptor, ModelRegistry, Selection};
use crate::planner::{PlanModel, Planner};
use crate::prober::Prober;
use crate::render::RenderQueue;
use crate::sse;

const CONNECTION_ERROR: &str = "Connection error";
const MISSING_JOB_ID: &str = "Missing job id from server";

// ═══════════════════════════════════════════════════════════════
// STATE MACHINE
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    Dispatching,
    AwaitingAuth,
    AwaitingConnectivity,
    Planning,
    Streaming,
    Rendering,
    Done,
    Error,
}

impl Phase {
    /// Nothing further happens without a new submit
    pub fn is_settled(self) -> bool {
        matches!(self, Phase::Idle | Phase::Done | Phase::Error)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Submit,
    NeedsAuth,
    NeedsConnectivity,
    Ready(BackendKind),
    AuthObtained,
    ConnectivityRestored,
    Cancel,
    /// First sign of life from the backend
    Signal,
    Finished,
    Drained,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    SetStatus(Status),
    HideOverlay,
    StorePending,
    RestorePending,
    DiscardPending,
    StartAuthFlow,
    StartAutoRetry,
    StopAutoRetry,
    Dispatch,
    StartPlanning,
    OpenStream,
    StartSessionTimer,
    CancelSessionTimer,
    ClearQueue,
    ShowError(String),
    AwaitDrain,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub next: Phase,
    pub effects: Vec<Effect>,
}

/// The whole lifecycle in one table. Unlisted pairs leave the phase alone.
pub fn transition(phase: Phase, input: &Input) -> Transition {
    use Effect::*;

    let (next, effects) = match (phase, input) {
        (_, Input::Submit) => (
            Phase::Dispatching,
            vec![HideOverlay, SetStatus(Status::Planning), Dispatch],
        ),

        (Phase::Dispatching, Input::NeedsAuth) => {
            (Phase::AwaitingAuth, vec![StorePending, StartAuthFlow])
        }
        (Phase::Planning, Input::NeedsAuth) => (
            Phase::AwaitingAuth,
            vec![CancelSessionTimer, ClearQueue, StorePending, StartAuthFlow],
        ),
        (Phase::Dispatching, Input::NeedsConnectivity) => {
            (Phase::AwaitingConnectivity, vec![StorePending, StartAutoRetry])
        }

        (Phase::AwaitingAuth, Input::AuthObtained) => {
            (Phase::Dispatching, vec![HideOverlay, RestorePending, Dispatch])
        }
        (Phase::AwaitingConnectivity, Input::ConnectivityRestored) => (
            Phase::Dispatching,
            vec![HideOverlay, StopAutoRetry, RestorePending, Dispatch],
        ),
        (Phase::AwaitingAuth, Input::Cancel) => (
            Phase::Idle,
            vec![HideOverlay, DiscardPending, SetStatus(Status::Idle)],
        ),
        (Phase::AwaitingConnectivity, Input::Cancel) => (
            Phase::Idle,
            vec![HideOverlay, StopAutoRetry, DiscardPending, SetStatus(Status::Idle)],
        ),

        (Phase::Dispatching, Input::Ready(BackendKind::ModelDriven)) => {
            (Phase::Planning, vec![StartSessionTimer, StartPlanning])
        }
        (Phase::Dispatching, Input::Ready(BackendKind::Bridge)) => {
            (Phase::Streaming, vec![StartSessionTimer, OpenStream])
        }
        (Phase::Planning | Phase::Streaming, Input::Signal) => {
            (phase, vec![CancelSessionTimer, SetStatus(Status::Running)])
        }
        (Phase::Planning | Phase::Streaming, Input::Finished) => {
            (Phase::Rendering, vec![CancelSessionTimer, AwaitDrain])
        }
        (Phase::Rendering, Input::Drained) => (Phase::Done, vec![SetStatus(Status::Done)]),

        (
            Phase::Dispatching
            | Phase::AwaitingAuth
            | Phase::Planning
            | Phase::Streaming
            | Phase::Rendering,
            Input::Failed(message),
        ) => (
            Phase::Error,
            vec![
                CancelSessionTimer,
                ClearQueue,
                ShowError(message.clone()),
                SetStatus(Status::Error),
            ],
        ),
        (
            Phase::Dispatching | Phase::Planning | Phase::Streaming | Phase::Rendering,
            Input::Cancel,
        ) => (
            Phase::Idle,
            vec![CancelSessionTimer, ClearQueue, SetStatus(Status::Idle)],
        ),

        _ => (phase, Vec::new()),
    };

    Transition { next, effects }
}

/// Status line text
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Status {
    #[default]
    Idle,
    Planning,
    Running,
    Loading(String),
    Done,
    Error,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Idle => Ok(()),
            Status::Planning => write!(f, "Planning ..."),
            Status::Running => write!(f, "Running ..."),
            Status::Loading(message) => write!(f, "{}", message),
            Status::Done => write!(f, "Done"),
            Status::Error => write!(f, "Error"),
        }
    }
}

/// Modal prompt shown while a query waits on a prerequisite
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Overlay {
    #[default]
    Hidden,
    Auth { url: String },
    Connectivity { endpoint: String },
}

// ═══════════════════════════════════════════════════════════════
// SESSION
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq)]
pub struct PendingQuery {
    pub question: String,
    pub model_key: Option<String>,
}

#[derive(Default)]
struct Session {
    phase: Phase,
    generation: u64,
    active: Option<PendingQuery>,
    pending: Option<PendingQuery>,
    descriptor: Option<ModelDescriptor>,
    task: Option<JoinHandle<()>>,
    timer: Option<JoinHandle<()>>,
    watcher: Option<JoinHandle<()>>,
    drain: Option<JoinHandle<()>>,
    executing: bool,
    signalled: bool,
    session_start_shown: bool,
    failed_step: Option<DisplayBlock>,
}

impl Session {
    fn abort_tasks(&mut self) {
        for handle in [
            self.task.take(),
            self.timer.take(),
            self.watcher.take(),
            self.drain.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
    }
}

enum Message {
    Input(Input),
    Block(DisplayBlock),
    /// Step whose statement raised; shown next to the error block
    FailedStep(DisplayBlock),
    SessionStart,
}

struct Envelope {
    generation: u64,
    message: Message,
}

/// Shown when the backend is slow to answer
fn session_start_block() -> DisplayBlock {
    DisplayBlock::step("Session Start", "Import NumThy", "import numthy as nt")
}

fn is_session_start(block: &DisplayBlock) -> bool {
    block
        .step_title()
        .is_some_and(|t| t.to_lowercase().contains("session start"))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Everything the orchestrator drives
pub struct Components {
    pub client: reqwest::Client,
    pub registry: ModelRegistry,
    pub prober: Arc<Prober>,
    pub auth: Arc<Authenticator>,
    pub plan_model: Arc<dyn PlanModel>,
    pub planner: Planner,
    pub sandbox: Arc<dyn Sandbox>,
    pub queue: RenderQueue,
    pub session_start_delay: Duration,
}

struct Inner {
    client: reqwest::Client,
    registry: Mutex<ModelRegistry>,
    prober: Arc<Prober>,
    auth: Arc<Authenticator>,
    plan_model: Arc<dyn PlanModel>,
    planner: Planner,
    sandbox: Arc<dyn Sandbox>,
    queue: RenderQueue,
    session_start_delay: Duration,
    session: Mutex<Session>,
    status: watch::Sender<Status>,
    overlay: watch::Sender<Overlay>,
    phase: watch::Sender<Phase>,
    events: mpsc::UnboundedSender<Envelope>,
}

/// Single entry point for running queries; cheap to clone
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Must be called inside a tokio runtime
    pub fn new(parts: Components) -> Self {
        let (events, rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(Status::Idle);
        let (overlay, _) = watch::channel(Overlay::Hidden);
        let (phase, _) = watch::channel(Phase::Idle);

        let inner = Arc::new(Inner {
            client: parts.client,
            registry: Mutex::new(parts.registry),
            prober: parts.prober,
            auth: parts.auth,
            plan_model: parts.plan_model,
            planner: parts.planner,
            sandbox: parts.sandbox,
            queue: parts.queue,
            session_start_delay: parts.session_start_delay,
            session: Mutex::new(Session::default()),
            status,
            overlay,
            phase,
            events,
        });
        tokio::spawn(event_loop(Arc::downgrade(&inner), rx));
        Self { inner }
    }

    /// Start a query, superseding whatever was running
    pub async fn submit(&self, question: &str) {
        let question = question.trim();
        if question.is_empty() {
            return;
        }

        let (generation, terminate) = {
            let mut s = lock(&self.inner.session);
            s.generation += 1;
            self.inner.queue.reset();
            if s.phase == Phase::AwaitingConnectivity {
                self.inner.prober.stop_auto_retry();
            }
            s.abort_tasks();
            s.pending = None;
            s.descriptor = None;
            s.signalled = false;
            s.session_start_shown = false;
            s.failed_step = None;

            // The persisted key may name a backend the last probe discovered
            let connection = self.inner.prober.state();
            let model_key = {
                let mut registry = lock(&self.inner.registry);
                registry.rebuild(&connection);
                registry.selected().map(|d| d.key())
            };
            s.active = Some(PendingQuery {
                question: question.to_string(),
                model_key,
            });
            tracing::info!(generation = s.generation, %question, "query submitted");
            (s.generation, std::mem::take(&mut s.executing))
        };

        if terminate {
            self.inner.sandbox.terminate().await;
        }

        let mut s = lock(&self.inner.session);
        if s.generation == generation {
            self.inner.drive(&mut s, Input::Submit);
        }
    }

    /// Abandon the current query or the pending one behind an overlay
    pub fn cancel(&self) {
        let mut s = lock(&self.inner.session);
        s.generation += 1;
        s.abort_tasks();
        let terminate = std::mem::take(&mut s.executing);
        self.inner.drive(&mut s, Input::Cancel);
        s.active = None;
        drop(s);

        if terminate {
            let sandbox = self.inner.sandbox.clone();
            tokio::spawn(async move { sandbox.terminate().await });
        }
    }

    /// The user finished the sign-in flow; resume the pending query
    pub fn auth_completed(&self) {
        let mut s = lock(&self.inner.session);
        self.inner.drive(&mut s, Input::AuthObtained);
    }

    /// Select a model by key; see `ModelRegistry::select`
    pub fn select_model(&self, key: &str, manual: bool) -> Option<Selection> {
        let authenticated = self.inner.auth.is_authenticated();
        let connection = self.inner.prober.state();
        let mut registry = lock(&self.inner.registry);
        registry.rebuild(&connection);
        registry.select(key, manual, authenticated)
    }

    /// Progress text from the sandbox while it starts up
    pub fn show_loading(&self, message: String) {
        let s = lock(&self.inner.session);
        if matches!(s.phase, Phase::Planning | Phase::Streaming) {
            self.inner.status.send_replace(Status::Loading(message));
        }
    }

    pub fn status(&self) -> watch::Receiver<Status> {
        self.inner.status.subscribe()
    }

    pub fn overlay(&self) -> watch::Receiver<Overlay> {
        self.inner.overlay.subscribe()
    }

    pub fn phase(&self) -> watch::Receiver<Phase> {
        self.inner.phase.subscribe()
    }

    pub fn pending(&self) -> Option<PendingQuery> {
        lock(&self.inner.session).pending.clone()
    }
}

async fn event_loop(inner: Weak<Inner>, mut rx: mpsc::UnboundedReceiver<Envelope>) {
    while let Some(envelope) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.handle(envelope);
    }
}

impl Inner {
    fn send(&self, generation: u64, message: Message) {
        let _ = self.events.send(Envelope {
            generation,
            message,
        });
    }

    fn handle(self: &Arc<Self>, envelope: Envelope) {
        let mut s = lock(&self.session);
        if envelope.generation != s.generation {
            tracing::trace!(stale = envelope.generation, current = s.generation, "dropping event");
            return;
        }

        match envelope.message {
            Message::Input(input) => self.drive(&mut s, input),
            Message::Block(block) => {
                if !matches!(s.phase, Phase::Planning | Phase::Streaming) {
                    return;
                }
                if s.session_start_shown && is_session_start(&block) {
                    s.session_start_shown = false;
                    return;
                }
                self.queue.enqueue(block);
            }
            Message::FailedStep(block) => {
                if s.phase == Phase::Planning {
                    s.failed_step = Some(block);
                }
            }
            Message::SessionStart => {
                if !s.signalled && matches!(s.phase, Phase::Planning | Phase::Streaming) {
                    s.session_start_shown = true;
                    self.queue.enqueue(session_start_block());
                }
            }
        }
    }

    /// Feed an input and every input its effects produce
    fn drive(self: &Arc<Self>, s: &mut Session, input: Input) {
        let mut inputs = VecDeque::from([input]);
        while let Some(input) = inputs.pop_front() {
            let step = transition(s.phase, &input);
            if step.next != s.phase {
                tracing::debug!(from = ?s.phase, to = ?step.next, ?input, "phase change");
            } else if step.effects.is_empty() {
                tracing::debug!(phase = ?s.phase, ?input, "input ignored");
            }
            s.phase = step.next;
            self.phase.send_replace(step.next);

            for effect in step.effects {
                if let Some(next) = self.perform(s, effect) {
                    inputs.push_back(next);
                }
            }
        }
    }

    fn perform(self: &Arc<Self>, s: &mut Session, effect: Effect) -> Option<Input> {
        let generation = s.generation;
        match effect {
            Effect::SetStatus(status) => {
                self.status.send_replace(status);
            }
            Effect::HideOverlay => {
                self.overlay.send_replace(Overlay::Hidden);
            }
            Effect::StorePending => s.pending = s.active.clone(),
            Effect::RestorePending => {
                if let Some(pending) = s.pending.take() {
                    s.active = Some(pending);
                }
            }
            Effect::DiscardPending => {
                s.pending = None;
                s.active = None;
            }
            Effect::StartAuthFlow => match self.auth.start() {
                Ok(url) => {
                    tracing::info!("waiting for sign-in");
                    self.overlay.send_replace(Overlay::Auth { url });
                }
                Err(e) => return Some(Input::Failed(e.to_string())),
            },
            Effect::StartAutoRetry => {
                let endpoint = self.prober.endpoint();
                tracing::info!(%endpoint, "waiting for the bridge");
                self.prober.start_auto_retry();
                self.overlay.send_replace(Overlay::Connectivity { endpoint });

                let mut connection = self.prober.subscribe();
                let events = self.events.clone();
                s.watcher = Some(tokio::spawn(async move {
                    if connection.wait_for(|c| c.connected).await.is_ok() {
                        let _ = events.send(Envelope {
                            generation,
                            message: Message::Input(Input::ConnectivityRestored),
                        });
                    }
                }));
            }
            Effect::StopAutoRetry => {
                self.prober.stop_auto_retry();
                if let Some(watcher) = s.watcher.take() {
                    watcher.abort();
                }
            }
            Effect::Dispatch => return Some(self.dispatch(s)),
            Effect::StartPlanning | Effect::OpenStream => {
                let (Some(query), Some(descriptor)) = (s.active.clone(), s.descriptor.clone()) else {
                    return Some(Input::Failed("No query to run".into()));
                };
                let inner = self.clone();
                s.task = Some(if effect == Effect::StartPlanning {
                    tokio::spawn(run_model(inner, generation, query.question, descriptor))
                } else {
                    tokio::spawn(run_bridge(inner, generation, query.question, descriptor))
                });
            }
            Effect::StartSessionTimer => {
                s.signalled = false;
                let events = self.events.clone();
                let delay = self.session_start_delay;
                s.timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = events.send(Envelope {
                        generation,
                        message: Message::SessionStart,
                    });
                }));
            }
            Effect::CancelSessionTimer => {
                s.signalled = true;
                if let Some(timer) = s.timer.take() {
                    timer.abort();
                }
            }
            Effect::ClearQueue => self.queue.clear_pending(),
            Effect::ShowError(message) => {
                tracing::warn!(%message, "query failed");
                if let Some(step) = s.failed_step.take() {
                    self.queue.enqueue(step);
                }
                self.queue.enqueue(DisplayBlock::error(message));
            }
            Effect::AwaitDrain => {
                let queue = self.queue.clone();
                let events = self.events.clone();
                s.drain = Some(tokio::spawn(async move {
                    queue.flushed().await;
                    let _ = events.send(Envelope {
                        generation,
                        message: Message::Input(Input::Drained),
                    });
                }));
            }
        }
        None
    }

    /// Resolve the model and decide which prerequisite, if any, is missing
    fn dispatch(&self, s: &mut Session) -> Input {
        let Some(query) = s.active.clone() else {
            return Input::Failed("No query to run".into());
        };

        let connection = self.prober.state();
        let descriptor = {
            let mut registry = lock(&self.registry);
            registry.rebuild(&connection);
            resolve(registry.models(), query.model_key.as_deref()).cloned()
        };
        let Some(descriptor) = descriptor else {
            return Input::Failed("No model available".into());
        };

        tracing::info!(model = %descriptor.key(), "dispatching query");
        let kind = descriptor.kind;
        s.descriptor = Some(descriptor);
        match kind {
            BackendKind::ModelDriven if !self.auth.is_authenticated() => Input::NeedsAuth,
            BackendKind::Bridge if !connection.connected => Input::NeedsConnectivity,
            kind => Input::Ready(kind),
        }
    }

    fn set_executing(&self, generation: u64, executing: bool) {
        let mut s = lock(&self.session);
        if s.generation == generation {
            s.executing = executing;
        }
    }

    /// Plan with the hosted model, then run each step in the sandbox
    async fn execute_plan(&self, generation: u64, question: &str, descriptor: &ModelDescriptor) -> Result<()> {
        let plan = self
            .planner
            .generate_plan(self.plan_model.as_ref(), question, &descriptor.model)
            .await?;
        self.send(generation, Message::Input(Input::Signal));
        self.sandbox.reset().await?;

        for step in &plan.steps {
            self.set_executing(generation, true);
            let outcome = self.sandbox.execute(&step.expr).await;
            self.set_executing(generation, false);

            // Sent once the outcome is known so a failure can be attached
            let mut block = DisplayBlock::step(&step.label, &step.explain, &step.expr);
            match outcome {
                ExecOutcome::Ok(results) => {
                    self.send(generation, Message::Block(block));
                    for result in results {
                        self.send(generation, Message::Block(result));
                    }
                }
                ExecOutcome::Failed(error) => {
                    if let DisplayBlock::Step(inner) = &mut block {
                        inner.error = Some(error.clone());
                    }
                    self.send(generation, Message::FailedStep(block));
                    return Err(Error::Execution(format!(
                        "Step \"{}\" failed: {}\n>>> {}",
                        step.label, error, step.expr
                    )));
                }
            }
        }

        let final_text = plan.final_text.trim();
        if !final_text.is_empty() {
            self.send(generation, Message::Block(DisplayBlock::text(final_text)));
        }
        Ok(())
    }

    /// Submit to the bridge and relay its event stream
    async fn stream_job(&self, generation: u64, question: &str, descriptor: &ModelDescriptor) -> Result<Input> {
        let endpoint = self
            .prober
            .state()
            .active_endpoint
            .unwrap_or_else(|| self.prober.endpoint());
        let job_id = submit_job(&self.client, &endpoint, question, descriptor).await?;
        tracing::info!(%job_id, %endpoint, "job accepted");

        let url = format!("{}/stream/{}", endpoint, job_id);
        let response = match self
            .client
            .get(&url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
        {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                tracing::warn!(status = %r.status(), "event stream refused");
                return Ok(Input::Failed(CONNECTION_ERROR.into()));
            }
            Err(e) => {
                tracing::warn!(error = %e, "event stream unreachable");
                return Ok(Input::Failed(CONNECTION_ERROR.into()));
            }
        };

        let (tx, mut rx) = mpsc::channel(64);
        let _pump = AbortOnDrop(tokio::spawn(async move {
            if let Err(e) = sse::pump(response, tx).await {
                tracing::debug!(error = %e, "event stream ended");
            }
        }));

        while let Some(event) = rx.recv().await {
            match event.event.as_str() {
                "step" => {
                    self.send(generation, Message::Input(Input::Signal));
                    self.send(generation, Message::Block(block_from_payload(&event.data)));
                }
                "final" => self.send(generation, Message::Block(block_from_payload(&event.data))),
                "fail" => return Ok(Input::Failed(fail_message(&event.data))),
                "done" => return Ok(Input::Finished),
                other => tracing::debug!(event = other, "ignoring stream event"),
            }
        }
        Ok(Input::Failed(CONNECTION_ERROR.into()))
    }
}

async fn run_model(inner: Arc<Inner>, generation: u64, question: String, descriptor: ModelDescriptor) {
    let input = match inner.execute_plan(generation, &question, &descriptor).await {
        Ok(()) => Input::Finished,
        Err(e) if e.is_auth_required() => {
            tracing::info!("credential missing or expired");
            Input::NeedsAuth
        }
        Err(e) => Input::Failed(e.to_string()),
    };
    inner.send(generation, Message::Input(input));
}

async fn run_bridge(inner: Arc<Inner>, generation: u64, question: String, descriptor: ModelDescriptor) {
    let input = inner
        .stream_job(generation, &question, &descriptor)
        .await
        .unwrap_or_else(|e| Input::Failed(e.to_string()));
    inner.send(generation, Message::Input(input));
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// POST /query; returns the job id
pub async fn submit_job(
    client: &reqwest::Client,
    endpoint: &str,
    question: &str,
    descriptor: &ModelDescriptor,
) -> Result<String> {
    let response = client
        .post(format!("{}/query", endpoint))
        .json(&json!({
            "prompt": question,
            "model": descriptor.model,
            "backend": descriptor.backend,
        }))
        .send()
        .await?;

    let status = response.status();
    let text = response.text().await?;
    if !status.is_success() {
        let message = serde_json::from_str::<Value>(&text)
            .ok()
            .and_then(|v| v.get("error").and_then(Value::as_str).map(String::from))
            .unwrap_or(text);
        let message = if message.trim().is_empty() {
            format!("Request failed: {}", status.as_u16())
        } else {
            message
        };
        return Err(Error::Http {
            status: status.as_u16(),
            message,
        });
    }

    serde_json::from_str::<Value>(&text)
        .ok()
        .and_then(|v| v.get("jobId").and_then(Value::as_str).map(String::from))
        .ok_or_else(|| Error::Http {
            status: status.as_u16(),
            message: MISSING_JOB_ID.into(),
        })
}

/// `step`/`final` events carry `{block: ...}` or a bare block
fn block_from_payload(data: &str) -> DisplayBlock {
    match serde_json::from_str::<Value>(data) {
        Ok(mut value) => match value.get_mut("block").map(Value::take) {
            Some(block) => DisplayBlock::from_value(block),
            None => DisplayBlock::from_value(value),
        },
        Err(_) => DisplayBlock::text(data),
    }
}

fn fail_message(data: &str) -> String {
    serde_json::from_str::<Value>(data)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(String::from))
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| "Failed".to_string())
}
