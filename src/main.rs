//! ntquery - ask number-theory questions from the terminal
//!
//! USAGE:
//!   ntquery ask "Divisors of 360"     # plan, run and render one question
//!   ntquery models --refresh          # probe the bridge, list models
//!   ntquery select flash              # fuzzy-select a model
//!   ntquery login | logout            # model-driven backend credentials
//!   ntquery doctor                    # check config, bridge, auth, docs
//!   ntquery config set <key> <value>  # non-interactive config
//!   ntquery worker                    # isolated execution worker (internal)

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crossterm::tty::IsTty;
use once_cell::sync::OnceCell;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use ntquery::auth::Authenticator;
use ntquery::codeassist::CodeAssist;
use ntquery::config::{self, Config};
use ntquery::models::{default_catalogs, group_models, ModelRegistry, Prerequisite};
use ntquery::orchestrator::{Components, Orchestrator, Overlay, Phase};
use ntquery::planner::Planner;
use ntquery::prober::Prober;
use ntquery::render::{PlainSink, RenderQueue, RenderSink, TerminalSink, UnicodeMath};
use ntquery::store::{FileStore, KeyStore};
use ntquery::worker::{self, WorkerSandbox};
use ntquery::docs;

// ═══════════════════════════════════════════════════════════════
// CLI
// ═══════════════════════════════════════════════════════════════

#[derive(Parser, Debug)]
#[command(name = "ntquery", version, about = "Ask number-theory questions in plain language")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Plan, run and render one question
    Ask {
        question: Vec<String>,
        /// Model key (backend:model) or a fuzzy fragment of one
        #[arg(short, long)]
        model: Option<String>,
    },
    /// List models grouped by backend
    Models {
        #[arg(long)]
        refresh: bool,
    },
    /// Select the model used by `ask`
    Select { query: String },
    /// Sign in to the model-driven backend
    Login,
    /// Forget stored credentials
    Logout,
    /// Check config, bridge, credentials and docs
    Doctor,
    /// Edit the config file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Run the isolated execution worker on stdin/stdout
    #[command(hide = true)]
    Worker,
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    Set { key: String, value: String },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("NTQUERY_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

// ═══════════════════════════════════════════════════════════════
// MAIN
// ═══════════════════════════════════════════════════════════════

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::Worker => {
            let stdin = BufReader::new(tokio::io::stdin());
            worker::serve(stdin, tokio::io::stdout()).await?;
            Ok(())
        }
        Command::Ask { question, model } => {
            let ok = run_ask(&question.join(" "), model.as_deref()).await?;
            if !ok {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Models { refresh } => run_models(refresh).await,
        Command::Select { query } => run_select(&query).await,
        Command::Login => run_login().await,
        Command::Logout => run_logout(),
        Command::Doctor => run_doctor().await,
        Command::Config {
            action: ConfigAction::Set { key, value },
        } => run_config_set(&key, &value),
    }
}

// ═══════════════════════════════════════════════════════════════
// CONTEXT
// ═══════════════════════════════════════════════════════════════

/// Long-lived pieces shared by every command
struct App {
    cfg: Config,
    client: reqwest::Client,
    store: Arc<dyn KeyStore>,
    prober: Arc<Prober>,
    auth: Arc<Authenticator>,
}

impl App {
    fn load() -> Result<Self> {
        let cfg = Config::load()?;
        let store: Arc<dyn KeyStore> = Arc::new(FileStore::open(&config::store_path()?)?);
        let client = reqwest::Client::new();

        let prober = Prober::new(client.clone(), store.clone(), &cfg.bridge_url, cfg.retry_interval());
        let auth = Arc::new(Authenticator::new(client.clone(), store.clone(), cfg.oauth.clone()));

        Ok(Self {
            cfg,
            client,
            store,
            prober,
            auth,
        })
    }

    fn registry(&self) -> ModelRegistry {
        let mut registry = ModelRegistry::new(default_catalogs(), self.store.clone());
        registry.rebuild(&self.prober.state());
        registry
    }
}

// ═══════════════════════════════════════════════════════════════
// COMMANDS
// ═══════════════════════════════════════════════════════════════

async fn run_ask(question: &str, model: Option<&str>) -> Result<bool> {
    let ctx = App::load()?;
    ctx.prober.refresh().await;

    let docs = docs::load(ctx.cfg.docs_source.as_deref(), &ctx.client).await;
    let sink: Box<dyn RenderSink> = if std::io::stdout().is_tty() {
        Box::new(TerminalSink::new().context("Failed to open terminal")?)
    } else {
        Box::new(PlainSink::new(std::io::stdout()))
    };
    let queue = RenderQueue::new(sink, ctx.cfg.pacing(), Arc::new(UnicodeMath));

    let handle: Arc<OnceCell<Orchestrator>> = Arc::new(OnceCell::new());
    let exe = std::env::current_exe().context("Failed to locate the ntquery executable")?;
    let hook = handle.clone();
    let sandbox = WorkerSandbox::new(exe).on_status(move |message| {
        if let Some(orchestrator) = hook.get() {
            orchestrator.show_loading(message);
        }
    });

    let orchestrator = Orchestrator::new(Components {
        client: ctx.client.clone(),
        registry: ctx.registry(),
        prober: ctx.prober.clone(),
        auth: ctx.auth.clone(),
        plan_model: Arc::new(CodeAssist::new(
            ctx.client.clone(),
            ctx.auth.clone(),
            &ctx.cfg.code_assist_url,
        )),
        planner: Planner::new(docs, ctx.cfg.doc_limit),
        sandbox: Arc::new(sandbox),
        queue: queue.clone(),
        session_start_delay: ctx.cfg.session_start_delay(),
    });
    let _ = handle.set(orchestrator.clone());

    if let Some(query) = model {
        let key = fuzzy_key(&ctx.registry(), query)?;
        orchestrator.select_model(&key, false);
    }

    let mut status = orchestrator.status();
    let status_queue = queue.clone();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let text = status.borrow_and_update().to_string();
            status_queue.show_status(&text);
        }
    });

    let mut phase = orchestrator.phase();
    let mut overlay = orchestrator.overlay();
    orchestrator.submit(question).await;

    let settled = loop {
        let current = *phase.borrow_and_update();
        if current.is_settled() {
            break current;
        }
        tokio::select! {
            changed = phase.changed() => {
                if changed.is_err() {
                    break Phase::Error;
                }
            }
            changed = overlay.changed() => {
                if changed.is_err() {
                    continue;
                }
                let shown = overlay.borrow_and_update().clone();
                match shown {
                    Overlay::Auth { url } => {
                        tokio::spawn(sign_in(ctx.auth.clone(), orchestrator.clone(), url));
                    }
                    Overlay::Connectivity { endpoint } => {
                        eprintln!("Waiting for the bridge at {} (Ctrl-C to cancel)", endpoint);
                    }
                    Overlay::Hidden => {}
                }
            }
            _ = tokio::signal::ctrl_c() => orchestrator.cancel(),
        }
    };

    queue.flushed().await;
    queue.show_status("");
    Ok(settled == Phase::Done)
}

/// Prompt for the authorization code while `ask` waits behind the overlay
async fn sign_in(auth: Arc<Authenticator>, orchestrator: Orchestrator, url: String) {
    eprintln!("Sign in to continue:\n\n  {}\n", url);
    eprint!("Paste the authorization code: ");
    let _ = std::io::stderr().flush();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let code = match lines.next_line().await {
        Ok(Some(code)) if !code.trim().is_empty() => code,
        _ => {
            orchestrator.cancel();
            return;
        }
    };
    match auth.exchange_code(&code).await {
        Ok(()) => orchestrator.auth_completed(),
        Err(e) => {
            eprintln!("Sign-in failed: {}", e);
            orchestrator.cancel();
        }
    }
}

fn fuzzy_key(registry: &ModelRegistry, query: &str) -> Result<String> {
    if registry.models().iter().any(|m| m.key() == query) {
        return Ok(query.to_string());
    }
    registry
        .fuzzy_find(query)
        .first()
        .map(|m| m.key())
        .with_context(|| format!("No model matches '{}'", query))
}

async fn run_models(refresh: bool) -> Result<()> {
    let ctx = App::load()?;
    if refresh {
        println!("Probing {} ...", ctx.prober.endpoint());
    }
    let connected = ctx.prober.refresh().await;
    if refresh {
        println!("Bridge {}\n", if connected { "reachable" } else { "unreachable" });
    }

    let registry = ctx.registry();
    for (group, models) in group_models(registry.models()) {
        println!("{}:", group);
        for m in models {
            println!(
                "  {} {} ({}){}",
                if registry.is_selected(m) { "*" } else { " " },
                m.label,
                m.key(),
                if m.available { "" } else { " [unavailable]" }
            );
        }
    }
    Ok(())
}

async fn run_select(query: &str) -> Result<()> {
    let ctx = App::load()?;
    ctx.prober.refresh().await;
    let mut registry = ctx.registry();

    let key = fuzzy_key(&registry, query)?;
    let selection = registry
        .select(&key, true, ctx.auth.is_authenticated())
        .context("No models available")?;

    println!("Selected {} ({})", selection.descriptor.label, selection.descriptor.key());
    match selection.prerequisite {
        Some(Prerequisite::Authentication) => println!("Sign in first: ntquery login"),
        Some(Prerequisite::Connectivity) => println!(
            "Bridge unreachable at {}; start ntquery-bridge or run: ntquery config set bridge_url <url>",
            ctx.prober.endpoint()
        ),
        None => {}
    }
    Ok(())
}

async fn run_login() -> Result<()> {
    let ctx = App::load()?;
    let url = ctx.auth.start()?;
    println!("Open this URL and approve access:\n\n  {}\n", url);
    print!("Paste the authorization code: ");
    std::io::stdout().flush()?;

    let mut code = String::new();
    std::io::stdin().read_line(&mut code)?;
    ctx.auth.exchange_code(&code).await?;

    let assist = CodeAssist::new(ctx.client.clone(), ctx.auth.clone(), &ctx.cfg.code_assist_url);
    let token = ctx.auth.access_token().await?;
    match assist.ensure_project(&token).await {
        Ok(Some(project)) => println!("Signed in (project {})", project),
        Ok(None) => println!("Signed in"),
        Err(e) => println!("Signed in; project provisioning failed: {}", e),
    }
    Ok(())
}

fn run_logout() -> Result<()> {
    let ctx = App::load()?;
    ctx.auth.clear()?;
    println!("Credentials cleared");
    Ok(())
}

async fn run_doctor() -> Result<()> {
    println!("ntquery doctor\n");
    let ctx = App::load()?;

    println!("[✓] Config: {}", config::config_path()?.display());

    let endpoint = ctx.prober.endpoint();
    print!("[?] Bridge: checking {} ...", endpoint);
    std::io::stdout().flush()?;
    if ctx.prober.refresh().await {
        let state = ctx.prober.state();
        println!(
            "\r[✓] Bridge: {} ({} backends)          ",
            state.active_endpoint.unwrap_or(endpoint),
            state.backends.len()
        );
        if let Some(secure) = ctx.prober.discover_secure().await {
            println!("[✓] Secure bridge: {}", secure);
        }
    } else {
        println!("\r[✗] Bridge: unreachable at {}          ", endpoint);
    }

    let signed_in = ctx.auth.is_authenticated();
    println!(
        "[{}] Credentials: {}",
        if signed_in { "✓" } else { "✗" },
        if signed_in { "present" } else { "missing (ntquery login)" }
    );

    let docs = docs::load(ctx.cfg.docs_source.as_deref(), &ctx.client).await;
    println!(
        "[{}] API docs: {} entries from {}",
        if docs.docs.is_empty() { "✗" } else { "✓" },
        docs.docs.len(),
        ctx.cfg.docs_source.as_deref().unwrap_or("built-in catalog")
    );
    Ok(())
}

fn run_config_set(key: &str, value: &str) -> Result<()> {
    let mut cfg = Config::load()?;

    if key == "bridge_https" {
        let store = FileStore::open(&config::store_path()?)?;
        store.set(ntquery::store::keys::BRIDGE_HTTPS_URL, &config::normalize_endpoint(value))?;
        println!("Secure bridge endpoint remembered: {}", value);
        return Ok(());
    }

    let previous = cfg.bridge_url.clone();
    cfg.set(key, value)?;
    cfg.save()?;

    if cfg.bridge_url != previous {
        let store: Arc<dyn KeyStore> = Arc::new(FileStore::open(&config::store_path()?)?);
        let prober = Prober::new(reqwest::Client::new(), store, &previous, cfg.retry_interval());
        prober.set_endpoint(&cfg.bridge_url);
    }
    println!("{} saved to {}", key, config::config_path()?.display());
    Ok(())
}
