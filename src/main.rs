//! rye — agent execution host CLI
//!
//! Usage:
//!   rye search "read files" --scope tool.files.*
//!   rye load knowledge guides/intro
//!   rye sign tool "files/*"
//!   rye execute tool files/read --params '{"path": "x.txt"}' --dry-run
//!   rye thread spawn ops/review --inputs '{"goal": "triage"}'
//!   rye thread wait review-0001 --timeout 300
//!
//! Every command prints the protocol response envelope as JSON and exits
//! 0 on success, 1 on error.

use anyhow::Context;
use clap::{Parser, Subcommand};
use ryeos_core::protocol::{Request, Response};
use ryeos_core::{ArtifactKind, Limits, Space, Verb};
use ryeos_host::{dispatcher, Dispatcher, Host, HostConfig};
use ryeos_store::SystemBundle;
use ryeos_threads::spawn::SpawnRequest;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "rye",
    about = "Agent execution host: signed artifacts, executor chains, agent threads",
    version = env!("CARGO_PKG_VERSION")
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Project tier root (default: nearest ancestor containing .rye/)
    #[arg(long, global = true)]
    project: Option<PathBuf>,

    /// Write logs to a file in addition to stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Search artifacts across tiers
    Search {
        query: String,
        /// Scope: <kind>[.<prefix>.*]
        #[arg(long)]
        scope: Option<String>,
        #[arg(long)]
        space: Option<String>,
        #[arg(long, default_value_t = false)]
        fuzzy: bool,
        #[arg(long, default_value_t = 0)]
        page: usize,
        #[arg(long)]
        page_size: Option<usize>,
    },
    /// Load an artifact (optionally copying it into another tier)
    Load {
        kind: ArtifactKind,
        id: String,
        #[arg(long)]
        space: Option<String>,
        /// Copy into this tier after loading
        #[arg(long)]
        dest: Option<String>,
    },
    /// Sign an artifact or glob of artifacts
    Sign {
        kind: ArtifactKind,
        /// Artifact id, or glob like "files/*"
        pattern: String,
        #[arg(long)]
        space: Option<String>,
    },
    /// Execute a tool, workflow, or knowledge artifact
    Execute {
        kind: ArtifactKind,
        id: String,
        /// Runtime parameters as a JSON object
        #[arg(long, default_value = "{}")]
        params: String,
        #[arg(long, default_value_t = false)]
        dry_run: bool,
        /// Spawn workflows as threads instead of returning the body
        #[arg(long, default_value_t = false)]
        thread: bool,
        /// Detach the spawned thread
        #[arg(long = "async", default_value_t = false)]
        detach: bool,
        #[arg(long)]
        model: Option<String>,
    },
    /// Thread management
    Thread {
        #[command(subcommand)]
        command: ThreadCommands,
    },
    /// Generate (or show) the local signing key
    Keygen,
}

#[derive(Subcommand)]
enum ThreadCommands {
    /// Spawn a workflow directive as a thread
    Spawn {
        directive: String,
        #[arg(long, default_value = "{}")]
        inputs: String,
        #[arg(long)]
        parent: Option<String>,
        /// Block until the thread finishes
        #[arg(long, default_value_t = false)]
        sync: bool,
        #[arg(long)]
        model: Option<String>,
        /// Spend limit override in dollars
        #[arg(long)]
        spend: Option<f64>,
    },
    /// Wait for threads to reach a terminal state
    Wait {
        ids: Vec<String>,
        #[arg(long, default_value_t = 300)]
        timeout: u64,
    },
    /// Current status of threads without waiting
    Status { ids: Vec<String> },
    /// List in-flight threads
    List,
    /// Request cooperative cancellation (sentinel file)
    Cancel { id: String },
    /// Kill a thread's process, graceful then forced
    Kill { id: String },
    /// Resume a terminal thread with a new message
    Resume { id: String, message: String },
    /// Entry point the orchestrator launches; requires an agent runner
    Run {
        thread_id: String,
        #[arg(long, default_value_t = false)]
        pre_registered: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_file.as_deref())?;

    let host = Arc::new(Host::init(host_config(cli.project.clone())?)?);
    tracing::debug!(fingerprint = host.signing_key.fingerprint(), "host ready");
    let response = run_command(host, cli.command).await;
    let exit = if response.is_success() { 0 } else { 1 };
    println!("{}", serde_json::to_string_pretty(&response)?);
    std::process::exit(exit);
}

fn init_tracing(log_file: Option<&std::path::Path>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match log_file {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
            let file = path.file_name().context("log file has no name")?;
            let appender = tracing_appender::rolling::never(dir, file);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(appender)
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

/// Project root: explicit flag, else the nearest ancestor of the working
/// directory containing `.rye/`. System bundles live under the user
/// tier's `bundles/` directory.
fn host_config(project: Option<PathBuf>) -> anyhow::Result<HostConfig> {
    let project_dir = match project {
        Some(p) => Some(p),
        None => {
            let mut dir = std::env::current_dir()?;
            loop {
                let candidate = dir.join(".rye");
                if candidate.is_dir() {
                    break Some(candidate);
                }
                if !dir.pop() {
                    break None;
                }
            }
        }
    };

    let mut config = HostConfig {
        project_dir,
        ..HostConfig::default()
    };
    let tiers = ryeos_store::TierPaths::discover(None, Vec::new());
    let bundles_dir = tiers.user.join("bundles");
    if let Ok(entries) = std::fs::read_dir(&bundles_dir) {
        let mut bundles: Vec<SystemBundle> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .map(|e| SystemBundle::new(e.file_name().to_string_lossy().to_string(), e.path()))
            .collect();
        bundles.sort_by(|a, b| a.name.cmp(&b.name));
        config.bundles = bundles;
    }
    Ok(config)
}

async fn run_command(host: Arc<Host>, command: Commands) -> Response {
    match build_and_run(host, command).await {
        Ok(response) => response,
        Err(e) => Response::failure(&ryeos_core::Error::internal(e.to_string())),
    }
}

async fn build_and_run(host: Arc<Host>, command: Commands) -> anyhow::Result<Response> {
    let dispatcher = Dispatcher::new(host.clone());
    let response = match command {
        Commands::Search { query, scope, space, fuzzy, page, page_size } => {
            let mut req = Request::new(Verb::Search);
            req.query = Some(query);
            req.scope = scope;
            req.space = parse_space(space)?;
            req.options.fuzzy = fuzzy;
            req.options.page = page;
            req.options.page_size = page_size;
            dispatcher.handle(req).await
        }
        Commands::Load { kind, id, space, dest } => {
            let mut req = Request::new(Verb::Load);
            req.kind = Some(kind);
            req.id = Some(id);
            req.space = parse_space(space)?;
            req.options.destination = parse_space(dest)?;
            dispatcher.handle(req).await
        }
        Commands::Sign { kind, pattern, space } => {
            let mut req = Request::new(Verb::Sign);
            req.kind = Some(kind);
            req.id = Some(pattern);
            req.space = parse_space(space)?;
            dispatcher.handle(req).await
        }
        Commands::Execute { kind, id, params, dry_run, thread, detach, model } => {
            let mut req = Request::new(Verb::Execute);
            req.kind = Some(kind);
            req.id = Some(id);
            req.params = parse_object(&params)?;
            req.options.dry_run = dry_run;
            req.options.thread = thread;
            req.options.detach = detach;
            req.options.model = model;
            dispatcher.handle(req).await
        }
        Commands::Thread { command } => run_thread_command(&host, command).await?,
        Commands::Keygen => Response::success(serde_json::json!({
            "fingerprint": host.signing_key.fingerprint(),
            "public_key": host.signing_key.public_key_b64(),
            "path": host.signing_key.path(),
        })),
    };
    Ok(response)
}

async fn run_thread_command(host: &Arc<Host>, command: ThreadCommands) -> anyhow::Result<Response> {
    let response = match command {
        ThreadCommands::Spawn { directive, inputs, parent, sync, model, spend } => {
            let mut req = SpawnRequest::new(directive.parse()?);
            req.inputs = parse_object(&inputs)?;
            req.parent_id =
                parent.or_else(|| std::env::var(ryeos_threads::spawn::PARENT_THREAD_ENV).ok());
            req.detach = !sync;
            req.model = model;
            if let Some(spend) = spend {
                req.overrides = Some(Limits { spend, ..Limits::default() });
            }
            match host.orchestrator.spawn(req).await {
                Ok(outcome) => Response::success(serde_json::json!({
                    "thread_id": outcome.thread_id,
                    "pid": outcome.pid,
                    "status": outcome.status,
                    "result": outcome.result,
                })),
                Err(e) => Response::failure(&e),
            }
        }
        ThreadCommands::Wait { ids, timeout } => {
            match host.orchestrator.wait(&ids, Duration::from_secs(timeout)).await {
                Ok(report) => Response::success(serde_json::to_value(report)?),
                Err(e) => Response::failure(&e),
            }
        }
        ThreadCommands::Status { ids } => match host.orchestrator.aggregate(&ids) {
            Ok(report) => Response::success(serde_json::to_value(report)?),
            Err(e) => Response::failure(&e),
        },
        ThreadCommands::List => match host.orchestrator.list_active() {
            Ok(threads) => Response::success(serde_json::json!({
                "threads": threads
                    .iter()
                    .map(|t| serde_json::json!({
                        "thread_id": t.thread_id,
                        "directive": t.directive_id,
                        "status": t.status,
                        "parent_id": t.parent_id,
                        "cost": t.cost,
                    }))
                    .collect::<Vec<_>>(),
            })),
            Err(e) => Response::failure(&e),
        },
        ThreadCommands::Cancel { id } => match host.orchestrator.cancel(&id) {
            Ok(()) => Response::success(serde_json::json!({"thread_id": id, "cancel": "requested"})),
            Err(e) => Response::failure(&e),
        },
        ThreadCommands::Kill { id } => match host.orchestrator.kill(&id).await {
            Ok(()) => Response::success(serde_json::json!({"thread_id": id, "killed": true})),
            Err(e) => Response::failure(&e),
        },
        ThreadCommands::Resume { id, message } => {
            match dispatcher::resume_thread(host, &id, &message).await {
                Ok(data) => Response::success(data),
                Err(e) => Response::failure(&e),
            }
        }
        ThreadCommands::Run { thread_id, .. } => {
            // The turn loop needs a model provider, which only the agent
            // runner links. The host core launches runners; it is not one.
            Response::failure(&ryeos_core::Error::validation(format!(
                "no agent runner is linked into this binary; set RYE_RUNNER to your runner \
                 command and re-spawn thread {thread_id}"
            )))
        }
    };
    Ok(response)
}

fn parse_space(space: Option<String>) -> anyhow::Result<Option<Space>> {
    Ok(match space {
        Some(s) => Some(s.parse().map_err(|e: ryeos_core::Error| anyhow::anyhow!(e))?),
        None => None,
    })
}

fn parse_object(raw: &str) -> anyhow::Result<serde_json::Map<String, serde_json::Value>> {
    let value: serde_json::Value = serde_json::from_str(raw).context("params must be JSON")?;
    match value {
        serde_json::Value::Object(map) => Ok(map),
        _ => anyhow::bail!("params must be a JSON object"),
    }
}
