mod config;

use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use fieldpost_contract::QueueStatus;
use fieldpost_delivery::{
    run_probe, Connectivity, DeliveryWorker, FileCredentials, HttpUploadTransport, Outbox,
    Scheduler, StageRequest, UploadTransport,
};
use fieldpost_ingest::{build_router, AppState, BlobStore};
use fieldpost_storage::{AssetStore, QueueItem, QueueStore, StorageConfig};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{AgentSection, RuntimeConfig};

const WATCH_POLL: Duration = Duration::from_secs(2);

#[derive(Debug, Parser)]
#[command(author, version, about = "Field upload outbox and ingestion daemon")]
struct Cli {
    #[arg(long, global = true, default_value = "config/fieldpost.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the ingestion server.
    Serve,
    /// Run the device-side delivery loop until interrupted.
    Agent,
    /// Stage a file and queue it for delivery.
    Enqueue(EnqueueArgs),
    /// Inspect or maintain the local upload queue.
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
    /// Store a bearer token for the agent and requeue uploads that failed
    /// for lack of one.
    Login {
        #[arg(long)]
        token: String,
    },
    /// Create a server-side session and print its bearer token.
    IssueToken {
        #[arg(long)]
        user: String,
        /// Lifetime in hours; omitted means no expiry.
        #[arg(long)]
        ttl_hours: Option<i64>,
    },
}

#[derive(Debug, Args)]
struct EnqueueArgs {
    file: PathBuf,
    #[arg(long)]
    owner_type: String,
    #[arg(long)]
    owner_id: i64,
    #[arg(long)]
    stage: String,
    #[arg(long)]
    client_visible: bool,
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    mime: Option<String>,
}

#[derive(Debug, Subcommand)]
enum QueueAction {
    List,
    /// Print the queue on every change until interrupted.
    Watch,
    Retry { id: i64 },
    /// Delete failed items and their staged files.
    Purge,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = RuntimeConfig::load(&cli.config)?;
    match cli.command {
        Command::Serve => serve(config).await,
        Command::Agent => agent(&config.agent).await,
        Command::Enqueue(args) => enqueue(&config.agent, args).await,
        Command::Queue { action } => queue(&config.agent, action).await,
        Command::Login { token } => login(&config.agent, token).await,
        Command::IssueToken { user, ttl_hours } => issue_token(&config, &user, ttl_hours).await,
    }
}

async fn serve(config: RuntimeConfig) -> Result<()> {
    let assets = AssetStore::connect(&StorageConfig {
        sqlite_path: config.storage.sqlite_path.clone(),
    })
    .await?;
    let blobs = BlobStore::new(&config.storage.blob_root);
    blobs.ensure_root().await?;

    let app = build_router(AppState::new(assets, blobs, config.ingest));

    let socket: SocketAddr = config
        .http
        .bind
        .parse()
        .with_context(|| format!("invalid socket address {}", config.http.bind))?;
    let listener = tokio::net::TcpListener::bind(socket)
        .await
        .with_context(|| format!("failed to bind {}", config.http.bind))?;

    info!(
        bind = %config.http.bind,
        blob_root = %config.storage.blob_root.display(),
        max_file_bytes = config.ingest.max_file_bytes,
        "fieldpostd ingest listening"
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("axum server failed")
}

// Connectivity starts offline; only the agent probes the server.
struct Device {
    outbox: Outbox,
    transport: Arc<dyn UploadTransport>,
    connectivity: Connectivity,
}

async fn open_device(agent: &AgentSection) -> Result<Device> {
    let store = QueueStore::connect(&StorageConfig {
        sqlite_path: agent.queue_path.clone(),
    })
    .await?;
    let transport: Arc<dyn UploadTransport> =
        Arc::new(HttpUploadTransport::new(&agent.server_url, agent.timeouts())?);
    let credentials = Arc::new(FileCredentials::new(&agent.token_file));
    let worker = DeliveryWorker::new(store.clone(), Arc::clone(&transport), credentials)
        .with_max_attempts(agent.max_attempts);

    let connectivity = Connectivity::new(false);
    let scheduler = Scheduler::new(worker, connectivity.clone(), agent.scheduler());
    Ok(Device {
        outbox: Outbox::new(store, scheduler, &agent.staging_dir),
        transport,
        connectivity,
    })
}

async fn agent(agent: &AgentSection) -> Result<()> {
    let device = open_device(agent).await?;
    let recovered = device.outbox.store().recover_in_flight().await?;
    if recovered > 0 {
        warn!(recovered, "uploads interrupted by a previous run were put back to pending");
    }

    let guard = device.outbox.scheduler().start();
    let stop = CancellationToken::new();
    let probe = tokio::spawn(run_probe(
        device.connectivity.clone(),
        Arc::clone(&device.transport),
        agent.probe_interval(),
        stop.clone(),
    ));

    info!(server = %agent.server_url, queue = %agent.queue_path, "fieldpostd agent running");
    shutdown_signal().await;

    stop.cancel();
    guard.stop().await;
    if let Err(err) = probe.await {
        warn!(error = %err, "connectivity probe task ended abnormally");
    }
    Ok(())
}

async fn enqueue(agent: &AgentSection, args: EnqueueArgs) -> Result<()> {
    // Offline here: the running agent delivers on its next sweep.
    let device = open_device(agent).await?;
    let id = device
        .outbox
        .stage(StageRequest {
            source: args.file,
            owner_type: args.owner_type,
            owner_id: args.owner_id,
            stage: args.stage,
            client_visible: args.client_visible,
            original_name: args.name,
            mime_type: args.mime,
        })
        .await?;
    println!("{id}");
    Ok(())
}

async fn queue(agent: &AgentSection, action: QueueAction) -> Result<()> {
    let device = open_device(agent).await?;
    let outbox = &device.outbox;

    match action {
        QueueAction::List => {
            print_items(&outbox.store().list_all().await?, agent.max_attempts);
        }
        QueueAction::Watch => {
            // The change feed only covers this process; the poll picks up
            // transitions made by a running agent.
            let mut view = Box::pin(outbox.observe());
            let mut poll = tokio::time::interval(WATCH_POLL);
            let shutdown = shutdown_signal();
            tokio::pin!(shutdown);
            let mut last: Option<Vec<QueueItem>> = None;
            loop {
                let items = tokio::select! {
                    _ = &mut shutdown => break,
                    snapshot = view.next() => match snapshot {
                        Some(items) => items?,
                        None => break,
                    },
                    _ = poll.tick() => outbox.store().list_all().await?,
                };
                if last.as_ref() != Some(&items) {
                    println!("--");
                    print_items(&items, agent.max_attempts);
                    last = Some(items);
                }
            }
        }
        QueueAction::Retry { id } => {
            if outbox.retry(id).await? {
                println!("requeued {id}");
            } else {
                println!("item {id} is not failed");
            }
        }
        QueueAction::Purge => {
            let purged = outbox.purge_failed().await?;
            println!("purged {purged} failed item(s)");
        }
    }
    Ok(())
}

async fn login(agent: &AgentSection, token: String) -> Result<()> {
    if let Some(parent) = agent.token_file.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create {}", parent.display()))?;
    }
    tokio::fs::write(&agent.token_file, token.trim())
        .await
        .with_context(|| format!("write token file {}", agent.token_file.display()))?;

    let device = open_device(agent).await?;
    let requeued = device.outbox.credentials_refreshed().await?;
    println!("token stored; {requeued} upload(s) requeued");
    Ok(())
}

async fn issue_token(config: &RuntimeConfig, user: &str, ttl_hours: Option<i64>) -> Result<()> {
    let assets = AssetStore::connect(&StorageConfig {
        sqlite_path: config.storage.sqlite_path.clone(),
    })
    .await?;
    let session = assets
        .issue_session(user, ttl_hours.map(chrono::Duration::hours))
        .await?;
    info!(user_id = %session.user_id, expires_at = ?session.expires_at, "session issued");
    println!("{}", session.token);
    Ok(())
}

fn print_items(items: &[QueueItem], max_attempts: u32) {
    if items.is_empty() {
        println!("queue is empty");
        return;
    }
    for item in items {
        println!(
            "{:>6}  {:<9}  attempts={:<2}  {}/{}  {:<12}  {}  {}",
            item.id,
            item.status.as_str(),
            item.attempts,
            item.owner_type,
            item.owner_id,
            item.stage,
            item.original_name,
            describe_error(item, max_attempts),
        );
    }
}

fn describe_error(item: &QueueItem, max_attempts: u32) -> String {
    match item.last_error {
        Some(reason) if item.status == QueueStatus::Failed => {
            let terminal = reason.terminal(item.attempts, max_attempts);
            if terminal == reason {
                reason.to_string()
            } else {
                format!("{terminal} ({reason})")
            }
        }
        Some(reason) => reason.to_string(),
        None => String::new(),
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
