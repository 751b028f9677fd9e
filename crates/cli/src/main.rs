//! Upload CLI for reel.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use reel_cli::api_client::{ApiClient, JobResponse, UploadApi};
use reel_cli::config::{
    ClientConfig, client_config_path, load_client_config, normalize_base_url, read_token,
    save_client_config,
};
use reel_cli::upload::progress::{DEFAULT_TICK, ProgressEvent, ProgressTracker, UploadState};
use reel_cli::upload::queue::UploadQueue;
use reel_cli::upload::resume::ResumeCache;
use reel_cli::upload::transport::TransportMode;
use reel_cli::upload::{UploadOrchestrator, UploadSettings, UploadSource};
use reel_core::quota::QuotaResponse;
use reel_core::token::CreateTokenRequest;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "reelctl")]
#[command(about = "Upload videos to a reel server")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct ClientConfigArgs {
    /// Client config file path
    #[arg(long, env = "REEL_CLIENT_CONFIG")]
    client_config: Option<String>,
}

#[derive(Args, Clone)]
struct ApiArgs {
    /// Server API URL (overrides client config)
    #[arg(long)]
    server: Option<String>,

    /// Bearer token (overrides client config)
    #[arg(long)]
    token: Option<String>,

    #[command(flatten)]
    client: ClientConfigArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Save server URL and token locally
    Login {
        /// Server API base URL (e.g., https://reel.example.com)
        #[arg(long)]
        server: String,
        /// Token value (avoid if possible; prefer --token-stdin)
        #[arg(long)]
        token: Option<String>,
        /// Read token from stdin
        #[arg(long, default_value_t = false)]
        token_stdin: bool,
        /// Skip checking the token against the server
        #[arg(long, default_value_t = false)]
        no_verify: bool,
        #[command(flatten)]
        client: ClientConfigArgs,
    },
    /// Upload one or more files, in order
    Upload {
        /// Files to upload
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Chunk delivery: auto, direct or proxied
        #[arg(long, value_parser = parse_transport)]
        transport: Option<TransportMode>,
        #[command(flatten)]
        api: ApiArgs,
    },
    /// Show an upload session
    Status {
        session_id: String,
        #[command(flatten)]
        api: ApiArgs,
    },
    /// Cancel an upload session and release its reservation
    Cancel {
        session_id: String,
        #[command(flatten)]
        api: ApiArgs,
    },
    /// Show storage usage and limit
    Quota {
        #[command(flatten)]
        api: ApiArgs,
    },
    /// Check server health and version
    Health {
        #[command(flatten)]
        api: ApiArgs,
    },
    /// Administrative commands (admin token required)
    Admin {
        #[command(subcommand)]
        command: AdminCommands,
        #[command(flatten)]
        api: ApiArgs,
    },
}

#[derive(Subcommand)]
enum AdminCommands {
    /// Expire stale sessions and collect orphaned chunks now
    Sweep,
    /// Recompute every owner's storage usage
    Reconcile,
    /// List recent maintenance runs
    Jobs {
        #[arg(long)]
        limit: Option<u32>,
    },
    /// Token management
    Token {
        #[command(subcommand)]
        command: TokenCommands,
    },
    /// Per-owner quota management
    Quota {
        #[command(subcommand)]
        command: QuotaCommands,
    },
}

#[derive(Subcommand)]
enum TokenCommands {
    /// Mint a token
    Create {
        /// Existing owner to mint for (default: a new owner)
        #[arg(long)]
        owner: Option<String>,
        /// Grant the admin scope as well
        #[arg(long, default_value_t = false)]
        admin: bool,
        /// Lifetime in seconds
        #[arg(long)]
        expires_in: Option<u64>,
        #[arg(long)]
        description: Option<String>,
    },
}

#[derive(Subcommand)]
enum QuotaCommands {
    Get {
        owner: String,
    },
    Set {
        owner: String,
        /// New limit in bytes
        limit_bytes: u64,
    },
}

fn parse_transport(value: &str) -> Result<TransportMode, String> {
    match value {
        "auto" => Ok(TransportMode::Auto),
        "direct" => Ok(TransportMode::Direct),
        "proxied" => Ok(TransportMode::Proxied),
        other => Err(format!("unknown transport '{other}' (auto, direct, proxied)")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let Cli { command } = Cli::parse();

    match command {
        Commands::Login {
            server,
            token,
            token_stdin,
            no_verify,
            client,
        } => handle_login_command(&server, token, token_stdin, no_verify, &client).await,
        Commands::Upload {
            files,
            transport,
            api,
        } => handle_upload_command(files, transport, &api).await,
        Commands::Status { session_id, api } => handle_status_command(&session_id, &api).await,
        Commands::Cancel { session_id, api } => handle_cancel_command(&session_id, &api).await,
        Commands::Quota { api } => {
            let (client, _) = get_api_client(&api)?;
            print_quota(&client.get_quota().await?);
            Ok(())
        }
        Commands::Health { api } => handle_health_command(&api).await,
        Commands::Admin { command, api } => handle_admin_command(command, &api).await,
    }
}

struct ResolvedConfig {
    path: PathBuf,
    config: ClientConfig,
}

fn resolve_config(client: &ClientConfigArgs) -> Result<ResolvedConfig> {
    let path = client_config_path(client.client_config.as_deref())?;
    let config = load_client_config(&path)?;
    Ok(ResolvedConfig { path, config })
}

fn get_api_client(api: &ApiArgs) -> Result<(ApiClient, ResolvedConfig)> {
    let resolved = resolve_config(&api.client)?;
    let server = api
        .server
        .clone()
        .or_else(|| resolved.config.server.clone())
        .ok_or_else(|| anyhow::anyhow!("no server configured: run `reelctl login` or pass --server"))?;
    let token = api
        .token
        .clone()
        .or_else(|| resolved.config.token.clone())
        .ok_or_else(|| anyhow::anyhow!("no token configured: run `reelctl login` or pass --token"))?;

    let base_url = normalize_base_url(&server)?;
    let client = ApiClient::new(&base_url, &token)?;
    Ok((client, resolved))
}

async fn handle_login_command(
    server: &str,
    token: Option<String>,
    token_stdin: bool,
    no_verify: bool,
    client: &ClientConfigArgs,
) -> Result<()> {
    let token = read_token(token, token_stdin)?;
    let base_url = normalize_base_url(server)?;
    let ResolvedConfig { path, mut config } = resolve_config(client)?;

    if !no_verify {
        let api = ApiClient::new(&base_url, &token)?;
        let quota = api
            .get_quota()
            .await
            .context("token was rejected by the server")?;
        println!("Authenticated as owner {}", quota.owner_id);
    }

    config.server = Some(base_url.clone());
    config.token = Some(token);
    save_client_config(&path, &config).await?;

    println!("Logged in to {base_url}");
    println!("Client config: {}", path.display());
    Ok(())
}

async fn handle_upload_command(
    files: Vec<PathBuf>,
    transport: Option<TransportMode>,
    api: &ApiArgs,
) -> Result<()> {
    let (client, resolved) = get_api_client(api)?;

    let mut sources = Vec::with_capacity(files.len());
    for path in &files {
        let source = UploadSource::from_path(path)
            .await
            .with_context(|| format!("cannot read {}", path.display()))?;
        sources.push(source);
    }

    let resume_path = resolved.config.resume_cache_path(&resolved.path);
    let resume = ResumeCache::load(&resume_path).await?;
    let (progress, events) = ProgressTracker::with_events(DEFAULT_TICK);
    let renderer = tokio::spawn(render_progress(events));

    let orchestrator = Arc::new(UploadOrchestrator::new(
        Arc::new(client) as Arc<dyn UploadApi>,
        transport.unwrap_or(resolved.config.transport).build(),
        resume,
        progress,
        UploadSettings::from_config(&resolved.config),
    ));
    let queue = UploadQueue::start(orchestrator.clone());
    let tickets = queue.submit(sources);

    let names: Vec<String> = tickets.iter().map(|t| t.filename.clone()).collect();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted, cancelling uploads...");
            for name in &names {
                orchestrator.cancel(name).await;
            }
        }
    });

    let total = tickets.len();
    let mut failed = 0;
    for ticket in tickets {
        let filename = ticket.filename.clone();
        match ticket.wait().await {
            Ok(done) => println!(
                "{filename}: uploaded {} (video {}, share {})",
                format_bytes(done.size),
                done.video_id,
                done.share_id
            ),
            Err(e) => {
                failed += 1;
                eprintln!("{filename}: {e}");
            }
        }
    }

    interrupt.abort();
    queue.shutdown().await;
    renderer.abort();

    if failed > 0 {
        anyhow::bail!("{failed} of {total} uploads failed");
    }
    Ok(())
}

/// Print state changes and every tenth of progress.
async fn render_progress(mut events: mpsc::UnboundedReceiver<ProgressEvent>) {
    let mut last: HashMap<String, (UploadState, u32)> = HashMap::new();
    while let Some(ProgressEvent { filename, progress }) = events.recv().await {
        let decile = (progress.percent / 10.0) as u32;
        let seen = (progress.state, decile);
        if last.get(&filename) == Some(&seen) {
            continue;
        }
        last.insert(filename.clone(), seen);
        match progress.state {
            UploadState::Failed | UploadState::Completed => {}
            state => eprintln!("{filename}: {state} {:.0}%", progress.percent),
        }
    }
}

async fn handle_status_command(session_id: &str, api: &ApiArgs) -> Result<()> {
    let (client, _) = get_api_client(api)?;
    let status = client.session_status(session_id).await?;

    println!("Session: {}", status.session_id);
    println!("  Share ID: {}", status.share_id);
    println!("  Status: {}", status.status);
    println!(
        "  Chunks: {}/{}",
        status.chunks_uploaded, status.total_chunks
    );
    println!("  File size: {}", format_bytes(status.file_size));
    println!("  Expires: {}", status.expires_at);
    if let Some(error) = &status.error_message {
        println!("  Error: {error}");
    }
    Ok(())
}

async fn handle_cancel_command(session_id: &str, api: &ApiArgs) -> Result<()> {
    let (client, _) = get_api_client(api)?;
    let response = client.cancel_session(session_id).await?;
    println!("Session {}: {}", response.session_id, response.status);
    Ok(())
}

async fn handle_health_command(api: &ApiArgs) -> Result<()> {
    let resolved = resolve_config(&api.client)?;
    let server = api
        .server
        .clone()
        .or(resolved.config.server)
        .ok_or_else(|| anyhow::anyhow!("no server configured: run `reelctl login` or pass --server"))?;
    let base_url = normalize_base_url(&server)?;
    // Health needs no token.
    let health = ApiClient::new(&base_url, "")?.health().await?;

    println!("Status: {}", health.status);
    println!("Server version: {}", health.version);
    println!("Client version: {}", env!("CARGO_PKG_VERSION"));

    if health.version != env!("CARGO_PKG_VERSION") {
        eprintln!(
            "Warning: version mismatch (server: {}, client: {})",
            health.version,
            env!("CARGO_PKG_VERSION")
        );
    }
    Ok(())
}

async fn handle_admin_command(command: AdminCommands, api: &ApiArgs) -> Result<()> {
    let (client, _) = get_api_client(api)?;

    match command {
        AdminCommands::Sweep => {
            let report = client.trigger_sweep().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        AdminCommands::Reconcile => {
            let report = client.trigger_reconcile().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        AdminCommands::Jobs { limit } => {
            let jobs = client.list_jobs(limit).await?;
            if jobs.is_empty() {
                println!("No maintenance runs recorded.");
            } else {
                print_jobs(&jobs);
            }
        }
        AdminCommands::Token {
            command:
                TokenCommands::Create {
                    owner,
                    admin,
                    expires_in,
                    description,
                },
        } => {
            let mut scopes = vec!["upload".to_string()];
            if admin {
                scopes.push("admin".to_string());
            }
            let response = client
                .create_token(&CreateTokenRequest {
                    owner_id: owner,
                    scopes,
                    expires_in,
                    description,
                })
                .await?;

            println!("Token created successfully!");
            println!("\nToken ID: {}", response.token_id);
            println!("Owner ID: {}", response.owner_id);
            println!("Token secret: {}", response.token_secret);
            println!("\nIMPORTANT: Save this token secret now. It cannot be recovered.");
            if let Some(expires) = response.expires_at {
                println!("Expires: {expires}");
            }
        }
        AdminCommands::Quota { command } => {
            let quota = match command {
                QuotaCommands::Get { owner } => client.get_user_quota(&owner).await?,
                QuotaCommands::Set { owner, limit_bytes } => {
                    client.set_user_quota(&owner, limit_bytes).await?
                }
            };
            print_quota(&quota);
        }
    }
    Ok(())
}

fn print_jobs(jobs: &[JobResponse]) {
    println!(
        "{:<38} {:<16} {:<10} {:<26} Finished",
        "ID", "Type", "State", "Started"
    );
    println!("{}", "-".repeat(118));
    for job in jobs {
        println!(
            "{:<38} {:<16} {:<10} {:<26} {}",
            job.job_id,
            job.job_type,
            job.state,
            job.started_at.as_deref().unwrap_or("-"),
            job.finished_at.as_deref().unwrap_or("-"),
        );
    }
}

fn print_quota(quota: &QuotaResponse) {
    println!("Owner: {}", quota.owner_id);
    println!("  Used: {}", format_bytes(quota.storage_used_bytes));
    println!("  Limit: {}", format_bytes(quota.storage_limit_bytes));
    println!("  Remaining: {}", format_bytes(quota.remaining_bytes));
    println!("  Uploads: {}", quota.upload_count);
}

fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} bytes")
    }
}
