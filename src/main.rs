use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tollbooth::admin::{AdminServer, AdminService};
use tollbooth::config::TollboothConfig;
use tollbooth::ratelimit::{Identity, Role};

/// Distributed API rate limiting.
#[derive(Debug, Parser)]
#[command(name = "tollbooth", version, about)]
struct Cli {
    /// Service configuration file (YAML or TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the admin API until interrupted
    Serve,
    /// Run one rate limit check against the configured store
    Check {
        /// Authenticated user id
        #[arg(long)]
        user: Option<String>,
        /// Caller role
        #[arg(long)]
        role: Option<String>,
        /// Client address, used when no user id is given
        #[arg(long)]
        ip: Option<IpAddr>,
        #[arg(long, default_value = "/")]
        endpoint: String,
        #[arg(long, default_value_t = 1)]
        cost: u32,
    },
    /// Print global or per-identity status
    Status {
        /// Identity to inspect (user id or `ip:<addr>`)
        #[arg(long)]
        identity: Option<String>,
        #[arg(long)]
        role: Option<String>,
        /// Number of top consumers in the global view
        #[arg(long, default_value_t = 10)]
        top: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = TollboothConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Serve => serve(config).await,
        Command::Check {
            user,
            role,
            ip,
            endpoint,
            cost,
        } => {
            let limiter = config.build_limiter().await?;
            let result = limiter
                .check_unresolved(user.as_deref(), role.as_deref(), ip, &endpoint, cost)
                .await;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Command::Status {
            identity,
            role,
            top,
        } => {
            let admin = AdminService::new(config.build_limiter().await?);
            let output = match identity {
                Some(raw) => {
                    let identity = Identity::parse(&raw)
                        .ok_or_else(|| anyhow::anyhow!("invalid identity '{}'", raw))?;
                    let role = Role::resolve(role.as_deref());
                    serde_json::to_string_pretty(&admin.identity_status(&identity, &role).await?)?
                }
                None => serde_json::to_string_pretty(&admin.global_status(top).await?)?,
            };
            println!("{}", output);
            Ok(())
        }
    }
}

async fn serve(config: TollboothConfig) -> anyhow::Result<()> {
    info!("Starting Tollbooth Rate Limiting Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        admin_addr = %config.server.admin_addr,
        backend = ?config.store.backend,
        policy = %config.failure_policy,
        "Configuration loaded"
    );

    let limiter = config.build_limiter().await?;
    let mut admin = AdminService::new(limiter);
    if let Some(path) = &config.limits_path {
        admin = admin.with_limits_path(path);
    }

    let server = AdminServer::new(
        config.server.admin_addr,
        Arc::new(admin),
        config.server.admin_token.clone(),
    );
    server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Tollbooth Rate Limiting Service stopped");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
