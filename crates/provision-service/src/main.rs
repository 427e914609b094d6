use anyhow::Context;
use clap::{Parser, ValueEnum};
use provision_adapters::HttpCrmConfig;
use provision_core::{
    EngineConfig, ErrorClassification, ProvisioningWorker, RetryPolicy, StorageConfig,
    WorkerConfig,
};
use provision_service::auth::AdminTokens;
use provision_service::{build_router, CrmBackend, ServiceConfig, ServiceState};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StorageMode {
    Auto,
    Memory,
    Postgres,
}

#[derive(Debug, Parser)]
#[command(name = "provisiond", version, about = "Checkout-driven tenant provisioning service")]
struct Cli {
    /// REST socket address to bind, e.g. 127.0.0.1:8092
    #[arg(long, default_value = "127.0.0.1:8092", env = "PROVISION_LISTEN")]
    listen: SocketAddr,
    /// JSON file holding the plan catalog and tenant registry.
    #[arg(long, default_value = "data/catalog.json", env = "PROVISION_CATALOG")]
    catalog: PathBuf,
    /// Job and audit persistence backend. `auto` picks postgres when a database url is configured.
    #[arg(long, value_enum, default_value_t = StorageMode::Auto, env = "PROVISION_STORAGE")]
    storage: StorageMode,
    /// PostgreSQL url for jobs and audit entries.
    #[arg(long, env = "PROVISION_DATABASE_URL")]
    database_url: Option<String>,
    /// Max PostgreSQL pool connections.
    #[arg(long, default_value_t = 5, env = "PROVISION_PG_MAX_CONNECTIONS")]
    pg_max_connections: u32,
    /// Shared secret for checkout webhook signatures.
    #[arg(long, env = "PROVISION_WEBHOOK_SECRET", hide_env_values = true)]
    webhook_secret: Option<String>,
    /// Admin API bearer tokens as `principal:token`, comma separated.
    #[arg(
        long = "admin-token",
        env = "PROVISION_ADMIN_TOKEN",
        hide_env_values = true,
        value_delimiter = ','
    )]
    admin_tokens: Vec<String>,
    /// Base URL for issued payment links.
    #[arg(long, default_value = "https://checkout.local/pay", env = "PROVISION_PAYMENT_LINK_BASE")]
    payment_link_base: String,
    /// CRM REST base URL. The in-process mock CRM is used when unset.
    #[arg(long, env = "PROVISION_CRM_URL")]
    crm_url: Option<String>,
    #[arg(long, env = "PROVISION_CRM_API_KEY", hide_env_values = true)]
    crm_api_key: Option<String>,
    #[arg(long, default_value_t = 30, env = "PROVISION_CRM_TIMEOUT_SECS")]
    crm_timeout_secs: u64,
    /// JSON file mapping CRM status/error codes to transient or permanent.
    #[arg(long, env = "PROVISION_CRM_ERROR_POLICY")]
    crm_error_policy: Option<PathBuf>,
    #[arg(long, default_value_t = 5, env = "PROVISION_MAX_ATTEMPTS")]
    max_attempts: u32,
    #[arg(long, default_value_t = 2_000, env = "PROVISION_RETRY_INITIAL_MS")]
    retry_initial_ms: u64,
    #[arg(long, default_value_t = 300_000, env = "PROVISION_RETRY_MAX_MS")]
    retry_max_ms: u64,
    #[arg(long, default_value_t = 120, env = "PROVISION_LEASE_TTL_SECS")]
    lease_ttl_secs: i64,
    #[arg(long, default_value_t = 1_000, env = "PROVISION_POLL_INTERVAL_MS")]
    poll_interval_ms: u64,
    #[arg(long, default_value_t = 8, env = "PROVISION_WORKER_CONCURRENCY")]
    worker_concurrency: usize,
    /// Lease owner prefix; defaults to provisiond-<pid>.
    #[arg(long, env = "PROVISION_WORKER_ID")]
    worker_id: Option<String>,
}

fn resolve_storage(cli: &Cli) -> anyhow::Result<StorageConfig> {
    let resolved_url = cli
        .database_url
        .clone()
        .or_else(|| std::env::var("DATABASE_URL").ok());

    let storage = match cli.storage {
        StorageMode::Memory => StorageConfig::Memory,
        StorageMode::Postgres => {
            let database_url = resolved_url.ok_or_else(|| {
                anyhow::anyhow!("storage=postgres requires --database-url or DATABASE_URL")
            })?;
            StorageConfig::postgres(database_url, cli.pg_max_connections)
        }
        StorageMode::Auto => match resolved_url {
            Some(database_url) => StorageConfig::postgres(database_url, cli.pg_max_connections),
            None => StorageConfig::Memory,
        },
    };

    Ok(storage)
}

fn resolve_crm(cli: &Cli) -> anyhow::Result<CrmBackend> {
    let Some(base_url) = cli.crm_url.clone() else {
        return Ok(CrmBackend::Mock);
    };
    let classification = match &cli.crm_error_policy {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading CRM error policy {}", path.display()))?;
            ErrorClassification::from_json(&raw)
                .with_context(|| format!("parsing CRM error policy {}", path.display()))?
        }
        None => ErrorClassification::default(),
    };
    Ok(CrmBackend::Http(HttpCrmConfig {
        base_url,
        api_key: cli.crm_api_key.clone(),
        timeout_secs: cli.crm_timeout_secs,
        classification,
    }))
}

/// A lease must outlive one adapter call, or a slow CRM request could overlap
/// with another executor's.
fn check_lease_ttl(cli: &Cli, crm: &CrmBackend) -> anyhow::Result<()> {
    if let CrmBackend::Http(config) = crm {
        let timeout = i64::try_from(config.timeout_secs).unwrap_or(i64::MAX);
        if cli.lease_ttl_secs <= timeout {
            anyhow::bail!(
                "lease ttl ({}s) must exceed the CRM request timeout ({}s)",
                cli.lease_ttl_secs,
                config.timeout_secs
            );
        }
    }
    Ok(())
}

fn engine_config(cli: &Cli) -> EngineConfig {
    EngineConfig {
        worker_id: cli
            .worker_id
            .clone()
            .unwrap_or_else(|| format!("provisiond-{}", std::process::id())),
        lease_ttl_secs: cli.lease_ttl_secs,
        retry: RetryPolicy {
            max_attempts: cli.max_attempts,
            initial_delay_ms: cli.retry_initial_ms,
            max_delay_ms: cli.retry_max_ms,
            ..RetryPolicy::default()
        },
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| {
            "provision_service=info,provision_core=info,info".to_string()
        }))
        .init();

    let cli = Cli::parse();
    let crm = resolve_crm(&cli)?;
    check_lease_ttl(&cli, &crm)?;
    let config = ServiceConfig {
        catalog_path: Some(cli.catalog.clone()),
        storage: resolve_storage(&cli)?,
        engine: engine_config(&cli),
        crm,
        webhook_secret: cli.webhook_secret.clone(),
        admin_tokens: AdminTokens::parse(&cli.admin_tokens).context("parsing admin tokens")?,
        payment_link_base: cli.payment_link_base.clone(),
    };
    let state = ServiceState::bootstrap(config).await?;
    let app = build_router(state.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = ProvisioningWorker::new(
        state.engine.clone(),
        WorkerConfig {
            poll_interval_ms: cli.poll_interval_ms,
            max_concurrency: cli.worker_concurrency,
            ..WorkerConfig::default()
        },
    );
    let worker_task = tokio::spawn(worker.run(shutdown_rx));

    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    info!("provision-service REST listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("provision-service draining worker");
    let _ = shutdown_tx.send(true);
    worker_task.await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for Ctrl+C");
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
                tracing::error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, initiating graceful shutdown"),
        _ = terminate => info!("Received terminate signal, initiating graceful shutdown"),
    }
}
