use clap::Parser;
use indexguard::{config::Config, server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env first so clap's env fallbacks see variables
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Attempt to load config before initializing logs to pick up log_level from file
    let cfg_file_res = Config::load_from_file(cli.config.as_deref());
    let cfg_file = match &cfg_file_res {
        Ok(c) => c.clone(),
        Err(_) => Config::default(),
    };

    // Log filter precedence: CLI (--log-level / INDEXGUARD_LOG_LEVEL)
    // > RUST_LOG (env) > config.toml log_level > default("info")
    let filter_spec = if let Some(ref lvl) = cli.log_level {
        lvl.clone()
    } else if let Ok(env_spec) = std::env::var("RUST_LOG") {
        env_spec
    } else if let Some(ref lvl) = cfg_file.log_level {
        lvl.clone()
    } else {
        "info".to_string()
    };

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter_spec))
        .compact()
        .init();

    if let Err(e) = cfg_file_res.as_ref() {
        tracing::warn!(error = %format!("{e:?}"), "invalid config; using defaults");
    }

    // Load from config file (if present), then override with CLI/env.
    let cfg = cfg_file.with_overrides(
        cli.listen_addr.clone(),
        cli.upstream_addrs.clone(),
        cli.log_level.clone(),
        cli.message_timeout_secs,
        cli.client_idle_timeout_secs,
        cli.catalog_username.clone(),
        cli.catalog_password.clone(),
        cli.catalog_auth_db.clone(),
    );
    cfg.validate().map_err(|e| anyhow::anyhow!("{e}"))?;
    tracing::info!(
        listen_addr = %cfg.listen_addr,
        upstreams = ?cfg.upstream_addrs,
        "starting indexguard"
    );

    // Bind or initial catalog dial failures exit non-zero
    server::run(cfg).await?;
    Ok(())
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "indexguard",
    version,
    about = "Mongo wire relay that rejects unindexed queries"
)]
struct Cli {
    /// Path to config TOML file
    #[arg(short = 'c', long = "config", env = "INDEXGUARD_CONFIG")]
    config: Option<String>,

    /// Listen address for client connections (e.g., 127.0.0.1:6000)
    #[arg(long = "listen-addr", env = "INDEXGUARD_LISTEN_ADDR")]
    listen_addr: Option<String>,

    /// Comma-separated list of upstream mongo addresses
    #[arg(long = "upstream-addrs", env = "INDEXGUARD_UPSTREAM_ADDRS")]
    upstream_addrs: Option<String>,

    /// Timeout for one message to be proxied, in seconds
    #[arg(long = "message-timeout-secs", env = "INDEXGUARD_MESSAGE_TIMEOUT_SECS")]
    message_timeout_secs: Option<u64>,

    /// Idle timeout for client connections, in seconds
    #[arg(
        long = "client-idle-timeout-secs",
        env = "INDEXGUARD_CLIENT_IDLE_TIMEOUT_SECS"
    )]
    client_idle_timeout_secs: Option<u64>,

    /// Log level or filter spec (e.g., info or info,indexguard=debug)
    #[arg(long = "log-level", env = "INDEXGUARD_LOG_LEVEL")]
    log_level: Option<String>,

    /// Username for the catalog backchannel
    #[arg(long = "catalog-username", env = "INDEXGUARD_CATALOG_USERNAME")]
    catalog_username: Option<String>,

    /// Password for the catalog backchannel
    #[arg(long = "catalog-password", env = "INDEXGUARD_CATALOG_PASSWORD")]
    catalog_password: Option<String>,

    /// Auth database for the catalog backchannel
    #[arg(long = "catalog-auth-db", env = "INDEXGUARD_CATALOG_AUTH_DB")]
    catalog_auth_db: Option<String>,
}
