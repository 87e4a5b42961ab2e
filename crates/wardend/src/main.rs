//! wardend - The warden daemon
//!
//! One binary, two roles:
//! - `broker` serves leases over HTTP from a policy directory and a lease store
//! - `enforce` keeps this host's programs within the leases the broker grants

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use warden_client::{Client, SrvResolver};
use warden_config::{
    BrokerConfig, CachedPolicies, DaemonConfig, DirectoryPolicies, EnforcerConfig, PolicyCache,
    PolicySource, StoreKind, load_daemon_config,
};
use warden_core::Broker;
use warden_enforcer::{
    DEFAULT_ENFORCE_INTERVAL, DEFAULT_POLICY_INTERVAL, Enforcer, InvocationContext, Orchestrator,
    PolicyManager,
};
use warden_host_api::ProcessHost;
use warden_host_linux::LinuxHost;
use warden_http::ServerOptions;
use warden_store::{LeaseStore, MemoryStore, SqliteStore, TxLogStore, parse_schedule};
use warden_util::{DEFAULT_PORT, default_database_path, default_policy_cache_path, parse_duration};

/// wardend - Cooperative lease broker and enforcement service
#[derive(Parser, Debug)]
#[command(name = "wardend", version)]
#[command(about = "Cooperative lease broker and enforcement service", long_about = None)]
struct Args {
    /// Daemon configuration file (TOML); flags take precedence over it
    #[arg(short, long, global = true, env = "WARDEN_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (RUST_LOG overrides)
    #[arg(short, long, global = true, default_value = "info")]
    log_level: String,

    /// Write logs as JSON
    #[arg(long, global = true, env = "WARDEN_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the lease broker
    Broker(BrokerArgs),
    /// Enforce lease policies on this host
    Enforce(EnforceArgs),
}

#[derive(clap::Args, Debug, Default)]
struct BrokerArgs {
    /// Directory of *.pol policy files (default: working directory)
    #[arg(long, env = "WARDEN_POLICIES")]
    policies: Option<PathBuf>,

    /// Lease store: memory or sqlite
    #[arg(long, env = "WARDEN_STORE")]
    store: Option<StoreKind>,

    /// SQLite lease database path
    #[arg(long, env = "WARDEN_DB")]
    db: Option<PathBuf>,

    /// Log lease transactions
    #[arg(long)]
    txlog: bool,

    /// Transaction log checkpoint schedule, e.g. "100ops"
    #[arg(long)]
    checkpoint: Option<String>,

    /// Listen address
    #[arg(long, env = "WARDEN_LISTEN")]
    listen: Option<String>,

    /// Interval between lease purges; 0 disables
    #[arg(long, value_parser = duration_arg)]
    purge_interval: Option<Duration>,

    /// Time allowed for open requests at shutdown
    #[arg(long, value_parser = duration_arg)]
    shutdown_timeout: Option<Duration>,
}

#[derive(clap::Args, Debug, Default)]
struct EnforceArgs {
    /// Broker address; may be repeated
    #[arg(long = "server", env = "WARDEN_SERVERS", value_delimiter = ',')]
    servers: Vec<String>,

    /// Find the broker through this domain when no server is given
    #[arg(long, env = "WARDEN_DOMAIN")]
    domain: Option<String>,

    /// Manage processes that cannot be terminated
    #[arg(long)]
    passive: bool,

    /// Host name reported to the broker
    #[arg(long, env = "WARDEN_HOSTNAME")]
    hostname: Option<String>,

    /// Interval between policy retrievals
    #[arg(long, value_parser = duration_arg)]
    policy_interval: Option<Duration>,

    /// Interval between enforcement passes
    #[arg(long, value_parser = duration_arg)]
    enforce_interval: Option<Duration>,

    /// Policy cache file
    #[arg(long, env = "WARDEN_POLICY_CACHE")]
    cache: Option<PathBuf>,
}

fn duration_arg(s: &str) -> Result<Duration, String> {
    parse_duration(s).map_err(|e| e.to_string())
}

/// Broker settings after merging flags over the configuration file
#[derive(Debug, PartialEq)]
struct BrokerSettings {
    listen: String,
    policy_dir: Option<PathBuf>,
    store: StoreKind,
    database: PathBuf,
    txlog: bool,
    checkpoint: Option<String>,
    options: ServerOptions,
}

impl BrokerSettings {
    fn merge(args: BrokerArgs, config: BrokerConfig) -> Self {
        let defaults = ServerOptions::default();
        Self {
            listen: args
                .listen
                .or(config.listen)
                .unwrap_or_else(|| format!("0.0.0.0:{}", DEFAULT_PORT)),
            policy_dir: args.policies.or(config.policy_dir),
            store: args.store.or(config.store).unwrap_or_default(),
            database: args.db.or(config.database).unwrap_or_else(default_database_path),
            txlog: args.txlog || config.txlog.unwrap_or(false),
            checkpoint: args.checkpoint.or(config.checkpoint),
            options: ServerOptions {
                purge_interval: args
                    .purge_interval
                    .or(config.purge_interval)
                    .unwrap_or(defaults.purge_interval),
                shutdown_timeout: args
                    .shutdown_timeout
                    .or(config.shutdown_timeout)
                    .unwrap_or(defaults.shutdown_timeout),
            },
        }
    }
}

/// Enforcer settings after merging flags over the configuration file
#[derive(Debug, PartialEq)]
struct EnforceSettings {
    servers: Vec<String>,
    domain: Option<String>,
    passive: bool,
    hostname: Option<String>,
    policy_interval: Duration,
    enforce_interval: Duration,
    cache: PathBuf,
}

impl EnforceSettings {
    fn merge(args: EnforceArgs, config: EnforcerConfig) -> Self {
        Self {
            servers: if args.servers.is_empty() {
                config.servers
            } else {
                args.servers
            },
            domain: args.domain,
            passive: args.passive || config.passive.unwrap_or(false),
            hostname: args.hostname.or(config.hostname),
            policy_interval: args
                .policy_interval
                .or(config.policy_interval)
                .unwrap_or(DEFAULT_POLICY_INTERVAL),
            enforce_interval: args
                .enforce_interval
                .or(config.enforce_interval)
                .unwrap_or(DEFAULT_ENFORCE_INTERVAL),
            cache: args
                .cache
                .or(config.policy_cache)
                .unwrap_or_else(default_policy_cache_path),
        }
    }
}

/// Resolves on SIGTERM, SIGINT or SIGHUP
fn shutdown_signal() -> Result<impl Future<Output = ()> + Send + 'static> {
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to create SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to create SIGINT handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("Failed to create SIGHUP handler")?;

    Ok(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully"),
            _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully"),
            _ = sighup.recv() => info!("Received SIGHUP, shutting down gracefully"),
        }
    })
}

fn open_store(settings: &BrokerSettings) -> Result<Arc<dyn LeaseStore>> {
    let store: Arc<dyn LeaseStore> = match settings.store {
        StoreKind::Memory => Arc::new(MemoryStore::new()),
        StoreKind::Sqlite => {
            if let Some(parent) = settings.database.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create data directory {:?}", parent))?;
            }
            Arc::new(
                SqliteStore::open(&settings.database)
                    .with_context(|| format!("Failed to open database {:?}", settings.database))?,
            )
        }
    };

    if !settings.txlog {
        return Ok(store);
    }

    let schedule = match &settings.checkpoint {
        Some(spec) => parse_schedule(spec).context("Unable to parse transaction checkpoint schedule")?,
        None => Vec::new(),
    };
    Ok(Arc::new(TxLogStore::new(store, schedule)))
}

async fn run_broker(settings: BrokerSettings) -> Result<()> {
    let policy_dir = match &settings.policy_dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("Unable to detect working directory")?,
    };
    let policies: Arc<dyn PolicySource> = Arc::new(CachedPolicies::new(DirectoryPolicies::new(&policy_dir)));
    let store = open_store(&settings)?;

    info!(policy = %policies.name(), lease = %store.name(), "Created providers");
    info!(path = %policy_dir.display(), "Policy source directory");

    // Refuse to start with a broken policy set
    let initial = policies.policies().context("Failed to load policy set")?;
    info!(count = initial.len(), "Policies loaded");

    let listener = TcpListener::bind(&settings.listen)
        .await
        .with_context(|| format!("Failed to listen on {}", settings.listen))?;

    let broker = Arc::new(Broker::new(policies, store.clone()));
    warden_http::serve(listener, broker, settings.options, shutdown_signal()?)
        .await
        .context("Broker failed")?;

    if let Err(e) = store.close() {
        warn!(error = %e, "Failed to close lease store");
    }
    info!("Stopped warden broker");
    Ok(())
}

async fn run_enforcer(settings: EnforceSettings) -> Result<()> {
    let client = match (&settings.servers[..], &settings.domain) {
        ([], Some(domain)) => Client::new(Arc::new(SrvResolver::for_domain(domain))),
        ([], None) => bail!("No broker configured; use --server, --domain or [enforcer] servers"),
        (servers, _) => Client::with_servers(servers.iter().cloned()),
    };
    let client = Arc::new(client);

    let host = match &settings.hostname {
        Some(name) => LinuxHost::new().with_hostname(name),
        None => LinuxHost::new(),
    };
    let host = Arc::new(host);
    let hostname = host.hostname();

    info!(
        host = %hostname,
        servers = %settings.servers.join(", "),
        passive = settings.passive,
        cache = %settings.cache.display(),
        "Starting enforcement"
    );

    let manager = Arc::new(PolicyManager::new(
        client.clone(),
        Some(PolicyCache::new(&settings.cache)),
    ));
    let orchestrator = Arc::new(Orchestrator::new(
        InvocationContext::new(client, host),
        hostname,
        settings.passive,
    ));

    Enforcer::new(manager, orchestrator)
        .with_policy_interval(settings.policy_interval)
        .with_enforce_interval(settings.enforce_interval)
        .run(shutdown_signal()?)
        .await;

    info!("Stopped warden enforcement");
    Ok(())
}

fn init_logging(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level, args.log_json);

    info!(version = env!("CARGO_PKG_VERSION"), "wardend starting");

    let config = match &args.config {
        Some(path) => load_daemon_config(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => DaemonConfig::default(),
    };

    match args.command {
        Command::Broker(broker) => run_broker(BrokerSettings::merge(broker, config.broker)).await,
        Command::Enforce(enforce) => run_enforcer(EnforceSettings::merge(enforce, config.enforcer)).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_config::parse_daemon_config;

    #[test]
    fn broker_flags_override_config() {
        let args = Args::try_parse_from([
            "wardend",
            "broker",
            "--listen",
            "127.0.0.1:9000",
            "--store",
            "sqlite",
            "--purge-interval",
            "30s",
        ])
        .unwrap();
        let Command::Broker(broker) = args.command else {
            panic!("expected broker command");
        };

        let config = parse_daemon_config(
            r#"
            [broker]
            listen = "0.0.0.0:1"
            database = "/var/lib/warden/leases.db"
            txlog = true
            checkpoint = "100ops"
            "#,
        )
        .unwrap();

        let settings = BrokerSettings::merge(broker, config.broker);
        assert_eq!(settings.listen, "127.0.0.1:9000");
        assert_eq!(settings.store, StoreKind::Sqlite);
        assert_eq!(settings.database, PathBuf::from("/var/lib/warden/leases.db"));
        assert!(settings.txlog);
        assert_eq!(settings.checkpoint.as_deref(), Some("100ops"));
        assert_eq!(settings.options.purge_interval, Duration::from_secs(30));
        assert_eq!(settings.options.shutdown_timeout, ServerOptions::default().shutdown_timeout);
    }

    #[test]
    fn broker_defaults() {
        let settings = BrokerSettings::merge(BrokerArgs::default(), BrokerConfig::default());
        assert_eq!(settings.listen, "0.0.0.0:5877");
        assert_eq!(settings.store, StoreKind::Memory);
        assert!(!settings.txlog);
        assert!(settings.policy_dir.is_none());
    }

    #[test]
    fn enforce_servers_from_flags_or_config() {
        let args = Args::try_parse_from([
            "wardend",
            "enforce",
            "--server",
            "broker-a",
            "--server",
            "broker-b:8080",
            "--enforce-interval",
            "2s",
        ])
        .unwrap();
        let Command::Enforce(enforce) = args.command else {
            panic!("expected enforce command");
        };

        let config = EnforcerConfig {
            servers: vec!["ignored".into()],
            passive: Some(true),
            ..Default::default()
        };
        let settings = EnforceSettings::merge(enforce, config);
        assert_eq!(settings.servers, ["broker-a", "broker-b:8080"]);
        assert!(settings.passive);
        assert_eq!(settings.enforce_interval, Duration::from_secs(2));
        assert_eq!(settings.policy_interval, DEFAULT_POLICY_INTERVAL);

        let settings = EnforceSettings::merge(
            EnforceArgs::default(),
            EnforcerConfig {
                servers: vec!["broker-c".into()],
                ..Default::default()
            },
        );
        assert_eq!(settings.servers, ["broker-c"]);
        assert!(!settings.passive);
    }

    #[test]
    fn invalid_durations_are_rejected() {
        assert!(Args::try_parse_from(["wardend", "enforce", "--policy-interval", "soon"]).is_err());
    }
}
