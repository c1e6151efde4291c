use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pasarela::audit::FileStreamEmitter;
use pasarela::auth::{LocalLockWatcher, RoleAuthorizer};
use pasarela::config::{Config, ConfigError, DatabaseConfig, LoggingConfig};
use pasarela::heartbeat::{FileAnnouncer, FileRotationGetter};
use pasarela::net::{load_certificates, TlsMaterial};
use pasarela::utils::{Clock, SystemClock};
use pasarela::{HeartbeatSettings, MonitorSettings, ServerBuilder, VERSION};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

#[derive(Parser)]
#[command(name = "pasarela")]
#[command(about = "Access-control-aware database gateway")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(author = "Pasarela Team")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the database gateway
    Run {
        /// Path to configuration file
        #[arg(short, long, default_value = "config/dev.toml")]
        config: PathBuf,
    },
    /// Generate an example configuration file
    Config {
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Validate configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => {
            run_gateway(config).await?;
        }
        Commands::Config { output } => {
            generate_config(output)?;
        }
        Commands::Validate { config } => {
            validate_config(config)?;
        }
        Commands::Version => {
            show_version();
        }
    }

    Ok(())
}

async fn run_gateway(config_path: PathBuf) -> Result<()> {
    let config = Config::load_from_file(&config_path)
        .with_context(|| format!("failed to load config from {:?}", config_path))?;

    init_logging(&config.logging)?;

    info!(version = VERSION, config = ?config_path, "Starting pasarela.");
    info!(addr = %config.server.listen_addr, cluster = %config.server.cluster_name, "Listening.");

    let data_dir = PathBuf::from(&config.server.data_dir);
    let databases = config
        .databases
        .iter()
        .map(DatabaseConfig::to_database)
        .collect::<Result<Vec<_>, _>>()?;
    let mut tls = TlsMaterial::from_files(
        &config.tls.cert_file,
        &config.tls.key_file,
        &config.tls.client_ca_file,
    )
    .context("failed to load TLS material")?;
    for cluster in &config.trusted_clusters {
        let cas = load_certificates(Path::new(&cluster.ca_file))
            .with_context(|| format!("failed to load CA of trusted cluster {}", cluster.name))?;
        tls = tls.with_trusted_cluster(cluster.name.as_str(), cas);
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let locks = Arc::new(LocalLockWatcher::new(config.locks.clone()));
    let mut authorizer = RoleAuthorizer::new(config.roles.clone(), locks.clone(), clock.clone());
    for (cluster, role_map) in config.trusted_cluster_maps() {
        authorizer = authorizer.with_trusted_cluster(cluster, role_map);
    }

    let parent = CancellationToken::new();
    let server = ServerBuilder::new()
        .data_dir(&data_dir)
        .host_id(config.server.host_id.as_str())
        .hostname(config.server.hostname.as_str())
        .cluster_name(config.server.cluster_name.as_str())
        .databases(databases)
        .tls(tls)
        .authorizer(Arc::new(authorizer))
        .announcer(Arc::new(FileAnnouncer::new(data_dir.join("heartbeats"))))
        .rotation_getter(Arc::new(FileRotationGetter::new(data_dir.join("rotation.json"))))
        .lock_watcher(locks)
        .stream_emitter(Arc::new(FileStreamEmitter::new(data_dir.join("log").join("sessions"))))
        .clock(clock)
        .heartbeat_settings(HeartbeatSettings {
            server_ttl: config.heartbeat.server_ttl(),
            keep_alive_period: config.heartbeat.keep_alive_period(),
            check_period: config.heartbeat.check_period(),
        })
        .monitor_settings(MonitorSettings {
            check_interval: config.session.monitor_interval(),
            client_idle_timeout: config.session.client_idle_timeout(),
        })
        .build(&parent)
        .await
        .context("failed to initialize database service")?;

    server.start();

    let listener = TcpListener::bind(&config.server.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.server.listen_addr))?;
    let serving = {
        let server = server.clone();
        tokio::spawn(async move { server.serve(listener).await })
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for shutdown signal")?;
            info!("Shutdown signal received.");
        }
        reason = server.wait() => {
            info!(reason = ?reason, "Service context cancelled.");
        }
    }

    let closed = server.close().await;
    match serving.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "Accept loop failed."),
        Err(e) => warn!(error = %e, "Accept loop panicked."),
    }

    info!(in_flight = server.in_flight(), "Waiting for connections to finish.");
    server.drain().await;
    closed?;

    info!("Pasarela stopped.");
    Ok(())
}

fn generate_config(output: PathBuf) -> Result<()> {
    println!("Generating configuration file: {:?}", output);

    Config::create_example_config(&output)
        .with_context(|| format!("failed to generate config {:?}", output))?;

    println!("Configuration file generated successfully!");
    println!("Edit the file to match your environment and run:");
    println!("  pasarela run --config {:?}", output);

    Ok(())
}

fn validate_config(config_path: PathBuf) -> Result<()> {
    println!("Validating configuration file: {:?}", config_path);

    match Config::load_from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration file is valid");
            println!("  Listen address: {}", config.server.listen_addr);
            println!("  Cluster: {}", config.server.cluster_name);
            println!("  Databases: {}", config.databases.len());
            for (i, db) in config.databases.iter().enumerate() {
                println!("    {}: {} ({}) at {}", i + 1, db.name, db.protocol, db.uri);
            }
            println!("  Roles: {}", config.roles.len());
            println!("  Trusted clusters: {}", config.trusted_clusters.len());
            println!("  Locks: {}", config.locks.len());
        }
        Err(e) => {
            eprintln!("✗ Configuration file validation failed:");
            match &e {
                ConfigError::IoError(msg) => eprintln!("  File error: {}", msg),
                ConfigError::ParseError(msg) => eprintln!("  Parse error: {}", msg),
                ConfigError::ValidationError(msg) => eprintln!("  Validation error: {}", msg),
                ConfigError::SerializeError(msg) => eprintln!("  Serialization error: {}", msg),
            }
            return Err(e.into());
        }
    }

    Ok(())
}

fn show_version() {
    println!("pasarela v{}", VERSION);
    println!("Access-control-aware database gateway");
    println!();
    println!(
        "Built with Rust {}",
        option_env!("CARGO_PKG_RUST_VERSION").unwrap_or("unknown")
    );
    println!("Target: {}", std::env::consts::ARCH);
    println!();
    println!("Features:");
    println!("  • Mutual TLS termination with certificate-encoded identities");
    println!("  • Role, lock and trusted cluster authorization");
    println!("  • Heartbeat announcements with dynamic labels");
    println!("  • Session audit recording and connection monitoring");
    println!("  • PostgreSQL, MySQL and MongoDB relay engines");
}

fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .with_context(|| format!("invalid log level {:?}", config.level))?;
    let json = config.format == "json";

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    if config.stdout {
        layers.push(if json {
            fmt::layer().json().boxed()
        } else {
            fmt::layer().with_target(true).boxed()
        });
    }
    if let Some(path) = &config.file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file {}", path))?;
        let writer = Mutex::new(file);
        layers.push(if json {
            fmt::layer().json().with_writer(writer).boxed()
        } else {
            fmt::layer().with_ansi(false).with_writer(writer).boxed()
        });
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .context("failed to install log subscriber")?;

    info!(level = %config.level, format = %config.format, "Logging initialized.");
    Ok(())
}
