//! WolfStore - Object Storage Gateway
//!
//! Serves bucket and object operations over HTTP and forwards them to an
//! S3-compatible object storage service.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfstore::api::HttpServer;
use wolfstore::config::{default_config_path, BackendKind, WolfStoreConfig};
use wolfstore::error::Result;
use wolfstore::gateway::ObjectGateway;

/// WolfStore - Object Storage Gateway
#[derive(Parser)]
#[command(name = "wolfstore")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value_os_t = default_config_path())]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway
    Start {
        /// Override the API bind address
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value_os_t = default_config_path())]
        output: PathBuf,

        /// Default bucket
        #[arg(long, default_value = "wolfstore")]
        bucket: String,

        /// S3-compatible endpoint (empty for AWS)
        #[arg(long, default_value = "http://localhost:9000")]
        endpoint: String,
    },

    /// Validate configuration file
    Validate,

    /// Show gateway information
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start { bind } => run_start(cli.config, cli.log_level, bind).await,
        Commands::Init {
            output,
            bucket,
            endpoint,
        } => {
            init_logging(cli.log_level.as_deref().unwrap_or("info"), "pretty");
            run_init(output, bucket, endpoint)
        }
        Commands::Validate => {
            init_logging(cli.log_level.as_deref().unwrap_or("info"), "pretty");
            run_validate(cli.config)
        }
        Commands::Info => {
            init_logging(cli.log_level.as_deref().unwrap_or("info"), "pretty");
            run_info(cli.config)
        }
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "compact" {
        registry.with(tracing_subscriber::fmt::layer().compact()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Start the gateway
async fn run_start(config_path: PathBuf, log_level: Option<String>, bind: Option<String>) -> Result<()> {
    let mut config = match WolfStoreConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            init_logging(log_level.as_deref().unwrap_or("info"), "pretty");
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            tracing::error!("Please check that the config file exists and is valid TOML");
            return Err(e);
        }
    };

    let level = log_level.unwrap_or_else(|| config.logging.level.clone());
    init_logging(&level, &config.logging.format);
    tracing::info!("Starting WolfStore gateway...");

    if let Some(bind) = bind {
        config.api.bind_address = bind;
    }

    let gateway = match ObjectGateway::from_config(&config).await {
        Ok(g) => g,
        Err(e) => {
            tracing::error!("Failed to initialize storage backend: {}", e);
            return Err(e);
        }
    };
    tracing::info!(
        "Default bucket: {} (part size {} bytes, concurrency {})",
        config.storage.bucket,
        config.upload.part_size_bytes,
        config.upload.concurrency
    );

    let server = HttpServer::new(config.api.clone(), gateway);
    server
        .start_with_shutdown(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received shutdown signal");
            }
        })
        .await?;

    tracing::info!("WolfStore stopped");
    Ok(())
}

/// Write a starter configuration file
fn run_init(output: PathBuf, bucket: String, endpoint: String) -> Result<()> {
    let config_content = format!(
        r#"# WolfStore Configuration
# Generated configuration file

[storage]
# "s3" for an S3-compatible service, "memory" for local development
backend = "s3"
endpoint = "{endpoint}"
region = "us-east-1"
bucket = "{bucket}"
path_style = true
# Credentials may also come from AWS_ACCESS_KEY_ID / AWS_SECRET_ACCESS_KEY
# access_key = "minioadmin"
# secret_key = "minioadmin"
connect_timeout_secs = 10
request_timeout_secs = 300

[upload]
part_size_bytes = 5242880
concurrency = 4
max_retries = 2
retry_backoff_ms = 100
call_timeout_secs = 120
upload_timeout_secs = 0

[presign]
expiry_secs = 600

[lifecycle]
rule_id = "MoveToGlacierAfter30Days"
prefix = "temp/"
transition_days = 30
storage_class = "GLACIER"

[api]
enabled = true
bind_address = "0.0.0.0:8080"
cors_enabled = false
max_body_bytes = 536870912

[logging]
level = "info"
format = "pretty"
"#
    );

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to configure your storage endpoint and credentials.");
    println!("Then start with: wolfstore --config {} start", output.display());

    Ok(())
}

fn run_validate(config_path: PathBuf) -> Result<()> {
    match WolfStoreConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Backend: {:?}", config.storage.backend);
            println!("  Endpoint: {}", config.endpoint());
            println!("  Bucket: {}", config.storage.bucket);
            println!("  Credentials: {}", if config.storage.access_key.is_some() { "set" } else { "none" });
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

fn run_info(config_path: PathBuf) -> Result<()> {
    let config = WolfStoreConfig::from_file(&config_path)?;

    println!("WolfStore Gateway Information");
    println!("=============================");
    println!();
    println!("Storage Configuration:");
    match config.storage.backend {
        BackendKind::S3 => {
            println!("  Backend:        S3-compatible");
            println!("  Endpoint:       {}", config.endpoint());
            println!("  Region:         {}", config.storage.region);
            println!("  Path Style:     {}", config.storage.path_style);
        }
        BackendKind::Memory => println!("  Backend:        in-memory"),
    }
    println!("  Bucket:         {}", config.storage.bucket);
    println!();
    println!("Upload Configuration:");
    println!("  Part Size:      {} bytes", config.upload.part_size_bytes);
    println!("  Concurrency:    {}", config.upload.concurrency);
    println!("  Max Retries:    {}", config.upload.max_retries);
    println!("  Call Timeout:   {:?}", config.upload.call_timeout());
    println!("  Upload Timeout: {:?}", config.upload.upload_timeout());
    println!();
    println!("Presigned URLs:   valid for {} s", config.presign.expiry_secs);
    println!(
        "Lifecycle Rule:   {} ({}* -> {} after {} days)",
        config.lifecycle.rule_id,
        config.lifecycle.prefix,
        config.lifecycle.storage_class,
        config.lifecycle.transition_days
    );
    println!();
    println!("API:              {} (enabled: {})", config.api.bind_address, config.api.enabled);

    Ok(())
}
