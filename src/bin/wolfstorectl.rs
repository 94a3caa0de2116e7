//! WolfStoreCtl - Command line tool for a running WolfStore gateway
//!
//! Usage:
//!   wolfstorectl buckets list        - List buckets
//!   wolfstorectl upload KEY FILE     - Upload a file in one request
//!   wolfstorectl multipart KEY FILE  - Upload a file as a multipart upload
//!   wolfstorectl ls                  - List objects in the default bucket

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response};

use wolfstore::api::{ErrorResponse, HealthResponse};
use wolfstore::config::{default_config_path, WolfStoreConfig};
use wolfstore::storage::sigv4::uri_encode;
use wolfstore::storage::ObjectVersion;

/// WolfStore Gateway Control Tool
#[derive(Parser)]
#[command(name = "wolfstorectl")]
#[command(about = "Manage buckets and objects through a WolfStore gateway", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value_os_t = default_config_path())]
    config: PathBuf,

    /// API endpoint to connect to (overrides config)
    #[arg(short, long)]
    endpoint: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage buckets
    Buckets {
        #[command(subcommand)]
        action: BucketAction,
    },
    /// Upload a file in a single request
    Upload {
        key: String,
        file: PathBuf,
        /// Request SSE-S3 encryption
        #[arg(long)]
        encrypt: bool,
    },
    /// Upload a file as a multipart upload
    Multipart { key: String, file: PathBuf },
    /// Download an object
    Download {
        key: String,
        /// Output file (defaults to the last key segment)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// List objects in the default bucket
    Ls {
        #[arg(short, long)]
        prefix: Option<String>,
    },
    /// Delete an object
    Rm { key: String },
    /// Issue a presigned URL
    Presign {
        #[command(subcommand)]
        method: PresignAction,
    },
    /// Enable versioning on a bucket
    Versioning { bucket: String },
    /// List versions of objects under a key prefix
    Versions { key: String },
    /// Apply the configured lifecycle rule to a bucket
    Lifecycle { bucket: String },
    /// Set a tag on an object
    Tag {
        key: String,
        tag_key: String,
        tag_value: String,
    },
    /// Check gateway health
    Health,
    /// Check configuration file for errors
    CheckConfig {
        /// Path to config file to check (defaults to --config path)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum BucketAction {
    /// List all buckets
    List,
    /// Create a bucket
    Create { name: String },
    /// Delete an empty bucket
    Delete { name: String },
}

#[derive(Subcommand)]
enum PresignAction {
    /// URL for downloading an object
    Get { key: String },
    /// URL for uploading an object
    Put { key: String },
}

// ============ Main ============

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let endpoint = cli
        .endpoint
        .clone()
        .unwrap_or_else(|| endpoint_from_config(&cli.config));
    let client = Client::new();

    let result = match &cli.command {
        Commands::Buckets { action } => match action {
            BucketAction::List => list_buckets(&client, &endpoint).await,
            BucketAction::Create { name } => {
                post_message(&client, &format!("{}/api/s3/buckets/{}", endpoint, uri_encode(name, true))).await
            }
            BucketAction::Delete { name } => {
                delete_message(&client, &format!("{}/api/s3/buckets/{}", endpoint, uri_encode(name, true))).await
            }
        },
        Commands::Upload { key, file, encrypt } => {
            let route = if *encrypt { "upload-encrypted" } else { "upload" };
            upload(&client, &endpoint, route, key, file).await
        }
        Commands::Multipart { key, file } => upload(&client, &endpoint, "multipart", key, file).await,
        Commands::Download { key, output } => download(&client, &endpoint, key, output.as_deref()).await,
        Commands::Ls { prefix } => list_objects(&client, &endpoint, prefix.as_deref()).await,
        Commands::Rm { key } => {
            delete_message(&client, &format!("{}/api/s3/objects/{}", endpoint, uri_encode(key, false))).await
        }
        Commands::Presign { method } => {
            let (route, key) = match method {
                PresignAction::Get { key } => ("presigned-download", key),
                PresignAction::Put { key } => ("presigned-upload", key),
            };
            get_message(&client, &format!("{}/api/s3/{}/{}", endpoint, route, uri_encode(key, false))).await
        }
        Commands::Versioning { bucket } => {
            post_message(&client, &format!("{}/api/s3/versioning/{}", endpoint, uri_encode(bucket, true))).await
        }
        Commands::Versions { key } => list_versions(&client, &endpoint, key).await,
        Commands::Lifecycle { bucket } => {
            post_message(&client, &format!("{}/api/s3/lifecycle/{}", endpoint, uri_encode(bucket, true))).await
        }
        Commands::Tag {
            key,
            tag_key,
            tag_value,
        } => tag(&client, &endpoint, key, tag_key, tag_value).await,
        Commands::Health => health(&client, &endpoint).await,
        Commands::CheckConfig { file } => {
            let config_path = file.clone().unwrap_or_else(|| cli.config.clone());
            check_config(&config_path)
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

/// API endpoint derived from the gateway config, with 0.0.0.0 mapped to localhost
fn endpoint_from_config(path: &Path) -> String {
    let fallback = "http://127.0.0.1:8080".to_string();
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(_) => return fallback,
    };
    match toml::from_str::<WolfStoreConfig>(&content) {
        Ok(config) => {
            let addr = config.api.bind_address;
            if addr.starts_with("0.0.0.0") {
                format!("http://127.0.0.1:{}", addr.split(':').nth(1).unwrap_or("8080"))
            } else {
                format!("http://{}", addr)
            }
        }
        Err(_) => fallback,
    }
}

/// Turn an error response into an error carrying the gateway's message
async fn check(response: Response) -> Result<Response> {
    if response.status().is_success() {
        return Ok(response);
    }

    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorResponse>(&body) {
        Ok(err) => {
            let mut message = format!("{} ({}, HTTP {})", err.error, err.code, status.as_u16());
            if let Some(upload_id) = err.upload_id {
                message.push_str(&format!("\n  upload id: {}", upload_id));
            }
            if let Some(cleanup) = err.cleanup {
                message.push_str(&format!("\n  cleanup:   {}", cleanup));
            }
            if let Some(cleanup_error) = err.cleanup_error {
                message.push_str(&format!("\n  cleanup error: {}", cleanup_error));
            }
            bail!(message)
        }
        Err(_) => bail!("API error: {} {}", status, body),
    }
}

async fn print_text(response: Response) -> Result<()> {
    println!("{}", response.text().await?);
    Ok(())
}

async fn get_message(client: &Client, url: &str) -> Result<()> {
    print_text(check(client.get(url).send().await?).await?).await
}

async fn post_message(client: &Client, url: &str) -> Result<()> {
    print_text(check(client.post(url).send().await?).await?).await
}

async fn delete_message(client: &Client, url: &str) -> Result<()> {
    print_text(check(client.delete(url).send().await?).await?).await
}

// ============ Commands ============

async fn list_buckets(client: &Client, endpoint: &str) -> Result<()> {
    let response = check(client.get(format!("{}/api/s3/buckets", endpoint)).send().await?).await?;
    let buckets: Vec<String> = response.json().await?;

    println!();
    println!("Buckets ({})", buckets.len());
    println!("{}", "-".repeat(40));
    for bucket in &buckets {
        println!("{}", bucket);
    }
    println!();
    Ok(())
}

async fn upload(client: &Client, endpoint: &str, route: &str, key: &str, file: &Path) -> Result<()> {
    let data = tokio::fs::read(file)
        .await
        .with_context(|| format!("failed to read {}", file.display()))?;
    let size = data.len();
    let file_name = file
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "upload.bin".to_string());

    let form = Form::new()
        .text("key", key.to_string())
        .part("file", Part::bytes(data).file_name(file_name));

    let started = std::time::Instant::now();
    let response = client
        .post(format!("{}/api/s3/{}", endpoint, route))
        .multipart(form)
        .send()
        .await?;
    let response = check(response).await?;

    println!("{}", response.text().await?);
    println!(
        "  {} bytes in {}",
        size,
        format_duration(started.elapsed())
    );
    Ok(())
}

async fn download(client: &Client, endpoint: &str, key: &str, output: Option<&Path>) -> Result<()> {
    let url = format!("{}/api/s3/download/{}", endpoint, uri_encode(key, false));
    let response = check(client.get(&url).send().await?).await?;
    let data = response.bytes().await?;

    let output = match output {
        Some(path) => path.to_path_buf(),
        None => PathBuf::from(key.rsplit('/').next().unwrap_or(key)),
    };
    tokio::fs::write(&output, &data)
        .await
        .with_context(|| format!("failed to write {}", output.display()))?;
    println!("Downloaded {} ({} bytes) to {}", key, data.len(), output.display());
    Ok(())
}

async fn list_objects(client: &Client, endpoint: &str, prefix: Option<&str>) -> Result<()> {
    let mut request = client.get(format!("{}/api/s3/objects", endpoint));
    if let Some(prefix) = prefix {
        request = request.query(&[("prefix", prefix)]);
    }
    let keys: Vec<String> = check(request.send().await?).await?.json().await?;

    for key in &keys {
        println!("{}", key);
    }
    eprintln!("{} object(s)", keys.len());
    Ok(())
}

async fn list_versions(client: &Client, endpoint: &str, key: &str) -> Result<()> {
    let url = format!("{}/api/s3/versions/{}", endpoint, uri_encode(key, false));
    let versions: Vec<ObjectVersion> = check(client.get(&url).send().await?).await?.json().await?;

    println!();
    println!(
        "{:<30} {:<38} {:<8} {:<10} {}",
        "KEY", "VERSION ID", "LATEST", "SIZE", "LAST MODIFIED"
    );
    println!("{}", "-".repeat(110));
    for v in &versions {
        let size = if v.is_delete_marker {
            "(deleted)".to_string()
        } else {
            v.size.to_string()
        };
        println!(
            "{:<30} {:<38} {:<8} {:<10} {}",
            v.key,
            v.version_id,
            if v.is_latest { "yes" } else { "" },
            size,
            v.last_modified.as_deref().unwrap_or("-")
        );
    }
    println!();
    Ok(())
}

async fn tag(client: &Client, endpoint: &str, key: &str, tag_key: &str, tag_value: &str) -> Result<()> {
    let response = client
        .post(format!("{}/api/s3/tag", endpoint))
        .query(&[("key", key), ("tagKey", tag_key), ("tagValue", tag_value)])
        .send()
        .await?;
    print_text(check(response).await?).await
}

async fn health(client: &Client, endpoint: &str) -> Result<()> {
    let response = client
        .get(format!("{}/health", endpoint))
        .send()
        .await
        .with_context(|| format!("gateway at {} is unreachable", endpoint))?;
    let health: HealthResponse = check(response).await?.json().await?;

    println!();
    println!("WolfStore Gateway (wolfstorectl v{})", env!("CARGO_PKG_VERSION"));
    println!("========================================");
    println!();
    println!(
        "Status:   {}",
        if health.healthy {
            "\x1b[32mhealthy\x1b[0m"
        } else {
            "\x1b[31munhealthy\x1b[0m"
        }
    );
    println!("Version:  {}", health.version);
    println!("Bucket:   {}", health.bucket);
    println!("Uptime:   {}", format_duration(std::time::Duration::from_secs(health.uptime_seconds)));
    println!();
    Ok(())
}

fn check_config(path: &Path) -> Result<()> {
    println!();
    println!("WolfStore Configuration Check");
    println!("=============================");
    println!();

    if !path.exists() {
        bail!("config file not found: {}", path.display());
    }
    println!("\x1b[1;32m✓\x1b[0m Config file: {}", path.display());

    let config = WolfStoreConfig::from_file(path).context("configuration is invalid")?;
    println!("\x1b[1;32m✓\x1b[0m Configuration is valid");

    let mut warnings = Vec::new();
    if config.storage.access_key.is_none() {
        warnings.push("no storage credentials; requests are unsigned and presigning is unavailable".to_string());
    }
    if config.storage.endpoint.starts_with("http://") && !config.storage.endpoint.contains("localhost") {
        warnings.push(format!("endpoint {} is not using TLS", config.storage.endpoint));
    }
    if config.upload.upload_timeout_secs == 0 {
        warnings.push("upload.upload_timeout_secs is 0; uploads are bounded only per call".to_string());
    }
    if !config.api.enabled {
        warnings.push("api.enabled is false; the gateway will not serve requests".to_string());
    }

    println!();
    if warnings.is_empty() {
        println!("\x1b[1;32mNo warnings\x1b[0m");
    } else {
        for warning in &warnings {
            println!("\x1b[1;33m⚠ WARNING:\x1b[0m {}", warning);
        }
    }
    println!();
    Ok(())
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs >= 3600 {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    } else if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{:.2}s", d.as_secs_f64())
    }
}
