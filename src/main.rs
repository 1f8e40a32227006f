use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use etcd_archiver::backup::remove_artifact;
use etcd_archiver::config::{generate_example_config, DEFAULT_CONFIG_PATH};
use etcd_archiver::logging::{init_console_logging, init_logging};
use etcd_archiver::{AppConfig, Archiver, BackupJob, Endpoint, LarkClient, Notifier, S3Store};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "etcd-archiver")]
#[command(about = "Snapshot etcd endpoints, archive them to cold storage and report to Lark")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Defaults to `run`
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Snapshot every endpoint, archive the snapshots and post the report
    Run,
    /// Archive a snapshot file left behind by an earlier run
    Upload {
        /// Snapshot file to upload; removed after a successful upload
        #[arg(short, long)]
        file: String,
    },
    /// Show which chats would receive the report
    Destinations,
    /// Run a backup pass now and then every N hours
    Daemon {
        /// Interval between backup passes in hours
        #[arg(short, long, default_value = "24", value_parser = clap::value_parser!(u64).range(1..))]
        interval_hours: u64,
    },
    /// Generate an example configuration file
    GenerateConfig {
        /// Output path for the config file
        #[arg(short, long, default_value = "config.toml.example")]
        output: String,
    },
    /// Show recent logs
    Logs {
        /// Number of log lines to show
        #[arg(short, long, default_value = "50")]
        lines: usize,
    },
}

async fn connect_lark(config: &AppConfig) -> Result<Arc<LarkClient>> {
    let client = LarkClient::connect(
        config.lark.api_base(),
        &config.lark.app_id,
        &config.lark.app_secret()?,
        config.lark.timeout(),
    )
    .await
    .context("Failed to authenticate with Lark")?;
    Ok(Arc::new(client))
}

fn notifier(config: &AppConfig, chat: Arc<LarkClient>) -> Notifier {
    Notifier::new(
        chat,
        config.lark.allow_list(),
        config.lark.console_url(&config.storage.bucket),
    )
}

async fn archiver(config: &AppConfig) -> Result<Archiver> {
    let store = S3Store::from_config(&config.storage)
        .await
        .context("Failed to set up object storage client")?;
    Ok(Archiver::new(&config.cluster.name, Arc::new(store)))
}

async fn build_job(config: &AppConfig) -> Result<BackupJob> {
    let chat = connect_lark(config).await?;
    let archiver = archiver(config).await?;
    Ok(BackupJob::new(
        &config.cluster.name,
        config.snapshot.clone(),
        archiver,
        notifier(config, chat),
    ))
}

fn endpoints(config: &AppConfig) -> Vec<Endpoint> {
    config.endpoints.iter().map(Endpoint::from).collect()
}

async fn run_once(config: &AppConfig) -> Result<()> {
    let job = build_job(config).await?;
    let (result, report) = job
        .run(&endpoints(config))
        .await
        .context("Failed to resolve chat destinations")?;
    info!(
        "Run complete: {} succeeded, {} failed, report delivered to {:?}",
        result.successes.len(),
        result.failures.len(),
        report.delivered
    );
    Ok(())
}

async fn upload_file(config: &AppConfig, file: &str) -> Result<()> {
    let path = Path::new(file);
    let archiver = archiver(config).await?;
    let key = archiver
        .upload(path)
        .await
        .with_context(|| format!("Failed to upload {}", path.display()))?;
    info!("[UPLOAD] [SUCCESS] Upload finished: {}", archiver.location(&key));
    remove_artifact(path);
    Ok(())
}

async fn show_destinations(config: &AppConfig) -> Result<()> {
    let chat = connect_lark(config).await?;
    let destinations = notifier(config, chat)
        .resolve_destinations()
        .await
        .context("Failed to resolve chat destinations")?;

    if destinations.is_empty() {
        println!("No joined chat matches {:?}", config.lark.allow_list());
    }
    for destination in destinations {
        println!("  {} ({})", destination.display_name, destination.id);
    }
    Ok(())
}

async fn run_daemon(config: &AppConfig, interval_hours: u64) -> Result<()> {
    let job = build_job(config).await?;
    let endpoints = endpoints(config);
    let mut timer = tokio::time::interval(Duration::from_secs(interval_hours * 3600));

    info!("Daemon started, backing up every {} hours", interval_hours);
    loop {
        timer.tick().await;
        info!("Scheduled backup triggered");
        if let Err(e) = job.run(&endpoints).await {
            warn!("Backup report could not be delivered: {}", e);
        }
    }
}

fn show_logs(config: &AppConfig, lines: usize) -> Result<()> {
    let log_file = config.logging.file_path();
    if !log_file.exists() {
        println!("No log file found at: {}", log_file.display());
        return Ok(());
    }

    let content = fs::read_to_string(&log_file)
        .with_context(|| format!("Failed to read log file: {}", log_file.display()))?;
    let log_lines: Vec<&str> = content.lines().collect();
    let start = log_lines.len().saturating_sub(lines);
    for line in &log_lines[start..] {
        println!("{}", line);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.as_deref().unwrap_or(DEFAULT_CONFIG_PATH);
    let command = cli.command.unwrap_or(Commands::Run);

    match &command {
        Commands::GenerateConfig { output } => {
            init_console_logging();
            generate_example_config(Path::new(output))?;
            println!("✅ Example configuration file generated: {}", output);
            println!("📝 Please edit it with your credentials, endpoints and chat names");
            return Ok(());
        }
        Commands::Logs { lines } => {
            let config = AppConfig::load(config_path)?;
            return show_logs(&config, *lines);
        }
        _ => {}
    }

    let config = AppConfig::load(config_path)?;
    let _guard = init_logging(&config.logging)?;
    info!(
        "Current date time: {}",
        chrono::Local::now().format("%Y-%m-%d-%H:%M:%S")
    );

    match command {
        Commands::Run => run_once(&config).await,
        Commands::Upload { file } => upload_file(&config, &file).await,
        Commands::Destinations => show_destinations(&config).await,
        Commands::Daemon { interval_hours } => run_daemon(&config, interval_hours).await,
        Commands::GenerateConfig { .. } | Commands::Logs { .. } => Ok(()),
    }
}
