mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::future::Future;
#[cfg(feature = "server")]
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands, ConfigCommands};
use vackup::core::{default_image_name, JobStatus, TransferJob, VolumeService};
use vackup::utils::{format_duration, truncate_string, AppConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so command output stays clean
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vackup=info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let load = || load_config(cli.docker.as_deref(), cli.timeout.as_deref());
    let service = || -> Result<VolumeService> { VolumeService::from_config(&load()?) };

    match &cli.command {
        #[cfg(feature = "server")]
        Commands::Serve { port, host, cors } => {
            let config = load()?;
            let host = host.clone().unwrap_or_else(|| config.host.clone());
            let port = port.unwrap_or(config.port);
            let service = Arc::new(VolumeService::from_config(&config)?);
            vackup::server::run(host, port, *cors, service).await?;
        }
        Commands::Volumes { sizes } => handle_volumes(&service()?, *sizes).await?,
        Commands::Size { volume } => {
            let service = service()?;
            let size = run_step(format!("Measuring {}", volume), service.size_string(volume)).await?;
            println!("{}: {}", volume, size.bold());
        }
        Commands::Export { volume, path } => {
            let service = service()?;
            let job = run_step(
                format!("Exporting {} to {}", volume, path),
                service.export_volume(volume, path),
            )
            .await?;
            print_job(&job);
        }
        Commands::Import { volume, path } => {
            let service = service()?;
            let job = run_step(
                format!("Importing {} into {}", path, volume),
                service.import_volume(volume, path),
            )
            .await?;
            print_job(&job);
        }
        Commands::Clone { volume, destination } => {
            let service = service()?;
            let job = run_step(
                format!("Cloning {} to {}", volume, destination),
                service.clone_volume(volume, destination),
            )
            .await?;
            print_job(&job);
        }
        Commands::Save { volume, image } => {
            let service = service()?;
            let target = image.clone().unwrap_or_else(|| default_image_name(volume));
            let job = run_step(
                format!("Saving {} to image {}", volume, target),
                service.save_volume(volume, Some(target.as_str())),
            )
            .await?;
            print_job(&job);
        }
        Commands::Load { volume, image } => {
            let service = service()?;
            let job = run_step(
                format!("Loading image {} into {}", image, volume),
                service.load_volume(volume, image),
            )
            .await?;
            print_job(&job);
        }
        Commands::Transfer { volume, path } => {
            let service = service()?;
            let job = run_step(
                format!("Copying {} to {}", volume, path),
                service.transfer_volume(volume, path),
            )
            .await?;
            print_job(&job);
        }
        Commands::Run { volume, image, target } => {
            let service = service()?;
            let started = run_step(
                format!("Starting {} with {}", image, volume),
                service.run_container(volume, image, target.as_deref()),
            )
            .await?;
            println!(
                "{} Container {} started, {} mounted at {}",
                "✓".green(),
                started.id.chars().take(12).collect::<String>(),
                started.volume,
                started.target
            );
        }
        Commands::Empty { volume } => {
            let service = service()?;
            run_step(format!("Emptying {}", volume), service.empty_volume(volume)).await?;
            println!("{} Volume {} emptied", "✓".green(), volume);
        }
        Commands::Delete { volume } => {
            let service = service()?;
            run_step(format!("Deleting {}", volume), service.delete_volume(volume)).await?;
            println!("{} Volume {} deleted", "✓".green(), volume);
        }
        Commands::Events => handle_events(&service()?).await?,
        Commands::Config { command } => handle_config(command)?,
    }

    Ok(())
}

/// Config file values with command line overrides applied
fn load_config(docker: Option<&str>, timeout: Option<&str>) -> Result<AppConfig> {
    let mut config = AppConfig::load()?;
    if let Some(docker) = docker {
        config.docker_binary = docker.to_string();
    }
    if let Some(timeout) = timeout {
        config.operation_timeout = Some(timeout.to_string());
    }
    config.validate()?;
    Ok(config)
}

/// Await one operation behind a spinner, reporting failure in red
async fn run_step<T, E, F>(message: String, operation: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg} ({elapsed})")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.set_message(message.clone());
    spinner.enable_steady_tick(Duration::from_millis(100));

    let result = operation.await;
    spinner.finish_and_clear();

    match result {
        Ok(value) => Ok(value),
        Err(e) => {
            println!("{} {}", "✗".red(), message);
            Err(e).context(message)
        }
    }
}

fn print_job(job: &TransferJob) {
    let elapsed = job
        .duration()
        .map(|d| format!(" in {}", format_duration(d.num_seconds().max(0) as u64)))
        .unwrap_or_default();

    match &job.status {
        JobStatus::Succeeded => println!(
            "{} {} {} -> {}{}",
            "✓".green(),
            job.kind.as_str(),
            job.source,
            job.destination,
            elapsed
        ),
        JobStatus::Failed { message } => println!("{} {}: {}", "✗".red(), job.kind.as_str(), message),
        other => println!("{:?} {}", other, job.kind.as_str()),
    }

    for warning in &job.warnings {
        println!("  {} {}", "!".yellow(), warning.yellow());
    }
}

async fn handle_volumes(service: &VolumeService, sizes: bool) -> Result<()> {
    let volumes = if sizes {
        run_step("Measuring volumes".to_string(), service.list_volumes(true)).await?
    } else {
        service.list_volumes(false).await?
    };

    println!("{:<40} {:<10} {:>10}  {}", "Volume", "Driver", "Size", "Containers");
    println!("{}", "-".repeat(80));

    for (name, volume) in &volumes {
        let size = volume.size.as_deref().unwrap_or("-");
        println!(
            "{:<40} {:<10} {:>10}  {}",
            truncate_string(name, 40),
            volume.driver,
            size,
            volume.containers.join(", ")
        );
    }

    if volumes.is_empty() {
        println!("{}", "No volumes".dimmed());
    }
    Ok(())
}

async fn handle_events(service: &VolumeService) -> Result<()> {
    let mut events = service.subscribe_events();
    let background = service.start_background();
    println!("Watching volume events (Ctrl-C to stop)\n");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let time = event
                        .time
                        .and_then(|t| chrono::DateTime::from_timestamp(t, 0))
                        .map(|t| t.format("%H:%M:%S").to_string())
                        .unwrap_or_else(|| "--:--:--".to_string());
                    let container = event
                        .container
                        .as_deref()
                        .map(|c| format!(" ({})", truncate_string(c, 12)))
                        .unwrap_or_default();
                    println!(
                        "{} {:<8} {}{}",
                        time.dimmed(),
                        format!("{:?}", event.action).to_lowercase().cyan(),
                        event.volume,
                        container
                    );
                }
                Err(RecvError::Lagged(missed)) => println!("{} missed {} events", "!".yellow(), missed),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    for task in background {
        task.abort();
    }
    Ok(())
}

fn handle_config(command: &ConfigCommands) -> Result<()> {
    let path = AppConfig::config_path()?;

    match command {
        ConfigCommands::Show => {
            let config = AppConfig::load_from(&path)?;
            let contents = toml::to_string_pretty(&config).context("Failed to serialize config")?;
            println!("# {}\n{}", path.display(), contents);

            let timeout = config
                .timeout()?
                .map(|t| humantime::format_duration(t).to_string())
                .unwrap_or_else(|| "disabled".to_string());
            println!("# operation timeout: {}", timeout);
        }
        ConfigCommands::Path => println!("{}", path.display()),
        ConfigCommands::Init { force } => {
            if path.exists() && !force {
                println!("{} {} already exists (use --force to overwrite)", "!".yellow(), path.display());
                return Ok(());
            }
            AppConfig::default().save_to(&path)?;
            println!("{} Wrote {}", "✓".green(), path.display());
        }
    }

    Ok(())
}
