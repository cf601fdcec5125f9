mod commands;
mod config;

use clap::{Parser, Subcommand};

use config::Connection;

#[derive(Parser)]
#[command(name = "cadence", about = "Adaptive, AI-planned job scheduling engine")]
struct Cli {
    /// Scheduler façade base URL (overrides CADENCE_API_URL)
    #[arg(long, global = true)]
    api_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a cadence config file (no services required)
    Init {
        /// Scheduler façade base URL
        #[arg(long, default_value = "http://localhost:3000")]
        api_url: String,
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Run the engine continuously until interrupted
    Start,
    /// Run exactly one processing cycle and print the aggregate
    Process,
    /// Print an engine-state snapshot
    Status,
    /// Fetch and print the façade's scheduler metrics
    Metrics,
    /// Release stale job leases
    UnlockJobs,
}

/// `cadence init`: write the config file skeleton.
fn cmd_init(api_url: &str, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = config::ConfigFile {
        api: config::ApiSection {
            url: api_url.to_string(),
            token: None,
        },
        model: config::ModelSection::default(),
    };

    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  api.url = {api_url}");
    println!();
    println!("Add your model api key under [model] or set OPENAI_API_KEY.");

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Development convenience; silently absent in production.
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { api_url, force } => {
            cmd_init(&api_url, force)?;
        }
        Commands::Start => {
            let connection = Connection::resolve(cli.api_url.as_deref())?;
            commands::run_start(&connection).await?;
        }
        Commands::Process => {
            let connection = Connection::resolve(cli.api_url.as_deref())?;
            let failed_jobs = commands::run_process(&connection).await?;
            if failed_jobs > 0 {
                std::process::exit(1);
            }
        }
        Commands::Status => {
            let connection = Connection::resolve(cli.api_url.as_deref())?;
            commands::run_status(&connection).await?;
        }
        Commands::Metrics => {
            let connection = Connection::resolve(cli.api_url.as_deref())?;
            commands::run_metrics(&connection).await?;
        }
        Commands::UnlockJobs => {
            commands::run_unlock_jobs();
        }
    }

    Ok(())
}
