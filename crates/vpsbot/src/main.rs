//! vpsbot — VPS chat-bot back end
//!
//! Opens the instance store (running the one-time owner migration), then
//! answers bot commands over a JSON-lines channel on stdin/stdout.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use vpsbot::{config::BotConfig, SharedState};

#[derive(Parser)]
#[command(name = "vpsbot")]
#[command(about = "VPS chat-bot back end")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve commands as JSON lines on stdin, replying on stdout
    Run {
        /// Path to config file
        #[arg(short, long, default_value = "/etc/vpsbot/config.json")]
        config: PathBuf,
    },

    /// Run the startup migration and backup, then exit
    Migrate {
        /// Path to config file
        #[arg(short, long, default_value = "/etc/vpsbot/config.json")]
        config: PathBuf,
    },

    /// Generate a sample config file
    InitConfig {
        /// Path to write config
        #[arg(short, long, default_value = "/etc/vpsbot/config.json")]
        output: PathBuf,

        /// Directory holding the database and outbox
        #[arg(long, default_value = "/var/lib/vpsbot")]
        state_path: PathBuf,
    },

    /// Execute a single command and print the JSON result
    ///
    /// Examples:
    ///   vpsbot exec vps.list --actor 42
    ///   vpsbot exec vps.regen_ssh --actor 42 --params '{"container_name":"web1"}'
    ///   vpsbot exec backup.list --actor 1 --params '{"page":1}'
    Exec {
        /// Command name (e.g. vps.list, vps.regen_ssh, backup.restore)
        command: String,

        /// Invoking user id
        #[arg(long)]
        actor: u64,

        /// JSON parameters for the command (default: {})
        #[arg(long, default_value = "{}")]
        params: String,

        /// Path to config file (default: state under ~/.vpsbot)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Keep stdout clean JSON for exec; run logs to stderr
    if !matches!(cli.command, Commands::Exec { .. }) {
        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(EnvFilter::from_default_env().add_directive("vpsbot=info".parse()?))
            .init();
    }

    match cli.command {
        Commands::Run { config } => {
            run_bot(config).await?;
        }
        Commands::Migrate { config } => {
            migrate(config).await?;
        }
        Commands::InitConfig { output, state_path } => {
            init_config(output, state_path)?;
        }
        Commands::Exec {
            command,
            actor,
            params,
            config,
        } => {
            exec_command(&command, actor, &params, config).await?;
        }
    }

    Ok(())
}

// ─── Run ─────────────────────────────────────────────────────────────────────

async fn run_bot(config_path: PathBuf) -> anyhow::Result<()> {
    info!(config = %config_path.display(), "starting vpsbot");

    let config = BotConfig::load(&config_path)?;
    info!(
        database = %config.database_file.display(),
        admins = config.admin_ids.len(),
        runtime = %config.container_runtime,
        "loaded config"
    );

    let (state, report) = SharedState::open(config).await?;
    info!(
        outcome = ?report.outcome,
        migrated = report.migrated,
        unresolved = report.unresolved.len(),
        "store ready"
    );

    let state = Arc::new(state);
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();

    tokio::select! {
        result = vpsbot::dispatcher::serve(state.clone(), stdin, stdout) => result?,
        _ = tokio::signal::ctrl_c() => info!("interrupted, shutting down"),
    }

    match Arc::try_unwrap(state) {
        Ok(state) => state.close().await,
        Err(_) => info!("requests still in flight, store released on exit"),
    }
    Ok(())
}

// ─── Migrate ─────────────────────────────────────────────────────────────────

async fn migrate(config_path: PathBuf) -> anyhow::Result<()> {
    let config = BotConfig::load(&config_path)?;
    let (state, report) = SharedState::open(config).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    state.close().await;
    Ok(())
}

// ─── InitConfig ──────────────────────────────────────────────────────────────

fn init_config(output: PathBuf, state_path: PathBuf) -> anyhow::Result<()> {
    let config = BotConfig::rooted_at(&state_path);
    config.save(&output)?;

    println!("Config written to {}", output.display());
    println!();
    println!("Add your admin ids, then run:");
    println!("  vpsbot run --config {}", output.display());

    Ok(())
}

// ─── Exec ────────────────────────────────────────────────────────────────────

async fn exec_command(
    command: &str,
    actor: u64,
    params_str: &str,
    config_path: Option<PathBuf>,
) -> anyhow::Result<()> {
    use vpsbot::commands::{handle_command, CommandRequest};

    let params: serde_json::Value = serde_json::from_str(params_str)
        .map_err(|e| anyhow::anyhow!("invalid JSON params: {e}"))?;

    let config = match config_path {
        Some(path) => BotConfig::load(&path)?,
        None => BotConfig::rooted_at(
            &dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".vpsbot"),
        ),
    };

    let (state, _) = SharedState::open(config).await?;

    let request = CommandRequest {
        command: command.to_string(),
        actor,
        params,
    };

    let outcome = handle_command(&state, request).await;
    state.close().await;

    match outcome {
        Ok(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Err(e) => {
            let err = serde_json::json!({
                "ok": false,
                "error": e.to_string(),
                "command": command,
            });
            println!("{}", serde_json::to_string_pretty(&err)?);
            std::process::exit(1);
        }
    }

    Ok(())
}
