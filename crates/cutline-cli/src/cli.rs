//! CLI entry and dispatch.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use cutline_core::config::{Config, paths};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cutline")]
#[command(version = "0.1")]
#[command(about = "Terminal client for the Cutline editing assistant")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Override the service base URL from config
    #[arg(long, value_name = "URL")]
    base_url: Option<String>,

    /// Override the UI language ("en", "zh")
    #[arg(long)]
    lang: Option<String>,

    /// Start a fresh session instead of resuming the stored one
    #[arg(long)]
    new_session: bool,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Interactive chat with the editing assistant (default)
    Chat,
    /// Print the stored session id, if any
    Session,
}

/// # Errors
/// Returns an error if the selected command fails.
pub fn run() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load().context("Failed to load config")?;
    if let Some(base_url) = cli.base_url {
        config.base_url = base_url;
    }
    if let Some(lang) = cli.lang {
        config.lang = lang;
    }

    match cli.command {
        None | Some(Commands::Chat) => {
            let _log_guard = init_logging()?;
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(chat_entry(config, cli.new_session))
        }
        Some(Commands::Session) => {
            match cutline_core::client::load_session_ref() {
                Some(id) => println!("{id}"),
                None => println!("(no stored session)"),
            }
            Ok(())
        }
    }
}

async fn chat_entry(config: Config, new_session: bool) -> Result<()> {
    let stored = if new_session {
        cutline_core::client::clear_session_ref();
        None
    } else {
        cutline_core::client::load_session_ref()
    };
    crate::chat::run(config, stored).await
}

/// File logging only: stdout belongs to the chat transcript.
fn init_logging() -> Result<tracing_appender::non_blocking::WorkerGuard> {
    let logs_dir = paths::logs_dir();
    std::fs::create_dir_all(&logs_dir)
        .with_context(|| format!("Failed to create {}", logs_dir.display()))?;
    let appender = tracing_appender::rolling::daily(logs_dir, "cutline.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("CUTLINE_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(writer)
        .with_ansi(false)
        .init();
    Ok(guard)
}

/// Expands shell-ish path arguments for `:upload`.
pub fn parse_upload_paths(rest: &str) -> Vec<PathBuf> {
    rest.split_whitespace().map(PathBuf::from).collect()
}
