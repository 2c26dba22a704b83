use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod ask;
mod config;
mod scaffold;
mod secrets;
mod sink;

use config::Config;

/// Log level for tracing output
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    /// Most verbose: all tracing including stream chunks
    Trace,
    /// Verbose: wire requests, decode and process details
    Debug,
    /// Standard: high-level flow, token usage
    Info,
    /// Quiet: only warnings and errors
    Warn,
    /// Minimal: only errors
    Error,
}

impl LogLevel {
    fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Parser)]
#[command(name = "confab")]
#[command(author, version, about = "Transcript-driven streaming chat", long_about = None)]
pub struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, value_enum, default_value = "warn")]
    pub log_level: LogLevel,

    /// Write logs to file (JSON-lines format)
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Config file (default: ~/.config/confab/config.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer the transcript's open question and write it back
    Ask(AskArgs),
    /// Create a transcript skeleton
    New {
        /// Where to write it (default: ./chat-<date>.md)
        path: Option<PathBuf>,
    },
    /// Show current configuration
    Config,
}

#[derive(Debug, clap::Args)]
pub struct AskArgs {
    /// Transcript file
    pub path: PathBuf,

    /// Provider to use (overrides the transcript header and config)
    #[arg(long)]
    pub provider: Option<String>,

    /// Model to use (overrides the transcript header and config)
    #[arg(short, long)]
    pub model: Option<String>,

    /// Request timeout in seconds; 0 disables
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Send the question's fenced code block verbatim as the payload
    #[arg(long)]
    pub raw: bool,

    /// Do not mirror the streamed answer to stdout
    #[arg(long)]
    pub no_stream_display: bool,

    /// Answer every unanswered exchange, oldest first
    #[arg(long)]
    pub all: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging. Answers stream to stdout, so the fmt layer goes
    // to stderr.
    let filter = EnvFilter::new(cli.log_level.as_filter());
    if let Some(log_path) = &cli.log_file {
        let file = std::fs::File::create(log_path)
            .with_context(|| format!("Failed to create log file: {:?}", log_path))?;
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::sync::Mutex::new(file)))
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    let config = Config::load(cli.config.as_deref())?;

    match &cli.command {
        Commands::Ask(args) => ask::run(args, &config).await,
        Commands::New { path } => {
            let written = scaffold::create(path.clone(), &config.transcript.to_parser_config())?;
            println!("created {}", written.display());
            Ok(())
        }
        Commands::Config => show_config(&config),
    }
}

fn show_config(config: &Config) -> Result<()> {
    println!("Configuration:");
    if let Some(provider) = &config.default_provider {
        println!("  Default provider: {}", provider);
    }
    println!(
        "  Memory: {}",
        if config.memory.enabled {
            "enabled"
        } else {
            "disabled"
        }
    );
    println!("  Full exchanges kept: {}", config.memory.max_full_exchanges);
    println!("  Transport: {}", config.transport.program);
    match config.transport.timeout() {
        Some(timeout) => println!("  Timeout: {}s", timeout.as_secs()),
        None => println!("  Timeout: disabled"),
    }

    println!("\nProviders:");
    if config.providers.is_empty() {
        println!("  (none configured; well-known names resolve keys from the environment)");
    }
    for (name, entry) in &config.providers {
        println!("  {}:", name);
        match config.provider_config(name) {
            Ok(provider) => {
                println!("    Wire family: {}", provider.kind);
                println!("    Endpoint: {}", provider.endpoint);
            }
            Err(_) => println!("    (invalid - no wire family for this name)"),
        }
        if let Some(model) = &entry.default_model {
            println!("    Default model: {}", model);
        }
        if entry.api_key.is_some() {
            println!("    API key: (configured)");
        } else if let Some(cmd) = &entry.api_key_cmd {
            println!("    API key: via command '{}'", cmd);
        } else if let Some(var) = &entry.api_key_env {
            println!("    API key: ${}", var);
        }
        if let Some(max_tokens) = entry.default_max_tokens {
            println!("    Max tokens: {}", max_tokens);
        }
        if entry.web_search {
            println!("    Web search: enabled");
        }
    }
    Ok(())
}
