//! SkyMemory - Long-term user memory for group chats
//!
//! Reads chat messages as JSON lines on stdin and maintains per-user memories
//! on disk.

use anyhow::Result;
use clap::{Parser, Subcommand};
use skymemory::{
    channels::JsonLinesAdapter,
    config::SkyMemoryConfig,
    gateway::GatewayBuilder,
    memory::{MemoryFiles, MemoryStore, UserMemoryStore},
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::BufReader;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "skymemory")]
#[command(version)]
#[command(about = "Long-term user memory for group chats")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "SKYMEMORY_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read JSON-lines messages from stdin and extract memories
    Run,

    /// List users with stored memories
    Users,

    /// Print a user's stored memories
    Memories {
        /// User id
        user_id: String,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Forget one memory, or all of a user's memories
    Forget {
        /// User id
        user_id: String,

        /// Index of the memory to forget (all when omitted)
        #[arg(short, long)]
        index: Option<usize>,
    },

    /// Show configuration
    ShowConfig {
        /// Show default configuration
        #[arg(long)]
        default: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => SkyMemoryConfig::load(path)?,
        None => SkyMemoryConfig::default(),
    };

    init_logging(cli.verbose, cli.log_json || config.logging.json);

    match cli.command {
        Commands::Run => run(config).await?,
        Commands::Users => list_users(&config).await?,
        Commands::Memories { user_id, json } => show_memories(&config, &user_id, json).await?,
        Commands::Forget { user_id, index } => forget(&config, &user_id, index).await?,
        Commands::ShowConfig { default } => {
            show_config(if default { None } else { Some(&config) })?;
        }
    }

    Ok(())
}

fn init_logging(verbose: bool, json: bool) {
    let log_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("skymemory={}", log_level).into());

    let (json_layer, plain_layer) = if json {
        let layer = tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr);
        (Some(layer), None)
    } else {
        let layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
        (None, Some(layer))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(plain_layer)
        .init();
}

async fn run(config: SkyMemoryConfig) -> Result<()> {
    let gateway = GatewayBuilder::new().config(config).build().await?;
    gateway
        .add_channel(Arc::new(JsonLinesAdapter::new(
            "stdin",
            BufReader::new(tokio::io::stdin()),
        )))
        .await;
    gateway.start().await?;

    tracing::info!("SkyMemory is running. Press Ctrl+C to stop.");

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            tracing::info!("Interrupted, dropping pending windows");
        }
        _ = gateway.channels_closed() => {
            tracing::info!("Input closed, flushing pending windows");
            gateway.drain().await;
        }
    }

    gateway.stop().await?;
    Ok(())
}

async fn open_store(config: &SkyMemoryConfig) -> Result<UserMemoryStore> {
    let files = MemoryFiles::open(&config.storage.memory_dir).await?;
    Ok(UserMemoryStore::with_files(
        config.memory.max_memories_per_user,
        files,
    ))
}

async fn list_users(config: &SkyMemoryConfig) -> Result<()> {
    let store = open_store(config).await?;
    let users = store.user_ids().await;
    if users.is_empty() {
        println!("No stored memories");
    }
    for user_id in users {
        println!("{}", user_id);
    }
    Ok(())
}

async fn show_memories(config: &SkyMemoryConfig, user_id: &str, json: bool) -> Result<()> {
    let store = open_store(config).await?;
    let records = store.get(user_id).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("No memories for user {}", user_id);
        return Ok(());
    }
    for (index, record) in records.iter().enumerate() {
        println!(
            "[{}] {}  (refs: {}, last used: {})",
            index,
            record.content,
            record.reference_count,
            record.last_referenced_at.format("%Y-%m-%d %H:%M")
        );
        if !record.context.is_empty() {
            println!("    context: {}", record.context);
        }
    }
    Ok(())
}

async fn forget(config: &SkyMemoryConfig, user_id: &str, index: Option<usize>) -> Result<()> {
    let store = open_store(config).await?;
    match index {
        Some(index) => {
            let before = store.get(user_id).await.len();
            store.forget(user_id, index).await?;
            store.flush().await?;
            if index < before {
                println!("Forgot memory {} of user {}", index, user_id);
            } else {
                println!("User {} has no memory {}", user_id, index);
            }
        }
        None => {
            store.forget_all(user_id).await?;
            println!("Forgot all memories of user {}", user_id);
        }
    }
    Ok(())
}

fn show_config(config: Option<&SkyMemoryConfig>) -> Result<()> {
    let config = config.cloned().unwrap_or_default();
    let toml = toml::to_string_pretty(&config)?;
    println!("{}", toml);
    Ok(())
}
