//! # Ask Harness CLI (`askh`)
//!
//! The `askh` binary wires the question pipeline to a terminal or an HTTP
//! listener.
//!
//! ## Usage
//!
//! ```bash
//! askh --config ./config/askh.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `askh init` | Create the SQLite database and run schema migrations |
//! | `askh load <fixtures.json>` | Seed entities and chunks for local development |
//! | `askh route "<text>"` | Show the intent verdict for a message |
//! | `askh ask "<text>"` | Run one message through the full pipeline |
//! | `askh serve` | Start the HTTP server |
//!
//! ## Examples
//!
//! ```bash
//! askh init
//! askh load ./fixtures/sample.json
//! askh route "who leads the juice shop project?"
//! askh ask "how do I start a chapter?" --user U123
//! askh ask "anyone know where the slides are?" --user U123 --passive
//! RUST_LOG=ask_harness=debug askh serve
//! ```

use ask_harness::cache::CacheClient;
use ask_harness::generator::create_generator;
use ask_harness::models::Query;
use ask_harness::pipeline::Pipeline;
use ask_harness::router::{IntentClassifier, IntentRouter, ModelIntentStage};
use ask_harness::{config, db, migrate, seed, server};

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Ask Harness: question routing and retrieval for a community chat assistant.
#[derive(Parser)]
#[command(
    name = "askh",
    about = "Ask Harness: question routing and retrieval for a community chat assistant",
    version,
    long_about = "Ask Harness routes chat questions either to a deterministic lookup over \
    structured entity records or to a grounded retrieval-augmented answer, with per-user \
    rate limiting and a passive question filter."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/askh.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Seed entities and chunks from a JSON fixtures file.
    ///
    /// Chunks are embedded with the configured provider. Reloading the same
    /// file is idempotent; chunks missing from the file are removed.
    Load {
        /// Path to the fixtures file.
        path: PathBuf,
    },

    /// Classify a message as STATIC or DYNAMIC and print the verdict.
    Route {
        /// Message text.
        text: String,
    },

    /// Run a message through the pipeline and print the response envelope.
    Ask {
        /// Message text.
        text: String,

        /// User id used for rate limiting.
        #[arg(long, default_value = "cli")]
        user: String,

        /// Channel id, informational only.
        #[arg(long)]
        channel: Option<String>,

        /// Treat the message as overheard rather than addressed to the bot.
        #[arg(long)]
        passive: bool,
    },

    /// Start the HTTP server on `[server].bind`.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ask_harness=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg.db).await?;
            migrate::run_migrations(&pool).await?;
            println!("Database initialized successfully.");
        }
        Commands::Load { path } => {
            seed::run_load(&cfg, &path).await?;
        }
        Commands::Route { text } => {
            let cache = CacheClient::shared(&cfg.cache).await?;
            let mut router = IntentRouter::new(
                cache,
                &cfg.router,
                Duration::from_secs(cfg.cache.intent_ttl_secs),
            );
            if cfg.router.model_enabled {
                router = router.with_model(
                    ModelIntentStage::new(create_generator(&cfg.generator)?)
                        .with_deadline(Duration::from_millis(cfg.router.model_deadline_ms)),
                );
            }
            let verdict = router.route(&text).await;
            println!("{}", serde_json::to_string_pretty(&verdict)?);
        }
        Commands::Ask {
            text,
            user,
            channel,
            passive,
        } => {
            let pipeline = Pipeline::from_config(&cfg).await?;
            let query = Query::new(text, user, channel, !passive);
            match pipeline.process(&query).await {
                Some(envelope) => println!("{}", serde_json::to_string_pretty(&envelope)?),
                None => println!("(no response: not a question)"),
            }
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
