use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use std::path::PathBuf;
use std::sync::Arc;

use parley::api::{AppState, build_router};
use parley::auth::AuthState;
use parley::model::ModelAdapter;
use parley::relay::ConversationRelay;
use parley::settings::AppConfig;
use parley::store::{ChatStore, SqliteStore};
use parley::workflow::WorkflowEngine;
use parley::ws::WsHub;

#[derive(Parser)]
#[command(name = "parley", version, about = "Real-time chat relay server")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Silence all log output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the chat relay server (the default)
    Serve {
        /// Bind address, overriding the config file
        #[arg(long)]
        host: Option<String>,

        /// Bind port, overriding the config file
        #[arg(long)]
        port: Option<u16>,
    },

    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Print the effective configuration
    Config,
}

fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        "off"
    } else {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    match cli.command.unwrap_or(Command::Serve {
        host: None,
        port: None,
    }) {
        Command::Serve { host, port } => {
            let mut config = AppConfig::load(cli.config.as_deref())?;
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            serve(config).await
        }
        Command::Init { force } => init_config(cli.config, force),
        Command::Config => {
            let config = AppConfig::load(cli.config.as_deref())?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn serve(config: AppConfig) -> Result<()> {
    if config.auth.jwt_secret.is_none() {
        anyhow::bail!("auth.jwt_secret must be configured before serving");
    }

    let store: Arc<dyn ChatStore> = Arc::new(SqliteStore::open(&config.database.path).await?);
    let hub = Arc::new(WsHub::new());
    let auth = AuthState::new(config.auth.clone());
    let relay = Arc::new(ConversationRelay::new(
        Arc::clone(&store),
        Arc::clone(&hub),
        ModelAdapter::new(),
        WorkflowEngine::new()?,
    ));

    let app = build_router(AppState::new(store, hub, auth, relay));

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;

    info!("Listening on {}", addr);
    axum::serve(listener, app).await.context("serving")?;
    Ok(())
}

fn init_config(path: Option<PathBuf>, force: bool) -> Result<()> {
    let path = match path.or_else(AppConfig::default_path) {
        Some(path) => path,
        None => anyhow::bail!("no config path given and no default location available"),
    };

    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }

    let config = AppConfig::default();
    std::fs::write(&path, toml::to_string_pretty(&config)?)
        .with_context(|| format!("writing {}", path.display()))?;

    println!("Wrote {}", path.display());
    Ok(())
}
