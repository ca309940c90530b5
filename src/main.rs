use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use chat_session_server::chat::ChatStateGateway;
use chat_session_server::config::{AppConfig, CliConfig, FileConfig};
use chat_session_server::conversation::OpenAIEngine;
use chat_session_server::future_jobs::JobStore;
use chat_session_server::server::metrics;
use chat_session_server::{
    run_server, ChatProtocol, FutureScheduler, RequestsLoggingLevel, SessionFinalizer,
    SqliteChatStore, SqliteJobStore, SqliteUserStore, UserStore, CHAT_JOB_TYPE,
};

fn parse_path(s: &str) -> Result<PathBuf> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(msg).with_context(|| format!("Error resolving path: {}", s));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(original_path))
}

#[derive(Parser, Debug)]
struct CliArgs {
    /// Path to a TOML config file. Its values override the command line.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Directory holding jobs.db, chat.db and user.db.
    #[clap(long, value_parser = parse_path)]
    pub db_dir: Option<PathBuf>,

    /// The port to listen on.
    #[clap(short, long, default_value_t = 3001)]
    pub port: u16,

    /// The port for the metrics server (Prometheus scraping).
    #[clap(long, default_value_t = 9091)]
    pub metrics_port: u16,

    /// The level of logging to perform on each request.
    #[clap(long, default_value = "path")]
    pub logging_level: RequestsLoggingLevel,

    /// Create a user with this handle, print a bearer token for it and exit.
    #[clap(long)]
    pub add_user: Option<String>,
}

impl CliArgs {
    fn cli_config(&self) -> CliConfig {
        CliConfig {
            db_dir: self.db_dir.clone(),
            port: self.port,
            metrics_port: self.metrics_port,
            logging_level: self.logging_level.clone(),
        }
    }
}

fn add_user(user_store: &dyn UserStore, handle: &str) -> Result<()> {
    let user_id = match user_store.get_user_id(handle)? {
        Some(user_id) => {
            info!("User {} already exists with id {}", handle, user_id);
            user_id
        }
        None => user_store.create_user(handle)?,
    };
    let token = user_store.create_auth_token(user_id)?;
    println!("{}", token.value.0);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .context("Failed to initialize tracing")?;

    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading config from {:?}", path);
            Some(FileConfig::load(path)?)
        }
        None => None,
    };
    let config = AppConfig::resolve(&cli_args.cli_config(), file_config)?;

    info!("Opening user store at {:?}...", config.user_db_path());
    let user_store = Arc::new(SqliteUserStore::new(config.user_db_path())?);

    if let Some(handle) = &cli_args.add_user {
        return add_user(user_store.as_ref(), handle);
    }

    info!("Initializing metrics...");
    metrics::init_metrics();

    info!("Opening chat store at {:?}...", config.chat_db_path());
    let chat_store: Arc<dyn ChatStateGateway> =
        Arc::new(SqliteChatStore::new(config.chat_db_path())?);
    info!("Opening job store at {:?}...", config.jobs_db_path());
    let job_store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::new(config.jobs_db_path())?);

    info!(
        "Conversation engine: model {} at {}",
        config.llm.model, config.llm.base_url
    );
    let engine = Arc::new(OpenAIEngine::new(config.llm.clone()));

    let mut scheduler = FutureScheduler::new(job_store.clone(), config.scheduler.clone());
    scheduler.add_handler(
        CHAT_JOB_TYPE,
        Arc::new(SessionFinalizer::new(chat_store.clone())),
    );
    let scheduler_handle = if config.scheduler.enabled {
        Some(scheduler.start())
    } else {
        warn!("Future jobs scheduler is disabled, idle chats will not be finished");
        None
    };

    let protocol = Arc::new(ChatProtocol::new(
        chat_store,
        user_store.clone(),
        job_store,
        engine,
        config.chat.clone(),
    ));

    info!("Ready to serve at port {}!", config.port);
    info!("Metrics available at port {}!", config.metrics_port);
    let served = run_server(config.server_config(), protocol, user_store, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Shutting down...");
    })
    .await;

    if let Some(handle) = scheduler_handle {
        handle.stop().await;
    }
    served
}
