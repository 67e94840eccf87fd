//! EMX session engine - main entry point

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use emx_common::config::{self, TomlConfig};
use emx_common::db::init_database;
use emx_session::aggregator::{HttpStepSource, StepSource};
use emx_session::api::{self, AppContext, BuildInfo};
use emx_session::config::RuntimeSettings;
use emx_session::navigator::{SessionManager, SessionServices};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for emx-session
#[derive(Parser, Debug)]
#[command(name = "emx-session")]
#[command(about = "Session sequencing and completion admission service")]
#[command(version)]
struct Args {
    /// Root folder holding the database and the session cache
    #[arg(short, long, env = "EMX_ROOT_FOLDER")]
    root_folder: Option<String>,

    /// Port to listen on (overrides the config file)
    #[arg(short, long, env = "EMX_PORT")]
    port: Option<u16>,

    /// Path to the TOML config file
    #[arg(short, long, env = "EMX_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let toml = TomlConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("emx_session={0},emx_common={0},tower_http=info", toml.logging.level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_file(true).with_line_number(true))
        .init();

    let build = BuildInfo {
        version: env!("CARGO_PKG_VERSION"),
        git_hash: env!("GIT_HASH"),
        build_timestamp: env!("BUILD_TIMESTAMP"),
        build_profile: env!("BUILD_PROFILE"),
    };
    info!(
        "Starting emx-session v{} [{}] built {} ({})",
        build.version, build.git_hash, build.build_timestamp, build.build_profile
    );

    let root = config::resolve_root_folder(args.root_folder.as_deref(), config::ROOT_FOLDER_ENV, &toml);
    config::prepare_root_folder(&root).context("Failed to prepare root folder")?;
    info!("Root folder: {}", root.display());

    let db_path = root.join(config::DATABASE_FILE);
    info!("Database: {}", db_path.display());
    let db = init_database(&db_path)
        .await
        .context("Failed to initialize database")?;
    let settings = RuntimeSettings::load(&db).await.context("Failed to load settings")?;
    info!(?settings, "Runtime settings loaded");

    let http_client = reqwest::Client::builder()
        .user_agent(concat!("emx-session/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to build HTTP client")?;

    let mut remote_sources: Vec<Arc<dyn StepSource>> = Vec::new();
    for source in &toml.remote_sources {
        match HttpStepSource::from_config(http_client.clone(), source) {
            Ok(s) => {
                info!(kind = %source.kind, url = %source.url_template, "Remote step source configured");
                remote_sources.push(Arc::new(s));
            }
            Err(e) => warn!(kind = %source.kind, error = %e, "Ignoring remote step source"),
        }
    }

    let services = Arc::new(SessionServices::new(
        db,
        root.join(config::CACHE_DIR),
        settings,
        remote_sources,
    ));
    let manager = Arc::new(SessionManager::new(services));
    let router = api::build_router(AppContext::new(Arc::clone(&manager), build), &toml.cors_origins);

    let ip = toml
        .bind_address
        .parse()
        .with_context(|| format!("Invalid bind address {}", toml.bind_address))?;
    let addr = SocketAddr::new(ip, args.port.unwrap_or(toml.port));

    api::server::serve(addr, router, manager).await.context("Server error")?;

    info!("Server shutdown complete");
    Ok(())
}
