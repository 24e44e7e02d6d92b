use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use storyloom::api::{self, AppState};
use storyloom::blob::FsBlobStore;
use storyloom::config;
use storyloom::db;
use storyloom::gateway::GeminiGateway;
use storyloom::pipeline::PipelineDeps;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(args.config.as_path()))?;
    cfg.ensure_dirs()?;

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/storyloom.db", cfg.app.data_dir));

    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let gateway = Arc::new(GeminiGateway::from_config(&cfg));
    let blob = Arc::new(FsBlobStore::new(
        cfg.app.data_dir.clone(),
        cfg.app.public_base_url.clone(),
    ));

    let state = AppState {
        deps: PipelineDeps {
            pool,
            gateway,
            blob,
            image_retries: cfg.gemini.image_retries,
        },
    };

    let router = api::create_router(state);
    let listener = tokio::net::TcpListener::bind(&cfg.app.bind_addr).await?;
    info!(addr = %cfg.app.bind_addr, "starting storyteller service");
    axum::serve(listener, router).await?;

    Ok(())
}
