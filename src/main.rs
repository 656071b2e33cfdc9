use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};

use cdservice::http::{self, AppState};
use cdservice::{EngineFactory, ServiceConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("cdservice=info".parse()?),
        )
        .init();

    dotenvy::dotenv().ok();

    if std::env::args().skip(1).any(|arg| arg == "--example-conf") {
        print!("{}", ServiceConfig::example());
        return Ok(());
    }

    let config = ServiceConfig::from_env()?;
    std::fs::create_dir_all(&config.task_dir).with_context(|| {
        format!("Failed to create task directory {}", config.task_dir.display())
    })?;

    info!("Starting community detection service...");

    let factory = EngineFactory::from_config(&config).context("Failed to create engine")?;
    let engine = Arc::new(factory.build());
    let reconciler = engine.start();

    let state = AppState {
        engine: engine.clone(),
        host_url: config.host_url.clone(),
        app_path: config.app_path.clone(),
    };
    let served = http::serve(state, &config.bind_address, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
        }
        info!("Shutdown signal received");
    })
    .await;

    engine.shutdown();
    if let Err(e) = reconciler.await {
        error!("Reconciliation loop ended abnormally: {}", e);
    }
    served
}
