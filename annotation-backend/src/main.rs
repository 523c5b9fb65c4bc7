use anyhow::Context;
use std::sync::Arc;
use tracing::info;
use unified_detector::ModelRegistry;

use annotation_backend::config::AppConfig;
use annotation_backend::pipeline::{spawn_dispatcher, Orchestrator, TracingNotifier};
use annotation_backend::store::{AnnotationStore, InMemoryStore};
use annotation_backend::{create_app, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting Blueprint Annotation Server");

    let config = AppConfig::from_env().context("Invalid configuration")?;

    // The blocking HTTP clients own a runtime, so build them off the async threads
    let models = {
        let (room, wall, window_door) = (
            config.room_model.clone(),
            config.wall_model.clone(),
            config.window_door_model.clone(),
        );
        tokio::task::spawn_blocking(move || ModelRegistry::from_configs(room, wall, window_door))
            .await
            .context("Model registry task failed")??
    };

    let store: Arc<dyn AnnotationStore> = Arc::new(InMemoryStore::new());
    let orchestrator = Orchestrator::new(Arc::clone(&store), Arc::new(models), Arc::new(TracingNotifier));
    let pipeline = spawn_dispatcher(orchestrator, config.dispatcher);
    info!(
        "Stage dispatcher running with concurrency {} and {} attempts per stage",
        config.dispatcher.concurrency, config.dispatcher.max_attempts
    );

    let app = create_app(AppState { store, pipeline }, &config);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}
