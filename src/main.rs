use std::sync::Arc;

use lpg_dispatch::api::rest::router;
use lpg_dispatch::config::{Config, LogFormat};
use lpg_dispatch::engine::queue::run_dispatch_worker;
use lpg_dispatch::error::AppError;
use lpg_dispatch::state::AppState;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let config = Config::from_env()?;
    init_tracing(&config);

    let (app_state, job_rx) = AppState::from_config(&config).await?;
    let shared_state = Arc::new(app_state);

    let app = router(shared_state.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = tokio::spawn(run_dispatch_worker(
        shared_state.dispatcher.clone(),
        shared_state.metrics.clone(),
        job_rx,
        shared_state.auto_assign_timeout,
        shutdown_rx,
    ));

    let bind_addr = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|err| AppError::Internal(format!("failed to bind {bind_addr}: {err}")))?;

    tracing::info!(
        http_port = config.http_port,
        backend = shared_state.backend,
        "http server started"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| AppError::Internal(format!("server error: {err}")))?;

    let _ = shutdown_tx.send(true);
    if let Err(err) = worker.await {
        tracing::error!(error = %err, "dispatch worker did not stop cleanly");
    }

    Ok(())
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::new(config.log_level.clone());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Compact => builder.compact().init(),
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
}
