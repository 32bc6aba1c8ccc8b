use anyhow::Result;
use rollcall_core::FaceDetector;
use rollcall_store::AttendanceStore;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod controller;
mod routes;

use config::Config;
use controller::{CameraOpener, SessionController};
use routes::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");
    let config = Config::from_env();

    let store = Arc::new(AttendanceStore::open(&config.db_path)?);
    tracing::info!(
        path = %config.db_path.display(),
        students = store.student_count()?,
        "store opened"
    );

    // Missing cascade model is fatal at startup, not at session start.
    let model_path = config.cascade_model_path();
    let detector = Arc::new(FaceDetector::load(&model_path)?);
    tracing::info!(path = model_path, "cascade detector loaded");

    let controller = Arc::new(SessionController::new(
        CameraOpener {
            device: config.camera_device.clone(),
        },
        detector,
        store.clone(),
        config.feed_buffer_frames,
    ));

    let app = routes::router(AppState {
        controller: controller.clone(),
        store,
    });

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    tracing::info!(addr = %config.listen_addr, device = %config.camera_device, "rollcalld ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    tracing::info!("rollcalld shutting down");
    controller.stop();
    Ok(())
}
