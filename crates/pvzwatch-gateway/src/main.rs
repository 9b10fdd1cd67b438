use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use pvzwatch_blacklist::BlacklistSearch;
use pvzwatch_core::config::WatchConfig;
use pvzwatch_core::types::TaskStatus;
use pvzwatch_geo::GeoFilter;
use pvzwatch_pipeline::Supervisor;
use pvzwatch_store::Store;

mod app;
mod cleanup;
mod error;
mod http;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config_path = std::env::var("PVZWATCH_CONFIG").ok();
    let config = WatchConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        eprintln!("config load failed ({e}), using defaults");
        WatchConfig::default()
    });

    // Stdout always; a daily-rolled file as well when LOG_PATH is set.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "pvzwatch=info,pvzwatch_gateway=info,tower_http=info".into());
    let _file_guard = match &config.log_path {
        Some(log_path) => {
            let path = Path::new(log_path);
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            let file = path.file_name().map(|f| f.to_owned()).unwrap_or_default();
            let (writer, guard) = tracing_appender::non_blocking(
                tracing_appender::rolling::daily(dir, file),
            );
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(env_filter).init();
            None
        }
    };

    let store = Store::open(&config.db_path)?;
    store.seed_blacklist_chat(&config.blacklist_chat, Some("Чёрный Список ПВЗ"))?;

    let supervisor = Arc::new(Supervisor::new());
    let geo = Arc::new(GeoFilter::new());
    let blacklist = Arc::new(BlacklistSearch::new(
        config.api_id,
        config.api_hash.clone(),
        config.blacklist_session_path.clone(),
        store.clone(),
    ));

    let cleanup_cancel = CancellationToken::new();
    let cleanup_handle = tokio::spawn(cleanup::run(
        store.clone(),
        supervisor.clone(),
        cleanup_cancel.clone(),
    ));

    let bind = config.host.clone();
    let port = config.port;
    let state = Arc::new(app::AppState {
        config,
        store: store.clone(),
        supervisor: supervisor.clone(),
        geo,
        blacklist,
    });
    let router = app::build_router(state);

    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    info!(%addr, "pvzwatch gateway listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Graceful shutdown: stop every monitoring task, then the cleanup loop.
    info!("shutting down, stopping monitoring tasks");
    for task_id in supervisor.task_ids() {
        supervisor.stop(task_id);
        if let Err(e) = store.update_task_status(task_id, TaskStatus::Stopped, Some(Utc::now())) {
            warn!(%task_id, error = %e, "stop status write failed");
        }
    }
    cleanup_cancel.cancel();
    let _ = cleanup_handle.await;
    info!("pvzwatch gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
