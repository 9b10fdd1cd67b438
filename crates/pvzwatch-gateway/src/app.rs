use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};

use pvzwatch_blacklist::BlacklistSearch;
use pvzwatch_core::config::WatchConfig;
use pvzwatch_geo::GeoFilter;
use pvzwatch_pipeline::Supervisor;
use pvzwatch_store::Store;

/// Central shared state: passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: WatchConfig,
    pub store: Store,
    pub supervisor: Arc<Supervisor>,
    pub geo: Arc<GeoFilter>,
    pub blacklist: Arc<BlacklistSearch>,
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(crate::http::health::root_handler))
        .route("/health", get(crate::http::health::health_handler))
        .route("/workers/start", post(crate::http::workers::start))
        .route("/workers/status/{task_id}", get(crate::http::workers::status))
        .route("/workers/stop/{task_id}", post(crate::http::workers::stop))
        .route("/workers/list/{task_id}", get(crate::http::workers::list))
        .route(
            "/workers/{item_id}/check-blacklist",
            post(crate::http::workers::check_blacklist),
        )
        .route("/blacklist/check", post(crate::http::blacklist::check))
        .route("/blacklist/chats", get(crate::http::blacklist::chats))
        .route("/blacklist/chats/sync", post(crate::http::blacklist::sync))
        .route("/blacklist/chats/add", post(crate::http::blacklist::add))
        .route(
            "/blacklist/chats/remove",
            post(crate::http::blacklist::remove),
        )
        .route(
            "/blacklist/chats/topics",
            get(crate::http::blacklist::topics),
        )
        .route("/admin/stats", get(crate::http::admin::stats))
        .route("/admin/cleanup", post(crate::http::admin::cleanup))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
