use std::time::Duration;

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use tower::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::errors::AdminError;

use super::context::AdminContext;

pub fn router(context: AdminContext) -> Router {
    Router::new()
        .route("/healthz", get(handle_healthz))
        .route("/admin/stats", get(handle_admin_stats))
        .layer(TimeoutLayer::new(Duration::from_secs(5)))
        .layer(TraceLayer::new_for_http())
        .with_state(context)
}

async fn handle_healthz() -> &'static str {
    "ok"
}

#[derive(Serialize)]
struct AdminStats {
    version: String,
    hot_users: Vec<i64>,
}

/// Top hot users by access score, as tracked by the timeline cache (module
/// B's `hotUsers`), plus the running build version. Read-only: this
/// endpoint never mutates store or cache state.
async fn handle_admin_stats(
    State(context): State<AdminContext>,
) -> Result<Json<AdminStats>, AdminError> {
    let hot_users = context.cache.hot_users(20).await;
    Ok(Json(AdminStats {
        version: context.version.clone(),
        hot_users,
    }))
}
