use axum::{
    routing::{get, patch, post},
    Router,
};
use orchestrator_dispatcher::ActionDispatcher;
use std::sync::Arc;

use crate::handlers::{
    health::health_check,
    resources::{apply_action, create_resource, delete_resource, get_actions, update_resource},
};

/// API应用状态
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<ActionDispatcher>,
}

/// 创建API路由
pub fn create_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/resources", post(create_resource))
        .route(
            "/resources/{id}",
            patch(update_resource).delete(delete_resource),
        )
        .route(
            "/resources/{id}/actions",
            get(get_actions).patch(apply_action),
        )
        .with_state(state)
}
