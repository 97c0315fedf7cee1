//! # Orchestrator API
//!
//! 资源编排的 HTTP 接口，基于 Axum 构建。
//!
//! ## API 端点
//!
//! - `GET /health` - 健康检查
//! - `POST /resources` - 创建资源
//! - `PATCH /resources/{id}` - 修改资源（已 provision 且开启审批时暂存）
//! - `DELETE /resources/{id}` - 删除资源
//! - `GET /resources/{id}/actions` - 调用方当前可执行的动作
//! - `PATCH /resources/{id}/actions` - 执行动作，请求体 `{"action": "<name>"}`
//!
//! 调用方通过 `x-actor-id` 请求头标识，缺失时返回 401。
//!
//! ## 错误响应
//!
//! ```json
//! {
//!   "error": {
//!     "message": "...",
//!     "type": "DEPENDENCY_ERROR",
//!     "code": 409,
//!     "dependencies": [3, 4],
//!     "timestamp": "2024-01-01T00:00:00Z"
//!   }
//! }
//! ```

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod response;
pub mod routes;

use axum::Router;
use orchestrator_dispatcher::ActionDispatcher;
use std::sync::Arc;
use tower::ServiceBuilder;

use middleware::{cors_layer, request_logging, trace_layer};
use routes::{create_routes, AppState};

pub use error::{ApiError, ApiResult};
pub use handlers::ACTOR_HEADER;

/// 创建完整的API应用
pub fn create_app(dispatcher: Arc<ActionDispatcher>) -> Router {
    create_routes(AppState { dispatcher }).layer(
        ServiceBuilder::new()
            .layer(trace_layer())
            .layer(cors_layer())
            .layer(axum::middleware::from_fn(request_logging)),
    )
}
