use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    Json,
};
use orchestrator_dispatcher::NewResource;
use orchestrator_domain::{Action, ResourceId, ResourceView};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::ApiResult;
use crate::handlers::Actor;
use crate::response::ApiResponse;
use crate::routes::AppState;

#[derive(Debug, Deserialize)]
pub struct ActionRequest {
    pub action: String,
}

/// 调用方当前可执行的动作
pub async fn get_actions(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
    Actor(actor): Actor,
) -> ApiResult<ApiResponse<Vec<Action>>> {
    let actions = state.dispatcher.get_actions(id, &actor).await?;
    Ok(ApiResponse::success(actions))
}

pub async fn apply_action(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
    Actor(actor): Actor,
    payload: Result<Json<ActionRequest>, JsonRejection>,
) -> ApiResult<ApiResponse<ResourceView>> {
    let Json(request) = payload?;
    let action: Action = request.action.parse()?;
    debug!(resource_id = id, action = %action, actor = %actor, "执行动作");

    let view = state.dispatcher.apply(id, action, &actor).await?;
    Ok(ApiResponse::success(view))
}

/// 修改资源；已 provision 且开启审批时修改被暂存
pub async fn update_resource(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
    Actor(actor): Actor,
    payload: Result<Json<Map<String, Value>>, JsonRejection>,
) -> ApiResult<ApiResponse<ResourceView>> {
    let Json(diff) = payload?;
    let view = state.dispatcher.update(id, diff, &actor).await?;
    if view.has_pending_edit {
        return Ok(ApiResponse::success_with_message(view, "修改已暂存，等待审批"));
    }
    Ok(ApiResponse::success(view))
}

pub async fn delete_resource(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
    Actor(actor): Actor,
) -> ApiResult<ApiResponse<ResourceView>> {
    let view = state.dispatcher.apply(id, Action::Delete, &actor).await?;
    Ok(ApiResponse::success_with_message(view, "资源已删除"))
}

pub async fn create_resource(
    State(state): State<AppState>,
    Actor(actor): Actor,
    payload: Result<Json<NewResource>, JsonRejection>,
) -> ApiResult<(StatusCode, ApiResponse<ResourceView>)> {
    let Json(request) = payload?;
    let view = state.dispatcher.create(request, &actor).await?;
    Ok((StatusCode::CREATED, ApiResponse::success(view)))
}
