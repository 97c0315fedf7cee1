use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use orchestrator_errors::OrchestratorError;
use serde_json::{json, Value};
use tracing::error;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("编排错误: {0}")]
    Orchestrator(#[from] OrchestratorError),

    #[error("请求体格式错误: {0}")]
    MalformedBody(String),

    #[error("缺少调用方身份")]
    MissingActor,
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::MalformedBody(rejection.body_text())
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::MalformedBody(_) => StatusCode::BAD_REQUEST,
            ApiError::MissingActor => StatusCode::UNAUTHORIZED,
            ApiError::Orchestrator(e) => match e {
                OrchestratorError::EntityNotFound { .. } => StatusCode::NOT_FOUND,
                OrchestratorError::EntityWrongState { .. } => StatusCode::CONFLICT,
                OrchestratorError::DependencyError { .. } => StatusCode::CONFLICT,
                OrchestratorError::AccessDenied { .. } => StatusCode::FORBIDDEN,
                OrchestratorError::AccessUnauthorized => StatusCode::UNAUTHORIZED,
                OrchestratorError::InvalidInput(_) => StatusCode::UNPROCESSABLE_ENTITY,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            ApiError::MalformedBody(_) => "MALFORMED_BODY",
            ApiError::MissingActor => "UNAUTHORIZED",
            ApiError::Orchestrator(e) => match e {
                OrchestratorError::EntityNotFound { .. } => "ENTITY_NOT_FOUND",
                OrchestratorError::EntityWrongState { .. } => "ENTITY_WRONG_STATE",
                OrchestratorError::DependencyError { .. } => "DEPENDENCY_ERROR",
                OrchestratorError::AccessDenied { .. } => "ACCESS_DENIED",
                OrchestratorError::AccessUnauthorized => "UNAUTHORIZED",
                OrchestratorError::InvalidInput(_) => "INVALID_INPUT",
                _ => "INTERNAL_ERROR",
            },
        }
    }

    /// 系统故障不向调用方暴露细节
    fn public_message(&self) -> String {
        match self.status() {
            StatusCode::INTERNAL_SERVER_ERROR => "系统内部错误".to_string(),
            _ => self.to_string(),
        }
    }

    fn body(&self) -> Value {
        let mut error = json!({
            "message": self.public_message(),
            "type": self.error_type(),
            "code": self.status().as_u16(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        if let ApiError::Orchestrator(e) = self {
            if let Some(ids) = e.dependency_ids() {
                error["dependencies"] = json!(ids);
            }
        }
        json!({ "error": error })
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self, "请求因内部错误失败");
        }
        (status, Json(self.body())).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_maps_to_404() {
        let error: ApiError = OrchestratorError::resource_not_found(7).into();
        assert_eq!(error.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_wrong_state_maps_to_409() {
        let error: ApiError =
            OrchestratorError::wrong_state(1, "execute", "PROVISION", "IN_PROGRESS").into();
        assert_eq!(error.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn test_dependency_error_carries_ids() {
        let error: ApiError = OrchestratorError::dependency("blocked", vec![3, 4]).into();
        assert_eq!(error.status(), StatusCode::CONFLICT);
        assert_eq!(error.body()["error"]["dependencies"], json!([3, 4]));
    }

    #[test]
    fn test_access_errors() {
        let denied: ApiError = OrchestratorError::access_denied("bob", 1, "destroy").into();
        assert_eq!(denied.status(), StatusCode::FORBIDDEN);
        let anonymous: ApiError = OrchestratorError::AccessUnauthorized.into();
        assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::MissingActor.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_invalid_input_and_malformed_body() {
        let invalid: ApiError = OrchestratorError::invalid_input("bad diff").into();
        assert_eq!(invalid.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(
            ApiError::MalformedBody("eof".into()).status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_internal_error_hides_detail() {
        let error: ApiError = OrchestratorError::storage("connection string leaked").into();
        assert_eq!(error.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(error.body()["error"]["message"], json!("系统内部错误"));
    }
}
