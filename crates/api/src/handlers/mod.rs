use axum::{extract::FromRequestParts, http::request::Parts};

use crate::error::ApiError;

pub mod health;
pub mod resources;

/// 标识调用方的请求头
pub const ACTOR_HEADER: &str = "x-actor-id";

/// 从请求头中提取的调用方身份
#[derive(Debug, Clone)]
pub struct Actor(pub String);

impl<S> FromRequestParts<S> for Actor
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(ACTOR_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|actor| !actor.is_empty())
            .map(|actor| Actor(actor.to_string()))
            .ok_or(ApiError::MissingActor)
    }
}
