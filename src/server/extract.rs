//! 鉴权提取器

use super::error::ApiError;
use super::state::AppState;
use crate::auth::{extract_bearer, AuthError, Identity};
use axum::{
    async_trait,
    extract::{FromRequestParts, Query},
    http::{header::AUTHORIZATION, request::Parts},
};
use serde::Deserialize;

/// 已认证的调用方（Authorization: Bearer <token>）
#[derive(Debug, Clone)]
pub struct AuthUser(pub Identity);

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = bearer_from_parts(parts)?;
        Ok(AuthUser(state.verifier.verify(token)?))
    }
}

fn bearer_from_parts(parts: &Parts) -> Result<&str, AuthError> {
    let header = parts
        .headers
        .get(AUTHORIZATION)
        .ok_or(AuthError::MissingToken)?
        .to_str()
        .map_err(|_| AuthError::InvalidFormat)?;
    extract_bearer(header)
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// WebSocket 调用方
///
/// 浏览器无法给 WebSocket 握手加自定义头，所以也接受 `?token=`；
/// `server.ws_require_auth = false` 时不校验，值为 None
#[derive(Debug, Clone)]
pub struct WsCaller(pub Option<Identity>);

#[async_trait]
impl FromRequestParts<AppState> for WsCaller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        if !state.config.server.ws_require_auth {
            return Ok(WsCaller(None));
        }

        if parts.headers.contains_key(AUTHORIZATION) {
            let token = bearer_from_parts(parts)?;
            return Ok(WsCaller(Some(state.verifier.verify(token)?)));
        }

        let Query(query) = Query::<TokenQuery>::from_request_parts(parts, state)
            .await
            .map_err(|e| ApiError::BadRequest(e.body_text()))?;
        let token = query.token.ok_or(AuthError::MissingToken)?;
        Ok(WsCaller(Some(state.verifier.verify(&token)?)))
    }
}
