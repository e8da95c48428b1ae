//! Basic 认证、可信前置认证头与口令摘要。

use axum::http::header::{HeaderName, WWW_AUTHENTICATE};
use axum::http::{HeaderMap, HeaderValue};
use axum_extra::headers::{Authorization, HeaderMapExt, authorization::Basic};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::ApiError;
use crate::registry::Registry;

pub const AUTH_REALM: &str = r#"Basic realm="Private Area""#;

#[derive(Debug, Default)]
pub struct AuthConfig {
    /// 由前置反向代理设置、可直接信任的用户名请求头；未配置时不启用。
    pub trusted_user_header: Option<HeaderName>,
}

/// 计算口令的 SHA-256 十六进制摘要。
pub fn hash_password(password: &str) -> String {
    let hash = Sha256::digest(password.as_bytes());
    format!("{hash:x}")
}

/// 认证当前请求。
///
/// 返回 `Ok(None)` 表示无需认证；认证失败时返回带质询头的 `Unauthorized`。
pub fn authenticate(
    headers: &HeaderMap,
    registry: &Registry,
    auth: &AuthConfig,
) -> Result<Option<String>, ApiError> {
    if let Some(header) = &auth.trusted_user_header
        && let Some(user) = headers
            .get(header)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    {
        debug!(user, "pre-authenticated by trusted header");
        return Ok(Some(user.to_string()));
    }

    if !registry.requires_auth() {
        return Ok(None);
    }

    if let Some(credentials) = headers.typed_get::<Authorization<Basic>>() {
        let username = credentials.username();
        if let Some(expected) = registry.users.get(username)
            && *expected == hash_password(credentials.password())
        {
            return Ok(Some(username.to_string()));
        }
        warn!(user = username, "authentication failed");
    }

    let mut challenge = HeaderMap::new();
    challenge.insert(WWW_AUTHENTICATE, HeaderValue::from_static(AUTH_REALM));
    Err(ApiError::Unauthorized(challenge))
}
