//! 统一的 HTTP 错误类型与转换。

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::error;

use crate::registry::ConfigError;
use crate::source::SourceError;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(HeaderMap),
    Forbidden(String),
    NotFound(String),
    MethodNotAllowed,
    NotImplemented(String),
    /// 内部细节只写日志，不返回给客户端。
    Internal(String),
}

fn error_response(status: StatusCode, headers: HeaderMap, message: &str) -> Response {
    (
        status,
        headers,
        format!("Error {}: {}", status.as_u16(), message),
    )
        .into_response()
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(msg) => {
                error_response(StatusCode::BAD_REQUEST, HeaderMap::new(), &msg)
            }
            ApiError::Unauthorized(headers) => {
                error_response(StatusCode::UNAUTHORIZED, headers, "Authenticate")
            }
            ApiError::Forbidden(msg) => error_response(StatusCode::FORBIDDEN, HeaderMap::new(), &msg),
            ApiError::NotFound(msg) => error_response(StatusCode::NOT_FOUND, HeaderMap::new(), &msg),
            ApiError::MethodNotAllowed => error_response(
                StatusCode::METHOD_NOT_ALLOWED,
                HeaderMap::new(),
                "Method not allowed",
            ),
            ApiError::NotImplemented(msg) => {
                error_response(StatusCode::NOT_IMPLEMENTED, HeaderMap::new(), &msg)
            }
            ApiError::Internal(detail) => {
                error!(error = %detail, "internal error while handling request");
                error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    HeaderMap::new(),
                    "Internal server error",
                )
            }
        }
    }
}

impl From<ConfigError> for ApiError {
    fn from(error: ConfigError) -> Self {
        ApiError::Internal(error.to_string())
    }
}

impl From<SourceError> for ApiError {
    fn from(error: SourceError) -> Self {
        ApiError::Internal(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[tokio::test]
    async fn internal_error_hides_detail() {
        let response = ApiError::Internal("/etc/secret: permission denied".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = response.into_body().collect().await.expect("body").to_bytes();
        assert_eq!(&body[..], b"Error 500: Internal server error");
    }
}
