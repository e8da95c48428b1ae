//! 静态资源服务：路径校验与文件流式输出。

use axum::body::Body as AxumBody;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use httpdate::fmt_http_date;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::fs::{self, File};
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::error::ApiError;

/// 将请求的文件名解析为静态目录内的路径；拒绝父目录引用与绝对路径。
pub fn resolve_asset(root: &Path, fname: &str) -> Result<PathBuf, ApiError> {
    if fname.contains("..") {
        return Err(ApiError::Forbidden("Invalid file name".into()));
    }
    let mut normalized = PathBuf::new();
    for component in Path::new(fname).components() {
        match component {
            Component::Normal(segment) => normalized.push(segment),
            Component::CurDir => continue,
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ApiError::Forbidden("Invalid file name".into()));
            }
        }
    }
    if normalized.as_os_str().is_empty() {
        return Err(ApiError::NotFound("Not found".into()));
    }
    Ok(root.join(normalized))
}

/// 输出静态文件内容。
pub async fn serve_asset(static_dir: Option<&Path>, fname: &str) -> Result<Response, ApiError> {
    if fname.contains("..") {
        return Err(ApiError::Forbidden("Invalid file name".into()));
    }
    let Some(root) = static_dir else {
        return Err(ApiError::NotImplemented(
            "Static file serving not enabled".into(),
        ));
    };
    let target = resolve_asset(root, fname)?;

    let metadata = match fs::metadata(&target).await {
        Ok(metadata) if metadata.is_file() => metadata,
        Ok(_) => return Err(ApiError::NotFound("Not found".into())),
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(ApiError::NotFound("Not found".into()));
        }
        Err(err) => return Err(ApiError::Internal(err.to_string())),
    };
    let file = File::open(&target)
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;

    let mime = mime_guess::from_path(&target).first_or_octet_stream();
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(mime.essence_str())
            .map_err(|_| ApiError::Internal("invalid MIME type".into()))?,
    );
    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&metadata.len().to_string())
            .map_err(|_| ApiError::Internal("failed to build response headers".into()))?,
    );
    if let Ok(modified) = metadata.modified() {
        headers.insert(
            header::LAST_MODIFIED,
            HeaderValue::from_str(&fmt_http_date(modified))
                .map_err(|_| ApiError::Internal("failed to build response headers".into()))?,
        );
    }

    debug!(path = ?target, size = metadata.len(), "serve static asset");
    Ok((
        StatusCode::OK,
        headers,
        AxumBody::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}
