//! 动态字段/选项来源：可执行文件的输出或静态 JSON 文件。

use serde::de::DeserializeOwned;
use std::fs::Metadata;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::fs;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to run {path}: {source}")]
    Spawn { path: PathBuf, source: io::Error },
    #[error("{path} exited with code {code}: {stderr}")]
    Failed {
        path: PathBuf,
        code: i32,
        stderr: String,
    },
    #[error("invalid JSON from {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid definition from {path}: {reason}")]
    Invalid { path: PathBuf, reason: String },
}

/// 判断文件是否对属主可执行。
pub fn is_executable(metadata: &Metadata) -> bool {
    metadata.is_file() && metadata.permissions().mode() & 0o100 != 0
}

/// 读取 JSON 来源：可执行文件则运行并解析其标准输出，否则直接读取文件内容。
pub async fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T, SourceError> {
    let metadata = fs::metadata(path).await.map_err(|source| SourceError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let content = if is_executable(&metadata) {
        let mut command = Command::new(path);
        if let Some(dir) = path.parent() {
            command.current_dir(dir);
        }
        let output = command
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| SourceError::Spawn {
                path: path.to_path_buf(),
                source,
            })?;
        if !output.status.success() {
            return Err(SourceError::Failed {
                path: path.to_path_buf(),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        debug!(path = ?path, bytes = output.stdout.len(), "source command finished");
        output.stdout
    } else {
        fs::read(path).await.map_err(|source| SourceError::Read {
            path: path.to_path_buf(),
            source,
        })?
    };

    serde_json::from_slice(&content).map_err(|source| SourceError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
