//! 表单提交解析：普通字段收集与上传文件落盘到临时文件。

use axum::extract::Multipart;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::ApiError;
use crate::field::{FieldSchema, upload_name_key};

pub const UPLOAD_PREFIX: &str = "formrun_";

#[derive(Debug)]
pub struct UploadConfig {
    pub temp_dir: PathBuf,
}

/// 本次请求创建的临时文件；析构时无条件删除。
#[derive(Debug, Default)]
pub struct UploadSet {
    paths: Vec<PathBuf>,
}

impl UploadSet {
    /// 在临时目录中分配一个唯一文件名，并登记以便清理。
    fn allocate(&mut self, temp_dir: &Path) -> PathBuf {
        let path = temp_dir.join(format!("{UPLOAD_PREFIX}{}", Uuid::new_v4()));
        self.paths.push(path.clone());
        path
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }
}

impl Drop for UploadSet {
    fn drop(&mut self) {
        for path in &self.paths {
            match std::fs::remove_file(path) {
                Ok(()) => debug!(path = ?path, "removed upload temp file"),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => warn!(path = ?path, error = %err, "failed to remove upload temp file"),
            }
        }
    }
}

/// 一次提交的原始取值。上传字段的值为临时文件路径，`<name>__name` 为原始文件名。
#[derive(Debug, Default)]
pub struct Submission {
    pub values: BTreeMap<String, String>,
    pub uploaded: BTreeSet<String>,
    pub uploads: UploadSet,
}

impl Submission {
    pub fn form_name(&self) -> Option<&str> {
        self.values.get("form_name").map(String::as_str)
    }

    /// 文件字段只接受真正上传的内容，丢弃以普通字段伪造的路径。
    pub fn retain_uploads_for(&mut self, fields: &[FieldSchema]) {
        for field in fields.iter().filter(|field| field.is_file()) {
            if !self.uploaded.contains(&field.name) {
                self.values.remove(&field.name);
                self.values.remove(&upload_name_key(&field.name));
            }
        }
    }
}

/// 读取 multipart 请求体；同名字段以首次出现为准。
pub async fn collect_submission(
    mut multipart: Multipart,
    config: &UploadConfig,
) -> Result<Submission, ApiError> {
    let mut submission = Submission::default();

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::BadRequest(err.to_string()))?
    {
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };

        match field.file_name().map(str::to_string) {
            Some(file_name) => {
                if file_name.is_empty() || submission.uploaded.contains(&name) {
                    continue;
                }
                let path = submission.uploads.allocate(&config.temp_dir);
                let mut file = File::create(&path)
                    .await
                    .map_err(|err| ApiError::Internal(err.to_string()))?;
                let mut total_written: u64 = 0;
                while let Some(chunk) = field
                    .chunk()
                    .await
                    .map_err(|err| ApiError::BadRequest(err.to_string()))?
                {
                    total_written += chunk.len() as u64;
                    file.write_all(&chunk)
                        .await
                        .map_err(|err| ApiError::Internal(err.to_string()))?;
                }
                file.flush()
                    .await
                    .map_err(|err| ApiError::Internal(err.to_string()))?;
                debug!(field = name, file_name, bytes = total_written, "upload saved");

                submission
                    .values
                    .insert(upload_name_key(&name), file_name);
                submission
                    .values
                    .insert(name.clone(), path.to_string_lossy().into_owned());
                submission.uploaded.insert(name);
            }
            None => {
                let text = field
                    .text()
                    .await
                    .map_err(|err| ApiError::BadRequest(err.to_string()))?;
                submission.values.entry(name).or_insert(text);
            }
        }
    }

    Ok(submission)
}
