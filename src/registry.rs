//! 表单注册表：从 JSON 配置构建、加载期校验与只读共享。

use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::field::FieldSchema;
use crate::form::{FieldSource, FormSchema, OutputMode, check_fields, resolve_relative};
use crate::source::{SourceError, is_executable};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("malformed configuration {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("form '{form}': {reason}")]
    Form { form: String, reason: String },
    #[error("script {path} is not accessible: {source}")]
    Script { path: PathBuf, source: io::Error },
    #[error("{0} is not executable")]
    NotExecutable(PathBuf),
    #[error(transparent)]
    Source(#[from] SourceError),
}

#[derive(Deserialize)]
struct RegistryDocument {
    title: String,
    #[serde(default)]
    users: HashMap<String, String>,
    static_dir: Option<PathBuf>,
    #[serde(alias = "custom_css_path")]
    custom_css: Option<PathBuf>,
    forms: Vec<FormDocument>,
}

#[derive(Deserialize)]
struct FormDocument {
    name: String,
    title: String,
    #[serde(default)]
    description: String,
    script: PathBuf,
    fields: Option<Vec<FieldSchema>>,
    fields_from: Option<PathBuf>,
    #[serde(default)]
    output: OutputMode,
    #[serde(default)]
    hidden: bool,
    #[serde(default = "default_submit_title")]
    submit_title: String,
    allowed_users: Option<Vec<String>>,
    run_as: Option<String>,
}

fn default_submit_title() -> String {
    "Submit".to_string()
}

/// 全局设置与全部表单，构建后只读。
#[derive(Debug)]
pub struct Registry {
    pub title: String,
    /// 用户名到 SHA-256 十六进制口令摘要；为空表示无需认证。
    pub users: HashMap<String, String>,
    pub static_dir: Option<PathBuf>,
    pub custom_css: Option<String>,
    pub forms: Vec<FormSchema>,
}

impl Registry {
    /// 读取并校验配置文件。
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let path = fs::canonicalize(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        let content = fs::read(&path).await.map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let document: RegistryDocument =
            serde_json::from_slice(&content).map_err(|source| ConfigError::Parse {
                path: path.clone(),
                source,
            })?;
        let base_dir = path.parent().unwrap_or(Path::new("/")).to_path_buf();

        let custom_css = match document.custom_css {
            Some(css) => {
                let css_path = resolve_relative(&base_dir, &css);
                let css = fs::read_to_string(&css_path)
                    .await
                    .map_err(|source| ConfigError::Read {
                        path: css_path,
                        source,
                    })?;
                Some(css)
            }
            None => None,
        };

        let mut names = HashSet::new();
        let mut forms = Vec::with_capacity(document.forms.len());
        for form in document.forms {
            if !names.insert(form.name.clone()) {
                return Err(ConfigError::Form {
                    form: form.name,
                    reason: "duplicate form name".into(),
                });
            }
            forms.push(build_form(form, &base_dir).await?);
        }

        let users = document
            .users
            .into_iter()
            .map(|(user, hash)| (user, hash.to_ascii_lowercase()))
            .collect();

        debug!(path = ?path, forms = forms.len(), "form configuration loaded");
        Ok(Self {
            title: document.title,
            users,
            static_dir: document
                .static_dir
                .map(|dir| resolve_relative(&base_dir, &dir)),
            custom_css,
            forms,
        })
    }

    pub fn requires_auth(&self) -> bool {
        !self.users.is_empty()
    }

    pub fn form(&self, name: &str) -> Option<&FormSchema> {
        self.forms.iter().find(|form| form.name == name)
    }

    /// 可见表单：排除隐藏表单与当前用户无权访问的表单。
    pub fn visible_forms(&self, user: Option<&str>) -> Vec<&FormSchema> {
        self.forms
            .iter()
            .filter(|form| !form.hidden && form.is_allowed(user))
            .collect()
    }
}

async fn build_form(form: FormDocument, base_dir: &Path) -> Result<FormSchema, ConfigError> {
    let fail = |reason: String| ConfigError::Form {
        form: form.name.clone(),
        reason,
    };

    let fields = match (form.fields, form.fields_from) {
        (Some(fields), _) => {
            check_fields(&fields).map_err(fail)?;
            FieldSource::Static(fields)
        }
        (None, Some(source)) => FieldSource::Command(resolve_relative(base_dir, &source)),
        (None, None) => {
            return Err(fail("missing either 'fields' or 'fields_from'".into()));
        }
    };

    let script = resolve_relative(base_dir, &form.script);
    let metadata = fs::metadata(&script)
        .await
        .map_err(|source| ConfigError::Script {
            path: script.clone(),
            source,
        })?;
    if !is_executable(&metadata) {
        return Err(ConfigError::NotExecutable(script));
    }

    let schema = FormSchema {
        name: form.name,
        title: form.title,
        description: form.description,
        fields,
        script,
        output: form.output,
        hidden: form.hidden,
        allowed_users: form.allowed_users,
        run_as: form.run_as,
        submit_title: form.submit_title,
        base_dir: base_dir.to_path_buf(),
    };
    // 动态字段/选项在加载期先求值一次，尽早暴露配置错误。
    schema.resolve_fields().await?;
    Ok(schema)
}

/// 注册表的获取方式：常驻缓存，或开发模式下每个请求重新加载。
#[derive(Debug)]
pub struct RegistrySource {
    path: PathBuf,
    reload: bool,
    cached: Arc<Registry>,
}

impl RegistrySource {
    pub async fn open(path: &Path, reload: bool) -> Result<Self, ConfigError> {
        let registry = Registry::load(path).await?;
        info!(
            path = ?path,
            forms = registry.forms.len(),
            reload,
            "form configuration ready"
        );
        Ok(Self {
            path: path.to_path_buf(),
            reload,
            cached: Arc::new(registry),
        })
    }

    /// 返回当前请求使用的注册表；重新加载模式下每次构建独立实例。
    pub async fn current(&self) -> Result<Arc<Registry>, ConfigError> {
        if !self.reload {
            return Ok(self.cached.clone());
        }
        match Registry::load(&self.path).await {
            Ok(registry) => Ok(Arc::new(registry)),
            Err(err) => {
                warn!(path = ?self.path, error = %err, "form configuration reload failed");
                Err(err)
            }
        }
    }
}
