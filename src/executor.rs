//! 脚本执行：环境变量传值、子进程降权与输出捕获/流式转发。

use axum::response::Response;
use std::collections::BTreeMap;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{error, info, warn};

use crate::field::FormValue;
use crate::form::{FormSchema, OutputMode};
use crate::privilege::{apply_identity, resolve_identity};
use crate::raw::stream_response;
use crate::upload::UploadSet;

pub const DEFAULT_RUN_AS: &str = "nobody";
pub const FORM_ENV: &str = "__SF__FORM";
pub const USER_ENV: &str = "__SF__USER";

#[derive(Debug)]
pub struct ExecutorConfig {
    /// 以 root 运行且表单未指定 `run_as` 时使用的账户。
    pub default_run_as: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_run_as: DEFAULT_RUN_AS.to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutionResult {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
}

impl ExecutionResult {
    fn start_failure(reason: impl std::fmt::Display) -> Self {
        Self {
            stdout: Vec::new(),
            stderr: format!("Internal error: {reason}. Please see the log file.").into_bytes(),
            exit_code: -1,
        }
    }
}

/// 执行结果：捕获的输出，或已经由脚本输出直接构成的响应。
pub enum ScriptOutcome {
    Captured(ExecutionResult),
    Streamed(Response),
}

/// 一次脚本调用的输入。
pub struct ScriptRun<'a> {
    pub form: &'a FormSchema,
    pub values: &'a BTreeMap<String, FormValue>,
    pub user: Option<&'a str>,
    /// 上传的临时文件，需在脚本结束后才能删除。
    pub uploads: UploadSet,
}

fn build_command(run: &ScriptRun<'_>, config: &ExecutorConfig) -> Result<Command, String> {
    let mut command = Command::new(&run.form.script);
    if let Some(dir) = run.form.script.parent() {
        command.current_dir(dir);
    }
    command
        .envs(
            run.values
                .iter()
                .map(|(key, value)| (key.as_str(), value.to_string())),
        )
        .env(FORM_ENV, &run.form.name)
        .stdin(Stdio::null());
    if let Some(user) = run.user {
        command.env(USER_ENV, user);
    }

    let identity = resolve_identity(run.form.run_as.as_deref(), &config.default_run_as)
        .map_err(|err| err.to_string())?;
    if let Some(identity) = identity {
        apply_identity(&mut command, identity);
    }
    Ok(command)
}

/// 执行表单脚本。
///
/// 启动失败不会向上传播，而是转换为退出码 -1 的结果；非零退出码同样作为数据返回。
pub async fn run_script(run: ScriptRun<'_>, config: &ExecutorConfig) -> ScriptOutcome {
    let script = run.form.script.clone();
    let mut command = match build_command(&run, config) {
        Ok(command) => command,
        Err(err) => {
            error!(script = ?script, error = %err, "failed to prepare script identity");
            return ScriptOutcome::Captured(ExecutionResult::start_failure(err));
        }
    };

    if run.form.output == OutputMode::Raw {
        return run_streamed(command, run.uploads, script).await;
    }

    let output = command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await;
    drop(run.uploads);
    match output {
        Ok(output) => {
            let exit_code = output.status.code().unwrap_or(-1);
            info!(script = ?script, exit_code, "script finished");
            ScriptOutcome::Captured(ExecutionResult {
                stdout: output.stdout,
                stderr: output.stderr,
                exit_code,
            })
        }
        Err(err) => {
            error!(script = ?script, error = %err, "failed to start script");
            ScriptOutcome::Captured(ExecutionResult::start_failure(err))
        }
    }
}

async fn run_streamed(
    mut command: Command,
    uploads: UploadSet,
    script: std::path::PathBuf,
) -> ScriptOutcome {
    let mut child = match command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(err) => {
            error!(script = ?script, error = %err, "failed to start script");
            return ScriptOutcome::Captured(ExecutionResult::start_failure(err));
        }
    };

    let stderr = child.stderr.take();
    let Some(stdout) = child.stdout.take() else {
        warn!(script = ?script, "script stdout unavailable");
        return ScriptOutcome::Captured(ExecutionResult::start_failure("stdout unavailable"));
    };

    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) => info!(script = ?script, exit_code = status.code().unwrap_or(-1), "script finished"),
            Err(err) => warn!(script = ?script, error = %err, "failed to wait for script"),
        }
        drop(uploads);
    });

    ScriptOutcome::Streamed(stream_response(stdout, stderr).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::form::FieldSource;
    use http_body_util::BodyExt;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};
    use tempfile::{TempDir, tempdir};

    fn script_dir() -> TempDir {
        let temp = tempdir().expect("tempdir");
        std::fs::set_permissions(temp.path(), std::fs::Permissions::from_mode(0o755))
            .expect("chmod dir");
        temp
    }

    fn write_script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("job.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod");
        path
    }

    fn form(script: PathBuf, output: OutputMode) -> FormSchema {
        FormSchema {
            name: "job".into(),
            title: "Job".into(),
            description: String::new(),
            fields: FieldSource::Static(Vec::new()),
            script,
            output,
            hidden: false,
            allowed_users: None,
            run_as: None,
            submit_title: "Submit".into(),
            base_dir: PathBuf::from("/"),
        }
    }

    async fn captured(form: &FormSchema, values: &BTreeMap<String, FormValue>) -> ExecutionResult {
        let run = ScriptRun {
            form,
            values,
            user: Some("admin"),
            uploads: UploadSet::default(),
        };
        match run_script(run, &ExecutorConfig::default()).await {
            ScriptOutcome::Captured(result) => result,
            ScriptOutcome::Streamed(_) => panic!("expected captured output"),
        }
    }

    #[tokio::test]
    async fn captures_output_and_exit_code() {
        let temp = script_dir();
        let script = write_script(temp.path(), "echo stdout\necho boom >&2\nexit 33");
        let result = captured(&form(script, OutputMode::Escaped), &BTreeMap::new()).await;
        assert_eq!(result.exit_code, 33);
        assert_eq!(result.stdout, b"stdout\n");
        assert_eq!(result.stderr, b"boom\n");
    }

    #[tokio::test]
    async fn values_are_passed_through_environment() {
        let temp = script_dir();
        let script = write_script(temp.path(), "echo \"$age $__SF__FORM $__SF__USER\"");
        let values = BTreeMap::from([("age".to_string(), FormValue::Integer(30))]);
        let result = captured(&form(script, OutputMode::Escaped), &values).await;
        assert_eq!(String::from_utf8_lossy(&result.stdout), "30 job admin\n");
    }

    #[tokio::test]
    async fn runs_in_script_directory() {
        let temp = script_dir();
        let script = write_script(temp.path(), "pwd");
        let result = captured(&form(script, OutputMode::Html), &BTreeMap::new()).await;
        let cwd = String::from_utf8_lossy(&result.stdout).trim().to_string();
        let expected = std::fs::canonicalize(temp.path()).expect("canonicalize");
        assert_eq!(std::fs::canonicalize(cwd).expect("canonicalize cwd"), expected);
    }

    #[tokio::test]
    async fn missing_executable_becomes_synthetic_failure() {
        let temp = script_dir();
        let result = captured(
            &form(temp.path().join("gone.sh"), OutputMode::Escaped),
            &BTreeMap::new(),
        )
        .await;
        assert_eq!(result.exit_code, -1);
        assert!(String::from_utf8_lossy(&result.stderr).contains("Internal error"));
    }

    #[tokio::test]
    async fn raw_output_streams_into_response() {
        let temp = script_dir();
        let script = write_script(
            temp.path(),
            "printf 'HTTP/1.0 202 Accepted\\r\\nContent-Type: text/csv\\r\\n\\r\\n'\necho a,b",
        );
        let schema = form(script, OutputMode::Raw);
        let values = BTreeMap::new();
        let run = ScriptRun {
            form: &schema,
            values: &values,
            user: None,
            uploads: UploadSet::default(),
        };
        let ScriptOutcome::Streamed(response) = run_script(run, &ExecutorConfig::default()).await
        else {
            panic!("expected streamed output");
        };
        assert_eq!(response.status(), axum::http::StatusCode::ACCEPTED);
        assert_eq!(response.headers()["content-type"], "text/csv");
        let body = response.into_body().collect().await.expect("body").to_bytes();
        assert_eq!(&body[..], b"a,b\n");
    }

    #[tokio::test]
    async fn raw_output_survives_stderr_flood_before_stdout() {
        let temp = script_dir();
        let script = write_script(
            temp.path(),
            "head -c 200000 /dev/zero | tr '\\0' e >&2\necho done",
        );
        let schema = form(script, OutputMode::Raw);
        let values = BTreeMap::new();
        let run = ScriptRun {
            form: &schema,
            values: &values,
            user: None,
            uploads: UploadSet::default(),
        };

        let body = tokio::time::timeout(std::time::Duration::from_secs(10), async {
            let ScriptOutcome::Streamed(response) =
                run_script(run, &ExecutorConfig::default()).await
            else {
                panic!("expected streamed output");
            };
            response.into_body().collect().await.expect("body").to_bytes()
        })
        .await
        .expect("raw run finished in time");

        assert_eq!(body.len(), 200_000 + b"done\n".len());
        // 200000 stderr bytes plus the one in "done".
        assert_eq!(body.iter().filter(|byte| **byte == b'e').count(), 200_001);
        assert!(body.windows(5).any(|window| window == b"done\n"));
    }
}
