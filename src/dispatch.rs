//! 请求分发：路由表、认证、表单展示/提交与静态资源。

use axum::Router;
use axum::body::Body as AxumBody;
use axum::extract::{Extension, FromRequest, Multipart};
use axum::http::{Method, Request};
use axum::response::{Html, IntoResponse, Response};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

use crate::assets::serve_asset;
use crate::auth::{AuthConfig, authenticate};
use crate::error::ApiError;
use crate::executor::{ExecutorConfig, ScriptOutcome, ScriptRun, run_script};
use crate::field::{FieldSchema, FormValue};
use crate::form::{FormSchema, validate_fields};
use crate::http::parse_query;
use crate::logging::AUDIT_TARGET;
use crate::registry::{Registry, RegistrySource};
use crate::render;
use crate::upload::{UploadConfig, collect_submission};

const MASKED_VALUE: &str = "********";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Route {
    Index,
    Form,
    Submit,
    Static,
}

impl Route {
    fn from_path(path: &str) -> Option<Self> {
        match path.trim_matches('/') {
            "" => Some(Route::Index),
            "form" => Some(Route::Form),
            "submit" => Some(Route::Submit),
            "static" => Some(Route::Static),
            _ => None,
        }
    }

    fn accepts(self, method: &Method) -> bool {
        match self {
            Route::Submit => method == Method::POST,
            Route::Index | Route::Form | Route::Static => {
                method == Method::GET || method == Method::HEAD
            }
        }
    }
}

/// 组装路由；所有路径都经由同一个分发函数。
pub fn router(
    source: Arc<RegistrySource>,
    auth: Arc<AuthConfig>,
    executor: Arc<ExecutorConfig>,
    uploads: Arc<UploadConfig>,
) -> Router {
    Router::new()
        .fallback(dispatch)
        .layer(Extension(source))
        .layer(Extension(auth))
        .layer(Extension(executor))
        .layer(Extension(uploads))
}

async fn dispatch(
    Extension(source): Extension<Arc<RegistrySource>>,
    Extension(auth): Extension<Arc<AuthConfig>>,
    Extension(executor): Extension<Arc<ExecutorConfig>>,
    Extension(uploads): Extension<Arc<UploadConfig>>,
    request: Request<AxumBody>,
) -> Result<Response, ApiError> {
    let route = Route::from_path(request.uri().path())
        .ok_or_else(|| ApiError::NotFound("Not found".into()))?;
    if !route.accepts(request.method()) {
        return Err(ApiError::MethodNotAllowed);
    }

    let registry = source.current().await?;
    let user = authenticate(request.headers(), &registry, &auth)?;
    let user = user.as_deref();
    let params = parse_query(request.uri().query());

    match route {
        Route::Index => index(&registry, user).await,
        Route::Form => {
            let name = required_param(&params, "form_name")?;
            let form = find_form(&registry, name, user)?;
            show_form(&registry, form, &BTreeMap::new(), &BTreeMap::new()).await
        }
        Route::Submit => submit(request, &registry, user, &executor, &uploads).await,
        Route::Static => {
            let fname = required_param(&params, "fname")?;
            serve_asset(registry.static_dir.as_deref(), fname).await
        }
    }
}

fn required_param<'a>(params: &'a HashMap<String, String>, key: &str) -> Result<&'a str, ApiError> {
    params
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| ApiError::BadRequest(format!("Missing parameter: {key}")))
}

fn find_form<'a>(
    registry: &'a Registry,
    name: &str,
    user: Option<&str>,
) -> Result<&'a FormSchema, ApiError> {
    let form = registry
        .form(name)
        .ok_or_else(|| ApiError::NotFound(format!("No such form: {name}")))?;
    if !form.is_allowed(user) {
        return Err(ApiError::Forbidden("Not allowed to access this form".into()));
    }
    Ok(form)
}

async fn index(registry: &Registry, user: Option<&str>) -> Result<Response, ApiError> {
    let forms = registry.visible_forms(user);
    if let [form] = forms.as_slice() {
        return show_form(registry, form, &BTreeMap::new(), &BTreeMap::new()).await;
    }
    Ok(Html(render::list_page(registry, &forms)).into_response())
}

async fn show_form(
    registry: &Registry,
    form: &FormSchema,
    values: &BTreeMap<String, FormValue>,
    errors: &BTreeMap<String, Vec<String>>,
) -> Result<Response, ApiError> {
    let fields = form.resolve_fields().await?;
    Ok(Html(render::form_page(registry, form, &fields, values, errors)).into_response())
}

async fn submit(
    request: Request<AxumBody>,
    registry: &Registry,
    user: Option<&str>,
    executor: &ExecutorConfig,
    uploads: &UploadConfig,
) -> Result<Response, ApiError> {
    let multipart = Multipart::from_request(request, &())
        .await
        .map_err(|err| ApiError::BadRequest(err.body_text()))?;
    let mut submission = collect_submission(multipart, uploads).await?;

    let name = submission
        .form_name()
        .ok_or_else(|| ApiError::BadRequest("Missing parameter: form_name".into()))?
        .to_string();
    let form = find_form(registry, &name, user)?;
    let fields = form.resolve_fields().await?;
    submission.retain_uploads_for(&fields);
    submission.values.remove("form_name");

    let result = validate_fields(&fields, &submission.values);
    if !result.is_valid() {
        debug!(form = %form.name, errors = result.errors.len(), "submission rejected");
        return Ok(Html(render::form_page(
            registry,
            form,
            &fields,
            &result.values,
            &result.errors,
        ))
        .into_response());
    }

    let values = result.field_values(&fields);
    audit(form, &fields, &values, user, submission.uploads.len());
    let run = ScriptRun {
        form,
        values: &values,
        user,
        uploads: submission.uploads,
    };
    match run_script(run, executor).await {
        ScriptOutcome::Captured(result) => {
            Ok(Html(render::result_page(registry, form, &result)).into_response())
        }
        ScriptOutcome::Streamed(response) => Ok(response),
    }
}

fn audit(
    form: &FormSchema,
    fields: &[FieldSchema],
    values: &BTreeMap<String, FormValue>,
    user: Option<&str>,
    uploads: usize,
) {
    let masked = masked_values(fields, values);
    info!(
        target: AUDIT_TARGET,
        form = %form.name,
        script = ?form.script,
        cwd = ?form.script.parent(),
        user = user.unwrap_or("-"),
        values = ?masked,
        uploads,
        "running form script"
    );
}

fn masked_values(
    fields: &[FieldSchema],
    values: &BTreeMap<String, FormValue>,
) -> BTreeMap<String, String> {
    values
        .iter()
        .map(|(key, value)| {
            let secret = fields
                .iter()
                .any(|field| field.name == *key && field.is_password());
            let shown = if secret {
                MASKED_VALUE.to_string()
            } else {
                value.to_string()
            };
            (key.clone(), shown)
        })
        .collect()
}
