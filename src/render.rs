//! HTML 页面渲染：表单列表、表单（含错误回显）与脚本结果。

use std::collections::BTreeMap;
use std::fmt::{Display, Write};

use crate::executor::ExecutionResult;
use crate::field::{DATE_FORMAT, DateBound, FieldKind, FieldSchema, FormValue};
use crate::form::{FormSchema, OutputMode};
use crate::registry::Registry;

const BASE_STYLE: &str = r#"
    .btn { color: #FFFFFF; font-weight: bold; font-size: 0.9em; background-color: #1D98E4;
           padding: 9px; border-radius: 4px; border-width: 0px; text-decoration: none; }
    .btn-lnk { background-color: #B0B0B0; }
    .error { color: #FF0000; }
    *, body { font-family: sans-serif; }
    h1 { color: #555555; text-align: center; margin: 32px auto; }
    pre { font-family: monospace; }
    div.list, div.form, div.result { width: 50%; margin: 40px auto 0px auto; }
    div.list li { list-style: none; margin-bottom: 65px; }
    div.list h2, div.form h2, div.result h2 { background-color: #E0E5E5; border-radius: 3px;
           padding: 10px; font-size: 1.2em; }
    div.form li { list-style: none; font-size: 0.9em; }
    div.form li.hidden { display: none; }
    div.form p.form-field-title { font-weight: bold; margin-bottom: 3px; }
    div.form li.checkbox p { display: inline; }
    div.form li.submit { margin-top: 40px; }
    div.result ul.nav li { display: inline; margin-right: 10px; }
    div.about { text-align: center; font-size: 0.8em; color: #999999; margin-top: 80px; }
"#;

pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

fn url_encode(input: &str) -> String {
    url::form_urlencoded::byte_serialize(input.as_bytes()).collect()
}

fn page(registry: &Registry, body: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
  <meta charset="UTF-8">
  <title>{title}</title>
  <style>{BASE_STYLE}{custom}</style>
</head>
<body>
  <h1>{title}</h1>
  <div class="page">
{body}
    <div class="about">Powered by formrun v{version}</div>
  </div>
</body>
</html>
"#,
        title = escape_html(&registry.title),
        custom = registry.custom_css.as_deref().unwrap_or(""),
        version = crate::build::PKG_VERSION,
    )
}

/// 表单列表页。
pub fn list_page(registry: &Registry, forms: &[&FormSchema]) -> String {
    let mut items = String::new();
    for form in forms {
        let _ = write!(
            items,
            r#"
  <li>
    <h2 class="form-title">{title}</h2>
    <p class="form-description">{description}</p>
    <a class="form-link btn" href="./form?form_name={link}">{title}</a>
  </li>"#,
            title = escape_html(&form.title),
            description = escape_html(&form.description),
            link = url_encode(&form.name),
        );
    }
    page(
        registry,
        &format!("<div class=\"list\">\n  <ul>{items}\n  </ul>\n</div>"),
    )
}

/// 表单页；`values`/`errors` 用于校验失败后的回显。
pub fn form_page(
    registry: &Registry,
    form: &FormSchema,
    fields: &[FieldSchema],
    values: &BTreeMap<String, FormValue>,
    errors: &BTreeMap<String, Vec<String>>,
) -> String {
    let mut lines = String::new();
    for field in fields {
        let value = values.get(&field.name).map(ToString::to_string);
        let field_errors = errors.get(&field.name).map(Vec::as_slice).unwrap_or(&[]);
        lines.push_str(&render_line(field, value.as_deref(), field_errors));
    }

    let body = format!(
        r#"<div class="form">
  <h2 class="form-title">{title}</h2>
  <p class="form-description">{description}</p>
  <form id="{name}" action="submit" method="post" enctype="multipart/form-data">
    <input type="hidden" name="form_name" value="{name}" />
    <ul>{lines}
      <li class="submit">
        <input type="submit" class="btn" value="{submit_title}" />
        <a class="btn btn-lnk" href=".">Back to the list</a>
      </li>
    </ul>
  </form>
</div>"#,
        title = escape_html(&form.title),
        description = escape_html(&form.description),
        name = escape_html(&form.name),
        submit_title = escape_html(&form.submit_title),
    );
    page(registry, &body)
}

/// 脚本结果页。
pub fn result_page(registry: &Registry, form: &FormSchema, result: &ExecutionResult) -> String {
    let message = if result.exit_code != 0 {
        format!(
            r#"<span class="error">{}</span>"#,
            escape_html(&String::from_utf8_lossy(&result.stderr))
        )
    } else {
        let stdout = String::from_utf8_lossy(&result.stdout);
        match form.output {
            OutputMode::Html => stdout.into_owned(),
            OutputMode::Escaped | OutputMode::Raw => format!("<pre>{}</pre>", escape_html(&stdout)),
        }
    };

    let body = format!(
        r#"<div class="result">
  <h2 class="result-title">{title}</h2>
  <h3 class="result-subtitle">Result</h3>
  <div class="result-result">{message}</div>
  <ul class="nav">
    <li><a class="back-form btn btn-lnk" href="form?form_name={link}">Back to the form</a></li>
    <li><a class="btn btn-lnk" href=".">Back to the list</a></li>
  </ul>
</div>"#,
        title = escape_html(&form.title),
        link = url_encode(&form.name),
    );
    page(registry, &body)
}

fn render_line(field: &FieldSchema, value: Option<&str>, errors: &[String]) -> String {
    let mut classes = vec![field.kind.type_name()];
    if field.hidden {
        classes.push("hidden");
    }
    if field.required {
        classes.push("required");
    }
    classes.extend(field.classes.split_whitespace());
    let classes = escape_html(&classes.join(" "));

    let mut input = render_input(field, value, &classes);
    if field.required {
        input.push_str(r#" <abbr title="This field is required" class="required">&bull;</abbr>"#);
    }
    let title = escape_html(&field.title);
    let errors = escape_html(&errors.join(", "));

    if matches!(field.kind, FieldKind::Checkbox { .. }) {
        format!(
            r#"
      <li class="{classes}">
        <p class="form-field-input">{input} <p class="form-field-title">{title}</p>
        <span class="error">{errors}</span></p>
      </li>"#
        )
    } else {
        format!(
            r#"
      <li class="{classes}">
        <p class="form-field-title">{title}</p>
        <p class="form-field-input">{input}
        <span class="error">{errors}</span></p>
      </li>"#
        )
    }
}

fn attr<T: Display>(name: &str, value: Option<T>) -> String {
    match value {
        Some(value) => format!(r#" {name}="{}""#, escape_html(&value.to_string())),
        None => String::new(),
    }
}

fn date_text(bound: Option<DateBound>) -> Option<String> {
    bound.map(|bound| bound.resolve().format(DATE_FORMAT).to_string())
}

fn render_input(field: &FieldSchema, submitted: Option<&str>, classes: &str) -> String {
    let name = escape_html(&field.name);
    let style = escape_html(&field.style);
    let required = if field.required { " required" } else { "" };
    let current = submitted
        .map(str::to_string)
        .or_else(|| field.default_value.clone())
        .unwrap_or_default();
    let value = escape_html(&current);
    let common = format!(r#"name="{name}" class="{classes}" style="{style}""#);

    match &field.kind {
        FieldKind::String {
            minlen,
            maxlen,
            size,
        } => format!(
            r#"<input type="text" {common} value="{value}"{}{}{}{required} />"#,
            attr("minlength", *minlen),
            attr("maxlength", *maxlen),
            attr("size", *size),
        ),
        FieldKind::Text {
            minlen,
            maxlen,
            rows,
            cols,
        } => format!(
            r#"<textarea {common}{}{}{}{}{required}>{value}</textarea>"#,
            attr("rows", Some(rows.unwrap_or(4))),
            attr("cols", Some(cols.unwrap_or(80))),
            attr("minlength", *minlen),
            attr("maxlength", *maxlen),
        ),
        FieldKind::Password { minlen, maxlen } => format!(
            r#"<input type="password" {common} value=""{}{}{required} />"#,
            attr("minlength", *minlen),
            attr("maxlength", *maxlen),
        ),
        FieldKind::Integer { min, max } => format!(
            r#"<input type="number" {common} value="{value}"{}{}{required} />"#,
            attr("min", *min),
            attr("max", *max),
        ),
        FieldKind::Float { min, max } => format!(
            r#"<input type="number" step="any" {common} value="{value}"{}{}{required} />"#,
            attr("min", *min),
            attr("max", *max),
        ),
        FieldKind::Date { min, max } => {
            let value = if current == "today" {
                DateBound::Today.resolve().format(DATE_FORMAT).to_string()
            } else {
                value
            };
            format!(
                r#"<input type="date" {common} value="{value}"{}{}{required} />"#,
                attr("min", date_text(*min)),
                attr("max", date_text(*max)),
            )
        }
        FieldKind::File { extensions } => format!(
            r#"<input type="file" {common}{}{required} />"#,
            attr(
                "accept",
                extensions.as_ref().map(|exts| exts
                    .iter()
                    .map(|ext| format!(".{ext}"))
                    .collect::<Vec<_>>()
                    .join(","))
            ),
        ),
        FieldKind::Radio { .. } => {
            let options = field.options();
            let selected = if current.is_empty() {
                options.first().map(|(option, _)| option.as_str()).unwrap_or("")
            } else {
                current.as_str()
            };
            options
                .iter()
                .map(|(option, label)| {
                    let checked = if option == selected { " checked" } else { "" };
                    format!(
                        r#"<input type="radio" {common} value="{}"{checked}>{}<br/>"#,
                        escape_html(option),
                        escape_html(label),
                    )
                })
                .collect()
        }
        FieldKind::Select { .. } => {
            let options: String = field
                .options()
                .iter()
                .map(|(option, label)| {
                    let selected = if *option == current { " selected" } else { "" };
                    format!(
                        r#"<option value="{}"{selected}>{}</option>"#,
                        escape_html(option),
                        escape_html(label),
                    )
                })
                .collect();
            format!(r#"<select {common}>{options}</select>"#)
        }
        FieldKind::Checkbox { checked } => {
            let checked = match submitted {
                Some(value) => value == "on",
                None => *checked,
            };
            let checked = if checked { " checked" } else { "" };
            format!(r#"<input type="checkbox" {common} value="on"{checked} />"#)
        }
    }
}
