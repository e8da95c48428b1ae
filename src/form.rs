//! 单个表单的模型、访问控制与两轮校验。

use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use crate::field::{
    FieldKind, FieldSchema, FormValue, REQUIRED_MESSAGE, upload_name_key, validate_field,
};
use crate::source::{SourceError, load_json};

/// 脚本输出如何变成 HTTP 响应。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    #[default]
    Escaped,
    Html,
    Raw,
}

#[derive(Clone, Debug)]
pub enum FieldSource {
    Static(Vec<FieldSchema>),
    Command(PathBuf),
}

#[derive(Clone, Debug)]
pub struct FormSchema {
    pub name: String,
    pub title: String,
    pub description: String,
    pub fields: FieldSource,
    pub script: PathBuf,
    pub output: OutputMode,
    pub hidden: bool,
    pub allowed_users: Option<Vec<String>>,
    pub run_as: Option<String>,
    pub submit_title: String,
    /// 相对路径（`options_from`）的解析基准目录。
    pub base_dir: PathBuf,
}

/// 校验结果：`errors` 非空表示拒绝提交，`values` 始终保存尽力转换后的值。
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ValidationResult {
    pub errors: BTreeMap<String, Vec<String>>,
    pub values: BTreeMap<String, FormValue>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// 只保留表单字段（及上传字段的原始文件名），用于传给脚本。
    pub fn field_values(&self, fields: &[FieldSchema]) -> BTreeMap<String, FormValue> {
        let mut selected = BTreeMap::new();
        for field in fields {
            if let Some(value) = self.values.get(&field.name) {
                selected.insert(field.name.clone(), value.clone());
            }
            if field.is_file() {
                let key = upload_name_key(&field.name);
                if let Some(value) = self.values.get(&key) {
                    selected.insert(key, value.clone());
                }
            }
        }
        selected
    }
}

impl FormSchema {
    /// 用户是否在访问列表中；未配置列表时所有人可访问。
    pub fn is_allowed(&self, user: Option<&str>) -> bool {
        match &self.allowed_users {
            None => true,
            Some(allowed) => user.is_some_and(|user| allowed.iter().any(|name| name == user)),
        }
    }

    /// 返回展开后的字段列表（动态字段与动态选项均已求值）。
    pub async fn resolve_fields(&self) -> Result<Vec<FieldSchema>, SourceError> {
        let mut fields = match &self.fields {
            FieldSource::Static(fields) => fields.clone(),
            FieldSource::Command(path) => {
                let fields: Vec<FieldSchema> = load_json(path).await?;
                check_fields(&fields).map_err(|reason| SourceError::Invalid {
                    path: path.clone(),
                    reason,
                })?;
                fields
            }
        };

        for field in &mut fields {
            if let FieldKind::Radio {
                options,
                options_from,
            }
            | FieldKind::Select {
                options,
                options_from,
            } = &mut field.kind
                && let Some(source) = options_from.take()
            {
                let source = resolve_relative(&self.base_dir, &source);
                *options = Some(load_json(&source).await?);
            }
        }
        Ok(fields)
    }
}

/// 两轮校验：先检查必填项，再对其余字段逐一做类型校验；错误全部累积。
pub fn validate_fields(
    fields: &[FieldSchema],
    submitted: &BTreeMap<String, String>,
) -> ValidationResult {
    let mut result = ValidationResult {
        errors: BTreeMap::new(),
        values: submitted
            .iter()
            .map(|(key, value)| (key.clone(), FormValue::Text(value.clone())))
            .collect(),
    };

    for field in fields {
        let missing = submitted
            .get(&field.name)
            .is_none_or(|value| value.is_empty());
        if field.required && missing {
            result
                .errors
                .entry(field.name.clone())
                .or_default()
                .push(REQUIRED_MESSAGE.to_string());
        }
    }

    for field in fields {
        if result.errors.contains_key(&field.name) {
            continue;
        }
        match validate_field(field, submitted) {
            Ok(Some(value)) => {
                result.values.insert(field.name.clone(), value);
            }
            Ok(None) => {}
            Err(err) => {
                result
                    .errors
                    .entry(field.name.clone())
                    .or_default()
                    .push(err.0);
            }
        }
    }

    result
}

/// 字段名在表单内必须唯一，且每个字段定义完整。
pub fn check_fields(fields: &[FieldSchema]) -> Result<(), String> {
    let mut seen = HashSet::new();
    for field in fields {
        field.check()?;
        if !seen.insert(field.name.as_str()) {
            return Err(format!("duplicate field name '{}'", field.name));
        }
    }
    Ok(())
}

pub fn resolve_relative(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::NUMBER_MESSAGE;
    use serde_json::json;

    fn fields(value: serde_json::Value) -> Vec<FieldSchema> {
        serde_json::from_value(value).expect("fields")
    }

    fn submit(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    fn form(allowed_users: Option<Vec<String>>) -> FormSchema {
        FormSchema {
            name: "f".into(),
            title: "F".into(),
            description: String::new(),
            fields: FieldSource::Static(Vec::new()),
            script: PathBuf::from("/bin/true"),
            output: OutputMode::Escaped,
            hidden: false,
            allowed_users,
            run_as: None,
            submit_title: "Submit".into(),
            base_dir: PathBuf::from("/"),
        }
    }

    #[test]
    fn missing_required_field_skips_type_validation() {
        let fields = fields(json!([
            {"name": "age", "title": "Age", "type": "integer", "required": true}
        ]));
        let result = validate_fields(&fields, &submit(&[("age", "")]));
        assert_eq!(result.errors["age"], vec![REQUIRED_MESSAGE.to_string()]);
    }

    #[test]
    fn errors_accumulate_across_fields() {
        let fields = fields(json!([
            {"name": "age", "title": "Age", "type": "integer"},
            {"name": "name", "title": "Name", "type": "string", "required": true},
            {"name": "nick", "title": "Nick", "type": "string", "maxlen": 2}
        ]));
        let result = validate_fields(&fields, &submit(&[("age", "x"), ("nick", "abc")]));
        assert_eq!(result.errors.len(), 3);
        assert_eq!(result.errors["age"], vec![NUMBER_MESSAGE.to_string()]);
        assert!(!result.is_valid());
    }

    #[test]
    fn validated_values_replace_raw_values() {
        let fields = fields(json!([
            {"name": "age", "title": "Age", "type": "integer", "min": 18, "max": 65},
            {"name": "note", "title": "Note", "type": "string"}
        ]));
        let result = validate_fields(&fields, &submit(&[("age", "30"), ("note", "")]));
        assert!(result.is_valid());
        assert_eq!(result.values["age"], FormValue::Integer(30));
        assert_eq!(result.values["note"], FormValue::Text(String::new()));
    }

    #[test]
    fn validation_is_idempotent() {
        let fields = fields(json!([
            {"name": "age", "title": "Age", "type": "integer", "min": 18},
            {"name": "when", "title": "When", "type": "date"}
        ]));
        let input = submit(&[("age", "3"), ("when", "2024-05-01")]);
        assert_eq!(validate_fields(&fields, &input), validate_fields(&fields, &input));
    }

    #[test]
    fn field_values_drop_unknown_keys() {
        let fields = fields(json!([
            {"name": "doc", "title": "Doc", "type": "file"}
        ]));
        let result = validate_fields(
            &fields,
            &submit(&[("doc", "/tmp/a"), ("doc__name", "a.txt"), ("PATH", "/evil")]),
        );
        let selected = result.field_values(&fields);
        assert_eq!(selected.len(), 2);
        assert!(!selected.contains_key("PATH"));
    }

    #[test]
    fn allow_list_requires_listed_user() {
        let open = form(None);
        assert!(open.is_allowed(None));
        let restricted = form(Some(vec!["admin".into()]));
        assert!(restricted.is_allowed(Some("admin")));
        assert!(!restricted.is_allowed(Some("user")));
        assert!(!restricted.is_allowed(None));
    }

    #[test]
    fn duplicate_field_names_are_rejected() {
        let fields = fields(json!([
            {"name": "a", "title": "A", "type": "string"},
            {"name": "a", "title": "A2", "type": "integer"}
        ]));
        assert!(check_fields(&fields).is_err());
    }

    #[tokio::test]
    async fn options_from_file_are_resolved_relative_to_base_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::write(temp.path().join("colors.json"), r#"[["r", "Red"]]"#).expect("write");
        let mut schema = form(None);
        schema.base_dir = temp.path().to_path_buf();
        schema.fields = FieldSource::Static(fields(json!([
            {"name": "c", "title": "C", "type": "radio", "options_from": "colors.json"}
        ])));

        let resolved = schema.resolve_fields().await.expect("resolve");
        assert_eq!(resolved[0].options(), &[("r".to_string(), "Red".to_string())]);
        let result = validate_fields(&resolved, &submit(&[("c", "r")]));
        assert!(result.is_valid());
    }
}
