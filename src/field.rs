//! 字段定义与按字段类型分派的取值校验。

use chrono::{Local, NaiveDate};
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const REQUIRED_MESSAGE: &str = "This field is required";
pub const NUMBER_MESSAGE: &str = "Value must be a number";
pub const OPTION_MESSAGE: &str = "Value is an invalid option";

/// 表单中的单个字段定义，加载后不可变。
#[derive(Clone, Debug, Deserialize)]
pub struct FieldSchema {
    pub name: String,
    pub title: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub classes: String,
    #[serde(default)]
    pub style: String,
    #[serde(default, deserialize_with = "scalar_as_string")]
    pub default_value: Option<String>,
    #[serde(flatten)]
    pub kind: FieldKind,
}

/// 字段类型及其类型相关的约束。
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FieldKind {
    String {
        minlen: Option<usize>,
        maxlen: Option<usize>,
        size: Option<u32>,
    },
    Text {
        minlen: Option<usize>,
        maxlen: Option<usize>,
        rows: Option<u32>,
        cols: Option<u32>,
    },
    Password {
        minlen: Option<usize>,
        maxlen: Option<usize>,
    },
    Integer {
        min: Option<i64>,
        max: Option<i64>,
    },
    Float {
        min: Option<f64>,
        max: Option<f64>,
    },
    Date {
        min: Option<DateBound>,
        max: Option<DateBound>,
    },
    Radio {
        options: Option<Vec<(String, String)>>,
        options_from: Option<PathBuf>,
    },
    Select {
        options: Option<Vec<(String, String)>>,
        options_from: Option<PathBuf>,
    },
    Checkbox {
        #[serde(default)]
        checked: bool,
    },
    File {
        extensions: Option<Vec<String>>,
    },
}

impl FieldKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            FieldKind::String { .. } => "string",
            FieldKind::Text { .. } => "text",
            FieldKind::Password { .. } => "password",
            FieldKind::Integer { .. } => "integer",
            FieldKind::Float { .. } => "float",
            FieldKind::Date { .. } => "date",
            FieldKind::Radio { .. } => "radio",
            FieldKind::Select { .. } => "select",
            FieldKind::Checkbox { .. } => "checkbox",
            FieldKind::File { .. } => "file",
        }
    }
}

impl FieldSchema {
    /// 检查字段定义本身是否完整。
    pub fn check(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err(format!("field '{}' has an empty name", self.title));
        }
        match &self.kind {
            FieldKind::Radio {
                options,
                options_from,
            }
            | FieldKind::Select {
                options,
                options_from,
            } => {
                if options.is_none() && options_from.is_none() {
                    return Err(format!(
                        "field '{}' needs either 'options' or 'options_from'",
                        self.name
                    ));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// 静态选项列表；`options_from` 需在调用前展开。
    pub fn options(&self) -> &[(String, String)] {
        match &self.kind {
            FieldKind::Radio { options, .. } | FieldKind::Select { options, .. } => {
                options.as_deref().unwrap_or(&[])
            }
            _ => &[],
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self.kind, FieldKind::File { .. })
    }

    pub fn is_password(&self) -> bool {
        matches!(self.kind, FieldKind::Password { .. })
    }
}

/// 上传字段对应的原始文件名键。
pub fn upload_name_key(field_name: &str) -> String {
    format!("{field_name}__name")
}

/// 日期上下限，支持字面量 `today`。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DateBound {
    Today,
    Fixed(NaiveDate),
}

impl DateBound {
    pub fn resolve(self) -> NaiveDate {
        match self {
            DateBound::Today => Local::now().date_naive(),
            DateBound::Fixed(date) => date,
        }
    }
}

impl<'de> Deserialize<'de> for DateBound {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        if raw == "today" {
            return Ok(DateBound::Today);
        }
        NaiveDate::parse_from_str(&raw, DATE_FORMAT)
            .map(DateBound::Fixed)
            .map_err(|_| serde::de::Error::custom(format!("invalid date bound '{raw}'")))
    }
}

fn scalar_as_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(text)) => Some(text),
        Some(other) => Some(other.to_string()),
    })
}

/// 校验成功后的类型化取值。
#[derive(Clone, Debug, PartialEq)]
pub enum FormValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Date(NaiveDate),
}

impl fmt::Display for FormValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormValue::Text(text) => f.write_str(text),
            FormValue::Integer(value) => write!(f, "{value}"),
            FormValue::Float(value) => write!(f, "{value}"),
            FormValue::Date(date) => write!(f, "{}", date.format(DATE_FORMAT)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ValidationError(pub String);

impl ValidationError {
    fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// 按字段类型校验提交值。
///
/// 返回 `Ok(None)` 表示没有可替换的值（例如非必填字段留空），调用方保留原始值。
pub fn validate_field(
    field: &FieldSchema,
    submitted: &BTreeMap<String, String>,
) -> Result<Option<FormValue>, ValidationError> {
    let raw = submitted.get(&field.name).map(String::as_str);
    match &field.kind {
        FieldKind::String { minlen, maxlen, .. }
        | FieldKind::Text { minlen, maxlen, .. }
        | FieldKind::Password { minlen, maxlen } => {
            validate_length(field, raw.unwrap_or(""), *minlen, *maxlen)
        }
        FieldKind::Integer { min, max } => {
            let value = raw.unwrap_or("");
            if value.is_empty() && !field.required {
                return Ok(None);
            }
            let number = value
                .trim()
                .parse::<i64>()
                .map_err(|_| ValidationError::new(NUMBER_MESSAGE))?;
            check_bounds(number, *min, *max)?;
            Ok(Some(FormValue::Integer(number)))
        }
        FieldKind::Float { min, max } => {
            let value = raw.unwrap_or("");
            if value.is_empty() && !field.required {
                return Ok(None);
            }
            let number = value
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|number| number.is_finite())
                .ok_or_else(|| ValidationError::new(NUMBER_MESSAGE))?;
            check_bounds(number, *min, *max)?;
            Ok(Some(FormValue::Float(number)))
        }
        FieldKind::Date { min, max } => {
            let value = raw.unwrap_or("");
            if value.is_empty() && !field.required {
                return Ok(None);
            }
            let date = NaiveDate::parse_from_str(value.trim(), DATE_FORMAT).map_err(|_| {
                ValidationError::new("Invalid date, must be in form YYYY-MM-DD")
            })?;
            check_bounds(
                date,
                min.map(DateBound::resolve),
                max.map(DateBound::resolve),
            )?;
            Ok(Some(FormValue::Date(date)))
        }
        FieldKind::Radio { .. } | FieldKind::Select { .. } => {
            let value = raw.unwrap_or("");
            if value.is_empty() && !field.required {
                return Ok(None);
            }
            if field.options().iter().any(|(option, _)| option == value) {
                Ok(Some(FormValue::Text(value.to_string())))
            } else {
                Err(ValidationError::new(OPTION_MESSAGE))
            }
        }
        FieldKind::Checkbox { .. } => match raw.unwrap_or("off") {
            value @ ("on" | "off") => Ok(Some(FormValue::Text(value.to_string()))),
            _ => Err(ValidationError::new("Invalid value for checkbox")),
        },
        FieldKind::File { extensions } => {
            let Some(path) = raw.filter(|value| !value.is_empty()) else {
                if field.required {
                    return Err(ValidationError::new("Invalid file upload"));
                }
                return Ok(None);
            };
            let original = submitted
                .get(&upload_name_key(&field.name))
                .ok_or_else(|| ValidationError::new("Invalid file upload"))?;
            if let Some(allowed) = extensions {
                let extension = Path::new(original)
                    .extension()
                    .map(|ext| ext.to_string_lossy().into_owned())
                    .unwrap_or_default();
                if !allowed.iter().any(|allowed| *allowed == extension) {
                    return Err(ValidationError(format!(
                        "Only file types allowed: {}",
                        allowed.join(",")
                    )));
                }
            }
            Ok(Some(FormValue::Text(path.to_string())))
        }
    }
}

fn validate_length(
    field: &FieldSchema,
    value: &str,
    minlen: Option<usize>,
    maxlen: Option<usize>,
) -> Result<Option<FormValue>, ValidationError> {
    if value.is_empty() && !field.required {
        return Ok(None);
    }
    let length = value.chars().count();
    if let Some(minlen) = minlen
        && length < minlen
    {
        return Err(ValidationError(format!("Minimum length is {minlen}")));
    }
    if let Some(maxlen) = maxlen
        && length > maxlen
    {
        return Err(ValidationError(format!("Maximum length is {maxlen}")));
    }
    Ok(Some(FormValue::Text(value.to_string())))
}

fn check_bounds<T>(value: T, min: Option<T>, max: Option<T>) -> Result<(), ValidationError>
where
    T: PartialOrd + BoundDisplay,
{
    if let Some(min) = min
        && value < min
    {
        return Err(ValidationError(format!("Minimum value is {}", min.show())));
    }
    if let Some(max) = max
        && value > max
    {
        return Err(ValidationError(format!("Maximum value is {}", max.show())));
    }
    Ok(())
}

trait BoundDisplay {
    fn show(&self) -> String;
}

impl BoundDisplay for i64 {
    fn show(&self) -> String {
        self.to_string()
    }
}

impl BoundDisplay for f64 {
    fn show(&self) -> String {
        self.to_string()
    }
}

impl BoundDisplay for NaiveDate {
    fn show(&self) -> String {
        self.format(DATE_FORMAT).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn field(value: serde_json::Value) -> FieldSchema {
        serde_json::from_value(value).expect("field schema")
    }

    fn submit(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn string_length_bounds_are_inclusive() {
        let name = field(json!({"name": "n", "title": "N", "type": "string", "minlen": 2, "maxlen": 4}));
        assert!(validate_field(&name, &submit(&[("n", "ab")])).is_ok());
        assert!(validate_field(&name, &submit(&[("n", "abcd")])).is_ok());
        assert_eq!(
            validate_field(&name, &submit(&[("n", "a")])),
            Err(ValidationError("Minimum length is 2".into()))
        );
        assert_eq!(
            validate_field(&name, &submit(&[("n", "abcde")])),
            Err(ValidationError("Maximum length is 4".into()))
        );
    }

    #[test]
    fn length_counts_characters_not_bytes() {
        let name = field(json!({"name": "n", "title": "N", "type": "text", "maxlen": 3}));
        assert!(validate_field(&name, &submit(&[("n", "äöü")])).is_ok());
    }

    #[test]
    fn optional_empty_string_yields_no_value() {
        let name = field(json!({"name": "n", "title": "N", "type": "string", "minlen": 3}));
        assert_eq!(validate_field(&name, &submit(&[("n", "")])), Ok(None));
    }

    #[test]
    fn integer_scenario_bounds() {
        let age = field(json!({"name": "age", "title": "Age", "type": "integer", "min": 18, "max": 65}));
        let low = validate_field(&age, &submit(&[("age", "17")])).unwrap_err();
        assert!(low.0.contains("Minimum"));
        let high = validate_field(&age, &submit(&[("age", "70")])).unwrap_err();
        assert!(high.0.contains("Maximum"));
        assert_eq!(
            validate_field(&age, &submit(&[("age", "30")])),
            Ok(Some(FormValue::Integer(30)))
        );
    }

    #[test]
    fn non_numeric_input_skips_bounds() {
        let ratio = field(json!({"name": "r", "title": "R", "type": "float", "min": 1.5}));
        assert_eq!(
            validate_field(&ratio, &submit(&[("r", "abc")])),
            Err(ValidationError(NUMBER_MESSAGE.into()))
        );
        assert_eq!(
            validate_field(&ratio, &submit(&[("r", "NaN")])),
            Err(ValidationError(NUMBER_MESSAGE.into()))
        );
        assert_eq!(
            validate_field(&ratio, &submit(&[("r", "2.5")])),
            Ok(Some(FormValue::Float(2.5)))
        );
    }

    #[test]
    fn dates_compare_as_dates() {
        let day = field(json!({"name": "d", "title": "D", "type": "date", "min": "2024-02-01", "max": "2024-12-31"}));
        assert!(validate_field(&day, &submit(&[("d", "2024-10-05")])).is_ok());
        let early = validate_field(&day, &submit(&[("d", "2024-01-31")])).unwrap_err();
        assert_eq!(early.0, "Minimum value is 2024-02-01");
        let bad = validate_field(&day, &submit(&[("d", "05/10/2024")])).unwrap_err();
        assert!(bad.0.contains("YYYY-MM-DD"));
    }

    #[test]
    fn malformed_date_bound_fails_to_load() {
        let result = serde_json::from_value::<FieldSchema>(
            json!({"name": "d", "title": "D", "type": "date", "min": "tomorrow"}),
        );
        assert!(result.is_err());
    }

    #[test]
    fn select_requires_known_option() {
        let color = field(json!({
            "name": "c", "title": "C", "type": "select", "required": true,
            "options": [["r", "Red"], ["g", "Green"]]
        }));
        assert!(validate_field(&color, &submit(&[("c", "g")])).is_ok());
        assert_eq!(
            validate_field(&color, &submit(&[("c", "b")])),
            Err(ValidationError(OPTION_MESSAGE.into()))
        );
    }

    #[test]
    fn checkbox_defaults_to_off() {
        let agree = field(json!({"name": "a", "title": "A", "type": "checkbox"}));
        assert_eq!(
            validate_field(&agree, &submit(&[])),
            Ok(Some(FormValue::Text("off".into())))
        );
        assert!(validate_field(&agree, &submit(&[("a", "yes")])).is_err());
    }

    #[test]
    fn file_extension_is_case_sensitive() {
        let upload = field(json!({"name": "f", "title": "F", "type": "file", "extensions": ["csv"]}));
        let ok = submit(&[("f", "/tmp/x"), ("f__name", "data.csv")]);
        assert!(validate_field(&upload, &ok).is_ok());
        let upper = submit(&[("f", "/tmp/x"), ("f__name", "data.CSV")]);
        assert!(validate_field(&upload, &upper).is_err());
        assert_eq!(validate_field(&upload, &submit(&[])), Ok(None));
    }

    #[test]
    fn radio_without_options_is_rejected_at_load() {
        let radio = field(json!({"name": "r", "title": "R", "type": "radio"}));
        assert!(radio.check().is_err());
    }
}
