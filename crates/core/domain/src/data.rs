use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// 标签取值（字符串或数值）。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagValue {
    Number(f64),
    Text(String),
}

impl fmt::Display for TagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagValue::Number(v) => write!(f, "{}", v),
            TagValue::Text(v) => write!(f, "{}", v),
        }
    }
}

impl From<&str> for TagValue {
    fn from(value: &str) -> Self {
        TagValue::Text(value.to_string())
    }
}

impl From<String> for TagValue {
    fn from(value: String) -> Self {
        TagValue::Text(value)
    }
}

impl From<f64> for TagValue {
    fn from(value: f64) -> Self {
        TagValue::Number(value)
    }
}

impl From<i64> for TagValue {
    fn from(value: i64) -> Self {
        TagValue::Number(value as f64)
    }
}

/// 字段取值（数值、文本或布尔）。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Number(f64),
    Bool(bool),
    Text(String),
}

impl FieldValue {
    /// 仅数值字段参与聚合。
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Number(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(v) => Some(v.as_str()),
            _ => None,
        }
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Number(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

/// 时序点：写入后不可变，只会被追加或淘汰。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// 时间戳（毫秒）
    pub timestamp_ms: i64,
    /// 标识序列的标签（deviceId、sensorType、machineId 等）
    pub tags: BTreeMap<String, TagValue>,
    /// 负载字段（value、unit、quality 等）
    pub fields: BTreeMap<String, FieldValue>,
}

impl Point {
    pub fn new(timestamp_ms: i64) -> Self {
        Self {
            timestamp_ms,
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
        }
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<TagValue>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// 可选字段：`None` 时不写入。
    pub fn field_opt(self, key: impl Into<String>, value: Option<impl Into<FieldValue>>) -> Self {
        match value {
            Some(value) => self.field(key, value),
            None => self,
        }
    }

    /// 数值字段读取。
    pub fn number(&self, key: &str) -> Option<f64> {
        self.fields.get(key).and_then(FieldValue::as_f64)
    }

    /// 标签等值匹配；数值标签与其文本形式等价（`7` 与 `"7"`）。
    pub fn tag_matches(&self, key: &str, expected: &TagValue) -> bool {
        match self.tags.get(key) {
            Some(actual) if actual == expected => true,
            Some(actual) => actual.to_string() == expected.to_string(),
            None => false,
        }
    }
}

/// 获取当前时间戳（毫秒）
pub fn now_epoch_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
