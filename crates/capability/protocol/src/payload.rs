//! 报文解析
//!
//! 支持的报文格式：
//! - 纯数值：`23.5`
//! - 布尔：`true` / `false`（映射为 1 / 0）
//! - JSON：`{"value": 23.5, "unit": "°C", "quality": "good", "timestamp": 1700000000000}`
//! - key=value：`temp=23.5`

use crate::error::ProtocolError;
use serde_json::Value;

/// 解析后的单值报文
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedPayload {
    pub value: f64,
    pub unit: Option<String>,
    pub quality: Option<String>,
    pub timestamp_ms: Option<i64>,
}

impl ParsedPayload {
    fn bare(value: f64) -> Self {
        Self {
            value,
            unit: None,
            quality: None,
            timestamp_ms: None,
        }
    }
}

/// 解析单值报文。
pub fn parse_payload(payload: &[u8]) -> Result<ParsedPayload, ProtocolError> {
    let text = std::str::from_utf8(payload)
        .map_err(|e| ProtocolError::DataParse(format!("payload is not utf-8: {}", e)))?
        .trim();
    if text.is_empty() {
        return Err(ProtocolError::DataParse("empty payload".to_string()));
    }

    // 格式1：纯数值
    if let Ok(value) = text.parse::<f64>() {
        return finite(value).map(ParsedPayload::bare);
    }

    // 格式2：布尔
    if let Some(value) = parse_bool(text) {
        return Ok(ParsedPayload::bare(value));
    }

    // 格式3：JSON
    if let Ok(json) = serde_json::from_str::<Value>(text) {
        return parse_json(&json);
    }

    // 格式4：key=value
    for part in text.split(['=', ':', ',']) {
        if let Ok(value) = part.trim().parse::<f64>() {
            return finite(value).map(ParsedPayload::bare);
        }
    }

    Err(ProtocolError::DataParse(format!(
        "unrecognized payload: {}",
        truncate(text, 64)
    )))
}

fn parse_json(json: &Value) -> Result<ParsedPayload, ProtocolError> {
    if let Some(value) = json_number(json) {
        return finite(value).map(ParsedPayload::bare);
    }
    let value = json
        .get("value")
        .and_then(json_number)
        .ok_or_else(|| ProtocolError::DataParse("json payload has no numeric value".to_string()))
        .and_then(finite)?;
    Ok(ParsedPayload {
        value,
        unit: json.get("unit").and_then(Value::as_str).map(str::to_string),
        quality: json
            .get("quality")
            .and_then(Value::as_str)
            .map(str::to_string),
        timestamp_ms: json.get("timestamp").and_then(Value::as_i64),
    })
}

fn json_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => s.trim().parse::<f64>().ok().or_else(|| parse_bool(s)),
        _ => None,
    }
}

/// NaN / ±inf 不入库
fn finite(value: f64) -> Result<f64, ProtocolError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(ProtocolError::DataParse(format!("non-finite value: {}", value)))
    }
}

fn parse_bool(text: &str) -> Option<f64> {
    match text.trim().to_ascii_lowercase().as_str() {
        "true" | "on" => Some(1.0),
        "false" | "off" => Some(0.0),
        _ => None,
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// 根据主题 / 名称推断传感器类型。
pub fn infer_sensor_type(name: &str) -> &'static str {
    let name = name.to_ascii_lowercase();
    const RULES: &[(&[&str], &str)] = &[
        (&["temp"], "temperature"),
        (&["humid"], "humidity"),
        (&["press"], "pressure"),
        (&["vibr"], "vibration"),
        (&["power"], "power"),
        (&["energy"], "energy"),
        (&["flow"], "flow"),
        (&["level"], "level"),
        (&["speed", "rpm"], "speed"),
    ];
    RULES
        .iter()
        .find(|(needles, _)| needles.iter().any(|needle| name.contains(needle)))
        .map(|(_, sensor_type)| *sensor_type)
        .unwrap_or("generic")
}

/// 传感器类型对应的默认单位。
pub fn default_unit(sensor_type: &str) -> Option<&'static str> {
    match sensor_type {
        "temperature" => Some("°C"),
        "humidity" => Some("%"),
        "pressure" => Some("bar"),
        "vibration" => Some("mm/s"),
        "power" => Some("kW"),
        "energy" => Some("kWh"),
        "flow" => Some("m³/h"),
        "level" => Some("%"),
        "speed" => Some("rpm"),
        _ => None,
    }
}
