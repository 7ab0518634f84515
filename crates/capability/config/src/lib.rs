//! 采集进程运行配置加载。

use std::env;

/// 配置加载错误。
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required env: {0}")]
    Missing(String),
    #[error("invalid value for {0}: {1}")]
    Invalid(String, String),
}

/// 采集进程运行配置。
///
/// 各协议端点均为可选：未配置的协议不创建连接。
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub retention_points: usize,
    pub event_capacity: usize,
    pub simulate: bool,
    pub modbus_host: Option<String>,
    pub modbus_port: u16,
    pub modbus_unit_id: u8,
    pub modbus_registers: Vec<u16>,
    pub modbus_poll_interval_ms: u64,
    pub mqtt_host: Option<String>,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_topics: Vec<String>,
    pub mqtt_sample_interval_ms: u64,
    pub opcua_endpoint_url: Option<String>,
    pub opcua_nodes: Vec<String>,
    pub opcua_publishing_interval_ms: u64,
}

impl AppConfig {
    /// 从环境变量读取配置。
    pub fn from_env() -> Result<Self, ConfigError> {
        let retention_points = read_usize_with_default("EMS_TS_RETENTION_POINTS", 100_000)?;
        let event_capacity = read_usize_with_default("EMS_EVENT_CAPACITY", 256)?;
        let simulate = read_bool_with_default("EMS_SIMULATE", true);

        let modbus_host = read_optional("EMS_MODBUS_HOST");
        let modbus_port = read_u16_with_default("EMS_MODBUS_PORT", 502)?;
        let modbus_unit_id = read_u8_with_default("EMS_MODBUS_UNIT_ID", 1)?;
        let modbus_registers = read_list("EMS_MODBUS_REGISTERS")
            .unwrap_or_else(|| vec!["100".to_string()])
            .into_iter()
            .map(|item| {
                item.parse::<u16>()
                    .map_err(|_| ConfigError::Invalid("EMS_MODBUS_REGISTERS".to_string(), item))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let modbus_poll_interval_ms = read_u64_with_default("EMS_MODBUS_POLL_INTERVAL_MS", 1000)?;

        let mqtt_host = read_optional("EMS_MQTT_HOST");
        let mqtt_port = read_u16_with_default("EMS_MQTT_PORT", 1883)?;
        let mqtt_username = read_optional("EMS_MQTT_USERNAME");
        let mqtt_password = read_optional("EMS_MQTT_PASSWORD");
        let mqtt_topics = read_list("EMS_MQTT_TOPICS")
            .unwrap_or_else(|| vec!["ems/sensors/temperature".to_string()]);
        let mqtt_sample_interval_ms = read_u64_with_default("EMS_MQTT_SAMPLE_INTERVAL_MS", 1000)?;

        let opcua_endpoint_url = read_optional("EMS_OPCUA_ENDPOINT_URL");
        let opcua_nodes = read_list("EMS_OPCUA_NODES")
            .unwrap_or_else(|| vec!["ns=2;s=Machine1.Temperature".to_string()]);
        let opcua_publishing_interval_ms =
            read_u64_with_default("EMS_OPCUA_PUBLISHING_INTERVAL_MS", 1000)?;

        if retention_points == 0 {
            return Err(ConfigError::Invalid(
                "EMS_TS_RETENTION_POINTS".to_string(),
                "0".to_string(),
            ));
        }

        Ok(Self {
            retention_points,
            event_capacity,
            simulate,
            modbus_host,
            modbus_port,
            modbus_unit_id,
            modbus_registers,
            modbus_poll_interval_ms,
            mqtt_host,
            mqtt_port,
            mqtt_username,
            mqtt_password,
            mqtt_topics,
            mqtt_sample_interval_ms,
            opcua_endpoint_url,
            opcua_nodes,
            opcua_publishing_interval_ms,
        })
    }
}

fn read_u16_with_default(key: &str, default: u16) -> Result<u16, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };
    value
        .parse::<u16>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

fn read_u8_with_default(key: &str, default: u8) -> Result<u8, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };
    value
        .parse::<u8>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

fn read_u64_with_default(key: &str, default: u64) -> Result<u64, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };
    value
        .parse::<u64>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

fn read_usize_with_default(key: &str, default: usize) -> Result<usize, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };
    value
        .parse::<usize>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

fn read_optional(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(value) if !value.is_empty() => Some(value),
        _ => None,
    }
}

/// 逗号分隔列表；空项被忽略，全空视为未配置。
fn read_list(key: &str) -> Option<Vec<String>> {
    let value = read_optional(key)?;
    let items: Vec<String> = value
        .split(',')
        .map(|item| item.trim())
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect();
    if items.is_empty() { None } else { Some(items) }
}

fn read_bool_with_default(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(value) => matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "on"),
        Err(_) => default,
    }
}
