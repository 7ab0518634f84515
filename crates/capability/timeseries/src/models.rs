//! 时序存储数据模型
//!
//! - 写入模型：`SensorReading`、`MachineStatus`、`AlertEvent`
//! - 统计模型：`StoreStats`、`LatencyStats`
//! - 事件模型：`PointEvent`

use domain::Point;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// 测量集合名称。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Measurement {
    SensorReadings,
    MachineStatus,
    Alerts,
}

impl Measurement {
    pub const ALL: [Measurement; 3] = [
        Measurement::SensorReadings,
        Measurement::MachineStatus,
        Measurement::Alerts,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Measurement::SensorReadings => "sensor_readings",
            Measurement::MachineStatus => "machine_status",
            Measurement::Alerts => "alerts",
        }
    }
}

impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 传感器读数。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub device_id: String,
    pub sensor_type: String,
    pub value: f64,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub quality: Option<String>,
    /// 时间戳（毫秒），缺省为写入时刻
    #[serde(default)]
    pub timestamp_ms: Option<i64>,
}

impl SensorReading {
    pub fn new(device_id: impl Into<String>, sensor_type: impl Into<String>, value: f64) -> Self {
        Self {
            device_id: device_id.into(),
            sensor_type: sensor_type.into(),
            value,
            unit: None,
            quality: None,
            timestamp_ms: None,
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn with_quality(mut self, quality: impl Into<String>) -> Self {
        self.quality = Some(quality.into());
        self
    }

    pub fn at(mut self, timestamp_ms: i64) -> Self {
        self.timestamp_ms = Some(timestamp_ms);
        self
    }

    pub(crate) fn into_point(self, now_ms: i64) -> Point {
        Point::new(self.timestamp_ms.unwrap_or(now_ms))
            .tag("deviceId", self.device_id)
            .tag("sensorType", self.sensor_type)
            .field("value", self.value)
            .field_opt("unit", self.unit)
            .field_opt("quality", self.quality)
    }
}

/// 设备运行状态（含 OEE 指标）。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineStatus {
    pub machine_id: String,
    pub status: String,
    #[serde(default)]
    pub oee: Option<f64>,
    #[serde(default)]
    pub availability: Option<f64>,
    #[serde(default)]
    pub performance: Option<f64>,
    #[serde(default)]
    pub quality: Option<f64>,
    #[serde(default)]
    pub timestamp_ms: Option<i64>,
}

impl MachineStatus {
    pub fn new(machine_id: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            machine_id: machine_id.into(),
            status: status.into(),
            oee: None,
            availability: None,
            performance: None,
            quality: None,
            timestamp_ms: None,
        }
    }

    pub fn with_oee(mut self, oee: f64) -> Self {
        self.oee = Some(oee);
        self
    }

    pub fn at(mut self, timestamp_ms: i64) -> Self {
        self.timestamp_ms = Some(timestamp_ms);
        self
    }

    pub(crate) fn into_point(self, now_ms: i64) -> Point {
        Point::new(self.timestamp_ms.unwrap_or(now_ms))
            .tag("machineId", self.machine_id)
            .field("status", self.status)
            .field_opt("oee", self.oee)
            .field_opt("availability", self.availability)
            .field_opt("performance", self.performance)
            .field_opt("quality", self.quality)
    }
}

/// 告警事件。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub device_id: String,
    pub alert_type: String,
    pub severity: String,
    pub message: String,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub threshold: Option<f64>,
    #[serde(default)]
    pub acknowledged: bool,
    #[serde(default)]
    pub timestamp_ms: Option<i64>,
}

impl AlertEvent {
    pub fn new(
        device_id: impl Into<String>,
        alert_type: impl Into<String>,
        severity: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            alert_type: alert_type.into(),
            severity: severity.into(),
            message: message.into(),
            value: None,
            threshold: None,
            acknowledged: false,
            timestamp_ms: None,
        }
    }

    pub fn at(mut self, timestamp_ms: i64) -> Self {
        self.timestamp_ms = Some(timestamp_ms);
        self
    }

    pub(crate) fn into_point(self, now_ms: i64) -> Point {
        Point::new(self.timestamp_ms.unwrap_or(now_ms))
            .tag("deviceId", self.device_id)
            .tag("alertType", self.alert_type)
            .tag("severity", self.severity)
            .field("message", self.message)
            .field_opt("value", self.value)
            .field_opt("threshold", self.threshold)
            .field("acknowledged", self.acknowledged)
    }
}

/// 存储写入事件（`point`）。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PointEvent {
    pub measurement: Measurement,
    pub point: Point,
}

/// 存储统计。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreStats {
    pub total_points: usize,
    pub measurements: BTreeMap<Measurement, usize>,
    /// 按点内容估算的内存占用（字节）
    pub approx_memory_bytes: usize,
}

/// 到达间隔延迟统计（毫秒）。
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencyStats {
    pub average_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub sample_count: usize,
}
