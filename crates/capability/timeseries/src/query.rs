//! 查询参数与聚合区间解析

use crate::error::TimeseriesError;
use domain::{Point, TagValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 聚合函数。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    Mean,
    Min,
    Max,
    Sum,
    Count,
}

/// 区间查询参数。
///
/// 时间窗口 `[start_ms, end_ms]` 为闭区间；标签过滤为等值匹配。
/// 仅当 `aggregation` 与 `group_by_time` 同时给出时才分桶聚合。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryOptions {
    pub start_ms: i64,
    pub end_ms: i64,
    #[serde(default)]
    pub tags: BTreeMap<String, TagValue>,
    #[serde(default)]
    pub aggregation: Option<Aggregation>,
    #[serde(default)]
    pub group_by_time: Option<String>,
    /// 聚合字段，缺省为 `value`
    #[serde(default)]
    pub field: Option<String>,
}

impl QueryOptions {
    pub fn range(start_ms: i64, end_ms: i64) -> Self {
        Self {
            start_ms,
            end_ms,
            tags: BTreeMap::new(),
            aggregation: None,
            group_by_time: None,
            field: None,
        }
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<TagValue>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn device_id(self, device_id: impl Into<String>) -> Self {
        self.tag("deviceId", device_id.into())
    }

    pub fn sensor_type(self, sensor_type: impl Into<String>) -> Self {
        self.tag("sensorType", sensor_type.into())
    }

    pub fn machine_id(self, machine_id: impl Into<String>) -> Self {
        self.tag("machineId", machine_id.into())
    }

    pub fn alert_type(self, alert_type: impl Into<String>) -> Self {
        self.tag("alertType", alert_type.into())
    }

    pub fn aggregate(mut self, aggregation: Aggregation, group_by_time: impl Into<String>) -> Self {
        self.aggregation = Some(aggregation);
        self.group_by_time = Some(group_by_time.into());
        self
    }

    pub fn field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub(crate) fn matches(&self, point: &Point) -> bool {
        if point.timestamp_ms < self.start_ms || point.timestamp_ms > self.end_ms {
            return false;
        }
        self.tags
            .iter()
            .all(|(key, expected)| point.tag_matches(key, expected))
    }
}

/// 解析 `<整数><单位>` 形式的区间为毫秒，单位为 s/m/h/d。
pub fn parse_interval(interval: &str) -> Result<i64, TimeseriesError> {
    let interval = interval.trim();
    let invalid = || TimeseriesError::InvalidInterval(interval.to_string());
    let unit = interval.chars().last().ok_or_else(invalid)?;
    let unit_ms: i64 = match unit {
        's' => 1_000,
        'm' => 60_000,
        'h' => 3_600_000,
        'd' => 86_400_000,
        _ => return Err(invalid()),
    };
    let digits = &interval[..interval.len() - unit.len_utf8()];
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    let amount = digits.parse::<i64>().map_err(|_| invalid())?;
    if amount == 0 {
        return Err(invalid());
    }
    amount.checked_mul(unit_ms).ok_or_else(invalid)
}
