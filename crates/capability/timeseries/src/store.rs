//! 内存时序存储
//!
//! 每个测量集合各持有一把 `RwLock<VecDeque<Point>>`：写入按集合串行化，
//! 保证追加顺序；查询持读锁拿到尽力而为的快照。

use crate::aggregate::{aggregate_points, latency_stats};
use crate::error::TimeseriesError;
use crate::models::{
    AlertEvent, LatencyStats, MachineStatus, Measurement, PointEvent, SensorReading, StoreStats,
};
use crate::query::{Aggregation, QueryOptions, parse_interval};
use domain::{FieldValue, Point, TagValue, now_epoch_ms};
use ems_telemetry::{record_point_written, record_points_evicted};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;
use tracing::debug;

const DEFAULT_FIELD: &str = "value";

/// 存储参数。
#[derive(Debug, Clone)]
pub struct TimeseriesConfig {
    /// 每个测量集合保留的最大点数
    pub retention_points: usize,
    /// `point` 事件通道容量
    pub event_capacity: usize,
}

impl Default for TimeseriesConfig {
    fn default() -> Self {
        Self {
            retention_points: 100_000,
            event_capacity: 1024,
        }
    }
}

impl TimeseriesConfig {
    fn sanitized(mut self) -> Self {
        if self.retention_points == 0 {
            self.retention_points = 1;
        }
        if self.event_capacity == 0 {
            self.event_capacity = 1;
        }
        self
    }
}

/// 内存时序存储。
pub struct TimeseriesStore {
    config: TimeseriesConfig,
    sensor_readings: RwLock<VecDeque<Point>>,
    machine_status: RwLock<VecDeque<Point>>,
    alerts: RwLock<VecDeque<Point>>,
    events: broadcast::Sender<PointEvent>,
}

impl TimeseriesStore {
    pub fn new() -> Self {
        Self::with_config(TimeseriesConfig::default())
    }

    pub fn with_config(config: TimeseriesConfig) -> Self {
        let config = config.sanitized();
        let (events, _) = broadcast::channel(config.event_capacity);
        Self {
            config,
            sensor_readings: RwLock::new(VecDeque::new()),
            machine_status: RwLock::new(VecDeque::new()),
            alerts: RwLock::new(VecDeque::new()),
            events,
        }
    }

    pub fn config(&self) -> &TimeseriesConfig {
        &self.config
    }

    /// 订阅 `point` 事件；丢弃接收端即取消订阅。
    pub fn subscribe(&self) -> broadcast::Receiver<PointEvent> {
        self.events.subscribe()
    }

    pub fn write_sensor_reading(&self, reading: SensorReading) {
        let point = reading.into_point(now_epoch_ms());
        self.append(Measurement::SensorReadings, point);
    }

    /// 逐条写入，非原子。
    pub fn write_sensor_readings_batch(&self, readings: impl IntoIterator<Item = SensorReading>) {
        for reading in readings {
            self.write_sensor_reading(reading);
        }
    }

    pub fn write_machine_status(&self, status: MachineStatus) {
        let point = status.into_point(now_epoch_ms());
        self.append(Measurement::MachineStatus, point);
    }

    pub fn write_alert_event(&self, alert: AlertEvent) {
        let point = alert.into_point(now_epoch_ms());
        self.append(Measurement::Alerts, point);
    }

    pub fn query_sensor_readings(&self, options: &QueryOptions) -> Result<Vec<Point>, TimeseriesError> {
        self.query(Measurement::SensorReadings, options)
    }

    pub fn query_machine_status(&self, options: &QueryOptions) -> Result<Vec<Point>, TimeseriesError> {
        self.query(Measurement::MachineStatus, options)
    }

    pub fn query_alerts(&self, options: &QueryOptions) -> Result<Vec<Point>, TimeseriesError> {
        self.query(Measurement::Alerts, options)
    }

    /// 通用区间查询：原样结果保持存储顺序，聚合结果按桶起点升序。
    pub fn query(
        &self,
        measurement: Measurement,
        options: &QueryOptions,
    ) -> Result<Vec<Point>, TimeseriesError> {
        // 区间非法时在扫描前快速失败
        let bucket_ms = match (&options.aggregation, &options.group_by_time) {
            (Some(_), Some(interval)) => Some(parse_interval(interval)?),
            _ => None,
        };

        let selected: Vec<Point> = {
            let series = self.read(measurement);
            series
                .iter()
                .filter(|point| options.matches(point))
                .cloned()
                .collect()
        };

        match (options.aggregation, bucket_ms) {
            (Some(aggregation), Some(bucket_ms)) => {
                let field = options.field.as_deref().unwrap_or(DEFAULT_FIELD);
                Ok(aggregate_points(&selected, aggregation, bucket_ms, field))
            }
            _ => Ok(selected),
        }
    }

    /// 最近追加的匹配读数（按存储顺序，而非时间戳）。
    pub fn latest_sensor_reading(&self, device_id: &str, sensor_type: &str) -> Option<Point> {
        let device_id = TagValue::from(device_id);
        let sensor_type = TagValue::from(sensor_type);
        let series = self.read(Measurement::SensorReadings);
        series
            .iter()
            .rev()
            .find(|point| {
                point.tag_matches("deviceId", &device_id)
                    && point.tag_matches("sensorType", &sensor_type)
            })
            .cloned()
    }

    /// OEE 趋势：按区间对 `oee` 字段求均值。
    pub fn oee_trend(
        &self,
        machine_id: &str,
        start_ms: i64,
        end_ms: i64,
        interval: &str,
    ) -> Result<Vec<Point>, TimeseriesError> {
        let options = QueryOptions::range(start_ms, end_ms)
            .machine_id(machine_id)
            .aggregate(Aggregation::Mean, interval)
            .field("oee");
        self.query_machine_status(&options)
    }

    /// 指定设备读数的到达间隔统计。
    pub fn calculate_latency_stats(&self, device_id: &str, start_ms: i64, end_ms: i64) -> LatencyStats {
        let options = QueryOptions::range(start_ms, end_ms).device_id(device_id);
        let series = self.read(Measurement::SensorReadings);
        let selected: Vec<&Point> = series.iter().filter(|p| options.matches(p)).collect();
        latency_stats(&selected)
    }

    pub fn stats(&self) -> StoreStats {
        let mut measurements = BTreeMap::new();
        let mut total_points = 0;
        let mut approx_memory_bytes = 0;
        for measurement in Measurement::ALL {
            let series = self.read(measurement);
            total_points += series.len();
            approx_memory_bytes += series.iter().map(point_size).sum::<usize>();
            measurements.insert(measurement, series.len());
        }
        StoreStats {
            total_points,
            measurements,
            approx_memory_bytes,
        }
    }

    pub fn len(&self, measurement: Measurement) -> usize {
        self.read(measurement).len()
    }

    pub fn is_empty(&self) -> bool {
        Measurement::ALL.iter().all(|m| self.read(*m).is_empty())
    }

    /// 清空全部测量集合。
    pub fn clear(&self) {
        for measurement in Measurement::ALL {
            self.write(measurement).clear();
        }
    }

    fn append(&self, measurement: Measurement, point: Point) {
        let evicted = {
            let mut series = self.write(measurement);
            series.push_back(point.clone());
            let mut evicted = 0u64;
            while series.len() > self.config.retention_points {
                series.pop_front();
                evicted += 1;
            }
            evicted
        };
        record_point_written();
        if evicted > 0 {
            record_points_evicted(evicted);
            debug!(
                target: "ems.timeseries",
                measurement = %measurement,
                evicted,
                "retention_evicted"
            );
        }
        // 没有订阅者时发送失败，忽略即可
        let _ = self.events.send(PointEvent { measurement, point });
    }

    fn series(&self, measurement: Measurement) -> &RwLock<VecDeque<Point>> {
        match measurement {
            Measurement::SensorReadings => &self.sensor_readings,
            Measurement::MachineStatus => &self.machine_status,
            Measurement::Alerts => &self.alerts,
        }
    }

    fn read(&self, measurement: Measurement) -> RwLockReadGuard<'_, VecDeque<Point>> {
        self.series(measurement)
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self, measurement: Measurement) -> RwLockWriteGuard<'_, VecDeque<Point>> {
        self.series(measurement)
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for TimeseriesStore {
    fn default() -> Self {
        Self::new()
    }
}

fn point_size(point: &Point) -> usize {
    let tags: usize = point
        .tags
        .iter()
        .map(|(key, value)| {
            key.len()
                + std::mem::size_of::<TagValue>()
                + match value {
                    TagValue::Text(text) => text.len(),
                    TagValue::Number(_) => 0,
                }
        })
        .sum();
    let fields: usize = point
        .fields
        .iter()
        .map(|(key, value)| {
            key.len()
                + std::mem::size_of::<FieldValue>()
                + match value {
                    FieldValue::Text(text) => text.len(),
                    _ => 0,
                }
        })
        .sum();
    std::mem::size_of::<Point>() + tags + fields
}
