//! # EMS 时序存储
//!
//! 单进程内存时序存储，被所有协议适配器共享写入，供分析与报表调用方查询。
//!
//! ## 测量集合
//!
//! | 集合 | 标签 | 字段 |
//! |------|------|------|
//! | `sensor_readings` | deviceId, sensorType | value, unit, quality |
//! | `machine_status` | machineId | status, oee, availability, performance, quality |
//! | `alerts` | deviceId, alertType, severity | message, value, threshold, acknowledged |
//!
//! ## 核心特性
//!
//! - **保留上限**：每个集合最多保留 N 个最新点（默认 100,000），超出按 FIFO 淘汰
//! - **区间查询**：闭区间时间窗口 + 标签等值过滤，结果保持存储顺序
//! - **分桶聚合**：`<整数><s|m|h|d>` 区间，mean/min/max/sum/count，空桶省略
//! - **延迟统计**：按存储顺序计算到达间隔，输出 avg/min/max/p50/p95/p99
//! - **写入事件**：每次写入广播 `PointEvent`
//!
//! ## 两种"顺序"
//!
//! 存储与延迟统计使用追加顺序；聚合使用点自身时间戳。乱序时间戳不会被重排。
//!
//! ## 使用示例
//!
//! ```rust,ignore
//! use ems_timeseries::{QueryOptions, SensorReading, TimeseriesStore};
//!
//! let store = TimeseriesStore::new();
//! store.write_sensor_reading(SensorReading::new("dev-1", "temperature", 21.5));
//! let points = store.query_sensor_readings(&QueryOptions::range(0, i64::MAX).device_id("dev-1"))?;
//! ```

mod aggregate;
mod error;
mod models;
mod query;
mod store;

pub use error::TimeseriesError;
pub use models::*;
pub use query::{Aggregation, QueryOptions, parse_interval};
pub use store::{TimeseriesConfig, TimeseriesStore};
