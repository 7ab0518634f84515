//! 日志初始化与采集链路计数指标。

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing_subscriber::{EnvFilter, fmt};

/// 基础指标快照。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub points_written: u64,
    pub points_evicted: u64,
    pub deliveries: u64,
    pub delivery_errors: u64,
    pub status_changes: u64,
    pub connect_failures: u64,
    pub reconnects: u64,
    pub messages_published: u64,
    pub connections_created: u64,
    pub connections_removed: u64,
}

/// 进程级采集指标。
pub struct TelemetryMetrics {
    points_written: AtomicU64,
    points_evicted: AtomicU64,
    deliveries: AtomicU64,
    delivery_errors: AtomicU64,
    status_changes: AtomicU64,
    connect_failures: AtomicU64,
    reconnects: AtomicU64,
    messages_published: AtomicU64,
    connections_created: AtomicU64,
    connections_removed: AtomicU64,
}

impl TelemetryMetrics {
    pub fn new() -> Self {
        Self {
            points_written: AtomicU64::new(0),
            points_evicted: AtomicU64::new(0),
            deliveries: AtomicU64::new(0),
            delivery_errors: AtomicU64::new(0),
            status_changes: AtomicU64::new(0),
            connect_failures: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            messages_published: AtomicU64::new(0),
            connections_created: AtomicU64::new(0),
            connections_removed: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            points_written: self.points_written.load(Ordering::Relaxed),
            points_evicted: self.points_evicted.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            delivery_errors: self.delivery_errors.load(Ordering::Relaxed),
            status_changes: self.status_changes.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            messages_published: self.messages_published.load(Ordering::Relaxed),
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connections_removed: self.connections_removed.load(Ordering::Relaxed),
        }
    }
}

impl Default for TelemetryMetrics {
    fn default() -> Self {
        Self::new()
    }
}

static METRICS: OnceLock<TelemetryMetrics> = OnceLock::new();

/// 获取全局指标实例。
pub fn metrics() -> &'static TelemetryMetrics {
    METRICS.get_or_init(TelemetryMetrics::new)
}

/// 初始化 tracing（默认 info）。
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}

/// 记录时序点写入次数。
pub fn record_point_written() {
    metrics().points_written.fetch_add(1, Ordering::Relaxed);
}

/// 记录保留上限触发的淘汰次数。
pub fn record_points_evicted(count: u64) {
    metrics().points_evicted.fetch_add(count, Ordering::Relaxed);
}

/// 记录适配器成功投递次数（轮询读 / 消息 / 数据变化）。
pub fn record_delivery() {
    metrics().deliveries.fetch_add(1, Ordering::Relaxed);
}

/// 记录适配器投递失败次数。
pub fn record_delivery_error() {
    metrics().delivery_errors.fetch_add(1, Ordering::Relaxed);
}

/// 记录连接状态迁移次数。
pub fn record_status_change() {
    metrics().status_changes.fetch_add(1, Ordering::Relaxed);
}

/// 记录连接失败次数（配置错误、握手失败、超时）。
pub fn record_connect_failure() {
    metrics().connect_failures.fetch_add(1, Ordering::Relaxed);
}

/// 记录重连尝试次数。
pub fn record_reconnect() {
    metrics().reconnects.fetch_add(1, Ordering::Relaxed);
}

/// 记录 MQTT 发布成功次数。
pub fn record_message_published() {
    metrics().messages_published.fetch_add(1, Ordering::Relaxed);
}

/// 记录注册表创建连接次数。
pub fn record_connection_created() {
    metrics().connections_created.fetch_add(1, Ordering::Relaxed);
}

/// 记录注册表移除连接次数。
pub fn record_connection_removed() {
    metrics().connections_removed.fetch_add(1, Ordering::Relaxed);
}
