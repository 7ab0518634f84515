//! 连接状态机与运行计数
//!
//! 三种适配器共用的状态核心：状态迁移在同一把锁内完成并发出
//! `StatusChange` 事件，因此订阅者看到的状态序列与实际迁移顺序一致，
//! 且不会出现连续两个相同状态。

use crate::error::ProtocolError;
use crate::types::{AdapterEvent, AdapterStats, ConnectResult, ConnectionStatus};
use domain::now_epoch_ms;
use ems_telemetry::{
    record_connect_failure, record_delivery, record_delivery_error, record_status_change,
};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// 适配器事件通道默认容量
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// `connect()` 入口判定结果
pub(crate) enum ConnectStart {
    /// 已连接，直接返回成功
    AlreadyConnected,
    /// 另一次连接/重连正在进行
    Busy(ConnectionStatus),
    /// 已进入 connecting
    Started,
}

#[derive(Default)]
struct StatusCell {
    status: ConnectionStatus,
    connected_since_ms: Option<i64>,
}

#[derive(Default)]
struct Activity {
    last_activity_ms: Option<i64>,
    last_error: Option<String>,
}

pub(crate) struct LinkState {
    id: String,
    protocol: &'static str,
    cell: Mutex<StatusCell>,
    activity: Mutex<Activity>,
    deliveries: AtomicU64,
    errors: AtomicU64,
    writes: AtomicU64,
    published: AtomicU64,
    events: broadcast::Sender<AdapterEvent>,
}

impl LinkState {
    pub(crate) fn new(id: impl Into<String>, protocol: &'static str) -> Self {
        let (events, _) = broadcast::channel(DEFAULT_EVENT_CAPACITY);
        Self {
            id: id.into(),
            protocol,
            cell: Mutex::new(StatusCell::default()),
            activity: Mutex::new(Activity::default()),
            deliveries: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            published: AtomicU64::new(0),
            events,
        }
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn status(&self) -> ConnectionStatus {
        self.cell().status
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<AdapterEvent> {
        self.events.subscribe()
    }

    /// 无条件迁移；与当前状态相同时不发事件。
    pub(crate) fn transition(&self, next: ConnectionStatus) -> bool {
        let mut cell = self.cell();
        self.apply(&mut cell, next)
    }

    /// 仅当当前状态在 `from` 中时迁移。
    pub(crate) fn transition_if(&self, from: &[ConnectionStatus], next: ConnectionStatus) -> bool {
        let mut cell = self.cell();
        if !from.contains(&cell.status) {
            return false;
        }
        self.apply(&mut cell, next)
    }

    fn apply(&self, cell: &mut StatusCell, next: ConnectionStatus) -> bool {
        if cell.status == next {
            return false;
        }
        let previous = cell.status;
        cell.status = next;
        match next {
            ConnectionStatus::Connected => cell.connected_since_ms = Some(now_epoch_ms()),
            ConnectionStatus::Disconnected => cell.connected_since_ms = None,
            _ => {}
        }
        // 持锁发送，保证事件顺序与迁移顺序一致
        let _ = self.events.send(AdapterEvent::StatusChange { status: next });
        record_status_change();
        info!(
            target: "ems.protocol",
            protocol = self.protocol,
            connection_id = %self.id,
            from = %previous,
            to = %next,
            "status_changed"
        );
        true
    }

    pub(crate) fn begin_connect(&self) -> ConnectStart {
        let mut cell = self.cell();
        match cell.status {
            ConnectionStatus::Connected => ConnectStart::AlreadyConnected,
            status @ (ConnectionStatus::Connecting | ConnectionStatus::Reconnecting) => {
                ConnectStart::Busy(status)
            }
            ConnectionStatus::Disconnected | ConnectionStatus::Error => {
                self.apply(&mut cell, ConnectionStatus::Connecting);
                ConnectStart::Started
            }
        }
    }

    /// connecting → connected；被并发 disconnect 抢先时返回 false。
    pub(crate) fn finish_connect(&self) -> bool {
        self.transition_if(&[ConnectionStatus::Connecting], ConnectionStatus::Connected)
    }

    pub(crate) fn fail_connect(&self, err: &ProtocolError) -> ConnectResult {
        self.transition_if(&[ConnectionStatus::Connecting], ConnectionStatus::Error);
        record_connect_failure();
        self.note_error(err.to_string());
        warn!(
            target: "ems.protocol",
            protocol = self.protocol,
            connection_id = %self.id,
            error = %err,
            "connect_failed"
        );
        ConnectResult::failed(err.to_string())
    }

    pub(crate) fn begin_reconnect(&self) -> bool {
        self.transition_if(
            &[ConnectionStatus::Connected, ConnectionStatus::Error],
            ConnectionStatus::Reconnecting,
        )
    }

    pub(crate) fn finish_reconnect(&self) -> bool {
        self.transition_if(&[ConnectionStatus::Reconnecting], ConnectionStatus::Connected)
    }

    pub(crate) fn fail_reconnect(&self, err: &ProtocolError) -> ConnectResult {
        self.transition_if(&[ConnectionStatus::Reconnecting], ConnectionStatus::Error);
        record_connect_failure();
        self.note_error(err.to_string());
        warn!(
            target: "ems.protocol",
            protocol = self.protocol,
            connection_id = %self.id,
            error = %err,
            "reconnect_failed"
        );
        ConnectResult::failed(err.to_string())
    }

    /// 在超时约束下执行握手。
    pub(crate) async fn handshake<F>(&self, timeout_ms: u64, handshake: F) -> Result<(), ProtocolError>
    where
        F: Future<Output = Result<(), ProtocolError>>,
    {
        match tokio::time::timeout(Duration::from_millis(timeout_ms), handshake).await {
            Ok(result) => result,
            Err(_) => Err(ProtocolError::Timeout(format!(
                "handshake exceeded {}ms",
                timeout_ms
            ))),
        }
    }

    pub(crate) fn emit(&self, event: AdapterEvent) {
        let _ = self.events.send(event);
    }

    /// 记录一次成功投递并发出 `Data` 事件。
    pub(crate) fn record_delivery(&self, event: AdapterEvent) {
        self.deliveries.fetch_add(1, Ordering::Relaxed);
        self.activity().last_activity_ms = Some(now_epoch_ms());
        record_delivery();
        self.emit(event);
    }

    /// 记录一次投递失败并发出 `Error` 事件；状态不变。
    pub(crate) fn record_error(&self, key: Option<&str>, err: &ProtocolError) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        self.note_error(err.to_string());
        record_delivery_error();
        debug!(
            target: "ems.protocol",
            protocol = self.protocol,
            connection_id = %self.id,
            key = key.unwrap_or("-"),
            error = %err,
            "delivery_failed"
        );
        self.emit(AdapterEvent::Error {
            key: key.map(str::to_string),
            message: err.to_string(),
        });
    }

    pub(crate) fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.activity().last_activity_ms = Some(now_epoch_ms());
    }

    pub(crate) fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
        self.activity().last_activity_ms = Some(now_epoch_ms());
    }

    fn note_error(&self, message: String) {
        self.activity().last_error = Some(message);
    }

    pub(crate) fn stats(&self, active_points: usize) -> AdapterStats {
        let (status, connected_since_ms) = {
            let cell = self.cell();
            (cell.status, cell.connected_since_ms)
        };
        let (last_activity_ms, last_error) = {
            let activity = self.activity();
            (activity.last_activity_ms, activity.last_error.clone())
        };
        let uptime_ms = connected_since_ms
            .map(|since| (now_epoch_ms() - since).max(0) as u64)
            .unwrap_or(0);
        AdapterStats {
            status,
            deliveries: self.deliveries.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            last_activity_ms,
            last_error,
            connected_since_ms,
            uptime_ms,
            active_points,
        }
    }

    fn cell(&self) -> MutexGuard<'_, StatusCell> {
        self.cell.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn activity(&self) -> MutexGuard<'_, Activity> {
        self.activity.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
