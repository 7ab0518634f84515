//! Modbus 适配器
//!
//! 每个点位一个独立轮询任务，按点位自身的间隔读取寄存器，
//! 计算 `raw * scale_factor + offset` 后写入时序存储。
//!
//! ## 使用示例
//!
//! ```rust,ignore
//! let config = ModbusConfig::from_json(r#"{"id": "plc-1", "host": "10.0.0.5"}"#)?;
//! let adapter = ModbusAdapter::new(config, Arc::new(TokioModbusTransport::new()), store);
//! adapter.connect().await;
//! adapter.start_polling(RegisterPoint::holding(100).with_scale(0.1, 0.0));
//! ```

use crate::adapter::Adapter;
use crate::error::ProtocolError;
use crate::link::{ConnectStart, LinkState};
use crate::modbus_transport::{
    ModbusTransport, SimulatedModbusTransport, TokioModbusTransport, decode_registers,
};
use crate::registry::ConnectionRegistry;
use crate::tasks::TaskSet;
use crate::types::{
    AdapterEvent, AdapterStats, ConnectResult, ConnectionStatus, ModbusDataType, RegisterKind,
    TransportMode,
};
use async_trait::async_trait;
use domain::{FieldValue, now_epoch_ms};
use ems_telemetry::record_reconnect;
use ems_timeseries::{SensorReading, TimeseriesStore};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

const PROTOCOL: &str = "modbus";
const DEFAULT_SENSOR_TYPE: &str = "modbus_register";
const RECONNECT_TASK: &str = "__reconnect";

/// 链路类型
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModbusLink {
    #[default]
    Tcp,
    Rtu,
}

/// Modbus 连接配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModbusConfig {
    /// 连接 ID（注册表键）
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type", default)]
    pub link: ModbusLink,
    /// TCP 主机地址
    #[serde(default)]
    pub host: Option<String>,
    /// TCP 端口（默认 502）
    #[serde(default = "default_modbus_port")]
    pub port: u16,
    /// RTU 串口
    #[serde(default)]
    pub serial_port: Option<String>,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// 从站 ID
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
    /// 连接超时（毫秒）
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// 读取超时（毫秒）
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,
}

fn default_modbus_port() -> u16 {
    502
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_unit_id() -> u8 {
    1
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_read_timeout() -> u64 {
    3000
}

impl ModbusConfig {
    /// TCP 连接配置，其余字段取默认值。
    pub fn tcp(id: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            link: ModbusLink::Tcp,
            host: Some(host.into()),
            port: default_modbus_port(),
            serial_port: None,
            baud_rate: default_baud_rate(),
            unit_id: default_unit_id(),
            connect_timeout_ms: default_connect_timeout(),
            read_timeout_ms: default_read_timeout(),
        }
    }

    /// 从 JSON 配置字符串解析
    pub fn from_json(json: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(json).map_err(|e| ProtocolError::ConfigParse(e.to_string()))
    }

    /// 校验必填字段：TCP 需要 host，RTU 需要 serial_port。
    pub fn validate(&self) -> Result<(), ProtocolError> {
        let present = |value: &Option<String>| value.as_deref().is_some_and(|v| !v.trim().is_empty());
        match self.link {
            ModbusLink::Tcp if !present(&self.host) => Err(ProtocolError::InvalidConfig(
                "host is required for modbus tcp".to_string(),
            )),
            ModbusLink::Rtu if !present(&self.serial_port) => Err(ProtocolError::InvalidConfig(
                "serial_port is required for modbus rtu".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

/// 轮询点位
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterPoint {
    /// 寄存器起始地址
    pub address: u16,
    /// 寄存器数量
    #[serde(default = "default_length")]
    pub length: u16,
    #[serde(rename = "type", default)]
    pub kind: RegisterKind,
    #[serde(default)]
    pub data_type: ModbusDataType,
    #[serde(default = "default_scale_factor")]
    pub scale_factor: f64,
    #[serde(default)]
    pub offset: f64,
    /// 轮询间隔（毫秒）
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub sensor_type: Option<String>,
    #[serde(default)]
    pub unit: Option<String>,
}

fn default_length() -> u16 {
    1
}

fn default_scale_factor() -> f64 {
    1.0
}

fn default_poll_interval() -> u64 {
    1000
}

impl RegisterPoint {
    pub fn new(kind: RegisterKind, address: u16) -> Self {
        Self {
            address,
            length: default_length(),
            kind,
            data_type: ModbusDataType::default(),
            scale_factor: default_scale_factor(),
            offset: 0.0,
            poll_interval_ms: default_poll_interval(),
            device_id: None,
            sensor_type: None,
            unit: None,
        }
    }

    pub fn holding(address: u16) -> Self {
        Self::new(RegisterKind::Holding, address)
    }

    pub fn with_length(mut self, length: u16) -> Self {
        self.length = length;
        self
    }

    pub fn with_data_type(mut self, data_type: ModbusDataType) -> Self {
        self.data_type = data_type;
        self
    }

    pub fn with_scale(mut self, scale_factor: f64, offset: f64) -> Self {
        self.scale_factor = scale_factor;
        self.offset = offset;
        self
    }

    pub fn with_poll_interval_ms(mut self, poll_interval_ms: u64) -> Self {
        self.poll_interval_ms = poll_interval_ms;
        self
    }

    pub fn with_device(mut self, device_id: impl Into<String>, sensor_type: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self.sensor_type = Some(sensor_type.into());
        self
    }

    /// 点位键：`{type}:{address}:{length}`
    pub fn key(&self) -> String {
        format!("{}:{}:{}", self.kind.as_str(), self.address, self.length)
    }

    fn register_count(&self) -> u16 {
        match self.kind {
            RegisterKind::Holding | RegisterKind::Input => {
                self.length.max(self.data_type.register_count())
            }
            RegisterKind::Coil | RegisterKind::Discrete => self.length.max(1),
        }
    }

    fn scaled(&self, raw: f64) -> f64 {
        raw * self.scale_factor + self.offset
    }
}

struct ModbusInner {
    config: ModbusConfig,
    link: LinkState,
    transport: Arc<dyn ModbusTransport>,
    store: Arc<TimeseriesStore>,
    points: Mutex<HashMap<String, RegisterPoint>>,
    tasks: TaskSet,
}

/// Modbus 连接适配器
pub struct ModbusAdapter {
    inner: Arc<ModbusInner>,
}

impl ModbusAdapter {
    pub fn new(
        config: ModbusConfig,
        transport: Arc<dyn ModbusTransport>,
        store: Arc<TimeseriesStore>,
    ) -> Self {
        let link = LinkState::new(config.id.clone(), PROTOCOL);
        Self {
            inner: Arc::new(ModbusInner {
                config,
                link,
                transport,
                store,
                points: Mutex::new(HashMap::new()),
                tasks: TaskSet::default(),
            }),
        }
    }

    /// 构造 Modbus 注册表：每个连接独立创建一个传输实例。
    pub fn registry(store: Arc<TimeseriesStore>, mode: TransportMode) -> ConnectionRegistry<Self> {
        ConnectionRegistry::new(move |config: ModbusConfig| {
            let transport: Arc<dyn ModbusTransport> = match mode {
                TransportMode::Live => Arc::new(TokioModbusTransport::new()),
                TransportMode::Simulated => Arc::new(SimulatedModbusTransport::new()),
            };
            ModbusAdapter::new(config, transport, Arc::clone(&store))
        })
    }

    pub fn config(&self) -> &ModbusConfig {
        &self.inner.config
    }

    /// 注册轮询点位，返回点位键。
    ///
    /// 未连接时同样接受，任务在连接建立前空转。重复点位不会新增任务。
    pub fn start_polling(&self, point: RegisterPoint) -> String {
        let key = point.key();
        {
            let mut points = self.inner.points();
            if points.contains_key(&key) {
                debug!(target: "ems.protocol", connection_id = %self.inner.config.id, key = %key, "point already polled");
                return key;
            }
            points.insert(key.clone(), point.clone());
        }
        info!(
            target: "ems.protocol",
            connection_id = %self.inner.config.id,
            key = %key,
            interval_ms = point.poll_interval_ms,
            "polling_started"
        );
        let inner = Arc::clone(&self.inner);
        let task_key = key.clone();
        self.inner
            .tasks
            .spawn(key.clone(), async move { inner.poll_loop(task_key, point).await });
        key
    }

    /// 停止点位轮询；未知键返回 false。
    pub async fn stop_polling(&self, key: &str) -> bool {
        let removed = self.inner.points().remove(key).is_some();
        if removed {
            self.inner.tasks.stop(key).await;
            info!(target: "ems.protocol", connection_id = %self.inner.config.id, key = %key, "polling_stopped");
        }
        removed
    }

    /// 当前轮询点位
    pub fn polled_points(&self) -> Vec<RegisterPoint> {
        self.inner.points().values().cloned().collect()
    }

    pub async fn read_holding_registers(
        &self,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, ProtocolError> {
        self.inner.ensure_connected()?;
        self.inner.transport.read_holding_registers(address, count).await
    }

    pub async fn write_register(&self, address: u16, value: u16) -> Result<(), ProtocolError> {
        self.inner.ensure_connected()?;
        self.inner.transport.write_register(address, value).await?;
        self.inner.link.record_write();
        Ok(())
    }

    /// 重新握手；仅在 connected / error 状态下可用。
    pub async fn reconnect(&self) -> ConnectResult {
        if !self.inner.link.begin_reconnect() {
            return ConnectResult::failed(format!(
                "cannot reconnect while {}",
                self.inner.link.status()
            ));
        }
        self.inner.complete_reconnect().await
    }
}

impl ModbusInner {
    fn points(&self) -> MutexGuard<'_, HashMap<String, RegisterPoint>> {
        self.points.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_connected(&self) -> Result<(), ProtocolError> {
        if self.link.is_connected() {
            Ok(())
        } else {
            Err(ProtocolError::NotConnected)
        }
    }

    async fn poll_loop(self: Arc<Self>, key: String, point: RegisterPoint) {
        let period = Duration::from_millis(point.poll_interval_ms.max(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let device_id = point
            .device_id
            .clone()
            .unwrap_or_else(|| self.config.id.clone());
        let sensor_type = point
            .sensor_type
            .clone()
            .unwrap_or_else(|| DEFAULT_SENSOR_TYPE.to_string());
        let read_timeout = Duration::from_millis(self.config.read_timeout_ms);

        loop {
            ticker.tick().await;
            if !self.link.is_connected() {
                continue;
            }

            let result = match tokio::time::timeout(read_timeout, self.read_point(&point)).await {
                Ok(result) => result,
                Err(_) => Err(ProtocolError::Timeout(format!(
                    "read exceeded {}ms",
                    self.config.read_timeout_ms
                ))),
            };

            match result {
                Ok(raw) => {
                    // 写入前再次确认状态，断开后的在途读取不落库
                    if !self.link.is_connected() {
                        continue;
                    }
                    let value = point.scaled(raw);
                    let timestamp_ms = now_epoch_ms();
                    let mut reading = SensorReading::new(device_id.clone(), sensor_type.clone(), value)
                        .with_quality("good")
                        .at(timestamp_ms);
                    if let Some(unit) = &point.unit {
                        reading = reading.with_unit(unit.clone());
                    }
                    self.store.write_sensor_reading(reading);
                    self.link.record_delivery(AdapterEvent::Data {
                        key: key.clone(),
                        device_id: device_id.clone(),
                        sensor_type: sensor_type.clone(),
                        value: FieldValue::Number(value),
                        timestamp_ms,
                    });
                }
                Err(err) => {
                    self.link.record_error(Some(&key), &err);
                    if err.is_link_loss() {
                        self.trigger_reconnect();
                    }
                }
            }
        }
    }

    async fn read_point(&self, point: &RegisterPoint) -> Result<f64, ProtocolError> {
        let count = point.register_count();
        match point.kind {
            RegisterKind::Holding => {
                let registers = self.transport.read_holding_registers(point.address, count).await?;
                decode_registers(&registers, point.data_type)
            }
            RegisterKind::Input => {
                let registers = self.transport.read_input_registers(point.address, count).await?;
                decode_registers(&registers, point.data_type)
            }
            RegisterKind::Coil => {
                let bits = self.transport.read_coils(point.address, count).await?;
                first_bit(&bits)
            }
            RegisterKind::Discrete => {
                let bits = self.transport.read_discrete_inputs(point.address, count).await?;
                first_bit(&bits)
            }
        }
    }

    /// 链路中断时在独立任务中重连，避免占用轮询任务。
    fn trigger_reconnect(self: &Arc<Self>) {
        if !self.link.begin_reconnect() {
            return;
        }
        let inner = Arc::clone(self);
        self.tasks.spawn(RECONNECT_TASK, async move {
            inner.complete_reconnect().await;
        });
    }

    async fn complete_reconnect(&self) -> ConnectResult {
        record_reconnect();
        self.transport.disconnect().await;
        let handshake = self.transport.connect(&self.config);
        match self.link.handshake(self.config.connect_timeout_ms, handshake).await {
            Ok(()) if self.link.finish_reconnect() => ConnectResult::ok(),
            Ok(()) => {
                self.transport.disconnect().await;
                ConnectResult::failed("reconnect cancelled by disconnect")
            }
            Err(err) => self.link.fail_reconnect(&err),
        }
    }
}

fn first_bit(bits: &[bool]) -> Result<f64, ProtocolError> {
    bits.first()
        .map(|bit| if *bit { 1.0 } else { 0.0 })
        .ok_or_else(|| ProtocolError::DataParse("empty bit response".to_string()))
}

#[async_trait]
impl Adapter for ModbusAdapter {
    type Config = ModbusConfig;

    const PROTOCOL: &'static str = PROTOCOL;

    fn config_id(config: &ModbusConfig) -> &str {
        &config.id
    }

    fn id(&self) -> &str {
        self.inner.link.id()
    }

    fn status(&self) -> ConnectionStatus {
        self.inner.link.status()
    }

    fn stats(&self) -> AdapterStats {
        let active = self.inner.points().len();
        self.inner.link.stats(active)
    }

    fn subscribe_events(&self) -> broadcast::Receiver<AdapterEvent> {
        self.inner.link.subscribe()
    }

    async fn connect(&self) -> ConnectResult {
        let link = &self.inner.link;
        match link.begin_connect() {
            ConnectStart::AlreadyConnected => return ConnectResult::ok(),
            ConnectStart::Busy(status) => {
                return ConnectResult::failed(format!("connect already in progress ({})", status));
            }
            ConnectStart::Started => {}
        }
        if let Err(err) = self.inner.config.validate() {
            return link.fail_connect(&err);
        }

        let handshake = self.inner.transport.connect(&self.inner.config);
        if let Err(err) = link.handshake(self.inner.config.connect_timeout_ms, handshake).await {
            self.inner.transport.disconnect().await;
            return link.fail_connect(&err);
        }
        if !link.finish_connect() {
            self.inner.transport.disconnect().await;
            return ConnectResult::failed("connect cancelled by disconnect");
        }
        ConnectResult::ok()
    }

    async fn disconnect(&self) {
        // 先切状态，使在途读取与并发 connect 均不再落库
        self.inner.link.transition(ConnectionStatus::Disconnected);
        self.inner.points().clear();
        self.inner.tasks.stop_all().await;
        self.inner.transport.disconnect().await;
    }
}
