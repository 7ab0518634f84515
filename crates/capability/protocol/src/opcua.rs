//! OPC-UA 适配器
//!
//! 监控项由一个共享定时器统一采样；`browse_nodes` / `read_node` /
//! `write_node` 与监控项相互独立。数值类节点写入时序存储，
//! 字符串节点只发出 `Data` 事件。

use crate::adapter::Adapter;
use crate::error::ProtocolError;
use crate::link::{ConnectStart, LinkState};
use crate::opcua_transport::{
    DataValue, NodeDescriptor, OBJECTS_FOLDER, OpcUaDataType, OpcUaTransport,
    SimulatedOpcUaTransport, UnavailableOpcUaTransport, Variant,
};
use crate::payload::infer_sensor_type;
use crate::registry::ConnectionRegistry;
use crate::tasks::TaskSet;
use crate::types::{AdapterEvent, AdapterStats, ConnectResult, ConnectionStatus, TransportMode};
use async_trait::async_trait;
use ems_telemetry::record_reconnect;
use ems_timeseries::{SensorReading, TimeseriesStore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

const PROTOCOL: &str = "opcua";
const SAMPLER_TASK: &str = "__sampler";
const RECONNECT_TASK: &str = "__reconnect";
const DEFAULT_SENSOR_TYPE: &str = "opcua_node";

/// 安全模式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecurityMode {
    #[default]
    None,
    Sign,
    SignAndEncrypt,
}

/// OPC-UA 连接配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpcUaConfig {
    /// 连接 ID（注册表键）
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// 服务器端点，如 `opc.tcp://10.0.0.8:4840`
    #[serde(default)]
    pub endpoint_url: String,
    #[serde(default)]
    pub security_mode: SecurityMode,
    #[serde(default = "default_security_policy")]
    pub security_policy: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// 会话超时（毫秒），同时作为建立会话的超时
    #[serde(default = "default_session_timeout")]
    pub requested_session_timeout_ms: u64,
    /// 共享定时器间隔（毫秒）
    #[serde(default = "default_publishing_interval")]
    pub publishing_interval_ms: u64,
    /// 单次读取超时（毫秒）
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,
}

fn default_security_policy() -> String {
    "None".to_string()
}

fn default_session_timeout() -> u64 {
    60_000
}

fn default_publishing_interval() -> u64 {
    1000
}

fn default_read_timeout() -> u64 {
    3000
}

impl OpcUaConfig {
    pub fn new(id: impl Into<String>, endpoint_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            endpoint_url: endpoint_url.into(),
            security_mode: SecurityMode::None,
            security_policy: default_security_policy(),
            username: None,
            password: None,
            requested_session_timeout_ms: default_session_timeout(),
            publishing_interval_ms: default_publishing_interval(),
            read_timeout_ms: default_read_timeout(),
        }
    }

    /// 从 JSON 配置字符串解析
    pub fn from_json(json: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(json).map_err(|e| ProtocolError::ConfigParse(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        let endpoint = self.endpoint_url.trim();
        if endpoint.is_empty() {
            return Err(ProtocolError::InvalidConfig(
                "endpoint_url is required for opc-ua".to_string(),
            ));
        }
        if !endpoint.starts_with("opc.tcp://") {
            return Err(ProtocolError::InvalidConfig(format!(
                "endpoint_url must start with opc.tcp://, got {}",
                endpoint
            )));
        }
        if self.security_mode != SecurityMode::None && self.security_policy == "None" {
            return Err(ProtocolError::InvalidConfig(
                "security_policy is required when security_mode is not None".to_string(),
            ));
        }
        Ok(())
    }
}

/// 监控项
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoredItem {
    pub node_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub data_type: OpcUaDataType,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub sensor_type: Option<String>,
    /// 期望采样间隔（仅作记录）；实际采样由连接的 `publishing_interval_ms` 共享定时器驱动
    #[serde(default = "default_sampling_interval")]
    pub sampling_interval_ms: u64,
}

fn default_sampling_interval() -> u64 {
    1000
}

impl MonitoredItem {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            display_name: None,
            data_type: OpcUaDataType::default(),
            device_id: None,
            sensor_type: None,
            sampling_interval_ms: default_sampling_interval(),
        }
    }

    pub fn with_device(mut self, device_id: impl Into<String>, sensor_type: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self.sensor_type = Some(sensor_type.into());
        self
    }

    fn resolved_sensor_type(&self) -> String {
        if let Some(sensor_type) = &self.sensor_type {
            return sensor_type.clone();
        }
        let name = self.display_name.as_deref().unwrap_or(&self.node_id);
        match infer_sensor_type(name) {
            "generic" => DEFAULT_SENSOR_TYPE.to_string(),
            inferred => inferred.to_string(),
        }
    }
}

struct OpcUaInner {
    config: OpcUaConfig,
    link: LinkState,
    transport: Arc<dyn OpcUaTransport>,
    store: Arc<TimeseriesStore>,
    items: RwLock<BTreeMap<String, MonitoredItem>>,
    tasks: TaskSet,
}

/// OPC-UA 连接适配器
pub struct OpcUaAdapter {
    inner: Arc<OpcUaInner>,
}

impl OpcUaAdapter {
    pub fn new(
        config: OpcUaConfig,
        transport: Arc<dyn OpcUaTransport>,
        store: Arc<TimeseriesStore>,
    ) -> Self {
        let link = LinkState::new(config.id.clone(), PROTOCOL);
        Self {
            inner: Arc::new(OpcUaInner {
                config,
                link,
                transport,
                store,
                items: RwLock::new(BTreeMap::new()),
                tasks: TaskSet::default(),
            }),
        }
    }

    /// 构造 OPC-UA 注册表。实连模式下 `connect` 返回 unsupported。
    pub fn registry(store: Arc<TimeseriesStore>, mode: TransportMode) -> ConnectionRegistry<Self> {
        ConnectionRegistry::new(move |config: OpcUaConfig| {
            let transport: Arc<dyn OpcUaTransport> = match mode {
                TransportMode::Live => Arc::new(UnavailableOpcUaTransport),
                TransportMode::Simulated => Arc::new(SimulatedOpcUaTransport::new()),
            };
            OpcUaAdapter::new(config, transport, Arc::clone(&store))
        })
    }

    pub fn config(&self) -> &OpcUaConfig {
        &self.inner.config
    }

    /// 浏览子节点，缺省从 Objects 文件夹开始。
    pub async fn browse_nodes(
        &self,
        parent_node_id: Option<&str>,
    ) -> Result<Vec<NodeDescriptor>, ProtocolError> {
        self.inner.ensure_connected()?;
        self.inner
            .transport
            .browse(parent_node_id.unwrap_or(OBJECTS_FOLDER))
            .await
    }

    pub async fn read_node(&self, node_id: &str) -> Result<DataValue, ProtocolError> {
        self.inner.ensure_connected()?;
        self.inner.transport.read(node_id).await
    }

    pub async fn write_node(&self, node_id: &str, value: Variant) -> Result<(), ProtocolError> {
        self.inner.ensure_connected()?;
        self.inner.transport.write(node_id, value).await?;
        self.inner.link.record_write();
        info!(target: "ems.protocol", connection_id = %self.inner.config.id, node_id, "node_written");
        Ok(())
    }

    /// 添加监控项。未连接时返回 false；重复 nodeId 直接返回 true。
    pub fn subscribe_node(&self, item: MonitoredItem) -> bool {
        if !self.inner.link.is_connected() {
            return false;
        }
        let mut items = self.inner.items_mut();
        if items.contains_key(&item.node_id) {
            return true;
        }
        info!(
            target: "ems.protocol",
            connection_id = %self.inner.config.id,
            node_id = %item.node_id,
            "node_monitored"
        );
        items.insert(item.node_id.clone(), item);
        true
    }

    /// 移除监控项；未知 nodeId 返回 false。
    pub fn unsubscribe_node(&self, node_id: &str) -> bool {
        let removed = self.inner.items_mut().remove(node_id).is_some();
        if removed {
            info!(target: "ems.protocol", connection_id = %self.inner.config.id, node_id, "node_unmonitored");
        }
        removed
    }

    pub fn monitored_items(&self) -> Vec<MonitoredItem> {
        self.inner.items().values().cloned().collect()
    }

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

impl OpcUaInner {
    fn items(&self) -> RwLockReadGuard<'_, BTreeMap<String, MonitoredItem>> {
        self.items.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn items_mut(&self) -> RwLockWriteGuard<'_, BTreeMap<String, MonitoredItem>> {
        self.items.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_connected(&self) -> Result<(), ProtocolError> {
        if self.link.is_connected() {
            Ok(())
        } else {
            Err(ProtocolError::NotConnected)
        }
    }

    fn ensure_sampler(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        self.tasks
            .spawn_if_idle(SAMPLER_TASK, async move { inner.sample_loop().await });
    }

    async fn sample_loop(self: Arc<Self>) {
        let period = Duration::from_millis(self.config.publishing_interval_ms.max(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if !self.link.is_connected() {
                continue;
            }
            self.sample_once().await;
        }
    }

    async fn sample_once(self: &Arc<Self>) {
        let items: Vec<MonitoredItem> = self.items().values().cloned().collect();
        if items.is_empty() {
            return;
        }

        let read_timeout = Duration::from_millis(self.config.read_timeout_ms);
        let mut reads = JoinSet::new();
        for item in items {
            let transport = Arc::clone(&self.transport);
            reads.spawn(async move {
                let result = match tokio::time::timeout(read_timeout, transport.read(&item.node_id)).await {
                    Ok(result) => result,
                    Err(_) => Err(ProtocolError::Timeout(format!("read {}", item.node_id))),
                };
                (item, result)
            });
        }

        let mut link_lost = false;
        while let Some(joined) = reads.join_next().await {
            let Ok((item, result)) = joined else {
                continue;
            };
            match result {
                Ok(data) => self.deliver(&item, data),
                Err(err) => {
                    link_lost |= err.is_link_loss();
                    self.link.record_error(Some(&item.node_id), &err);
                }
            }
        }
        if link_lost {
            self.trigger_reconnect();
        }
    }

    fn deliver(&self, item: &MonitoredItem, data: DataValue) {
        if !self.link.is_connected() {
            return;
        }
        let device_id = item
            .device_id
            .clone()
            .unwrap_or_else(|| self.config.id.clone());
        let sensor_type = item.resolved_sensor_type();
        let timestamp_ms = data.source_timestamp_ms;

        if let Some(value) = data.value.as_f64() {
            self.store.write_sensor_reading(
                SensorReading::new(device_id.clone(), sensor_type.clone(), value)
                    .with_quality(data.quality.clone())
                    .at(timestamp_ms),
            );
        } else {
            debug!(
                target: "ems.protocol",
                connection_id = %self.config.id,
                node_id = %item.node_id,
                "non-numeric value not stored"
            );
        }
        self.link.record_delivery(AdapterEvent::Data {
            key: item.node_id.clone(),
            device_id,
            sensor_type,
            value: data.value.to_field_value(),
            timestamp_ms,
        });
    }

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
        match self
            .link
            .handshake(self.config.requested_session_timeout_ms, handshake)
            .await
        {
            Ok(()) if self.link.finish_reconnect() => ConnectResult::ok(),
            Ok(()) => {
                self.transport.disconnect().await;
                ConnectResult::failed("reconnect cancelled by disconnect")
            }
            Err(err) => self.link.fail_reconnect(&err),
        }
    }
}

#[async_trait]
impl Adapter for OpcUaAdapter {
    type Config = OpcUaConfig;

    const PROTOCOL: &'static str = PROTOCOL;

    fn config_id(config: &OpcUaConfig) -> &str {
        &config.id
    }

    fn id(&self) -> &str {
        self.inner.link.id()
    }

    fn status(&self) -> ConnectionStatus {
        self.inner.link.status()
    }

    fn stats(&self) -> AdapterStats {
        let active = self.inner.items().len();
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
        if let Err(err) = link
            .handshake(self.inner.config.requested_session_timeout_ms, handshake)
            .await
        {
            self.inner.transport.disconnect().await;
            return link.fail_connect(&err);
        }
        if !link.finish_connect() {
            self.inner.transport.disconnect().await;
            return ConnectResult::failed("connect cancelled by disconnect");
        }
        self.inner.ensure_sampler();
        if link.status() == ConnectionStatus::Disconnected {
            self.inner.tasks.stop(SAMPLER_TASK).await;
            return ConnectResult::failed("connect cancelled by disconnect");
        }
        ConnectResult::ok()
    }

    async fn disconnect(&self) {
        self.inner.link.transition(ConnectionStatus::Disconnected);
        self.inner.tasks.stop_all().await;
        self.inner.items_mut().clear();
        self.inner.transport.disconnect().await;
    }
}
