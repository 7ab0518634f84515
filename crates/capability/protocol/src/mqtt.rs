//! MQTT 适配器
//!
//! 一个连接只有一个共享定时器：每次触发遍历全部订阅，
//! 并发取回各主题的最新报文，解析后写入时序存储。

use crate::adapter::Adapter;
use crate::error::ProtocolError;
use crate::link::{ConnectStart, LinkState};
use crate::mqtt_transport::{MqttMessage, MqttTransport, RumqttcTransport, SimulatedMqttTransport};
use crate::payload::{infer_sensor_type, parse_payload};
use crate::registry::ConnectionRegistry;
use crate::tasks::TaskSet;
use crate::types::{AdapterEvent, AdapterStats, ConnectResult, ConnectionStatus, TransportMode};
use async_trait::async_trait;
use domain::{FieldValue, now_epoch_ms};
use ems_telemetry::{record_message_published, record_reconnect};
use ems_timeseries::{SensorReading, TimeseriesStore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

const PROTOCOL: &str = "mqtt";
const SAMPLER_TASK: &str = "__sampler";
const RECONNECT_TASK: &str = "__reconnect";

/// MQTT 连接配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    /// 连接 ID（注册表键）
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Broker 主机地址
    #[serde(default)]
    pub host: String,
    /// Broker 端口（默认 1883）
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    /// 客户端 ID（缺省时自动生成）
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_clean_session")]
    pub clean_session: bool,
    /// 连接超时（毫秒）
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// 单次读取超时（毫秒）
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,
    /// 共享定时器间隔（毫秒）
    #[serde(default = "default_sample_interval")]
    pub sample_interval_ms: u64,
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_keep_alive() -> u64 {
    30
}

fn default_clean_session() -> bool {
    true
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_read_timeout() -> u64 {
    1000
}

fn default_sample_interval() -> u64 {
    1000
}

impl MqttConfig {
    pub fn new(id: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            host: host.into(),
            port: default_mqtt_port(),
            client_id: None,
            username: None,
            password: None,
            keep_alive_secs: default_keep_alive(),
            clean_session: default_clean_session(),
            connect_timeout_ms: default_connect_timeout(),
            read_timeout_ms: default_read_timeout(),
            sample_interval_ms: default_sample_interval(),
        }
    }

    /// 从 JSON 配置字符串解析
    pub fn from_json(json: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(json).map_err(|e| ProtocolError::ConfigParse(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.host.trim().is_empty() {
            return Err(ProtocolError::InvalidConfig(
                "host is required for mqtt".to_string(),
            ));
        }
        if self.username.is_some() != self.password.is_some() {
            return Err(ProtocolError::InvalidConfig(
                "username and password must be set together".to_string(),
            ));
        }
        Ok(())
    }
}

/// 主题订阅
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MqttSubscription {
    pub topic: String,
    #[serde(default)]
    pub qos: u8,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub sensor_type: Option<String>,
}

impl MqttSubscription {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            qos: 0,
            device_id: None,
            sensor_type: None,
        }
    }

    pub fn with_qos(mut self, qos: u8) -> Self {
        self.qos = qos;
        self
    }

    pub fn with_device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    pub fn with_sensor_type(mut self, sensor_type: impl Into<String>) -> Self {
        self.sensor_type = Some(sensor_type.into());
        self
    }

    fn resolved_sensor_type(&self) -> String {
        self.sensor_type
            .clone()
            .unwrap_or_else(|| infer_sensor_type(&self.topic).to_string())
    }
}

struct MqttInner {
    config: MqttConfig,
    link: LinkState,
    transport: Arc<dyn MqttTransport>,
    store: Arc<TimeseriesStore>,
    subscriptions: RwLock<BTreeMap<String, MqttSubscription>>,
    tasks: TaskSet,
}

/// MQTT 连接适配器
pub struct MqttAdapter {
    inner: Arc<MqttInner>,
}

impl MqttAdapter {
    pub fn new(
        config: MqttConfig,
        transport: Arc<dyn MqttTransport>,
        store: Arc<TimeseriesStore>,
    ) -> Self {
        let link = LinkState::new(config.id.clone(), PROTOCOL);
        Self {
            inner: Arc::new(MqttInner {
                config,
                link,
                transport,
                store,
                subscriptions: RwLock::new(BTreeMap::new()),
                tasks: TaskSet::default(),
            }),
        }
    }

    /// 构造 MQTT 注册表：每个连接独立创建一个传输实例。
    pub fn registry(store: Arc<TimeseriesStore>, mode: TransportMode) -> ConnectionRegistry<Self> {
        ConnectionRegistry::new(move |config: MqttConfig| {
            let transport: Arc<dyn MqttTransport> = match mode {
                TransportMode::Live => Arc::new(RumqttcTransport::new()),
                TransportMode::Simulated => Arc::new(SimulatedMqttTransport::new()),
            };
            MqttAdapter::new(config, transport, Arc::clone(&store))
        })
    }

    pub fn config(&self) -> &MqttConfig {
        &self.inner.config
    }

    /// 订阅主题。未连接或 Broker 拒绝时返回 false；重复主题直接返回 true。
    pub async fn subscribe(&self, subscription: MqttSubscription) -> bool {
        let inner = &self.inner;
        if !inner.link.is_connected() {
            return false;
        }
        if inner.subscriptions().contains_key(&subscription.topic) {
            return true;
        }
        if let Err(err) = inner
            .transport
            .subscribe(&subscription.topic, subscription.qos)
            .await
        {
            inner.link.record_error(Some(&subscription.topic), &err);
            return false;
        }
        {
            // 与 disconnect 的清空互斥：等待 SUBACK 期间已断开则不保留
            let mut subscriptions = inner.subscriptions_mut();
            if !inner.link.is_connected() {
                return false;
            }
            info!(
                target: "ems.protocol",
                connection_id = %inner.config.id,
                topic = %subscription.topic,
                qos = subscription.qos,
                "subscribed"
            );
            subscriptions
                .entry(subscription.topic.clone())
                .or_insert(subscription);
        }
        true
    }

    /// 取消订阅；未知主题返回 false。
    pub async fn unsubscribe(&self, topic: &str) -> bool {
        let removed = self.inner.subscriptions_mut().remove(topic);
        if removed.is_none() {
            return false;
        }
        if let Err(err) = self.inner.transport.unsubscribe(topic).await {
            debug!(target: "ems.protocol", connection_id = %self.inner.config.id, topic, error = %err, "unsubscribe failed");
        }
        info!(target: "ems.protocol", connection_id = %self.inner.config.id, topic, "unsubscribed");
        true
    }

    /// 当前订阅
    pub fn subscriptions(&self) -> Vec<MqttSubscription> {
        self.inner.subscriptions().values().cloned().collect()
    }

    /// 发布消息；仅在 connected 状态下成功。
    pub async fn publish(&self, topic: &str, payload: &[u8], qos: u8) -> Result<(), ProtocolError> {
        if !self.inner.link.is_connected() {
            return Err(ProtocolError::NotConnected);
        }
        self.inner.transport.publish(topic, payload, qos).await?;
        self.inner.link.record_published();
        record_message_published();
        debug!(
            target: "ems.protocol",
            connection_id = %self.inner.config.id,
            topic,
            bytes = payload.len(),
            "published"
        );
        Ok(())
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

impl MqttInner {
    fn subscriptions(&self) -> RwLockReadGuard<'_, BTreeMap<String, MqttSubscription>> {
        self.subscriptions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn subscriptions_mut(&self) -> RwLockWriteGuard<'_, BTreeMap<String, MqttSubscription>> {
        self.subscriptions.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_sampler(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        self.tasks
            .spawn_if_idle(SAMPLER_TASK, async move { inner.sample_loop().await });
    }

    async fn sample_loop(self: Arc<Self>) {
        let period = Duration::from_millis(self.config.sample_interval_ms.max(1));
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

    /// 并发读取全部订阅，单个主题失败不阻塞其他主题。
    async fn sample_once(self: &Arc<Self>) {
        let subscriptions: Vec<MqttSubscription> =
            self.subscriptions().values().cloned().collect();
        if subscriptions.is_empty() {
            return;
        }

        let read_timeout = Duration::from_millis(self.config.read_timeout_ms);
        let mut reads = JoinSet::new();
        for subscription in subscriptions {
            let transport = Arc::clone(&self.transport);
            reads.spawn(async move {
                let result = match tokio::time::timeout(read_timeout, transport.receive(&subscription)).await {
                    Ok(result) => result,
                    Err(_) => Err(ProtocolError::Timeout(format!(
                        "no response for {}",
                        subscription.topic
                    ))),
                };
                (subscription, result)
            });
        }

        let mut link_lost = false;
        while let Some(joined) = reads.join_next().await {
            let Ok((subscription, result)) = joined else {
                continue;
            };
            match result {
                Ok(Some(message)) => self.deliver(&subscription, message),
                Ok(None) => {}
                Err(err) => {
                    link_lost |= err.is_link_loss();
                    self.link.record_error(Some(&subscription.topic), &err);
                }
            }
        }
        if link_lost {
            self.trigger_reconnect();
        }
    }

    fn deliver(&self, subscription: &MqttSubscription, message: MqttMessage) {
        let parsed = match parse_payload(&message.payload) {
            Ok(parsed) => parsed,
            Err(err) => {
                self.link.record_error(Some(&subscription.topic), &err);
                return;
            }
        };
        // 写入前再次确认状态，断开后的在途报文不落库
        if !self.link.is_connected() {
            return;
        }
        let device_id = subscription
            .device_id
            .clone()
            .unwrap_or_else(|| self.config.id.clone());
        let sensor_type = subscription.resolved_sensor_type();
        let timestamp_ms = parsed.timestamp_ms.unwrap_or_else(now_epoch_ms);

        let mut reading = SensorReading::new(device_id.clone(), sensor_type.clone(), parsed.value)
            .with_quality(parsed.quality.unwrap_or_else(|| "good".to_string()))
            .at(timestamp_ms);
        if let Some(unit) = parsed.unit {
            reading = reading.with_unit(unit);
        }
        self.store.write_sensor_reading(reading);
        self.link.record_delivery(AdapterEvent::Data {
            key: message.topic,
            device_id,
            sensor_type,
            value: FieldValue::Number(parsed.value),
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
        if let Err(err) = self.link.handshake(self.config.connect_timeout_ms, handshake).await {
            return self.link.fail_reconnect(&err);
        }
        self.resubscribe().await;
        if !self.link.finish_reconnect() {
            self.transport.disconnect().await;
            return ConnectResult::failed("reconnect cancelled by disconnect");
        }
        ConnectResult::ok()
    }

    /// 新会话上恢复已有订阅。
    async fn resubscribe(&self) {
        let subscriptions: Vec<MqttSubscription> =
            self.subscriptions().values().cloned().collect();
        for subscription in subscriptions {
            if let Err(err) = self
                .transport
                .subscribe(&subscription.topic, subscription.qos)
                .await
            {
                warn!(
                    target: "ems.protocol",
                    connection_id = %self.config.id,
                    topic = %subscription.topic,
                    error = %err,
                    "resubscribe failed"
                );
                self.link.record_error(Some(&subscription.topic), &err);
            }
        }
    }
}

#[async_trait]
impl Adapter for MqttAdapter {
    type Config = MqttConfig;

    const PROTOCOL: &'static str = PROTOCOL;

    fn config_id(config: &MqttConfig) -> &str {
        &config.id
    }

    fn id(&self) -> &str {
        self.inner.link.id()
    }

    fn status(&self) -> ConnectionStatus {
        self.inner.link.status()
    }

    fn stats(&self) -> AdapterStats {
        let active = self.inner.subscriptions().len();
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
        // error 后重新 connect 时恢复保留的订阅
        self.inner.resubscribe().await;
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
        self.inner.subscriptions_mut().clear();
        self.inner.transport.disconnect().await;
    }
}
