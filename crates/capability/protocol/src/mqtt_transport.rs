//! MQTT 传输层
//!
//! - [`RumqttcTransport`]：基于 rumqttc 的实连传输，事件循环在后台任务中运行，
//!   每个订阅过滤器缓存最近一条消息，由适配器的共享定时器取走
//! - [`SimulatedMqttTransport`]：合成 JSON 报文，支持注入指定报文与故障

use crate::error::ProtocolError;
use crate::mqtt::{MqttConfig, MqttSubscription};
use crate::payload::{default_unit, infer_sensor_type};
use async_trait::async_trait;
use rand::Rng;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// 收到的 MQTT 消息
#[derive(Debug, Clone, PartialEq)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// MQTT 传输接口
#[async_trait]
pub trait MqttTransport: Send + Sync {
    async fn connect(&self, config: &MqttConfig) -> Result<(), ProtocolError>;

    async fn disconnect(&self);

    async fn subscribe(&self, topic: &str, qos: u8) -> Result<(), ProtocolError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), ProtocolError>;

    async fn publish(&self, topic: &str, payload: &[u8], qos: u8) -> Result<(), ProtocolError>;

    /// 取走该订阅自上次以来的最新消息；无新消息时返回 `None`。
    async fn receive(
        &self,
        subscription: &MqttSubscription,
    ) -> Result<Option<MqttMessage>, ProtocolError>;
}

pub(crate) fn qos_from_u8(value: u8) -> QoS {
    match value {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

/// 主题过滤器匹配（支持 `+` 单层与 `#` 多层通配符）
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

// ============================================
// rumqttc 实连传输
// ============================================

struct Session {
    client: AsyncClient,
    eventloop: JoinHandle<()>,
}

struct AbortOnDrop(Option<JoinHandle<()>>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.abort();
        }
    }
}

type Inbox = Arc<Mutex<HashMap<String, MqttMessage>>>;
type Filters = Arc<Mutex<Vec<String>>>;

/// rumqttc 实连传输
#[derive(Default)]
pub struct RumqttcTransport {
    session: tokio::sync::Mutex<Option<Session>>,
    inbox: Inbox,
    filters: Filters,
    link_lost: Arc<AtomicBool>,
}

impl RumqttcTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl MqttTransport for RumqttcTransport {
    async fn connect(&self, config: &MqttConfig) -> Result<(), ProtocolError> {
        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(|| format!("ems-collector-{}", uuid::Uuid::new_v4()));
        let mut options = MqttOptions::new(client_id, config.host.clone(), config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
        options.set_clean_session(config.clean_session);
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username.clone(), password.clone());
        }

        let (client, mut eventloop) = AsyncClient::new(options, 64);
        let (ready_tx, ready_rx) = oneshot::channel::<Result<(), String>>();
        let inbox = Arc::clone(&self.inbox);
        let filters = Arc::clone(&self.filters);
        let link_lost = Arc::clone(&self.link_lost);
        link_lost.store(false, Ordering::SeqCst);

        let eventloop = tokio::spawn(async move {
            let mut ready = Some(ready_tx);
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        if let Some(tx) = ready.take() {
                            let _ = tx.send(Ok(()));
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let message = MqttMessage {
                            topic: publish.topic.clone(),
                            payload: publish.payload.to_vec(),
                        };
                        let matched: Vec<String> = lock(&filters)
                            .iter()
                            .filter(|filter| topic_matches(filter, &publish.topic))
                            .cloned()
                            .collect();
                        let mut buffered = lock(&inbox);
                        for filter in matched {
                            buffered.insert(filter, message.clone());
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if let Some(tx) = ready.take() {
                            let _ = tx.send(Err(e.to_string()));
                            break;
                        }
                        warn!(target: "ems.protocol", error = %e, "mqtt eventloop error");
                        link_lost.store(true, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });
        // 握手被超时取消时随之中止事件循环
        let mut guard = AbortOnDrop(Some(eventloop));

        match ready_rx.await {
            Ok(Ok(())) => {
                info!(target: "ems.protocol", host = %config.host, port = config.port, "mqtt connected");
                if let Some(eventloop) = guard.0.take() {
                    *self.session.lock().await = Some(Session { client, eventloop });
                }
                Ok(())
            }
            Ok(Err(reason)) => Err(ProtocolError::Connection(reason)),
            Err(_) => Err(ProtocolError::ChannelClosed),
        }
    }

    async fn disconnect(&self) {
        if let Some(session) = self.session.lock().await.take() {
            if let Err(e) = session.client.disconnect().await {
                debug!(target: "ems.protocol", error = %e, "mqtt disconnect error");
            }
            session.eventloop.abort();
        }
        lock(&self.filters).clear();
        lock(&self.inbox).clear();
    }

    async fn subscribe(&self, topic: &str, qos: u8) -> Result<(), ProtocolError> {
        let guard = self.session.lock().await;
        let session = guard.as_ref().ok_or(ProtocolError::NotConnected)?;
        session
            .client
            .subscribe(topic, qos_from_u8(qos))
            .await
            .map_err(|e| ProtocolError::Connection(e.to_string()))?;
        let mut filters = lock(&self.filters);
        if !filters.iter().any(|f| f == topic) {
            filters.push(topic.to_string());
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), ProtocolError> {
        lock(&self.filters).retain(|f| f != topic);
        lock(&self.inbox).remove(topic);
        let guard = self.session.lock().await;
        let session = guard.as_ref().ok_or(ProtocolError::NotConnected)?;
        session
            .client
            .unsubscribe(topic)
            .await
            .map_err(|e| ProtocolError::Connection(e.to_string()))
    }

    async fn publish(&self, topic: &str, payload: &[u8], qos: u8) -> Result<(), ProtocolError> {
        let guard = self.session.lock().await;
        let session = guard.as_ref().ok_or(ProtocolError::NotConnected)?;
        session
            .client
            .publish(topic, qos_from_u8(qos), false, payload.to_vec())
            .await
            .map_err(|e| ProtocolError::Connection(e.to_string()))
    }

    async fn receive(
        &self,
        subscription: &MqttSubscription,
    ) -> Result<Option<MqttMessage>, ProtocolError> {
        if self.link_lost.load(Ordering::SeqCst) {
            return Err(ProtocolError::Connection("mqtt link lost".to_string()));
        }
        Ok(lock(&self.inbox).remove(&subscription.topic))
    }
}

// ============================================
// 模拟传输
// ============================================

/// 模拟 MQTT Broker
///
/// 每次 `receive` 优先返回注入的报文，否则按传感器类型合成
/// `{"value": .., "unit": ..}` 报文。
pub struct SimulatedMqttTransport {
    handshake_delay: Duration,
    suback_delay: Duration,
    connected: AtomicBool,
    fail_connect: AtomicBool,
    fail_receive: AtomicBool,
    link_lost: AtomicBool,
    injected: Mutex<HashMap<String, VecDeque<Vec<u8>>>>,
    published: Mutex<Vec<MqttMessage>>,
}

impl Default for SimulatedMqttTransport {
    fn default() -> Self {
        Self {
            handshake_delay: Duration::from_millis(100),
            suback_delay: Duration::ZERO,
            connected: AtomicBool::new(false),
            fail_connect: AtomicBool::new(false),
            fail_receive: AtomicBool::new(false),
            link_lost: AtomicBool::new(false),
            injected: Mutex::new(HashMap::new()),
            published: Mutex::new(Vec::new()),
        }
    }
}

impl SimulatedMqttTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handshake_delay(mut self, delay: Duration) -> Self {
        self.handshake_delay = delay;
        self
    }

    /// 订阅确认（SUBACK）延迟
    pub fn with_suback_delay(mut self, delay: Duration) -> Self {
        self.suback_delay = delay;
        self
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_receive(&self, fail: bool) {
        self.fail_receive.store(fail, Ordering::SeqCst);
    }

    pub fn drop_link(&self) {
        self.link_lost.store(true, Ordering::SeqCst);
    }

    /// 注入一条报文，下次读取该主题时返回。
    pub fn inject(&self, topic: impl Into<String>, payload: impl Into<Vec<u8>>) {
        lock(&self.injected)
            .entry(topic.into())
            .or_default()
            .push_back(payload.into());
    }

    /// 已发布的消息（按发布顺序）
    pub fn published(&self) -> Vec<MqttMessage> {
        lock(&self.published).clone()
    }

    fn synthesize(topic: &str, sensor_type: &str) -> MqttMessage {
        let mut rng = rand::rng();
        let value: f64 = match sensor_type {
            "temperature" => rng.random_range(18.0..35.0),
            "humidity" => rng.random_range(30.0..80.0),
            "pressure" => rng.random_range(1.0..10.0),
            "vibration" => rng.random_range(0.0..12.0),
            "speed" => rng.random_range(0.0..3000.0),
            _ => rng.random_range(0.0..100.0),
        };
        let value = (value * 100.0).round() / 100.0;
        let payload = serde_json::json!({
            "value": value,
            "unit": default_unit(sensor_type),
        });
        MqttMessage {
            topic: topic.to_string(),
            payload: payload.to_string().into_bytes(),
        }
    }
}

#[async_trait]
impl MqttTransport for SimulatedMqttTransport {
    async fn connect(&self, config: &MqttConfig) -> Result<(), ProtocolError> {
        tokio::time::sleep(self.handshake_delay).await;
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(ProtocolError::Connection(format!(
                "simulated broker refused {}:{}",
                config.host, config.port
            )));
        }
        self.link_lost.store(false, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn subscribe(&self, _topic: &str, _qos: u8) -> Result<(), ProtocolError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ProtocolError::NotConnected);
        }
        if !self.suback_delay.is_zero() {
            tokio::time::sleep(self.suback_delay).await;
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), ProtocolError> {
        lock(&self.injected).remove(topic);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &[u8], _qos: u8) -> Result<(), ProtocolError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ProtocolError::NotConnected);
        }
        lock(&self.published).push(MqttMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        });
        Ok(())
    }

    async fn receive(
        &self,
        subscription: &MqttSubscription,
    ) -> Result<Option<MqttMessage>, ProtocolError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ProtocolError::NotConnected);
        }
        if self.link_lost.load(Ordering::SeqCst) {
            return Err(ProtocolError::Connection("simulated link loss".to_string()));
        }
        if self.fail_receive.load(Ordering::SeqCst) {
            return Err(ProtocolError::DataParse("simulated receive failure".to_string()));
        }
        let injected = lock(&self.injected)
            .get_mut(&subscription.topic)
            .and_then(VecDeque::pop_front);
        if let Some(payload) = injected {
            return Ok(Some(MqttMessage {
                topic: subscription.topic.clone(),
                payload,
            }));
        }
        let sensor_type = subscription
            .sensor_type
            .as_deref()
            .unwrap_or_else(|| infer_sensor_type(&subscription.topic));
        Ok(Some(Self::synthesize(&subscription.topic, sensor_type)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_matches() {
        assert!(topic_matches("plant/line1/temp", "plant/line1/temp"));
        assert!(topic_matches("plant/+/temp", "plant/line2/temp"));
        assert!(topic_matches("plant/#", "plant/line2/temp"));
        assert!(topic_matches("#", "anything/at/all"));
        assert!(!topic_matches("plant/+/temp", "plant/line2/humidity"));
        assert!(!topic_matches("plant/line1", "plant/line1/temp"));
        assert!(!topic_matches("plant/line1/temp", "plant/line1"));
    }

    #[test]
    fn test_qos_from_u8() {
        assert_eq!(qos_from_u8(0), QoS::AtMostOnce);
        assert_eq!(qos_from_u8(2), QoS::ExactlyOnce);
        assert_eq!(qos_from_u8(9), QoS::AtLeastOnce);
    }
}
