//! 连接注册表
//!
//! 每种协议一个注册表：按连接 ID 保存适配器，并把适配器事件
//! 附上连接 ID 后转发到注册表自己的事件通道。

use crate::adapter::Adapter;
use crate::error::ProtocolError;
use crate::types::AdapterEvent;
use ems_telemetry::{record_connection_created, record_connection_removed};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{RwLock, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// 注册表事件通道默认容量
pub const REGISTRY_EVENT_CAPACITY: usize = 1024;

/// 注册表转发的适配器事件
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistryEvent {
    pub connection_id: String,
    pub protocol: &'static str,
    pub event: AdapterEvent,
}

type Factory<A> = Box<dyn Fn(<A as Adapter>::Config) -> A + Send + Sync>;

struct Managed<A> {
    adapter: Arc<A>,
    forwarder: CancellationToken,
}

/// 按协议划分的连接注册表。
pub struct ConnectionRegistry<A: Adapter> {
    factory: Factory<A>,
    connections: RwLock<HashMap<String, Managed<A>>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl<A: Adapter> ConnectionRegistry<A> {
    /// 以适配器工厂构造注册表（工厂决定传输实现与共享存储）。
    pub fn new(factory: impl Fn(A::Config) -> A + Send + Sync + 'static) -> Self {
        let (events, _) = broadcast::channel(REGISTRY_EVENT_CAPACITY);
        Self {
            factory: Box::new(factory),
            connections: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// 创建连接（不自动 connect）。重复 ID 返回错误。
    pub async fn create_connection(&self, config: A::Config) -> Result<Arc<A>, ProtocolError> {
        let id = A::config_id(&config).to_string();
        let mut connections = self.connections.write().await;
        if connections.contains_key(&id) {
            return Err(ProtocolError::DuplicateConnection(id));
        }

        let adapter = Arc::new((self.factory)(config));
        let forwarder = self.spawn_forwarder(&id, adapter.subscribe_events());
        connections.insert(
            id.clone(),
            Managed {
                adapter: Arc::clone(&adapter),
                forwarder,
            },
        );
        record_connection_created();
        info!(
            target: "ems.protocol",
            protocol = A::PROTOCOL,
            connection_id = %id,
            "connection_created"
        );
        Ok(adapter)
    }

    pub async fn get_connection(&self, id: &str) -> Option<Arc<A>> {
        self.connections
            .read()
            .await
            .get(id)
            .map(|managed| Arc::clone(&managed.adapter))
    }

    pub async fn get_all_connections(&self) -> Vec<Arc<A>> {
        self.connections
            .read()
            .await
            .values()
            .map(|managed| Arc::clone(&managed.adapter))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    /// 断开并删除连接；未知 ID 返回 false。
    pub async fn remove_connection(&self, id: &str) -> bool {
        let managed = self.connections.write().await.remove(id);
        let Some(managed) = managed else {
            return false;
        };
        managed.adapter.disconnect().await;
        managed.forwarder.cancel();
        record_connection_removed();
        info!(
            target: "ems.protocol",
            protocol = A::PROTOCOL,
            connection_id = %id,
            "connection_removed"
        );
        true
    }

    /// 断开并清空全部连接。
    pub async fn shutdown(&self) {
        let drained: Vec<(String, Managed<A>)> =
            self.connections.write().await.drain().collect();
        let count = drained.len();
        for (_, managed) in drained {
            managed.adapter.disconnect().await;
            managed.forwarder.cancel();
            record_connection_removed();
        }
        info!(
            target: "ems.protocol",
            protocol = A::PROTOCOL,
            connections = count,
            "registry_shutdown"
        );
    }

    /// 订阅注册表事件；丢弃接收端即取消订阅。
    pub fn subscribe_events(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    fn spawn_forwarder(
        &self,
        id: &str,
        mut events: broadcast::Receiver<AdapterEvent>,
    ) -> CancellationToken {
        let token = CancellationToken::new();
        let stop = token.clone();
        let sink = self.events.clone();
        let connection_id = id.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    // 先排空已到达的事件，再响应停止信号
                    biased;
                    received = events.recv() => match received {
                        Ok(event) => {
                            let _ = sink.send(RegistryEvent {
                                connection_id: connection_id.clone(),
                                protocol: A::PROTOCOL,
                                event,
                            });
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(
                                target: "ems.protocol",
                                protocol = A::PROTOCOL,
                                connection_id = %connection_id,
                                skipped,
                                "registry_forwarder_lagged"
                            );
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = stop.cancelled() => break,
                }
            }
        });
        token
    }
}
