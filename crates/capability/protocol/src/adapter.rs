//! 协议适配器公共接口

use crate::types::{AdapterEvent, AdapterStats, ConnectResult, ConnectionStatus};
use async_trait::async_trait;
use tokio::sync::broadcast;

/// 单个连接的协议适配器。
///
/// 注册表只依赖此接口管理生命周期；订阅/轮询等协议特有操作
/// 通过具体类型调用。
#[async_trait]
pub trait Adapter: Send + Sync + 'static {
    /// 连接配置类型
    type Config: Send + 'static;

    /// 协议名（用于日志与注册表事件）
    const PROTOCOL: &'static str;

    /// 从配置中取出连接 ID
    fn config_id(config: &Self::Config) -> &str;

    fn id(&self) -> &str;

    fn status(&self) -> ConnectionStatus;

    fn stats(&self) -> AdapterStats;

    /// 订阅适配器事件；丢弃接收端即取消订阅。
    fn subscribe_events(&self) -> broadcast::Receiver<AdapterEvent>;

    async fn connect(&self) -> ConnectResult;

    /// 停止全部投递任务并进入 disconnected。幂等。
    async fn disconnect(&self);
}
