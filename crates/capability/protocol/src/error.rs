//! 协议错误类型定义

/// 协议通信错误
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// 连接错误（链路断开、握手失败）
    #[error("connection error: {0}")]
    Connection(String),

    /// IO 错误
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Modbus 异常响应
    #[error("modbus error: {0}")]
    Modbus(String),

    /// 配置解析错误
    #[error("config parse error: {0}")]
    ConfigParse(String),

    /// 配置缺失或取值非法
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// 数据解析错误
    #[error("data parse error: {0}")]
    DataParse(String),

    /// 超时错误
    #[error("timeout: {0}")]
    Timeout(String),

    /// 当前未处于 connected 状态
    #[error("not connected")]
    NotConnected,

    /// 目标节点或地址不存在
    #[error("not found: {0}")]
    NotFound(String),

    /// 注册表中已存在同 ID 连接
    #[error("duplicate connection id: {0}")]
    DuplicateConnection(String),

    /// 当前传输不支持该操作
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// 通道关闭
    #[error("channel closed")]
    ChannelClosed,
}

impl ProtocolError {
    /// 是否表示链路已断开（触发自动重连）。
    pub fn is_link_loss(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Io(_) | Self::ChannelClosed)
    }
}
