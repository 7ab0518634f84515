//! 协议相关类型定义

use domain::FieldValue;
use serde::{Deserialize, Serialize};
use std::fmt;

/// 连接状态（三种协议共用同一状态机）
///
/// ```text
/// disconnected ──connect──▶ connecting ──▶ connected ──▶ reconnecting ──▶ connected | error
///                               │
///                               └──▶ error
/// connected | error | reconnecting ──disconnect──▶ disconnected
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `connect()` / `reconnect()` 结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ConnectResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(reason.into()),
        }
    }
}

/// 适配器运行统计
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AdapterStats {
    pub status: ConnectionStatus,
    /// 成功投递次数
    pub deliveries: u64,
    /// 投递失败次数
    pub errors: u64,
    /// 写操作次数（Modbus 写寄存器 / OPC-UA 写节点）
    pub writes: u64,
    /// MQTT 发布次数
    pub published: u64,
    pub last_activity_ms: Option<i64>,
    pub last_error: Option<String>,
    pub connected_since_ms: Option<i64>,
    pub uptime_ms: u64,
    /// 当前活动的点位 / 订阅 / 监控项数量
    pub active_points: usize,
}

/// 适配器事件
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AdapterEvent {
    /// 状态变化，携带新状态
    StatusChange { status: ConnectionStatus },
    /// 一次成功投递
    Data {
        /// 点位键 / 主题 / nodeId
        key: String,
        device_id: String,
        sensor_type: String,
        value: FieldValue,
        timestamp_ms: i64,
    },
    /// 投递或连接错误，不改变连接状态
    Error {
        key: Option<String>,
        message: String,
    },
}

/// 传输模式：实连或模拟
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    Live,
    #[default]
    Simulated,
}

impl TransportMode {
    pub fn from_simulate_flag(simulate: bool) -> Self {
        if simulate { Self::Simulated } else { Self::Live }
    }
}

/// Modbus 寄存器数据类型
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModbusDataType {
    /// 16位有符号整数
    Int16,
    /// 16位无符号整数
    #[default]
    Uint16,
    /// 32位有符号整数（2个寄存器）
    Int32,
    /// 32位无符号整数（2个寄存器）
    Uint32,
    /// 32位浮点数（2个寄存器）
    Float32,
    /// 64位浮点数（4个寄存器）
    Float64,
}

impl ModbusDataType {
    /// 解码所需的最少寄存器数
    pub fn register_count(&self) -> u16 {
        match self {
            Self::Int16 | Self::Uint16 => 1,
            Self::Int32 | Self::Uint32 | Self::Float32 => 2,
            Self::Float64 => 4,
        }
    }
}

/// Modbus 点位的寄存器类别
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterKind {
    /// 线圈 (0x01)
    Coil,
    /// 离散输入 (0x02)
    Discrete,
    /// 保持寄存器 (0x03)
    #[default]
    Holding,
    /// 输入寄存器 (0x04)
    Input,
}

impl RegisterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Coil => "coil",
            Self::Discrete => "discrete",
            Self::Holding => "holding",
            Self::Input => "input",
        }
    }
}
