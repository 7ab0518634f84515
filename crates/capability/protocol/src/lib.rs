//! # 协议适配能力模块
//!
//! 提供多协议设备接入能力，支持：
//! - **Modbus**：每个点位独立轮询寄存器/线圈
//! - **MQTT**：订阅主题，共享定时器取回最新报文；支持发布
//! - **OPC-UA**：浏览、读写节点，共享定时器采样监控项
//!
//! ## 架构设计
//!
//! ```text
//! ConnectionRegistry<A>（每种协议一个）
//!       │  create / get / remove / shutdown，事件附连接 ID 转发
//!       ▼
//! Adapter（ModbusAdapter / MqttAdapter / OpcUaAdapter）
//!       │  LinkState：状态机 + 计数 + 事件广播
//!       │  TaskSet：轮询 / 采样 / 重连任务
//!       ▼
//! Transport trait（实连 / 模拟两种实现，适配器不区分）
//!       │
//!       ▼
//! TimeseriesStore（sensor_readings）
//! ```
//!
//! ## 连接状态
//!
//! `disconnected → connecting → connected → reconnecting → connected | error`，
//! 任意状态 `disconnect()` 回到 `disconnected`。每次迁移发出一次
//! `StatusChange` 事件，不会连续出现相同状态。
//!
//! ## 配置格式
//!
//! ```json
//! // Modbus
//! { "id": "plc-1", "type": "tcp", "host": "10.0.0.5", "port": 502, "unit_id": 1 }
//! // Modbus 点位
//! { "address": 100, "length": 1, "type": "holding", "data_type": "int16",
//!   "scale_factor": 0.1, "offset": 0, "poll_interval_ms": 1000 }
//!
//! // MQTT
//! { "id": "broker-1", "host": "10.0.0.9", "port": 1883, "sample_interval_ms": 1000 }
//!
//! // OPC-UA
//! { "id": "opc-1", "endpoint_url": "opc.tcp://10.0.0.8:4840", "publishing_interval_ms": 1000 }
//! ```

mod adapter;
mod error;
mod link;
mod modbus;
mod modbus_transport;
mod mqtt;
mod mqtt_transport;
mod opcua;
mod opcua_transport;
mod payload;
mod registry;
mod tasks;
mod types;

pub use adapter::Adapter;
pub use error::ProtocolError;
pub use link::DEFAULT_EVENT_CAPACITY;
pub use modbus::{ModbusAdapter, ModbusConfig, ModbusLink, RegisterPoint};
pub use modbus_transport::{
    ModbusTransport, SimulatedModbusTransport, TokioModbusTransport, decode_registers,
};
pub use mqtt::{MqttAdapter, MqttConfig, MqttSubscription};
pub use mqtt_transport::{
    MqttMessage, MqttTransport, RumqttcTransport, SimulatedMqttTransport, topic_matches,
};
pub use opcua::{MonitoredItem, OpcUaAdapter, OpcUaConfig, SecurityMode};
pub use opcua_transport::{
    DataValue, NodeClass, NodeDescriptor, OBJECTS_FOLDER, OpcUaDataType, OpcUaTransport,
    SimulatedOpcUaTransport, UnavailableOpcUaTransport, Variant,
};
pub use payload::{ParsedPayload, infer_sensor_type, parse_payload};
pub use registry::{ConnectionRegistry, REGISTRY_EVENT_CAPACITY, RegistryEvent};
pub use types::*;

/// Modbus 连接注册表
pub type ModbusRegistry = ConnectionRegistry<ModbusAdapter>;
/// MQTT 连接注册表
pub type MqttRegistry = ConnectionRegistry<MqttAdapter>;
/// OPC-UA 连接注册表
pub type OpcUaRegistry = ConnectionRegistry<OpcUaAdapter>;
