//! OPC-UA 传输层
//!
//! 当前依赖栈中没有 OPC-UA 客户端实现：
//! - [`UnavailableOpcUaTransport`]：实连模式占位，`connect` 返回 unsupported
//! - [`SimulatedOpcUaTransport`]：内置地址空间的模拟服务器

use crate::error::ProtocolError;
use crate::opcua::OpcUaConfig;
use async_trait::async_trait;
use domain::{FieldValue, now_epoch_ms};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// 标准 Objects 文件夹
pub const OBJECTS_FOLDER: &str = "ns=0;i=85";

/// 节点类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeClass {
    Object,
    Variable,
}

/// 变量数据类型
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpcUaDataType {
    Boolean,
    Int32,
    #[default]
    Double,
    String,
}

/// 节点取值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Variant {
    Boolean(bool),
    Int32(i32),
    Double(f64),
    String(String),
}

impl Variant {
    /// 数值化：布尔映射为 1 / 0，字符串无数值。
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Boolean(b) => Some(if *b { 1.0 } else { 0.0 }),
            Self::Int32(v) => Some(*v as f64),
            Self::Double(v) => Some(*v),
            Self::String(_) => None,
        }
    }

    pub fn data_type(&self) -> OpcUaDataType {
        match self {
            Self::Boolean(_) => OpcUaDataType::Boolean,
            Self::Int32(_) => OpcUaDataType::Int32,
            Self::Double(_) => OpcUaDataType::Double,
            Self::String(_) => OpcUaDataType::String,
        }
    }

    pub fn to_field_value(&self) -> FieldValue {
        match self {
            Self::Boolean(b) => FieldValue::Bool(*b),
            Self::Int32(v) => FieldValue::Number(*v as f64),
            Self::Double(v) => FieldValue::Number(*v),
            Self::String(s) => FieldValue::Text(s.clone()),
        }
    }
}

/// 带质量与源时间戳的读取结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataValue {
    pub value: Variant,
    pub quality: String,
    pub source_timestamp_ms: i64,
}

/// 浏览结果中的节点描述
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub node_id: String,
    pub browse_name: String,
    pub display_name: String,
    pub node_class: NodeClass,
    #[serde(default)]
    pub data_type: Option<OpcUaDataType>,
}

/// OPC-UA 传输接口
#[async_trait]
pub trait OpcUaTransport: Send + Sync {
    async fn connect(&self, config: &OpcUaConfig) -> Result<(), ProtocolError>;

    async fn disconnect(&self);

    async fn browse(&self, parent_node_id: &str) -> Result<Vec<NodeDescriptor>, ProtocolError>;

    async fn read(&self, node_id: &str) -> Result<DataValue, ProtocolError>;

    async fn write(&self, node_id: &str, value: Variant) -> Result<(), ProtocolError>;
}

// ============================================
// 实连占位
// ============================================

/// 实连模式占位传输
#[derive(Debug, Default)]
pub struct UnavailableOpcUaTransport;

impl UnavailableOpcUaTransport {
    fn unsupported() -> ProtocolError {
        ProtocolError::Unsupported("no live opc-ua transport is available".to_string())
    }
}

#[async_trait]
impl OpcUaTransport for UnavailableOpcUaTransport {
    async fn connect(&self, _config: &OpcUaConfig) -> Result<(), ProtocolError> {
        Err(Self::unsupported())
    }

    async fn disconnect(&self) {}

    async fn browse(&self, _parent_node_id: &str) -> Result<Vec<NodeDescriptor>, ProtocolError> {
        Err(Self::unsupported())
    }

    async fn read(&self, _node_id: &str) -> Result<DataValue, ProtocolError> {
        Err(Self::unsupported())
    }

    async fn write(&self, _node_id: &str, _value: Variant) -> Result<(), ProtocolError> {
        Err(Self::unsupported())
    }
}

// ============================================
// 模拟服务器
// ============================================

/// 模拟 OPC-UA 服务器
///
/// 地址空间：`Objects/Machine1`、`Objects/Machine2`，每台机器包含
/// `Temperature`、`Pressure`、`Speed`（Double）、`Running`（Boolean）、
/// `Status`（String）、`PartCount`（Int32）。写入值会覆盖合成值。
pub struct SimulatedOpcUaTransport {
    handshake_delay: Duration,
    children: BTreeMap<String, Vec<NodeDescriptor>>,
    variables: HashMap<String, OpcUaDataType>,
    connected: AtomicBool,
    fail_connect: AtomicBool,
    fail_reads: AtomicBool,
    link_lost: AtomicBool,
    part_count: AtomicI32,
    overrides: Mutex<HashMap<String, Variant>>,
}

const MACHINE_VARIABLES: &[(&str, OpcUaDataType)] = &[
    ("Temperature", OpcUaDataType::Double),
    ("Pressure", OpcUaDataType::Double),
    ("Speed", OpcUaDataType::Double),
    ("Running", OpcUaDataType::Boolean),
    ("Status", OpcUaDataType::String),
    ("PartCount", OpcUaDataType::Int32),
];

impl Default for SimulatedOpcUaTransport {
    fn default() -> Self {
        let mut children = BTreeMap::new();
        let mut variables = HashMap::new();
        let mut machines = Vec::new();
        for machine in ["Machine1", "Machine2"] {
            let machine_id = format!("ns=2;s={}", machine);
            machines.push(NodeDescriptor {
                node_id: machine_id.clone(),
                browse_name: format!("2:{}", machine),
                display_name: machine.to_string(),
                node_class: NodeClass::Object,
                data_type: None,
            });
            let nodes = MACHINE_VARIABLES
                .iter()
                .map(|(name, data_type)| {
                    let node_id = format!("ns=2;s={}.{}", machine, name);
                    variables.insert(node_id.clone(), *data_type);
                    NodeDescriptor {
                        node_id,
                        browse_name: format!("2:{}", name),
                        display_name: format!("{} {}", machine, name),
                        node_class: NodeClass::Variable,
                        data_type: Some(*data_type),
                    }
                })
                .collect();
            children.insert(machine_id, nodes);
        }
        children.insert(OBJECTS_FOLDER.to_string(), machines);

        Self {
            handshake_delay: Duration::from_millis(100),
            children,
            variables,
            connected: AtomicBool::new(false),
            fail_connect: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
            link_lost: AtomicBool::new(false),
            part_count: AtomicI32::new(0),
            overrides: Mutex::new(HashMap::new()),
        }
    }
}

impl SimulatedOpcUaTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handshake_delay(mut self, delay: Duration) -> Self {
        self.handshake_delay = delay;
        self
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn drop_link(&self) {
        self.link_lost.store(true, Ordering::SeqCst);
    }

    /// 固定某节点的取值。
    pub fn set_value(&self, node_id: impl Into<String>, value: Variant) {
        self.overrides().insert(node_id.into(), value);
    }

    fn overrides(&self) -> MutexGuard<'_, HashMap<String, Variant>> {
        self.overrides.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_connected(&self) -> Result<(), ProtocolError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ProtocolError::NotConnected);
        }
        if self.link_lost.load(Ordering::SeqCst) {
            return Err(ProtocolError::Connection("simulated session lost".to_string()));
        }
        Ok(())
    }

    fn synthesize(&self, node_id: &str, data_type: OpcUaDataType) -> Variant {
        let mut rng = rand::rng();
        match data_type {
            OpcUaDataType::Boolean => Variant::Boolean(rng.random_bool(0.8)),
            OpcUaDataType::Int32 => Variant::Int32(self.part_count.fetch_add(1, Ordering::SeqCst)),
            OpcUaDataType::String => {
                let states = ["running", "idle", "maintenance"];
                Variant::String(states[rng.random_range(0..states.len())].to_string())
            }
            OpcUaDataType::Double => {
                let value: f64 = if node_id.ends_with("Temperature") {
                    rng.random_range(20.0..80.0)
                } else if node_id.ends_with("Pressure") {
                    rng.random_range(1.0..10.0)
                } else if node_id.ends_with("Speed") {
                    rng.random_range(0.0..3000.0)
                } else {
                    rng.random_range(0.0..100.0)
                };
                Variant::Double((value * 100.0).round() / 100.0)
            }
        }
    }
}

#[async_trait]
impl OpcUaTransport for SimulatedOpcUaTransport {
    async fn connect(&self, config: &OpcUaConfig) -> Result<(), ProtocolError> {
        tokio::time::sleep(self.handshake_delay).await;
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(ProtocolError::Connection(format!(
                "simulated server rejected session for {}",
                config.endpoint_url
            )));
        }
        self.link_lost.store(false, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn browse(&self, parent_node_id: &str) -> Result<Vec<NodeDescriptor>, ProtocolError> {
        self.ensure_connected()?;
        Ok(self.children.get(parent_node_id).cloned().unwrap_or_default())
    }

    async fn read(&self, node_id: &str) -> Result<DataValue, ProtocolError> {
        self.ensure_connected()?;
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(ProtocolError::DataParse(format!("bad status reading {}", node_id)));
        }
        let data_type = self
            .variables
            .get(node_id)
            .copied()
            .ok_or_else(|| ProtocolError::NotFound(node_id.to_string()))?;
        let overridden = self.overrides().get(node_id).cloned();
        let value = overridden.unwrap_or_else(|| self.synthesize(node_id, data_type));
        Ok(DataValue {
            value,
            quality: "good".to_string(),
            source_timestamp_ms: now_epoch_ms(),
        })
    }

    async fn write(&self, node_id: &str, value: Variant) -> Result<(), ProtocolError> {
        self.ensure_connected()?;
        let data_type = self
            .variables
            .get(node_id)
            .copied()
            .ok_or_else(|| ProtocolError::NotFound(node_id.to_string()))?;
        if value.data_type() != data_type {
            return Err(ProtocolError::DataParse(format!(
                "{} expects {:?}, got {:?}",
                node_id,
                data_type,
                value.data_type()
            )));
        }
        self.overrides().insert(node_id.to_string(), value);
        Ok(())
    }
}
