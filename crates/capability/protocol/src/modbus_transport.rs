//! Modbus 传输层
//!
//! - [`TokioModbusTransport`]：基于 tokio-modbus 的 TCP 实连传输
//! - [`SimulatedModbusTransport`]：模拟从站，支持握手延迟、固定寄存器值与故障注入

use crate::error::ProtocolError;
use crate::modbus::{ModbusConfig, ModbusLink};
use crate::types::ModbusDataType;
use async_trait::async_trait;
use rand::Rng;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;
use tracing::{debug, info};

/// Modbus 传输接口（主站侧）
#[async_trait]
pub trait ModbusTransport: Send + Sync {
    async fn connect(&self, config: &ModbusConfig) -> Result<(), ProtocolError>;

    async fn disconnect(&self);

    async fn read_holding_registers(&self, address: u16, count: u16)
    -> Result<Vec<u16>, ProtocolError>;

    async fn read_input_registers(&self, address: u16, count: u16)
    -> Result<Vec<u16>, ProtocolError>;

    async fn read_coils(&self, address: u16, count: u16) -> Result<Vec<bool>, ProtocolError>;

    async fn read_discrete_inputs(&self, address: u16, count: u16)
    -> Result<Vec<bool>, ProtocolError>;

    async fn write_register(&self, address: u16, value: u16) -> Result<(), ProtocolError>;
}

/// 解析寄存器数据为浮点值（大端字序，高位寄存器在前）
pub fn decode_registers(registers: &[u16], data_type: ModbusDataType) -> Result<f64, ProtocolError> {
    if registers.is_empty() {
        return Err(ProtocolError::DataParse("empty registers".to_string()));
    }
    let needed = data_type.register_count() as usize;
    if registers.len() < needed {
        return Err(ProtocolError::DataParse(format!(
            "need {} registers for {:?}, got {}",
            needed,
            data_type,
            registers.len()
        )));
    }

    let value = match data_type {
        ModbusDataType::Int16 => registers[0] as i16 as f64,
        ModbusDataType::Uint16 => registers[0] as f64,
        ModbusDataType::Int32 => {
            let high = registers[0] as u32;
            let low = registers[1] as u32;
            ((high << 16) | low) as i32 as f64
        }
        ModbusDataType::Uint32 => {
            let high = registers[0] as u32;
            let low = registers[1] as u32;
            ((high << 16) | low) as f64
        }
        ModbusDataType::Float32 => {
            let high = registers[0] as u32;
            let low = registers[1] as u32;
            f32::from_bits((high << 16) | low) as f64
        }
        ModbusDataType::Float64 => {
            let bits = registers[..4]
                .iter()
                .fold(0u64, |acc, r| (acc << 16) | *r as u64);
            f64::from_bits(bits)
        }
    };

    if !value.is_finite() {
        return Err(ProtocolError::DataParse(format!(
            "non-finite {:?} register value",
            data_type
        )));
    }
    Ok(value)
}

// ============================================
// tokio-modbus 实连传输
// ============================================

/// Modbus TCP 实连传输
#[derive(Default)]
pub struct TokioModbusTransport {
    ctx: tokio::sync::Mutex<Option<Context>>,
}

impl TokioModbusTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr, ProtocolError> {
    if let Ok(addr) = format!("{}:{}", host, port).parse::<SocketAddr>() {
        return Ok(addr);
    }
    tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| ProtocolError::InvalidConfig(format!("cannot resolve host: {}", host)))
}

// 请求级错误视为链路问题，异常响应视为设备问题
fn request_error(e: impl std::fmt::Display) -> ProtocolError {
    ProtocolError::Connection(e.to_string())
}

fn exception_error(e: impl std::fmt::Debug) -> ProtocolError {
    ProtocolError::Modbus(format!("exception: {:?}", e))
}

#[async_trait]
impl ModbusTransport for TokioModbusTransport {
    async fn connect(&self, config: &ModbusConfig) -> Result<(), ProtocolError> {
        if config.link == ModbusLink::Rtu {
            return Err(ProtocolError::Unsupported(
                "modbus rtu requires a serial transport".to_string(),
            ));
        }
        let host = config.host.as_deref().unwrap_or_default();
        let addr = resolve(host, config.port).await?;

        info!(target: "ems.protocol", %addr, unit_id = config.unit_id, "connecting to modbus server");
        let mut ctx = tcp::connect(addr)
            .await
            .map_err(|e| ProtocolError::Connection(e.to_string()))?;
        ctx.set_slave(Slave(config.unit_id));

        *self.ctx.lock().await = Some(ctx);
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(mut ctx) = self.ctx.lock().await.take() {
            if let Err(e) = ctx.disconnect().await {
                debug!(target: "ems.protocol", error = %e, "modbus disconnect error");
            }
        }
    }

    async fn read_holding_registers(
        &self,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, ProtocolError> {
        let mut guard = self.ctx.lock().await;
        let ctx = guard.as_mut().ok_or(ProtocolError::NotConnected)?;
        ctx.read_holding_registers(address, count)
            .await
            .map_err(request_error)?
            .map_err(exception_error)
    }

    async fn read_input_registers(
        &self,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, ProtocolError> {
        let mut guard = self.ctx.lock().await;
        let ctx = guard.as_mut().ok_or(ProtocolError::NotConnected)?;
        ctx.read_input_registers(address, count)
            .await
            .map_err(request_error)?
            .map_err(exception_error)
    }

    async fn read_coils(&self, address: u16, count: u16) -> Result<Vec<bool>, ProtocolError> {
        let mut guard = self.ctx.lock().await;
        let ctx = guard.as_mut().ok_or(ProtocolError::NotConnected)?;
        ctx.read_coils(address, count)
            .await
            .map_err(request_error)?
            .map_err(exception_error)
    }

    async fn read_discrete_inputs(
        &self,
        address: u16,
        count: u16,
    ) -> Result<Vec<bool>, ProtocolError> {
        let mut guard = self.ctx.lock().await;
        let ctx = guard.as_mut().ok_or(ProtocolError::NotConnected)?;
        ctx.read_discrete_inputs(address, count)
            .await
            .map_err(request_error)?
            .map_err(exception_error)
    }

    async fn write_register(&self, address: u16, value: u16) -> Result<(), ProtocolError> {
        let mut guard = self.ctx.lock().await;
        let ctx = guard.as_mut().ok_or(ProtocolError::NotConnected)?;
        ctx.write_single_register(address, value)
            .await
            .map_err(request_error)?
            .map_err(exception_error)
    }
}

// ============================================
// 模拟传输
// ============================================

/// 模拟 Modbus 从站
///
/// 读取优先级：已写入值 > 固定寄存器值 > 随机值（0..1000）。
pub struct SimulatedModbusTransport {
    handshake_delay: Duration,
    fixed_registers: Option<Vec<u16>>,
    connected: AtomicBool,
    fail_connect: AtomicBool,
    fail_reads: AtomicBool,
    link_lost: AtomicBool,
    reads: AtomicU64,
    written: Mutex<HashMap<u16, u16>>,
}

impl Default for SimulatedModbusTransport {
    fn default() -> Self {
        Self {
            handshake_delay: Duration::from_millis(100),
            fixed_registers: None,
            connected: AtomicBool::new(false),
            fail_connect: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
            link_lost: AtomicBool::new(false),
            reads: AtomicU64::new(0),
            written: Mutex::new(HashMap::new()),
        }
    }
}

impl SimulatedModbusTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handshake_delay(mut self, delay: Duration) -> Self {
        self.handshake_delay = delay;
        self
    }

    /// 所有寄存器读取返回固定值（按读取长度截取/循环）。
    pub fn with_registers(mut self, registers: Vec<u16>) -> Self {
        self.fixed_registers = Some(registers);
        self
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// 模拟链路中断：后续读取返回连接错误，直到重新握手。
    pub fn drop_link(&self) {
        self.link_lost.store(true, Ordering::SeqCst);
    }

    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn written_register(&self, address: u16) -> Option<u16> {
        self.written().get(&address).copied()
    }

    fn check_read(&self) -> Result<(), ProtocolError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ProtocolError::NotConnected);
        }
        if self.link_lost.load(Ordering::SeqCst) {
            return Err(ProtocolError::Connection("simulated link loss".to_string()));
        }
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(ProtocolError::Modbus("simulated read failure".to_string()));
        }
        Ok(())
    }

    fn registers(&self, address: u16, count: u16) -> Vec<u16> {
        let written = self.written();
        let mut rng = rand::rng();
        (0..count)
            .map(|i| {
                let reg = address.wrapping_add(i);
                if let Some(value) = written.get(&reg) {
                    return *value;
                }
                match &self.fixed_registers {
                    Some(fixed) if !fixed.is_empty() => fixed[i as usize % fixed.len()],
                    _ => rng.random_range(0..1000),
                }
            })
            .collect()
    }

    fn bits(&self, count: u16) -> Vec<bool> {
        let mut rng = rand::rng();
        (0..count).map(|_| rng.random_bool(0.5)).collect()
    }

    fn written(&self) -> MutexGuard<'_, HashMap<u16, u16>> {
        self.written.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ModbusTransport for SimulatedModbusTransport {
    async fn connect(&self, config: &ModbusConfig) -> Result<(), ProtocolError> {
        tokio::time::sleep(self.handshake_delay).await;
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(ProtocolError::Connection(format!(
                "simulated connect failure for {}",
                config.id
            )));
        }
        self.link_lost.store(false, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn read_holding_registers(
        &self,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, ProtocolError> {
        self.check_read()?;
        Ok(self.registers(address, count))
    }

    async fn read_input_registers(
        &self,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, ProtocolError> {
        self.check_read()?;
        Ok(self.registers(address, count))
    }

    async fn read_coils(&self, _address: u16, count: u16) -> Result<Vec<bool>, ProtocolError> {
        self.check_read()?;
        Ok(self.bits(count))
    }

    async fn read_discrete_inputs(
        &self,
        _address: u16,
        count: u16,
    ) -> Result<Vec<bool>, ProtocolError> {
        self.check_read()?;
        Ok(self.bits(count))
    }

    async fn write_register(&self, address: u16, value: u16) -> Result<(), ProtocolError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ProtocolError::NotConnected);
        }
        self.written().insert(address, value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_int16() {
        assert_eq!(decode_registers(&[100], ModbusDataType::Int16).unwrap(), 100.0);
        assert_eq!(
            decode_registers(&[(-100i16) as u16], ModbusDataType::Int16).unwrap(),
            -100.0
        );
        assert_eq!(decode_registers(&[65535], ModbusDataType::Uint16).unwrap(), 65535.0);
    }

    #[test]
    fn test_decode_32bit() {
        assert_eq!(decode_registers(&[0x0001, 0x0000], ModbusDataType::Uint32).unwrap(), 65536.0);
        assert_eq!(decode_registers(&[0xFFFF, 0xFFFF], ModbusDataType::Int32).unwrap(), -1.0);
        let bits = 1.5f32.to_bits();
        let regs = [(bits >> 16) as u16, bits as u16];
        assert_eq!(decode_registers(&regs, ModbusDataType::Float32).unwrap(), 1.5);
    }

    #[test]
    fn test_decode_float64() {
        let bits = 2.25f64.to_bits();
        let regs = [
            (bits >> 48) as u16,
            (bits >> 32) as u16,
            (bits >> 16) as u16,
            bits as u16,
        ];
        assert_eq!(decode_registers(&regs, ModbusDataType::Float64).unwrap(), 2.25);
    }

    #[test]
    fn test_decode_rejects_non_finite() {
        let bits = f32::NAN.to_bits();
        let regs = [(bits >> 16) as u16, bits as u16];
        assert!(matches!(
            decode_registers(&regs, ModbusDataType::Float32),
            Err(ProtocolError::DataParse(_))
        ));
        let bits = f64::INFINITY.to_bits();
        let regs = [(bits >> 48) as u16, (bits >> 32) as u16, (bits >> 16) as u16, bits as u16];
        assert!(decode_registers(&regs, ModbusDataType::Float64).is_err());
    }

    #[test]
    fn test_decode_short_input() {
        assert!(decode_registers(&[], ModbusDataType::Int16).is_err());
        assert!(decode_registers(&[1], ModbusDataType::Float32).is_err());
    }
}
