//! 按环境配置建立各协议连接，并把注册表事件写入日志。

use ems_config::AppConfig;
use ems_protocol::{
    Adapter, AdapterEvent, ModbusConfig, ModbusRegistry, MonitoredItem, MqttConfig,
    MqttRegistry, MqttSubscription, OpcUaConfig, OpcUaRegistry, RegisterPoint, RegistryEvent,
};
use ems_timeseries::PointEvent;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const MODBUS_CONNECTION_ID: &str = "modbus-1";
const MQTT_CONNECTION_ID: &str = "mqtt-1";
const OPCUA_CONNECTION_ID: &str = "opcua-1";
const SIMULATED_HOST: &str = "127.0.0.1";
const SIMULATED_ENDPOINT: &str = "opc.tcp://127.0.0.1:4840";

/// 模拟模式下未配置地址时使用本地占位地址，保证三种协议都能跑起来。
fn host_or_simulated(host: &Option<String>, simulate: bool, fallback: &str) -> Option<String> {
    match host {
        Some(host) => Some(host.clone()),
        None if simulate => Some(fallback.to_string()),
        None => None,
    }
}

pub async fn start_modbus(registry: &ModbusRegistry, config: &AppConfig) {
    let Some(host) = host_or_simulated(&config.modbus_host, config.simulate, SIMULATED_HOST) else {
        return;
    };
    let mut modbus = ModbusConfig::tcp(MODBUS_CONNECTION_ID, host);
    modbus.port = config.modbus_port;
    modbus.unit_id = config.modbus_unit_id;

    let adapter = match registry.create_connection(modbus).await {
        Ok(adapter) => adapter,
        Err(err) => {
            warn!(target: "ems.collector", error = %err, "modbus_create_failed");
            return;
        }
    };
    // 点位先注册，连接失败时轮询任务保持空转，重连后恢复
    for address in &config.modbus_registers {
        adapter.start_polling(
            RegisterPoint::holding(*address).with_poll_interval_ms(config.modbus_poll_interval_ms),
        );
    }
    let result = adapter.connect().await;
    info!(
        target: "ems.collector",
        connection_id = adapter.id(),
        success = result.success,
        error = result.error.as_deref().unwrap_or(""),
        points = config.modbus_registers.len(),
        "modbus_started"
    );
}

pub async fn start_mqtt(registry: &MqttRegistry, config: &AppConfig) {
    let Some(host) = host_or_simulated(&config.mqtt_host, config.simulate, SIMULATED_HOST) else {
        return;
    };
    let mut mqtt = MqttConfig::new(MQTT_CONNECTION_ID, host);
    mqtt.port = config.mqtt_port;
    mqtt.username = config.mqtt_username.clone();
    mqtt.password = config.mqtt_password.clone();
    mqtt.sample_interval_ms = config.mqtt_sample_interval_ms;

    let adapter = match registry.create_connection(mqtt).await {
        Ok(adapter) => adapter,
        Err(err) => {
            warn!(target: "ems.collector", error = %err, "mqtt_create_failed");
            return;
        }
    };
    let result = adapter.connect().await;
    if !result.success {
        warn!(
            target: "ems.collector",
            connection_id = adapter.id(),
            error = result.error.as_deref().unwrap_or(""),
            "mqtt_connect_failed"
        );
        return;
    }
    let mut subscribed = 0usize;
    for topic in &config.mqtt_topics {
        if adapter.subscribe(MqttSubscription::new(topic.clone())).await {
            subscribed += 1;
        }
    }
    info!(
        target: "ems.collector",
        connection_id = adapter.id(),
        subscribed,
        "mqtt_started"
    );
}

pub async fn start_opcua(registry: &OpcUaRegistry, config: &AppConfig) {
    let Some(endpoint) =
        host_or_simulated(&config.opcua_endpoint_url, config.simulate, SIMULATED_ENDPOINT)
    else {
        return;
    };
    let mut opcua = OpcUaConfig::new(OPCUA_CONNECTION_ID, endpoint);
    opcua.publishing_interval_ms = config.opcua_publishing_interval_ms;

    let adapter = match registry.create_connection(opcua).await {
        Ok(adapter) => adapter,
        Err(err) => {
            warn!(target: "ems.collector", error = %err, "opcua_create_failed");
            return;
        }
    };
    let result = adapter.connect().await;
    if !result.success {
        warn!(
            target: "ems.collector",
            connection_id = adapter.id(),
            error = result.error.as_deref().unwrap_or(""),
            "opcua_connect_failed"
        );
        return;
    }
    let monitored = config
        .opcua_nodes
        .iter()
        .filter(|node_id| adapter.subscribe_node(MonitoredItem::new(node_id.as_str())))
        .count();
    info!(
        target: "ems.collector",
        connection_id = adapter.id(),
        monitored,
        "opcua_started"
    );
}

pub fn spawn_event_logger(mut events: broadcast::Receiver<RegistryEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_registry_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(target: "ems.collector", skipped, "registry_events_lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn log_registry_event(event: &RegistryEvent) {
    match &event.event {
        AdapterEvent::StatusChange { status } => info!(
            target: "ems.collector",
            protocol = event.protocol,
            connection_id = %event.connection_id,
            status = %status,
            "connection_status"
        ),
        AdapterEvent::Data {
            key,
            device_id,
            sensor_type,
            value,
            ..
        } => debug!(
            target: "ems.collector",
            protocol = event.protocol,
            connection_id = %event.connection_id,
            key = %key,
            device_id = %device_id,
            sensor_type = %sensor_type,
            value = ?value,
            "data_received"
        ),
        AdapterEvent::Error { key, message } => warn!(
            target: "ems.collector",
            protocol = event.protocol,
            connection_id = %event.connection_id,
            key = key.as_deref().unwrap_or(""),
            message = %message,
            "adapter_error"
        ),
    }
}

pub fn spawn_point_logger(mut points: broadcast::Receiver<PointEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match points.recv().await {
                Ok(event) => debug!(
                    target: "ems.collector",
                    measurement = event.measurement.as_str(),
                    timestamp_ms = event.point.timestamp_ms,
                    "point_stored"
                ),
                Err(RecvError::Lagged(skipped)) => {
                    debug!(target: "ems.collector", skipped, "point_events_lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
