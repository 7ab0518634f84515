mod wiring;

use ems_config::AppConfig;
use ems_protocol::{ModbusAdapter, MqttAdapter, OpcUaAdapter, TransportMode};
use ems_telemetry::{init_tracing, metrics};
use ems_timeseries::{TimeseriesConfig, TimeseriesStore};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 加载本地 .env（如存在），便于直接 cargo run 启动
    dotenvy::dotenv().ok();
    let config = AppConfig::from_env()?;
    // 初始化日志（RUST_LOG 控制级别）
    init_tracing();

    let store = Arc::new(TimeseriesStore::with_config(TimeseriesConfig {
        retention_points: config.retention_points,
        event_capacity: config.event_capacity,
    }));
    let mode = TransportMode::from_simulate_flag(config.simulate);
    info!(
        target: "ems.collector",
        mode = ?mode,
        retention_points = config.retention_points,
        "collector_starting"
    );

    // 每种协议一个注册表，事件统一转发到日志
    let modbus = ModbusAdapter::registry(Arc::clone(&store), mode);
    let mqtt = MqttAdapter::registry(Arc::clone(&store), mode);
    let opcua = OpcUaAdapter::registry(Arc::clone(&store), mode);
    let mut watchers = vec![
        wiring::spawn_event_logger(modbus.subscribe_events()),
        wiring::spawn_event_logger(mqtt.subscribe_events()),
        wiring::spawn_event_logger(opcua.subscribe_events()),
    ];
    watchers.push(wiring::spawn_point_logger(store.subscribe()));

    wiring::start_modbus(&modbus, &config).await;
    wiring::start_mqtt(&mqtt, &config).await;
    wiring::start_opcua(&opcua, &config).await;

    tokio::signal::ctrl_c().await?;
    info!(target: "ems.collector", "collector_stopping");

    modbus.shutdown().await;
    mqtt.shutdown().await;
    opcua.shutdown().await;
    for watcher in watchers {
        watcher.abort();
    }

    let stats = store.stats();
    info!(
        target: "ems.collector",
        total_points = stats.total_points,
        approx_memory_bytes = stats.approx_memory_bytes,
        stats = %serde_json::to_string(&stats)?,
        metrics = ?metrics().snapshot(),
        "collector_stopped"
    );
    Ok(())
}
