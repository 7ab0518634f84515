use ems_protocol::{
    Adapter, AdapterEvent, ConnectionStatus, ModbusAdapter, ModbusConfig, ModbusDataType,
    ProtocolError, RegisterPoint, SimulatedModbusTransport,
};
use ems_timeseries::{Measurement, TimeseriesStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

fn adapter_with(transport: Arc<SimulatedModbusTransport>) -> (ModbusAdapter, Arc<TimeseriesStore>) {
    let store = Arc::new(TimeseriesStore::new());
    let adapter = ModbusAdapter::new(
        ModbusConfig::tcp("plc-1", "10.0.0.5"),
        transport,
        Arc::clone(&store),
    );
    (adapter, store)
}

fn statuses(events: &mut broadcast::Receiver<AdapterEvent>) -> Vec<ConnectionStatus> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let AdapterEvent::StatusChange { status } = event {
            seen.push(status);
        }
    }
    seen
}

async fn sleep_ms(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

#[tokio::test(start_paused = true)]
async fn holding_register_scaled_into_store_until_disconnect() {
    let transport = Arc::new(SimulatedModbusTransport::new().with_registers(vec![235]));
    let (adapter, store) = adapter_with(transport);

    let result = adapter.connect().await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(adapter.status(), ConnectionStatus::Connected);

    adapter.start_polling(
        RegisterPoint::holding(100)
            .with_scale(0.1, 0.0)
            .with_poll_interval_ms(1000),
    );
    sleep_ms(1_500).await;

    let latest = store
        .latest_sensor_reading("plc-1", "modbus_register")
        .expect("reading");
    let value = latest.number("value").expect("value");
    assert!((value - 23.5).abs() < 1e-9, "{value}");

    adapter.disconnect().await;
    assert_eq!(adapter.status(), ConnectionStatus::Disconnected);
    let written = store.len(Measurement::SensorReadings);
    sleep_ms(2_000).await;
    assert_eq!(store.len(Measurement::SensorReadings), written);
    assert!(adapter.polled_points().is_empty());
}

#[tokio::test(start_paused = true)]
async fn status_sequence_has_no_duplicates() {
    let (adapter, _store) = adapter_with(Arc::new(SimulatedModbusTransport::new()));
    let mut events = adapter.subscribe_events();

    assert!(adapter.connect().await.success);
    // 已连接时再次 connect 为空操作
    assert!(adapter.connect().await.success);
    adapter.disconnect().await;
    adapter.disconnect().await;

    assert_eq!(
        statuses(&mut events),
        vec![
            ConnectionStatus::Connecting,
            ConnectionStatus::Connected,
            ConnectionStatus::Disconnected,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn missing_host_fails_into_error_and_stays_reusable() {
    let store = Arc::new(TimeseriesStore::new());
    let mut config = ModbusConfig::tcp("plc-2", "");
    config.host = None;
    let adapter = ModbusAdapter::new(config, Arc::new(SimulatedModbusTransport::new()), store);
    let mut events = adapter.subscribe_events();

    let result = adapter.connect().await;
    assert!(!result.success);
    assert!(result.error.unwrap_or_default().contains("host"));
    assert_eq!(adapter.status(), ConnectionStatus::Error);
    assert_eq!(
        statuses(&mut events),
        vec![ConnectionStatus::Connecting, ConnectionStatus::Error]
    );

    adapter.disconnect().await;
    assert_eq!(adapter.status(), ConnectionStatus::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn handshake_failure_then_retry_succeeds() {
    let transport = Arc::new(SimulatedModbusTransport::new());
    transport.set_fail_connect(true);
    let (adapter, _store) = adapter_with(Arc::clone(&transport));

    assert!(!adapter.connect().await.success);
    assert_eq!(adapter.status(), ConnectionStatus::Error);
    assert!(adapter.stats().last_error.is_some());

    transport.set_fail_connect(false);
    assert!(adapter.connect().await.success);
    assert_eq!(adapter.status(), ConnectionStatus::Connected);
    assert!(adapter.stats().connected_since_ms.is_some());
}

#[tokio::test(start_paused = true)]
async fn connect_timeout_fails_into_error() {
    let transport =
        Arc::new(SimulatedModbusTransport::new().with_handshake_delay(Duration::from_secs(30)));
    let store = Arc::new(TimeseriesStore::new());
    let mut config = ModbusConfig::tcp("plc-3", "10.0.0.7");
    config.connect_timeout_ms = 1_000;
    let adapter = ModbusAdapter::new(config, transport, store);

    let result = adapter.connect().await;
    assert!(!result.success);
    assert!(result.error.unwrap_or_default().contains("timeout"));
    assert_eq!(adapter.status(), ConnectionStatus::Error);
}

#[tokio::test(start_paused = true)]
async fn duplicate_points_poll_once() {
    let transport = Arc::new(SimulatedModbusTransport::new().with_registers(vec![1]));
    let (adapter, store) = adapter_with(Arc::clone(&transport));

    // 未连接时也接受注册
    let first = adapter.start_polling(RegisterPoint::holding(10));
    let second = adapter.start_polling(RegisterPoint::holding(10));
    assert_eq!(first, second);
    assert_eq!(first, "holding:10:1");
    assert_eq!(adapter.polled_points().len(), 1);

    sleep_ms(2_500).await;
    assert_eq!(store.len(Measurement::SensorReadings), 0);

    assert!(adapter.connect().await.success);
    sleep_ms(1_000).await;
    assert_eq!(store.len(Measurement::SensorReadings), 1);
    assert_eq!(adapter.stats().active_points, 1);

    assert!(adapter.stop_polling(&first).await);
    assert!(!adapter.stop_polling(&first).await);
    sleep_ms(3_000).await;
    assert_eq!(store.len(Measurement::SensorReadings), 1);
}

#[tokio::test(start_paused = true)]
async fn read_failures_are_counted_without_changing_status() {
    let transport = Arc::new(SimulatedModbusTransport::new());
    transport.set_fail_reads(true);
    let (adapter, store) = adapter_with(Arc::clone(&transport));
    assert!(adapter.connect().await.success);
    let mut events = adapter.subscribe_events();

    adapter.start_polling(RegisterPoint::holding(1).with_poll_interval_ms(500));
    sleep_ms(1_200).await;

    let stats = adapter.stats();
    assert_eq!(stats.errors, 2);
    assert_eq!(stats.deliveries, 0);
    assert_eq!(adapter.status(), ConnectionStatus::Connected);
    assert!(store.is_empty());

    let event = events.try_recv().expect("error event");
    assert!(matches!(event, AdapterEvent::Error { key: Some(ref key), .. } if key == "holding:1:1"));
}

#[tokio::test(start_paused = true)]
async fn link_loss_triggers_reconnect() {
    let transport = Arc::new(SimulatedModbusTransport::new().with_registers(vec![7]));
    let (adapter, store) = adapter_with(Arc::clone(&transport));
    assert!(adapter.connect().await.success);
    let mut events = adapter.subscribe_events();

    adapter.start_polling(RegisterPoint::holding(3));
    transport.drop_link();
    sleep_ms(1_500).await;

    assert_eq!(adapter.status(), ConnectionStatus::Connected);
    assert_eq!(
        statuses(&mut events),
        vec![ConnectionStatus::Reconnecting, ConnectionStatus::Connected]
    );

    sleep_ms(1_000).await;
    assert_eq!(store.len(Measurement::SensorReadings), 1);
}

#[tokio::test(start_paused = true)]
async fn direct_register_access_requires_connection() {
    let transport = Arc::new(SimulatedModbusTransport::new());
    let (adapter, _store) = adapter_with(Arc::clone(&transport));

    assert!(matches!(
        adapter.write_register(7, 42).await,
        Err(ProtocolError::NotConnected)
    ));

    assert!(adapter.connect().await.success);
    adapter.write_register(7, 42).await.expect("write");
    assert_eq!(transport.written_register(7), Some(42));
    assert_eq!(adapter.read_holding_registers(7, 1).await.expect("read"), vec![42]);
    assert_eq!(adapter.stats().writes, 1);
}

#[tokio::test(start_paused = true)]
async fn multi_register_points_decode_data_type() {
    let bits = 12.5f32.to_bits();
    let transport = Arc::new(
        SimulatedModbusTransport::new().with_registers(vec![(bits >> 16) as u16, bits as u16]),
    );
    let (adapter, store) = adapter_with(transport);
    assert!(adapter.connect().await.success);

    adapter.start_polling(
        RegisterPoint::holding(200)
            .with_length(2)
            .with_data_type(ModbusDataType::Float32)
            .with_scale(2.0, 1.0)
            .with_device("boiler-1", "temperature"),
    );
    sleep_ms(1_100).await;

    let latest = store
        .latest_sensor_reading("boiler-1", "temperature")
        .expect("reading");
    assert_eq!(latest.number("value"), Some(26.0));
}

#[test]
fn config_and_point_parse_from_json() {
    let config = ModbusConfig::from_json(r#"{"id": "plc-9", "host": "192.168.1.100"}"#).unwrap();
    assert_eq!(config.port, 502);
    assert_eq!(config.unit_id, 1);
    assert_eq!(config.connect_timeout_ms, 5000);
    assert!(config.validate().is_ok());

    let rtu = ModbusConfig::from_json(r#"{"id": "rtu-1", "type": "rtu"}"#).unwrap();
    assert!(rtu.validate().is_err());

    let point: RegisterPoint = serde_json::from_str(
        r#"{"address": 100, "type": "input", "data_type": "int16", "scale_factor": 0.1}"#,
    )
    .unwrap();
    assert_eq!(point.key(), "input:100:1");
    assert_eq!(point.poll_interval_ms, 1000);
    assert_eq!(point.offset, 0.0);
}
