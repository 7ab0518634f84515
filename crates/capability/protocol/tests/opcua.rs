use domain::FieldValue;
use ems_protocol::{
    Adapter, AdapterEvent, ConnectionStatus, MonitoredItem, NodeClass, OpcUaAdapter, OpcUaConfig,
    ProtocolError, SimulatedOpcUaTransport, TransportMode, Variant,
};
use ems_timeseries::{Measurement, TimeseriesStore};
use std::sync::Arc;
use std::time::Duration;

const TEMPERATURE: &str = "ns=2;s=Machine1.Temperature";
const STATUS: &str = "ns=2;s=Machine1.Status";

fn adapter_with(transport: Arc<SimulatedOpcUaTransport>) -> (OpcUaAdapter, Arc<TimeseriesStore>) {
    let store = Arc::new(TimeseriesStore::new());
    let adapter = OpcUaAdapter::new(
        OpcUaConfig::new("opc-1", "opc.tcp://10.0.0.8:4840"),
        transport,
        Arc::clone(&store),
    );
    (adapter, store)
}

async fn sleep_ms(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

#[tokio::test(start_paused = true)]
async fn browse_address_space() {
    let (adapter, _store) = adapter_with(Arc::new(SimulatedOpcUaTransport::new()));
    assert!(matches!(
        adapter.browse_nodes(None).await,
        Err(ProtocolError::NotConnected)
    ));

    assert!(adapter.connect().await.success);
    let machines = adapter.browse_nodes(None).await.expect("browse root");
    let names: Vec<&str> = machines.iter().map(|n| n.display_name.as_str()).collect();
    assert_eq!(names, vec!["Machine1", "Machine2"]);
    assert!(machines.iter().all(|n| n.node_class == NodeClass::Object));

    let variables = adapter
        .browse_nodes(Some("ns=2;s=Machine1"))
        .await
        .expect("browse machine");
    assert!(variables.iter().any(|n| n.node_id == TEMPERATURE));
    assert!(variables.iter().all(|n| n.node_class == NodeClass::Variable));

    assert!(adapter.browse_nodes(Some("ns=9;s=Nothing")).await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn read_and_write_nodes() {
    let (adapter, _store) = adapter_with(Arc::new(SimulatedOpcUaTransport::new()));
    assert!(adapter.connect().await.success);

    adapter
        .write_node(TEMPERATURE, Variant::Double(42.5))
        .await
        .expect("write");
    let data = adapter.read_node(TEMPERATURE).await.expect("read");
    assert_eq!(data.value, Variant::Double(42.5));
    assert_eq!(data.quality, "good");
    assert_eq!(adapter.stats().writes, 1);

    assert!(matches!(
        adapter.write_node(TEMPERATURE, Variant::Boolean(true)).await,
        Err(ProtocolError::DataParse(_))
    ));
    assert!(matches!(
        adapter.read_node("ns=2;s=Missing").await,
        Err(ProtocolError::NotFound(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn monitored_items_sampled_by_shared_timer() {
    let transport = Arc::new(SimulatedOpcUaTransport::new());
    transport.set_value(TEMPERATURE, Variant::Double(55.0));
    transport.set_value(STATUS, Variant::String("running".to_string()));
    let (adapter, store) = adapter_with(Arc::clone(&transport));

    assert!(!adapter.subscribe_node(MonitoredItem::new(TEMPERATURE)));
    assert!(adapter.connect().await.success);
    let mut events = adapter.subscribe_events();

    assert!(adapter.subscribe_node(MonitoredItem::new(TEMPERATURE)));
    assert!(adapter.subscribe_node(MonitoredItem::new(TEMPERATURE)));
    assert!(adapter.subscribe_node(MonitoredItem::new(STATUS).with_device("line-1", "state")));
    assert_eq!(adapter.monitored_items().len(), 2);

    sleep_ms(1_500).await;

    let latest = store
        .latest_sensor_reading("opc-1", "temperature")
        .expect("temperature");
    assert_eq!(latest.number("value"), Some(55.0));
    // 字符串节点只发事件，不写入存储
    assert_eq!(store.len(Measurement::SensorReadings), 1);

    let mut status_seen = false;
    while let Ok(event) = events.try_recv() {
        if let AdapterEvent::Data { key, value, .. } = event {
            if key == STATUS {
                assert_eq!(value, FieldValue::from("running"));
                status_seen = true;
            }
        }
    }
    assert!(status_seen);
    assert_eq!(adapter.stats().deliveries, 2);

    assert!(adapter.unsubscribe_node(STATUS));
    assert!(!adapter.unsubscribe_node(STATUS));
}

#[tokio::test(start_paused = true)]
async fn read_failures_do_not_tear_down_session() {
    let transport = Arc::new(SimulatedOpcUaTransport::new());
    let (adapter, store) = adapter_with(Arc::clone(&transport));
    assert!(adapter.connect().await.success);
    assert!(adapter.subscribe_node(MonitoredItem::new(TEMPERATURE)));

    transport.set_fail_reads(true);
    sleep_ms(2_500).await;
    assert_eq!(adapter.stats().errors, 2);
    assert_eq!(adapter.status(), ConnectionStatus::Connected);
    assert!(store.is_empty());

    transport.set_fail_reads(false);
    sleep_ms(1_000).await;
    assert_eq!(store.len(Measurement::SensorReadings), 1);
}

#[tokio::test(start_paused = true)]
async fn invalid_endpoint_fails_connect() {
    let store = Arc::new(TimeseriesStore::new());
    let adapter = OpcUaAdapter::new(
        OpcUaConfig::new("opc-2", "http://10.0.0.8"),
        Arc::new(SimulatedOpcUaTransport::new()),
        store,
    );
    let result = adapter.connect().await;
    assert!(!result.success);
    assert!(result.error.unwrap_or_default().contains("opc.tcp://"));
    assert_eq!(adapter.status(), ConnectionStatus::Error);
}

#[tokio::test(start_paused = true)]
async fn live_mode_is_unsupported() {
    let store = Arc::new(TimeseriesStore::new());
    let registry = OpcUaAdapter::registry(store, TransportMode::Live);
    let adapter = registry
        .create_connection(OpcUaConfig::new("opc-live", "opc.tcp://10.0.0.8:4840"))
        .await
        .expect("create");

    let result = adapter.connect().await;
    assert!(!result.success);
    assert!(result.error.unwrap_or_default().contains("unsupported"));
    assert_eq!(adapter.status(), ConnectionStatus::Error);
    registry.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn disconnect_stops_monitored_item_delivery() {
    let (adapter, store) = adapter_with(Arc::new(SimulatedOpcUaTransport::new()));
    assert!(adapter.connect().await.success);
    assert!(adapter.subscribe_node(MonitoredItem::new(TEMPERATURE)));

    sleep_ms(1_500).await;
    assert_eq!(store.len(Measurement::SensorReadings), 1);

    adapter.disconnect().await;
    assert_eq!(adapter.status(), ConnectionStatus::Disconnected);
    assert!(adapter.monitored_items().is_empty());
    sleep_ms(3_000).await;
    assert_eq!(store.len(Measurement::SensorReadings), 1);
}

#[tokio::test(start_paused = true)]
async fn session_loss_reconnects_and_keeps_monitored_items() {
    let transport = Arc::new(SimulatedOpcUaTransport::new());
    let (adapter, store) = adapter_with(Arc::clone(&transport));
    assert!(adapter.connect().await.success);
    assert!(adapter.subscribe_node(MonitoredItem::new(TEMPERATURE)));

    transport.drop_link();
    sleep_ms(1_500).await;
    assert_eq!(adapter.status(), ConnectionStatus::Connected);
    assert_eq!(adapter.monitored_items().len(), 1);
    assert!(store.is_empty());

    sleep_ms(1_000).await;
    assert_eq!(store.len(Measurement::SensorReadings), 1);
}
