use ems_protocol::{
    Adapter, AdapterEvent, ConnectionRegistry, ConnectionStatus, ModbusAdapter, ModbusConfig,
    MqttAdapter, MqttConfig, ProtocolError, RegisterPoint, RegistryEvent,
    SimulatedModbusTransport, TransportMode,
};
use ems_timeseries::TimeseriesStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

async fn next_status(events: &mut broadcast::Receiver<RegistryEvent>) -> (String, ConnectionStatus) {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("registry event in time")
            .expect("registry channel open");
        if let AdapterEvent::StatusChange { status } = event.event {
            return (event.connection_id, status);
        }
    }
}

#[tokio::test(start_paused = true)]
async fn create_get_remove_connections() {
    let store = Arc::new(TimeseriesStore::new());
    let registry = ModbusAdapter::registry(store, TransportMode::Simulated);

    let adapter = registry
        .create_connection(ModbusConfig::tcp("plc-1", "10.0.0.5"))
        .await
        .expect("create");
    assert_eq!(adapter.id(), "plc-1");
    assert_eq!(adapter.status(), ConnectionStatus::Disconnected);

    let duplicate = registry
        .create_connection(ModbusConfig::tcp("plc-1", "10.0.0.6"))
        .await;
    assert!(matches!(duplicate, Err(ProtocolError::DuplicateConnection(id)) if id == "plc-1"));

    registry
        .create_connection(ModbusConfig::tcp("plc-2", "10.0.0.7"))
        .await
        .expect("create second");
    assert_eq!(registry.get_all_connections().await.len(), 2);
    assert!(registry.get_connection("plc-2").await.is_some());
    assert!(registry.get_connection("plc-9").await.is_none());

    assert!(adapter.connect().await.success);
    assert!(registry.remove_connection("plc-1").await);
    assert_eq!(adapter.status(), ConnectionStatus::Disconnected);
    assert!(!registry.remove_connection("plc-1").await);
    assert_eq!(registry.len().await, 1);
}

#[tokio::test(start_paused = true)]
async fn adapter_events_reemitted_with_connection_id() {
    let store = Arc::new(TimeseriesStore::new());
    let registry = MqttAdapter::registry(store, TransportMode::Simulated);
    let mut events = registry.subscribe_events();

    let adapter = registry
        .create_connection(MqttConfig::new("broker-1", "10.0.0.9"))
        .await
        .expect("create");
    assert!(adapter.connect().await.success);

    assert_eq!(
        next_status(&mut events).await,
        ("broker-1".to_string(), ConnectionStatus::Connecting)
    );
    assert_eq!(
        next_status(&mut events).await,
        ("broker-1".to_string(), ConnectionStatus::Connected)
    );

    assert!(registry.remove_connection("broker-1").await);
    assert_eq!(
        next_status(&mut events).await,
        ("broker-1".to_string(), ConnectionStatus::Disconnected)
    );
}

#[tokio::test(start_paused = true)]
async fn shutdown_disconnects_everything() {
    let store = Arc::new(TimeseriesStore::new());
    let registry = ModbusAdapter::registry(Arc::clone(&store), TransportMode::Simulated);
    let mut adapters = Vec::new();
    for i in 0..3 {
        let adapter = registry
            .create_connection(ModbusConfig::tcp(format!("plc-{i}"), "10.0.0.5"))
            .await
            .expect("create");
        assert!(adapter.connect().await.success);
        adapter.start_polling(RegisterPoint::holding(1));
        adapters.push(adapter);
    }

    registry.shutdown().await;
    assert!(registry.is_empty().await);
    for adapter in &adapters {
        assert_eq!(adapter.status(), ConnectionStatus::Disconnected);
        assert!(adapter.polled_points().is_empty());
    }

    let written = store.stats().total_points;
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(store.stats().total_points, written);
}

#[tokio::test(start_paused = true)]
async fn remove_during_reconnect_ends_disconnected() {
    let store = Arc::new(TimeseriesStore::new());
    let transport = Arc::new(SimulatedModbusTransport::new().with_registers(vec![5]));
    let shared = Arc::clone(&transport);
    let registry: ConnectionRegistry<ModbusAdapter> = ConnectionRegistry::new(move |config: ModbusConfig| {
        ModbusAdapter::new(config, shared.clone(), Arc::clone(&store))
    });

    let adapter = registry
        .create_connection(ModbusConfig::tcp("plc-1", "10.0.0.5"))
        .await
        .expect("create");
    assert!(adapter.connect().await.success);
    adapter.start_polling(RegisterPoint::holding(1));

    transport.drop_link();
    tokio::time::sleep(Duration::from_millis(1_050)).await;
    assert_eq!(adapter.status(), ConnectionStatus::Reconnecting);

    assert!(registry.remove_connection("plc-1").await);
    assert_eq!(adapter.status(), ConnectionStatus::Disconnected);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(adapter.status(), ConnectionStatus::Disconnected);
}
