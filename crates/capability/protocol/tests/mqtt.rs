use domain::FieldValue;
use ems_protocol::{
    Adapter, ConnectionStatus, MqttAdapter, MqttConfig, MqttSubscription, ProtocolError,
    SimulatedMqttTransport,
};
use ems_timeseries::{Measurement, TimeseriesStore};
use std::sync::Arc;
use std::time::Duration;

fn adapter_with(transport: Arc<SimulatedMqttTransport>) -> (MqttAdapter, Arc<TimeseriesStore>) {
    let store = Arc::new(TimeseriesStore::new());
    let adapter = MqttAdapter::new(
        MqttConfig::new("broker-1", "10.0.0.9"),
        transport,
        Arc::clone(&store),
    );
    (adapter, store)
}

async fn sleep_ms(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

#[tokio::test(start_paused = true)]
async fn subscribe_requires_connection_and_is_idempotent() {
    let (adapter, _store) = adapter_with(Arc::new(SimulatedMqttTransport::new()));
    assert!(!adapter.subscribe(MqttSubscription::new("plant/line1/temperature")).await);

    assert!(adapter.connect().await.success);
    assert!(adapter.subscribe(MqttSubscription::new("plant/line1/temperature")).await);
    assert!(adapter.subscribe(MqttSubscription::new("plant/line1/temperature").with_qos(1)).await);
    assert_eq!(adapter.subscriptions().len(), 1);
    assert_eq!(adapter.stats().active_points, 1);

    assert!(adapter.unsubscribe("plant/line1/temperature").await);
    assert!(!adapter.unsubscribe("plant/line1/temperature").await);
    assert!(adapter.subscriptions().is_empty());
}

#[tokio::test(start_paused = true)]
async fn shared_timer_delivers_parsed_payloads() {
    let transport = Arc::new(SimulatedMqttTransport::new());
    let (adapter, store) = adapter_with(Arc::clone(&transport));
    assert!(adapter.connect().await.success);

    assert!(adapter.subscribe(MqttSubscription::new("plant/line1/temperature")).await);
    assert!(
        adapter
            .subscribe(MqttSubscription::new("plant/line1/flow").with_device("pump-3"))
            .await
    );
    transport.inject(
        "plant/line1/temperature",
        r#"{"value": 21.5, "unit": "°C", "quality": "good"}"#,
    );
    transport.inject("plant/line1/flow", "flow=12.25");
    sleep_ms(1_500).await;

    let temperature = store
        .latest_sensor_reading("broker-1", "temperature")
        .expect("temperature");
    assert_eq!(temperature.number("value"), Some(21.5));
    assert_eq!(temperature.fields.get("unit"), Some(&FieldValue::from("°C")));

    let flow = store.latest_sensor_reading("pump-3", "flow").expect("flow");
    assert_eq!(flow.number("value"), Some(12.25));
    assert_eq!(adapter.stats().deliveries, 2);
}

#[tokio::test(start_paused = true)]
async fn malformed_payload_counts_error_and_keeps_running() {
    let transport = Arc::new(SimulatedMqttTransport::new());
    let (adapter, store) = adapter_with(Arc::clone(&transport));
    assert!(adapter.connect().await.success);
    assert!(adapter.subscribe(MqttSubscription::new("plant/status").with_sensor_type("state")).await);

    transport.inject("plant/status", "not a number");
    sleep_ms(1_100).await;
    assert_eq!(adapter.stats().errors, 1);
    assert_eq!(adapter.status(), ConnectionStatus::Connected);
    assert!(store.is_empty());

    // 下一次触发恢复为合成报文
    sleep_ms(1_000).await;
    assert_eq!(store.len(Measurement::SensorReadings), 1);
}

#[tokio::test(start_paused = true)]
async fn publish_only_while_connected() {
    let transport = Arc::new(SimulatedMqttTransport::new());
    let (adapter, _store) = adapter_with(Arc::clone(&transport));

    assert!(matches!(
        adapter.publish("plant/cmd", b"start", 1).await,
        Err(ProtocolError::NotConnected)
    ));

    assert!(adapter.connect().await.success);
    adapter.publish("plant/cmd", b"start", 1).await.expect("publish");
    let published = transport.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].topic, "plant/cmd");
    assert_eq!(published[0].payload, b"start".to_vec());
    assert_eq!(adapter.stats().published, 1);

    adapter.disconnect().await;
    assert!(adapter.publish("plant/cmd", b"stop", 1).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn disconnect_stops_point_events() {
    let (adapter, store) = adapter_with(Arc::new(SimulatedMqttTransport::new()));
    let mut points = store.subscribe();
    assert!(adapter.connect().await.success);
    assert!(adapter.subscribe(MqttSubscription::new("plant/humidity")).await);

    sleep_ms(2_500).await;
    let mut delivered = 0;
    while points.try_recv().is_ok() {
        delivered += 1;
    }
    assert_eq!(delivered, 2);

    adapter.disconnect().await;
    assert!(adapter.subscriptions().is_empty());
    sleep_ms(3_000).await;
    assert!(points.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn broker_refusal_fails_connect() {
    let transport = Arc::new(SimulatedMqttTransport::new());
    transport.set_fail_connect(true);
    let (adapter, _store) = adapter_with(Arc::clone(&transport));

    let result = adapter.connect().await;
    assert!(!result.success);
    assert_eq!(adapter.status(), ConnectionStatus::Error);

    let store = Arc::new(TimeseriesStore::new());
    let empty_host = MqttAdapter::new(
        MqttConfig::new("broker-2", " "),
        Arc::new(SimulatedMqttTransport::new()),
        store,
    );
    assert!(!empty_host.connect().await.success);
}

#[tokio::test(start_paused = true)]
async fn link_loss_reconnects_and_keeps_subscriptions() {
    let transport = Arc::new(SimulatedMqttTransport::new());
    let (adapter, store) = adapter_with(Arc::clone(&transport));
    assert!(adapter.connect().await.success);
    assert!(adapter.subscribe(MqttSubscription::new("plant/pressure")).await);

    transport.drop_link();
    sleep_ms(1_500).await;
    assert_eq!(adapter.status(), ConnectionStatus::Connected);
    assert_eq!(adapter.subscriptions().len(), 1);
    assert!(store.is_empty());

    sleep_ms(1_000).await;
    assert_eq!(store.len(Measurement::SensorReadings), 1);
}

#[test]
fn config_defaults_from_json() {
    let config = MqttConfig::from_json(r#"{"id": "b-1", "host": "broker.local"}"#).unwrap();
    assert_eq!(config.port, 1883);
    assert_eq!(config.keep_alive_secs, 30);
    assert_eq!(config.sample_interval_ms, 1000);
    assert!(config.client_id.is_none());

    let half_auth =
        MqttConfig::from_json(r#"{"id": "b-2", "host": "broker.local", "username": "u"}"#).unwrap();
    assert!(half_auth.validate().is_err());
}

#[tokio::test(start_paused = true)]
async fn disconnect_during_suback_drops_subscription() {
    let transport =
        Arc::new(SimulatedMqttTransport::new().with_suback_delay(Duration::from_millis(200)));
    let (adapter, _store) = adapter_with(Arc::clone(&transport));
    let adapter = Arc::new(adapter);
    assert!(adapter.connect().await.success);

    let pending = {
        let adapter = Arc::clone(&adapter);
        tokio::spawn(async move {
            adapter
                .subscribe(MqttSubscription::new("plant/line1/temperature"))
                .await
        })
    };
    sleep_ms(50).await;
    adapter.disconnect().await;

    assert!(!pending.await.expect("subscribe task"));
    assert!(adapter.subscriptions().is_empty());

    // 重新连接后不会恢复该订阅
    assert!(adapter.connect().await.success);
    assert!(adapter.subscriptions().is_empty());
}
