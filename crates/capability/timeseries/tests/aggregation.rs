use ems_timeseries::{
    Aggregation, MachineStatus, QueryOptions, SensorReading, TimeseriesError, TimeseriesStore,
};

fn seeded_store() -> TimeseriesStore {
    let store = TimeseriesStore::new();
    // 同一 10s 桶内均匀分布：2, 4, 6, 8
    for (i, value) in [2.0, 4.0, 6.0, 8.0].into_iter().enumerate() {
        store.write_sensor_reading(
            SensorReading::new("dev-1", "temperature", value).at(10_000 + i as i64 * 2_000),
        );
    }
    store
}

fn single_bucket(store: &TimeseriesStore, aggregation: Aggregation) -> f64 {
    let points = store
        .query_sensor_readings(
            &QueryOptions::range(0, 60_000)
                .device_id("dev-1")
                .aggregate(aggregation, "10s"),
        )
        .expect("query");
    assert_eq!(points.len(), 1);
    assert_eq!(points[0].timestamp_ms, 10_000);
    points[0].number("value").expect("value")
}

#[test]
fn aggregation_reduces_single_bucket_exactly() {
    let store = seeded_store();
    assert_eq!(single_bucket(&store, Aggregation::Mean), 5.0);
    assert_eq!(single_bucket(&store, Aggregation::Min), 2.0);
    assert_eq!(single_bucket(&store, Aggregation::Max), 8.0);
    assert_eq!(single_bucket(&store, Aggregation::Sum), 20.0);
    assert_eq!(single_bucket(&store, Aggregation::Count), 4.0);
}

#[test]
fn buckets_sorted_regardless_of_input_order() {
    let store = TimeseriesStore::new();
    for ts in [125_000, 5_000, 65_000, 7_000, 130_000] {
        store.write_sensor_reading(SensorReading::new("dev-1", "power", 1.0).at(ts));
    }
    let points = store
        .query_sensor_readings(&QueryOptions::range(0, 200_000).aggregate(Aggregation::Count, "1m"))
        .expect("query");
    let starts: Vec<i64> = points.iter().map(|p| p.timestamp_ms).collect();
    assert_eq!(starts, vec![0, 60_000, 120_000]);
    let counts: Vec<f64> = points.iter().filter_map(|p| p.number("value")).collect();
    assert_eq!(counts, vec![2.0, 1.0, 2.0]);
}

#[test]
fn aggregated_point_uses_first_member_tags() {
    let store = TimeseriesStore::new();
    store.write_sensor_reading(SensorReading::new("dev-a", "temperature", 1.0).at(1_000));
    store.write_sensor_reading(SensorReading::new("dev-b", "temperature", 3.0).at(2_000));
    let points = store
        .query_sensor_readings(&QueryOptions::range(0, 5_000).aggregate(Aggregation::Mean, "5s"))
        .expect("query");
    assert_eq!(points.len(), 1);
    assert_eq!(points[0].tags.get("deviceId").map(|t| t.to_string()), Some("dev-a".to_string()));
    assert_eq!(points[0].number("value"), Some(2.0));
}

#[test]
fn bucket_without_numeric_members_is_omitted() {
    let store = TimeseriesStore::new();
    // 无 oee 字段的状态点不参与 oee 聚合
    store.write_machine_status(MachineStatus::new("7", "stopped").at(1_000));
    store.write_machine_status(MachineStatus::new("7", "running").with_oee(70.0).at(11_000));
    let points = store.oee_trend("7", 0, 20_000, "10s").expect("trend");
    assert_eq!(points.len(), 1);
    assert_eq!(points[0].timestamp_ms, 10_000);
}

#[test]
fn aggregation_requires_both_function_and_interval() {
    let store = seeded_store();
    let mut options = QueryOptions::range(0, 60_000);
    options.aggregation = Some(Aggregation::Sum);
    let raw = store.query_sensor_readings(&options).expect("query");
    assert_eq!(raw.len(), 4);
}

#[test]
fn malformed_interval_fails_fast() {
    let store = seeded_store();
    let err = store
        .query_sensor_readings(&QueryOptions::range(0, 60_000).aggregate(Aggregation::Mean, "abc"))
        .expect_err("invalid interval");
    assert_eq!(err, TimeseriesError::InvalidInterval("abc".to_string()));
}

#[test]
fn oee_trend_means_one_bucket() {
    let store = TimeseriesStore::new();
    let t0 = 1_700_000_000_000;
    for (i, oee) in [80.0, 85.0, 90.0].into_iter().enumerate() {
        store.write_machine_status(
            MachineStatus::new("7", "running")
                .with_oee(oee)
                .at(t0 + i as i64 * 1_000),
        );
    }
    let trend = store.oee_trend("7", t0, t0 + 5_000, "5s").expect("trend");
    assert_eq!(trend.len(), 1);
    assert_eq!(trend[0].number("oee"), Some(85.0));
    assert_eq!(trend[0].timestamp_ms, t0);
}

#[test]
fn aggregation_handles_earliest_representable_timestamp() {
    let store = TimeseriesStore::new();
    store.write_sensor_reading(SensorReading::new("dev-1", "temperature", 4.0).at(i64::MIN + 1));
    let points = store
        .query_sensor_readings(
            &QueryOptions::range(i64::MIN, 0).aggregate(Aggregation::Sum, "1s"),
        )
        .expect("query");
    assert_eq!(points.len(), 1);
    assert_eq!(points[0].timestamp_ms, (i64::MIN / 1000) * 1000);
    assert_eq!(points[0].number("value"), Some(4.0));
}
