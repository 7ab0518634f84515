use ems_telemetry::{metrics, record_delivery, record_points_evicted};

#[test]
fn counters_accumulate() {
    let before = metrics().snapshot();
    record_delivery();
    record_points_evicted(3);
    let after = metrics().snapshot();
    assert!(after.deliveries >= before.deliveries + 1);
    assert!(after.points_evicted >= before.points_evicted + 3);
}
