use domain::{FieldValue, Point, TagValue};

#[test]
fn point_builds_tags_and_fields() {
    let point = Point::new(1000)
        .tag("deviceId", "dev-1")
        .tag("machineId", 7i64)
        .field("value", 12.5)
        .field("unit", "°C")
        .field_opt("quality", None::<&str>);

    assert_eq!(point.timestamp_ms, 1000);
    assert_eq!(point.number("value"), Some(12.5));
    assert_eq!(point.fields.get("unit"), Some(&FieldValue::Text("°C".to_string())));
    assert!(!point.fields.contains_key("quality"));
    assert!(point.tag_matches("deviceId", &TagValue::from("dev-1")));
    assert!(!point.tag_matches("deviceId", &TagValue::from("dev-2")));
    assert!(!point.tag_matches("sensorType", &TagValue::from("dev-1")));
}

#[test]
fn numeric_tag_matches_text_form() {
    let point = Point::new(0).tag("machineId", 7i64);
    assert!(point.tag_matches("machineId", &TagValue::from("7")));
    assert!(point.tag_matches("machineId", &TagValue::Number(7.0)));
}

#[test]
fn point_serializes_untagged_values() {
    let point = Point::new(5).tag("deviceId", "d").field("value", 1.5).field("ok", true);
    let json = serde_json::to_value(&point).expect("serialize");
    assert_eq!(json["tags"]["deviceId"], "d");
    assert_eq!(json["fields"]["value"], 1.5);
    assert_eq!(json["fields"]["ok"], true);
}
