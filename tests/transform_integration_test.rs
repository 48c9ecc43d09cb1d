// Integration tests for the transform pipeline over datapoint ranges

use serde_json::{json, Value};
use timebatch::core::{Datapoint, DatapointArray};
use timebatch::range::{DataRange, DatapointArrayRange};
use timebatch::transform::{self, TransformRange};

fn json_points(values: &[Value]) -> DatapointArray {
    values
        .iter()
        .enumerate()
        .map(|(i, v)| Datapoint::new(i as i64 + 1, serde_json::to_vec(v).unwrap()))
        .collect()
}

fn decode_values(points: &DatapointArray) -> Vec<Value> {
    points
        .iter()
        .map(|dp| serde_json::from_slice(&dp.data).unwrap())
        .collect()
}

#[tokio::test]
async fn test_filter_projection_pipeline_end_to_end() {
    let input = json_points(&[
        json!(1),
        json!(10),
        json!(7),
        json!(1.0),
        json!(3),
        json!(2.0),
        json!(3.14),
    ]);
    let inner = Box::new(DatapointArrayRange::new(input, 0));
    let mut tr = TransformRange::new(inner, "if get() < 5 : get() >= 3").unwrap();
    tr.init().await.unwrap();

    let out = tr.next_array().await.unwrap();
    assert_eq!(
        decode_values(&out),
        vec![json!(false), json!(false), json!(true), json!(false), json!(true)]
    );
    assert_eq!(tr.next().await.unwrap(), None);
    tr.close();
}

#[tokio::test]
async fn test_sensor_style_projection() {
    let input = json_points(&[
        json!({"temp": 20.0, "unit": "C"}),
        json!({"temp": 30.0, "unit": "C"}),
        json!({"humidity": 0.4}),
        json!({"temp": 25.0, "unit": "C"}),
    ]);
    let inner = Box::new(DatapointArrayRange::new(input, 0));
    let mut tr = TransformRange::new(
        inner,
        "if has(\"temp\") | get(temp) | if $ > 22 | $ * 1.8 + 32",
    )
    .unwrap();
    tr.init().await.unwrap();

    let out = tr.next_array().await.unwrap();
    assert_eq!(decode_values(&out), vec![json!(86.0), json!(77.0)]);
}

#[tokio::test]
async fn test_set_projection_keeps_structure() {
    let input = json_points(&[json!({"raw": 10}), json!({"raw": 20})]);
    let inner = Box::new(DatapointArrayRange::new(input, 0));
    let mut tr =
        TransformRange::new(inner, "set(scaled, get(raw) / 10)").unwrap();
    tr.init().await.unwrap();

    let out = tr.next_array().await.unwrap();
    assert_eq!(
        decode_values(&out),
        vec![
            json!({"raw": 10, "scaled": 1.0}),
            json!({"raw": 20, "scaled": 2.0}),
        ]
    );
}

#[tokio::test]
async fn test_malformed_payloads_are_skipped_not_fatal() {
    let mut input = json_points(&[json!(1), json!(2)]);
    // A payload that is not JSON at all
    input.insert(1, Datapoint::new(99, b"\xff\xfe not json".to_vec()));

    let inner = Box::new(DatapointArrayRange::new(input, 0));
    let mut tr = TransformRange::new(inner, "$ + 1").unwrap();
    tr.init().await.unwrap();

    let out = tr.next_array().await.unwrap();
    assert_eq!(decode_values(&out), vec![json!(2.0), json!(3.0)]);
    assert_eq!(tr.error_count(), 1);
}

#[test]
fn test_parse_errors_name_the_token() {
    match transform::parse("get() ^ 3") {
        Err(timebatch::Error::TransformParse { token, .. }) => assert_eq!(token, "^"),
        other => panic!("expected a parse error, got {:?}", other.is_ok()),
    }
    match transform::parse("if get() <") {
        Err(timebatch::Error::TransformParse { token, .. }) => assert_eq!(token, "<EOF>"),
        other => panic!("expected a parse error, got {:?}", other.is_ok()),
    }
}
