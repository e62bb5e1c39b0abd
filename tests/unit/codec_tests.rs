//! Unit tests for the line codec and frame classification.

use bytes::BytesMut;
use serde_json::json;
use tokio_util::codec::Decoder;

use managed_instance::protocol::codec::{FrameCodec, MAX_LINE_BYTES};
use managed_instance::protocol::{Frame, LogEvent};
use managed_instance::AppError;

// ── Framing ──────────────────────────────────────────────────────────────────

/// A partial line stays buffered until its newline arrives.
#[test]
fn partial_line_is_buffered_until_newline() {
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::from("{\"pid\":");

    assert_eq!(codec.decode(&mut buf).expect("partial decode"), None);

    buf.extend_from_slice(b"42}\n");
    assert_eq!(
        codec.decode(&mut buf).expect("complete decode"),
        Some("{\"pid\":42}".to_owned())
    );
}

/// Two lines in one read come out as two items.
#[test]
fn batched_lines_decode_separately() {
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::from("{\"log\":\"a\"}\n{\"version\":\"1\"}\n");

    let first = codec.decode(&mut buf).unwrap();
    let second = codec.decode(&mut buf).unwrap();
    assert_eq!(first.as_deref(), Some("{\"log\":\"a\"}"));
    assert_eq!(second.as_deref(), Some("{\"version\":\"1\"}"));
    assert_eq!(codec.decode(&mut buf).unwrap(), None);
}

/// A line over the cap is a protocol error, not an allocation.
#[test]
fn oversized_line_is_a_protocol_error() {
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::from(vec![b'x'; MAX_LINE_BYTES + 1].as_slice());

    let err = codec.decode(&mut buf).expect_err("line must be rejected");
    assert!(
        matches!(err, AppError::Protocol(ref msg) if msg.starts_with("line too long")),
        "unexpected error: {err}"
    );
}

// ── Classification ───────────────────────────────────────────────────────────

#[test]
fn plain_object_answers_the_request() {
    let frame = Frame::parse(r#"{"version":"2024.01.01"}"#).unwrap();
    assert_eq!(frame, Frame::Response(json!({ "version": "2024.01.01" })));
}

#[test]
fn subscription_frame_keeps_the_whole_payload() {
    let frame = Frame::parse(r#"{"subscription":"sub1","files":["a.c"],"unilateral":true}"#)
        .unwrap();
    let Frame::Subscription(event) = frame else {
        panic!("expected a subscription frame");
    };
    assert_eq!(event.name, "sub1");
    assert_eq!(event.payload["files"], json!(["a.c"]));
    assert_eq!(event.payload["subscription"], json!("sub1"));
}

#[test]
fn log_frame_without_level() {
    let frame = Frame::parse(r#"{"log":"crawl done"}"#).unwrap();
    assert_eq!(
        frame,
        Frame::Log(LogEvent {
            level: None,
            text: "crawl done".into(),
        })
    );
}

#[test]
fn empty_subscription_name_is_rejected() {
    let err = Frame::parse(r#"{"subscription":""}"#).unwrap_err();
    assert!(matches!(err, AppError::Protocol(_)));
}

#[test]
fn invalid_json_is_reported_as_malformed() {
    let err = Frame::parse("{\"log\":").unwrap_err();
    assert!(matches!(err, AppError::Protocol(ref msg) if msg.starts_with("malformed json")));
}
