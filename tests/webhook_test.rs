//! Webhook signature verification and payload parsing.

use chrono::{DateTime, Duration, Utc};
use dialdesk::model::CallEventType;
use dialdesk::webhook::{
    MAX_EVENT_AGE_SECS, WebhookHeaders, parse_provider_event, sign, verify_and_parse,
    verify_signature,
};
use secrecy::SecretString;
use serde_json::json;

const SECRET: &str = "whsec_test_secret";

fn now() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-05-04T10:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

fn max_age() -> Duration {
    Duration::seconds(MAX_EVENT_AGE_SECS)
}

fn secret() -> SecretString {
    SecretString::from(SECRET)
}

fn signed_headers(timestamp: &str, body: &[u8]) -> WebhookHeaders {
    WebhookHeaders {
        signature: Some(sign(SECRET, timestamp, body).unwrap()),
        timestamp: Some(timestamp.to_string()),
        event_id: Some("evt_001".to_string()),
    }
}

fn ended_payload() -> serde_json::Value {
    json!({
        "event_id": "evt_001",
        "event_type": "call.ended",
        "timestamp": "2026-05-04T09:59:58Z",
        "data": {
            "call_id": "call_abc",
            "call_metadata": {
                "project_id": "7b0d3c52-2f55-4a55-9d3e-8f4a2b1c0d01",
                "expert_id": "7b0d3c52-2f55-4a55-9d3e-8f4a2b1c0d02",
                "call_task_id": "7b0d3c52-2f55-4a55-9d3e-8f4a2b1c0d03",
                "caller_id": "7b0d3c52-2f55-4a55-9d3e-8f4a2b1c0d04"
            },
            "timing": {
                "initiated_at": "2026-05-04T09:58:00Z",
                "answered_at": "2026-05-04T09:58:10Z",
                "ended_at": "2026-05-04T09:59:55Z",
                "duration_seconds": 105
            },
            "termination": { "reason": "completed", "sip_code": 200 },
            "recording": { "recording_id": "rec_1", "recording_url": null }
        }
    })
}

#[test]
fn valid_signature_yields_event_id() {
    let body = br#"{"event_id":"evt_001"}"#;
    let headers = signed_headers("2026-05-04T09:59:00Z", body);
    let event_id =
        verify_signature(&headers, body, Some(&secret()), now(), max_age()).unwrap();
    assert_eq!(event_id, "evt_001");
}

#[test]
fn missing_header_is_rejected_before_anything_else() {
    let body = b"{}";
    let mut headers = signed_headers("2026-05-04T09:59:00Z", body);
    headers.event_id = None;
    let err = verify_signature(&headers, body, None, now(), max_age()).unwrap_err();
    assert_eq!(err.code(), "missing_webhook_headers");
    assert_eq!(err.status(), 400);

    headers.event_id = Some(String::new());
    let err = verify_signature(&headers, body, Some(&secret()), now(), max_age()).unwrap_err();
    assert_eq!(err.code(), "missing_webhook_headers");
}

#[test]
fn unconfigured_secret_is_a_server_error() {
    let body = b"{}";
    let headers = signed_headers("2026-05-04T09:59:00Z", body);
    let err = verify_signature(&headers, body, None, now(), max_age()).unwrap_err();
    assert_eq!(err.code(), "webhook_secret_missing");
    assert_eq!(err.status(), 500);
}

#[test]
fn unparseable_timestamp_is_rejected() {
    let body = b"{}";
    let headers = signed_headers("yesterday", body);
    let err = verify_signature(&headers, body, Some(&secret()), now(), max_age()).unwrap_err();
    assert_eq!(err.code(), "invalid_webhook_timestamp");
    assert_eq!(err.status(), 400);
}

#[test]
fn stale_timestamp_is_rejected_even_with_a_valid_signature() {
    let body = b"{}";
    let headers = signed_headers("2026-05-04T09:50:00Z", body);
    let err = verify_signature(&headers, body, Some(&secret()), now(), max_age()).unwrap_err();
    assert_eq!(err.code(), "stale_webhook_timestamp");
    assert_eq!(err.status(), 401);

    let future = signed_headers("2026-05-04T10:10:00Z", body);
    let err = verify_signature(&future, body, Some(&secret()), now(), max_age()).unwrap_err();
    assert_eq!(err.code(), "stale_webhook_timestamp");
}

#[test]
fn tampered_body_fails_verification() {
    let headers = signed_headers("2026-05-04T09:59:00Z", br#"{"duration":105}"#);
    let err = verify_signature(
        &headers,
        br#"{"duration":2}"#,
        Some(&secret()),
        now(),
        max_age(),
    )
    .unwrap_err();
    assert_eq!(err.code(), "invalid_webhook_signature");
    assert_eq!(err.status(), 401);
}

#[test]
fn non_hex_signature_fails_verification() {
    let body = b"{}";
    let mut headers = signed_headers("2026-05-04T09:59:00Z", body);
    headers.signature = Some("not-a-hex-digest".into());
    let err = verify_signature(&headers, body, Some(&secret()), now(), max_age()).unwrap_err();
    assert_eq!(err.code(), "invalid_webhook_signature");
}

#[test]
fn signature_from_another_secret_fails_verification() {
    let body = b"{}";
    let timestamp = "2026-05-04T09:59:00Z";
    let headers = WebhookHeaders {
        signature: Some(sign("other_secret", timestamp, body).unwrap()),
        timestamp: Some(timestamp.into()),
        event_id: Some("evt_001".into()),
    };
    let err = verify_signature(&headers, body, Some(&secret()), now(), max_age()).unwrap_err();
    assert_eq!(err.code(), "invalid_webhook_signature");
}

#[test]
fn parses_a_full_ended_event() {
    let body = serde_json::to_vec(&ended_payload()).unwrap();
    let event = parse_provider_event(&body).unwrap();

    assert_eq!(event.event_id, "evt_001");
    assert_eq!(event.event_type, CallEventType::Ended);
    assert_eq!(event.call_id, "call_abc");
    assert_eq!(event.timing.duration_seconds, 105);
    assert_eq!(event.termination.sip_code, Some(200));

    let metadata = event.metadata.unwrap();
    assert_eq!(
        metadata.task_id.to_string(),
        "7b0d3c52-2f55-4a55-9d3e-8f4a2b1c0d03"
    );
    let recording = event.recording.unwrap();
    assert_eq!(recording.recording_id.as_deref(), Some("rec_1"));
    assert_eq!(recording.recording_url, None);
}

#[test]
fn event_without_metadata_parses_with_none() {
    let mut payload = ended_payload();
    payload["data"]
        .as_object_mut()
        .unwrap()
        .remove("call_metadata");
    let body = serde_json::to_vec(&payload).unwrap();
    let event = parse_provider_event(&body).unwrap();
    assert!(event.metadata.is_none());
}

#[test]
fn unknown_event_type_is_an_invalid_payload() {
    let mut payload = ended_payload();
    payload["event_type"] = json!("call.transferred");
    let body = serde_json::to_vec(&payload).unwrap();
    let err = parse_provider_event(&body).unwrap_err();
    assert_eq!(err.code(), "invalid_webhook_payload");
    assert_eq!(err.status(), 400);
}

#[test]
fn empty_call_id_is_an_invalid_payload() {
    let mut payload = ended_payload();
    payload["data"]["call_id"] = json!("");
    let body = serde_json::to_vec(&payload).unwrap();
    let err = parse_provider_event(&body).unwrap_err();
    assert_eq!(err.code(), "invalid_webhook_payload");
}

#[test]
fn verified_delivery_parses_when_event_ids_agree() {
    let body = serde_json::to_vec(&ended_payload()).unwrap();
    let headers = signed_headers("2026-05-04T09:59:58Z", &body);
    let event = verify_and_parse(&headers, &body, Some(&secret()), now()).unwrap();
    assert_eq!(event.event_id, "evt_001");
    assert_eq!(event.call_id, "call_abc");
}

#[test]
fn header_and_body_event_ids_must_match() {
    let body = serde_json::to_vec(&ended_payload()).unwrap();
    let mut headers = signed_headers("2026-05-04T09:59:58Z", &body);
    headers.event_id = Some("evt_999".to_string());
    let err = verify_and_parse(&headers, &body, Some(&secret()), now()).unwrap_err();
    assert_eq!(err.code(), "invalid_webhook_payload");
    assert_eq!(err.status(), 400);
}
