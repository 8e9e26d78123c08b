//! Provider webhook verification and parsing.
//!
//! The provider signs `timestamp + raw_body` with HMAC-SHA256 and sends the
//! hex digest alongside the timestamp and event id headers. Verification
//! happens on the raw bytes, before any parsing.

use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use sha2::Sha256;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::db::Db;
use crate::error::{Error, Result};
use crate::model::{
    CallEvent, CallEventType, CallMetadata, CallTiming, Intake, Recording, Termination,
};

type HmacSha256 = Hmac<Sha256>;

/// Maximum distance, in seconds, between the signed timestamp and now.
pub const MAX_EVENT_AGE_SECS: i64 = 300;

/// Signature headers as received. Any may be missing.
#[derive(Debug, Clone, Default)]
pub struct WebhookHeaders {
    pub signature: Option<String>,
    pub timestamp: Option<String>,
    pub event_id: Option<String>,
}

/// Check headers, freshness, and signature. Returns the event id.
pub fn verify_signature(
    headers: &WebhookHeaders,
    raw_body: &[u8],
    secret: Option<&SecretString>,
    now: DateTime<Utc>,
    max_age: Duration,
) -> Result<String> {
    let (Some(signature), Some(timestamp), Some(event_id)) = (
        non_empty(&headers.signature),
        non_empty(&headers.timestamp),
        non_empty(&headers.event_id),
    ) else {
        return Err(Error::webhook("missing_webhook_headers", 400));
    };
    let Some(secret) = secret else {
        return Err(Error::webhook("webhook_secret_missing", 500));
    };

    let signed_at = DateTime::parse_from_rfc3339(timestamp)
        .map_err(|_| Error::webhook("invalid_webhook_timestamp", 400))?
        .with_timezone(&Utc);
    if (now - signed_at).num_milliseconds().abs() > max_age.num_milliseconds() {
        return Err(Error::webhook("stale_webhook_timestamp", 401));
    }

    let expected =
        hex::decode(signature).map_err(|_| Error::webhook("invalid_webhook_signature", 401))?;
    let mut mac = HmacSha256::new_from_slice(secret.expose_secret().as_bytes())
        .map_err(|_| Error::webhook("webhook_secret_missing", 500))?;
    mac.update(timestamp.as_bytes());
    mac.update(raw_body);
    mac.verify_slice(&expected)
        .map_err(|_| Error::webhook("invalid_webhook_signature", 401))?;

    Ok(event_id.to_string())
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

/// Hex HMAC-SHA256 of `timestamp + body`, as the provider computes it.
pub fn sign(secret: &str, timestamp: &str, body: &[u8]) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| Error::Other(format!("invalid hmac key: {e}")))?;
    mac.update(timestamp.as_bytes());
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

#[derive(Debug, Deserialize)]
struct ProviderEvent {
    event_id: String,
    event_type: ProviderEventType,
    /// Validated for shape only; freshness comes from the signed header.
    #[serde(rename = "timestamp")]
    _timestamp: DateTime<Utc>,
    data: ProviderCallData,
}

#[derive(Debug, Clone, Copy, Deserialize)]
enum ProviderEventType {
    #[serde(rename = "call.started")]
    Started,
    #[serde(rename = "call.ringing")]
    Ringing,
    #[serde(rename = "call.answered")]
    Answered,
    #[serde(rename = "call.ended")]
    Ended,
    #[serde(rename = "call.failed")]
    Failed,
    #[serde(rename = "call.recording_ready")]
    RecordingReady,
}

impl From<ProviderEventType> for CallEventType {
    fn from(t: ProviderEventType) -> Self {
        match t {
            ProviderEventType::Started => CallEventType::Started,
            ProviderEventType::Ringing => CallEventType::Ringing,
            ProviderEventType::Answered => CallEventType::Answered,
            ProviderEventType::Ended => CallEventType::Ended,
            ProviderEventType::Failed => CallEventType::Failed,
            ProviderEventType::RecordingReady => CallEventType::RecordingReady,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ProviderCallData {
    call_id: String,
    call_metadata: Option<ProviderCallMetadata>,
    timing: ProviderTiming,
    termination: ProviderTermination,
    recording: Option<ProviderRecording>,
}

#[derive(Debug, Deserialize)]
struct ProviderCallMetadata {
    project_id: Uuid,
    expert_id: Uuid,
    call_task_id: Uuid,
    caller_id: Uuid,
}

#[derive(Debug, Deserialize)]
struct ProviderTiming {
    initiated_at: Option<DateTime<Utc>>,
    answered_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    duration_seconds: u32,
}

#[derive(Debug, Deserialize)]
struct ProviderTermination {
    reason: String,
    sip_code: Option<i32>,
}

#[derive(Debug, Deserialize)]
struct ProviderRecording {
    recording_id: Option<String>,
    recording_url: Option<String>,
}

/// Parse a provider payload into a [`CallEvent`].
pub fn parse_provider_event(raw_body: &[u8]) -> Result<CallEvent> {
    let event: ProviderEvent = serde_json::from_slice(raw_body).map_err(|e| {
        debug!("webhook payload rejected: {e}");
        Error::webhook("invalid_webhook_payload", 400)
    })?;
    if event.event_id.is_empty() || event.data.call_id.is_empty() {
        return Err(Error::webhook("invalid_webhook_payload", 400));
    }

    let data = event.data;
    Ok(CallEvent {
        event_id: event.event_id,
        event_type: event.event_type.into(),
        call_id: data.call_id,
        metadata: data.call_metadata.map(|m| CallMetadata {
            project_id: m.project_id,
            expert_id: m.expert_id,
            task_id: m.call_task_id,
            caller_id: m.caller_id,
        }),
        timing: CallTiming {
            initiated_at: data.timing.initiated_at,
            answered_at: data.timing.answered_at,
            ended_at: data.timing.ended_at,
            duration_seconds: i32::try_from(data.timing.duration_seconds).unwrap_or(i32::MAX),
        },
        termination: Termination {
            reason: data.termination.reason,
            sip_code: data.termination.sip_code,
        },
        recording: data.recording.map(|r| Recording {
            recording_id: r.recording_id,
            recording_url: r.recording_url,
        }),
    })
}

/// Verify a delivery and parse its body. The signed header event id must
/// match the one in the body, since the ledger keys on it.
pub fn verify_and_parse(
    headers: &WebhookHeaders,
    raw_body: &[u8],
    secret: Option<&SecretString>,
    now: DateTime<Utc>,
) -> Result<CallEvent> {
    let header_event_id = verify_signature(
        headers,
        raw_body,
        secret,
        now,
        Duration::seconds(MAX_EVENT_AGE_SECS),
    )?;
    let event = parse_provider_event(raw_body)?;
    if event.event_id != header_event_id {
        debug!(
            header_event_id,
            body_event_id = %event.event_id,
            "webhook event id mismatch"
        );
        return Err(Error::webhook("invalid_webhook_payload", 400));
    }
    Ok(event)
}

/// Verify, parse, register, and enqueue one webhook delivery.
///
/// A redelivery of an already-registered event is `Intake::Duplicate`,
/// which the HTTP surface answers with success.
#[instrument(skip_all, fields(correlation_id = %correlation_id))]
pub async fn receive(
    db: &Db,
    headers: &WebhookHeaders,
    raw_body: &[u8],
    secret: Option<&SecretString>,
    correlation_id: &str,
) -> Result<Intake> {
    let event = verify_and_parse(headers, raw_body, secret, db.now())?;
    db.accept_call_event(&event, correlation_id).await
}
