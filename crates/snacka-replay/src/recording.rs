//! Recorded transport logs and the collaborators that serve them.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, info};

use snacka_client::{ApiRequest, ApiResponse, RequestApi, ResourceHost, TransportEvent};
use snacka_shared::protocol::EventFrame;
use snacka_shared::types::{ResourceId, ViewId};
use snacka_shared::{RequestError, RequestErrorKind};

/// A connection lifecycle marker in a recording.
#[derive(Debug, Deserialize)]
#[serde(tag = "transport", rename_all = "snake_case")]
enum Marker {
    Connecting,
    Connected,
    Disconnected {
        #[serde(default = "unknown_reason")]
        reason: String,
    },
}

fn unknown_reason() -> String {
    "unknown".into()
}

/// Parse one JSONL line of a transport recording. Blank lines and `#`
/// comments yield `None`; anything without a `transport` key is passed to
/// the engine as a raw frame.
pub fn parse_line(line: &str) -> anyhow::Result<Option<TransportEvent>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let value: serde_json::Value = serde_json::from_str(line).context("line is not JSON")?;
    if value.get("transport").is_none() {
        return Ok(Some(TransportEvent::Frame(line.as_bytes().to_vec())));
    }

    let event = match serde_json::from_value::<Marker>(value).context("bad transport marker")? {
        Marker::Connecting => TransportEvent::Connecting,
        Marker::Connected => TransportEvent::Connected,
        Marker::Disconnected { reason } => TransportEvent::Disconnected { reason },
    };
    Ok(Some(event))
}

pub fn parse_log(text: &str) -> anyhow::Result<Vec<TransportEvent>> {
    let mut events = Vec::new();
    for (index, line) in text.lines().enumerate() {
        if let Some(event) = parse_line(line).with_context(|| format!("log line {}", index + 1))? {
            events.push(event);
        }
    }
    Ok(events)
}

/// Parse a backlog file: one [`EventFrame`] per line.
pub fn parse_backlog(text: &str) -> anyhow::Result<Vec<EventFrame>> {
    let mut frames = Vec::new();
    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let frame = EventFrame::from_bytes(line.as_bytes())
            .with_context(|| format!("backlog line {}", index + 1))?;
        frames.push(frame);
    }
    Ok(frames)
}

/// Request API backed by a recording. The first catch-up gets the whole
/// backlog, later ones get nothing. Mutations are refused.
pub struct ReplayApi {
    backlog: Mutex<Option<Vec<EventFrame>>>,
}

impl ReplayApi {
    pub fn new(backlog: Vec<EventFrame>) -> Self {
        Self {
            backlog: Mutex::new(Some(backlog)),
        }
    }
}

#[async_trait]
impl RequestApi for ReplayApi {
    async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, RequestError> {
        debug!(op = %request.correlation_id().short(), "Refusing mutation during replay");
        Err(RequestError::new(
            RequestErrorKind::Unavailable,
            "replay is read-only",
        ))
    }

    async fn fetch_backlog(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<EventFrame>, RequestError> {
        let frames = self.backlog.lock().take().unwrap_or_default();
        info!(count = frames.len(), ?since, "Serving recorded backlog");
        Ok(frames)
    }
}

/// Resource host that only logs.
pub struct LogHost;

#[async_trait]
impl ResourceHost for LogHost {
    async fn attach(&self, resource: &ResourceId, owner: ViewId) -> Result<(), String> {
        info!(%resource, owner = %owner.short(), "attach");
        Ok(())
    }

    async fn detach(&self, resource: &ResourceId, owner: ViewId) -> Result<(), String> {
        info!(%resource, owner = %owner.short(), "detach");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_markers_and_frames() {
        let log = r#"
# session start
{"transport":"connecting"}
{"transport":"connected"}
{"type":"voice_participant_left","data":{}}
{"transport":"disconnected"}
{"transport":"disconnected","reason":"idle timeout"}
"#;
        let events = parse_log(log).unwrap();
        assert_eq!(events.len(), 5);
        assert_eq!(events[0], TransportEvent::Connecting);
        assert_eq!(events[1], TransportEvent::Connected);
        assert!(matches!(events[2], TransportEvent::Frame(_)));
        assert_eq!(
            events[3],
            TransportEvent::Disconnected {
                reason: "unknown".into()
            }
        );
        assert_eq!(
            events[4],
            TransportEvent::Disconnected {
                reason: "idle timeout".into()
            }
        );
    }

    #[test]
    fn test_parse_reports_line_number() {
        let err = parse_log("{\"transport\":\"connected\"}\nnot json").unwrap_err();
        assert!(format!("{err:#}").starts_with("log line 2"));

        let err = parse_log(r#"{"transport":"teleported"}"#).unwrap_err();
        assert!(format!("{err:#}").contains("bad transport marker"));
    }

    #[tokio::test]
    async fn test_backlog_served_once() {
        let frames = parse_backlog(
            r#"{"type":"notification_read","data":{"id":"6c3f1c0e-3f0f-4d53-9b55-0c6d2f4ad0a1","read_at":"2024-01-01T00:00:00Z"}}"#,
        )
        .unwrap();
        let api = ReplayApi::new(frames);

        assert_eq!(api.fetch_backlog(None).await.unwrap().len(), 1);
        assert!(api.fetch_backlog(None).await.unwrap().is_empty());
    }
}
