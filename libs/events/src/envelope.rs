//! CloudEvents v1.0 envelope in the JSON event format.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// CloudEvents specification version carried in every envelope.
pub const SPEC_VERSION: &str = "1.0";

/// A CloudEvents v1.0 event in JSON format.
///
/// Attribute names follow the CloudEvents JSON mapping (`specversion`,
/// `datacontenttype`), not Rust naming.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudEvent {
    /// Specification version, always "1.0".
    #[serde(rename = "specversion")]
    pub spec_version: String,

    /// Unique event identifier; also used as the message key on the bus.
    pub id: String,

    /// Event type, e.g. "image.downloaded".
    #[serde(rename = "type")]
    pub event_type: String,

    /// Fixed URL identifying the producing service.
    pub source: String,

    /// Subject of the event: `{externalComponent}.{externalID}`.
    pub subject: String,

    /// When the event was produced.
    pub time: DateTime<Utc>,

    /// Content type of `data`, always "application/json".
    #[serde(rename = "datacontenttype")]
    pub data_content_type: String,

    /// Event-type specific payload.
    pub data: serde_json::Value,
}

impl CloudEvent {
    /// Build an envelope with a fresh id and the current time.
    pub fn new(
        event_type: impl Into<String>,
        source: impl Into<String>,
        subject: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            spec_version: SPEC_VERSION.to_string(),
            id: Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            source: source.into(),
            subject: subject.into(),
            time: Utc::now(),
            data_content_type: "application/json".to_string(),
            data,
        }
    }
}
