//! Image lifecycle event types and payloads.

use serde::{Deserialize, Serialize};

/// Kafka topic carrying all image lifecycle events.
pub const TOPIC_IMAGE_STATUS: &str = "omni-repository-image-status";

/// Fixed CloudEvents source identifying this service.
pub const EVENT_SOURCE: &str = "github.com/omnibuildplatform/omni-repository";

/// Lifecycle events emitted for an image record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageEvent {
    /// A record was registered through the façade.
    Created,
    /// A download block completed (emitted once per block).
    Downloaded,
    /// The digest matched and the sidecar was written.
    Verified,
    /// Image and sidecar landed in the object store.
    Pushed,
    /// The image reached the `Failed` state.
    Failed,
    /// Local files were removed.
    Cleaned,
}

impl ImageEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "image.created",
            Self::Downloaded => "image.downloaded",
            Self::Verified => "image.verified",
            Self::Pushed => "image.pushed",
            Self::Failed => "image.failed",
            Self::Cleaned => "image.cleaned",
        }
    }
}

impl std::fmt::Display for ImageEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Payload for `image.downloaded`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadedData {
    /// Size of the block that just completed, in bytes.
    pub block_size: u64,
    /// Total image size reported by the source, in bytes.
    pub image_size: u64,
}

/// Payload for `image.verified`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifiedData {
    pub checksum: String,
}

/// Payload for `image.pushed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushedData {
    pub image_path: String,
    pub checksum_path: String,
}

/// Payload for `image.failed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedData {
    pub detail: String,
}

/// Payload for `image.cleaned` (intentionally empty).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleanedData {}
