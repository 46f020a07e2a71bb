//! # omni-events
//!
//! Event type definitions and serialization for omni-repository.
//!
//! Every lifecycle transition of an image record is announced on the
//! event bus as a CloudEvents v1.0 JSON message. This crate defines:
//!
//! - The envelope ([`CloudEvent`]) with the spec-mandated attributes
//! - The image event types (`image.created`, `image.downloaded`, ...)
//! - The per-event data payloads carried in the envelope's `data` field
//!
//! Events are best-effort: a consumer must tolerate missing intermediate
//! events and re-derive state from the query endpoint when needed.

mod envelope;
mod types;

pub use envelope::{CloudEvent, SPEC_VERSION};
pub use types::{
    CleanedData, DownloadedData, FailedData, ImageEvent, PushedData, VerifiedData, EVENT_SOURCE,
    TOPIC_IMAGE_STATUS,
};
