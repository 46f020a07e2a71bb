//! Persistent image record storage.
//!
//! The record store is the durable heart of the lifecycle engine: image
//! status fields act as the work queue, and the status-gated query
//! families below are what the work fetcher sweeps. Storage is SQLite
//! with an in-memory variant for tests.

mod images;

pub use images::{ChecksumAlgorithm, Image, ImageStatus, ImageStore, StoreError};
