//! Object storage used to republish verified images.
//!
//! The [`ObjectStore`] trait captures exactly what the pusher needs from
//! an S3-compatible store: a metadata lookup that distinguishes 404,
//! object delete, and multipart upload by byte range. Tests supply an
//! in-memory implementation; production uses [`S3ObjectStore`].

mod s3;

pub use s3::S3ObjectStore;

use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;

/// Errors from object store operations.
#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("bucket {bucket} not reachable: {detail}")]
    BucketUnreachable { bucket: String, detail: String },

    #[error("object store request failed: {0}")]
    Request(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A part that finished uploading, identified for the completion call.
#[derive(Debug, Clone)]
pub struct CompletedUploadPart {
    pub part_number: i32,
    pub etag: String,
}

/// Minimal S3-compatible object store contract.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Whether an object exists (metadata lookup; 404 means no).
    async fn object_exists(&self, key: &str) -> Result<bool, ObjectStoreError>;

    async fn delete_object(&self, key: &str) -> Result<(), ObjectStoreError>;

    /// Create a zero-byte object, used as a directory marker.
    async fn put_empty_object(&self, key: &str) -> Result<(), ObjectStoreError>;

    /// Initiate a multipart upload; returns the upload id.
    async fn create_multipart_upload(&self, key: &str) -> Result<String, ObjectStoreError>;

    /// Upload one part from a byte range of a local file; returns its etag.
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        source: &Path,
        offset: u64,
        length: u64,
    ) -> Result<String, ObjectStoreError>;

    /// Complete a multipart upload. `parts` must be ordered by part number.
    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedUploadPart>,
    ) -> Result<(), ObjectStoreError>;

    async fn abort_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
    ) -> Result<(), ObjectStoreError>;

    /// Public URL an uploaded key is reachable at.
    fn external_url(&self, key: &str) -> String;
}
