//! Lifecycle workers and work dispatch.
//!
//! The store's status fields act as the durable work queue: the
//! [`WorkFetcher`] sweeps them into typed [`ImageWork`] items, and the
//! [`WorkManager`]'s pool drives each item through the matching worker.
//! Workers hold no cross-invocation state; a failure becomes
//! `status = Failed` plus an `image.failed` event, and the dispatcher
//! moves on.

mod cleaner;
mod fetcher;
mod manager;
mod puller;
mod pusher;
mod verifier;

pub use cleaner::ImageCleaner;
pub use fetcher::{WorkFetcher, FETCH_BATCH};
pub use manager::WorkManager;
pub use puller::ImagePuller;
pub use pusher::{ImagePusher, PushTarget};
pub use verifier::ImageVerifier;

use thiserror::Error;

use crate::objstore::ObjectStoreError;
use crate::store::{Image, StoreError};

/// Kind of deferred processing targeted at one image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkKind {
    Pull,
    Sign,
    Push,
    Clean,
}

impl std::fmt::Display for WorkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pull => "pull",
            Self::Sign => "sign",
            Self::Push => "push",
            Self::Clean => "clean",
        };
        write!(f, "{s}")
    }
}

/// One unit of work: an image plus what to do with it.
#[derive(Debug, Clone)]
pub struct ImageWork {
    pub image: Image,
    pub kind: WorkKind,
}

/// Errors from worker execution.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("object store error: {0}")]
    ObjectStore(#[from] ObjectStoreError),

    #[error("source url not usable: {0}")]
    InvalidSource(String),

    #[error("unacceptable status code {status} from {url}")]
    UnexpectedStatus { status: u16, url: String },

    #[error("content length missing or empty for {0}")]
    MissingContentLength(String),

    #[error("source reports a size of zero: {0}")]
    EmptySource(String),

    #[error("block size mismatch: requested {expected} bytes, wrote {actual}")]
    BlockSizeMismatch { expected: u64, actual: u64 },

    #[error("{failed} of {total} blocks failed permanently")]
    BlocksFailed { failed: u64, total: usize },

    #[error("expected {expected} part files, found {found}")]
    PartsMissing { expected: usize, found: usize },

    #[error("checksum is not identical to image file's, provided {expected} while actual {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("work queue closed")]
    QueueClosed,
}
