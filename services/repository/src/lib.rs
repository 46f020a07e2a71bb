//! omni-repository service library.
//!
//! An image artifact repository: large binary images (ISOs, disk images,
//! RPM bundles, toolchains) enter by direct upload or asynchronous pull,
//! are verified against a client-supplied digest, optionally republished
//! to S3-compatible object storage, and announced over a
//! CloudEvents-on-Kafka bus.
//!
//! ## Architecture
//!
//! ```text
//! façade (api/ + service) ──▶ store (SQLite record per image)
//!                                 ▲
//!                                 │ status-gated sweeps
//!                           WorkFetcher ──▶ work queue ──▶ WorkManager pool
//!                                                 │
//!                       Puller / Verifier / Pusher / Cleaner
//! ```
//!
//! All durable state lives in the store; a worker reads its image,
//! drives one transition, and writes narrow updates back. Crash recovery
//! re-enqueues `Downloading`/`Pushing` images on the first fetch of a
//! process.
//!
//! ## Modules
//!
//! - `api`: HTTP ingestion façade
//! - `service`: in-process registration/query/delete API
//! - `store`: SQLite-backed image records
//! - `workers`: puller, verifier, pusher, cleaner, fetcher, manager
//! - `notify`: CloudEvents emission
//! - `objstore`: S3-compatible object store client

pub mod api;
pub mod config;
pub mod layout;
pub mod notify;
pub mod objstore;
pub mod service;
pub mod state;
pub mod store;
pub mod workers;
