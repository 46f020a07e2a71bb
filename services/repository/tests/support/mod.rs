//! Shared helpers for integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use sha2::{Digest, Sha256};

use omni_repository::store::{ChecksumAlgorithm, Image, ImageStatus, ImageStore};

/// In-process HTTP server standing in for the remote image host.
/// Serves one body with `Range` support and optional fault injection.
#[derive(Clone)]
pub struct RangeServer {
    body: Arc<Vec<u8>>,
    range_requests: Arc<AtomicUsize>,
    fail_range: Arc<Option<(u64, u64)>>,
    fail_consumed: Arc<AtomicBool>,
}

impl RangeServer {
    fn new(body: Vec<u8>, fail_range: Option<(u64, u64)>) -> Self {
        Self {
            body: Arc::new(body),
            range_requests: Arc::new(AtomicUsize::new(0)),
            fail_range: Arc::new(fail_range),
            fail_consumed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Number of ranged GETs observed so far.
    pub fn range_requests(&self) -> usize {
        self.range_requests.load(Ordering::SeqCst)
    }
}

fn parse_range(value: &str) -> Option<(u64, u64)> {
    let rest = value.strip_prefix("bytes=")?;
    let (start, end) = rest.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

async fn serve_image(State(server): State<RangeServer>, headers: HeaderMap) -> impl IntoResponse {
    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_range);

    match range {
        Some((start, end)) => {
            server.range_requests.fetch_add(1, Ordering::SeqCst);

            if *server.fail_range == Some((start, end))
                && !server.fail_consumed.swap(true, Ordering::SeqCst)
            {
                return (StatusCode::INTERNAL_SERVER_ERROR, Vec::new()).into_response();
            }

            let len = server.body.len() as u64;
            if start >= len || end >= len || start > end {
                return (StatusCode::RANGE_NOT_SATISFIABLE, Vec::new()).into_response();
            }
            let slice = server.body[start as usize..=end as usize].to_vec();
            (StatusCode::PARTIAL_CONTENT, slice).into_response()
        }
        None => (StatusCode::OK, server.body.as_ref().clone()).into_response(),
    }
}

/// Spawn the server on an ephemeral port; returns the handle and the
/// image URL.
pub async fn spawn_range_server(body: Vec<u8>) -> (RangeServer, String) {
    spawn_range_server_failing(body, None).await
}

/// Like [`spawn_range_server`], but the given `(start, end)` range
/// returns a 500 on its first attempt.
pub async fn spawn_range_server_failing(
    body: Vec<u8>,
    fail_range: Option<(u64, u64)>,
) -> (RangeServer, String) {
    let server = RangeServer::new(body, fail_range);
    let app = Router::new()
        .route("/image.iso", get(serve_image))
        .with_state(server.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (server, format!("http://{addr}/image.iso"))
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// A deterministic, non-repeating test body.
pub fn test_body(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Build and insert an image record pending download.
pub fn seed_pending_image(
    store: &ImageStore,
    checksum: &str,
    source_url: &str,
    external_id: &str,
) -> Image {
    let mut image = Image {
        id: 0,
        external_id: external_id.to_string(),
        external_component: "omni-manager".to_string(),
        user_id: 7,
        name: "openEuler-x86_64".to_string(),
        description: String::new(),
        file_name: "a.iso".to_string(),
        source_url: Some(source_url.to_string()),
        checksum: checksum.to_string(),
        algorithm: ChecksumAlgorithm::Sha256,
        image_path: format!("7/{checksum}/a.iso"),
        checksum_path: format!("7/{checksum}/a.iso.sha256sum"),
        publish: false,
        status: ImageStatus::Created,
        status_detail: String::new(),
        deleted: false,
        create_time: Utc::now(),
        update_time: Utc::now(),
    };
    store.add_image(&mut image).unwrap();
    image
}
