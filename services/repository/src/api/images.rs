//! Image endpoints: upload, load (pull), query, delete.

use std::collections::HashMap;
use std::path::PathBuf;

use axum::extract::{Multipart, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{error, warn};
use uuid::Uuid;
use validator::Validate;

use crate::service::NewImage;
use crate::state::AppState;
use crate::store::{Image, ImageStatus};

use super::error::ApiError;

/// Prefix relative paths are exposed under until an image is pushed.
const BROWSE_PREFIX: &str = "/browse";

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/upload", post(upload_image))
        .route("/load", post(load_image))
        .route("/query", get(query_image))
        .route("/", delete(delete_image))
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ImageRequest {
    #[validate(length(min = 1))]
    pub name: String,

    #[serde(default)]
    pub desc: String,

    #[validate(length(min = 1))]
    pub checksum: String,

    #[validate(length(min = 1))]
    pub algorithm: String,

    #[serde(rename = "externalID")]
    #[validate(length(min = 1))]
    pub external_id: String,

    #[serde(default)]
    pub source_url: Option<String>,

    #[validate(length(min = 1))]
    pub file_name: String,

    #[serde(rename = "userID")]
    #[validate(range(min = 1))]
    pub user_id: i64,

    #[serde(default)]
    pub publish: bool,

    #[validate(length(min = 1))]
    pub external_component: String,
}

impl ImageRequest {
    fn into_new_image(self) -> NewImage {
        NewImage {
            name: self.name,
            description: self.desc,
            checksum: self.checksum,
            algorithm: self.algorithm,
            external_id: self.external_id,
            external_component: self.external_component,
            source_url: self.source_url,
            file_name: self.file_name,
            user_id: self.user_id,
            publish: self.publish,
        }
    }

    /// Rebuild the request from multipart text fields.
    fn from_fields(fields: &HashMap<String, String>) -> Self {
        let text = |name: &str| fields.get(name).cloned().unwrap_or_default();
        Self {
            name: text("name"),
            desc: text("desc"),
            checksum: text("checksum"),
            algorithm: text("algorithm"),
            external_id: text("externalID"),
            source_url: fields.get("sourceUrl").cloned().filter(|v| !v.is_empty()),
            file_name: text("fileName"),
            user_id: fields
                .get("userID")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            publish: fields
                .get("publish")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
            external_component: text("externalComponent"),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageResponse {
    pub id: i64,
    pub name: String,
    pub desc: String,
    pub checksum: String,
    pub algorithm: String,
    #[serde(rename = "externalID")]
    pub external_id: String,
    pub source_url: Option<String>,
    pub file_name: String,
    #[serde(rename = "userID")]
    pub user_id: i64,
    pub publish: bool,
    pub external_component: String,
    pub status: String,
    pub status_detail: String,
    pub image_path: String,
    pub checksum_path: String,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

impl ImageResponse {
    fn from_image(image: &Image) -> Self {
        // relative paths are browsable; pushed images expose external URLs
        let (image_path, checksum_path) = if image.status != ImageStatus::Pushed {
            (
                browse_path(&image.image_path),
                browse_path(&image.checksum_path),
            )
        } else {
            (image.image_path.clone(), image.checksum_path.clone())
        };

        Self {
            id: image.id,
            name: image.name.clone(),
            desc: image.description.clone(),
            checksum: image.checksum.clone(),
            algorithm: image.algorithm.as_str().to_string(),
            external_id: image.external_id.clone(),
            source_url: image.source_url.clone(),
            file_name: image.file_name.clone(),
            user_id: image.user_id,
            publish: image.publish,
            external_component: image.external_component.clone(),
            status: image.status.as_str().to_string(),
            status_detail: image.status_detail.clone(),
            image_path,
            checksum_path,
            create_time: image.create_time,
            update_time: image.update_time,
        }
    }
}

fn browse_path(relative: &str) -> String {
    format!("{BROWSE_PREFIX}/{}", relative.trim_start_matches('/'))
}

#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    pub token: Option<String>,
}

fn check_token(state: &AppState, token: &TokenQuery) -> Result<(), ApiError> {
    match token.token.as_deref() {
        Some(token) if token == state.upload_token => Ok(()),
        _ => Err(ApiError::unauthorized("token_mismatch", "token mismatch")),
    }
}

/// Upload an image body and register it at `Downloaded`.
async fn upload_image(
    State(state): State<AppState>,
    Query(token): Query<TokenQuery>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    check_token(&state, &token)?;

    let mut fields: HashMap<String, String> = HashMap::new();
    let mut staged: Option<PathBuf> = None;

    let result = async {
        while let Some(mut field) = multipart
            .next_field()
            .await
            .map_err(|e| ApiError::bad_request("invalid_multipart", e.to_string()))?
        {
            let Some(name) = field.name().map(ToString::to_string) else {
                continue;
            };
            if name == "file" {
                let staging = state.data_folder.join(format!(".upload-{}", Uuid::new_v4()));
                let mut file = fs::File::create(&staging).await.map_err(|e| {
                    ApiError::internal("staging_failed", format!("failed to stage upload: {e}"))
                })?;
                staged = Some(staging);
                while let Some(chunk) = field
                    .chunk()
                    .await
                    .map_err(|e| ApiError::bad_request("invalid_multipart", e.to_string()))?
                {
                    file.write_all(&chunk).await.map_err(|e| {
                        ApiError::internal("staging_failed", format!("failed to stage upload: {e}"))
                    })?;
                }
                file.flush().await.map_err(|e| {
                    ApiError::internal("staging_failed", format!("failed to stage upload: {e}"))
                })?;
            } else {
                let value = field
                    .text()
                    .await
                    .map_err(|e| ApiError::bad_request("invalid_multipart", e.to_string()))?;
                fields.insert(name, value);
            }
        }

        let staged_file = staged
            .clone()
            .ok_or_else(|| ApiError::bad_request("missing_file", "missing file"))?;

        let request = ImageRequest::from_fields(&fields);
        request
            .validate()
            .map_err(|e| ApiError::bad_request("invalid_request", e.to_string()))?;

        let image = state.service.create_image(request.into_new_image())?;

        let destination = state.data_folder.join(&image.image_path);
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                ApiError::internal("store_failed", format!("failed to create image folder: {e}"))
            })?;
        }
        fs::rename(&staged_file, &destination).await.map_err(|e| {
            error!(error = %e, destination = %destination.display(), "failed to place uploaded image");
            ApiError::internal("store_failed", "failed to copy image content into local".to_string())
        })?;
        staged = None;

        Ok((StatusCode::CREATED, Json(ImageResponse::from_image(&image))))
    }
    .await;

    if let Some(staging) = staged {
        if let Err(e) = fs::remove_file(&staging).await {
            warn!(error = %e, staging = %staging.display(), "failed to remove staged upload");
        }
    }
    result
}

/// Register an image to be pulled from an external URL.
async fn load_image(
    State(state): State<AppState>,
    Query(token): Query<TokenQuery>,
    Json(request): Json<ImageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    check_token(&state, &token)?;
    request
        .validate()
        .map_err(|e| ApiError::bad_request("invalid_request", e.to_string()))?;

    let image = state
        .service
        .create_image_pending_download(request.into_new_image())?;
    Ok((StatusCode::CREATED, Json(ImageResponse::from_image(&image))))
}

#[derive(Debug, Deserialize)]
pub struct QueryImageRequest {
    #[serde(rename = "externalID")]
    pub external_id: String,
}

async fn query_image(
    State(state): State<AppState>,
    Query(request): Query<QueryImageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let image = state.service.query_by_external_id(&request.external_id)?;
    Ok(Json(ImageResponse::from_image(&image)))
}

#[derive(Debug, Deserialize)]
pub struct DeleteImageRequest {
    #[serde(rename = "userID")]
    pub user_id: i64,
    pub checksum: String,
}

async fn delete_image(
    State(state): State<AppState>,
    Query(token): Query<TokenQuery>,
    Json(request): Json<DeleteImageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    check_token(&state, &token)?;
    state
        .service
        .soft_delete(request.user_id, &request.checksum)?;
    Ok(StatusCode::NO_CONTENT)
}
