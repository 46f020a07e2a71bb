//! In-process façade for image record registration and queries.
//!
//! All ingestion semantics live here; the HTTP layer only binds requests.
//! Uploaded images enter at `Downloaded` (the caller writes the bytes),
//! pulled images enter at `Created` and rely on the work fetcher.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use omni_events::ImageEvent;
use thiserror::Error;
use tracing::info;

use crate::layout;
use crate::notify::Notifier;
use crate::store::{ChecksumAlgorithm, Image, ImageStatus, ImageStore, StoreError};

/// Errors surfaced to the façade's callers.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    Validation(String),

    #[error("image with identical checksum already exists: {0}")]
    Duplicate(String),

    #[error("image not found")]
    NotFound,

    #[error("store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for ServiceError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(_) => Self::NotFound,
            other => Self::Store(other),
        }
    }
}

/// Fields a caller supplies when registering an image.
#[derive(Debug, Clone)]
pub struct NewImage {
    pub name: String,
    pub description: String,
    pub checksum: String,
    pub algorithm: String,
    pub external_id: String,
    pub external_component: String,
    pub source_url: Option<String>,
    pub file_name: String,
    pub user_id: i64,
    pub publish: bool,
}

/// Image registration, lookup, and soft deletion.
pub struct ImageService {
    store: ImageStore,
    notifier: Arc<dyn Notifier>,
    data_folder: PathBuf,
}

impl ImageService {
    pub fn new(store: ImageStore, notifier: Arc<dyn Notifier>, data_folder: PathBuf) -> Self {
        Self {
            store,
            notifier,
            data_folder,
        }
    }

    pub fn data_folder(&self) -> &Path {
        &self.data_folder
    }

    /// Register an uploaded image. The caller is responsible for writing
    /// the bytes to the returned record's `image_path`.
    pub fn create_image(&self, request: NewImage) -> Result<Image, ServiceError> {
        self.register(request, ImageStatus::Downloaded)
    }

    /// Register an image to be pulled from its source URL.
    pub fn create_image_pending_download(&self, request: NewImage) -> Result<Image, ServiceError> {
        let url = request
            .source_url
            .as_deref()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| ServiceError::Validation("source url is empty".to_string()))?;
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ServiceError::Validation(format!(
                "source url scheme not supported: {url}"
            )));
        }
        self.register(request, ImageStatus::Created)
    }

    pub fn query_by_external_id(&self, external_id: &str) -> Result<Image, ServiceError> {
        Ok(self.store.get_image_by_external_id(external_id)?)
    }

    /// Soft-delete the live record for `(userId, checksum)`; the cleaner
    /// reclaims files and hard-deletes on its next sweep.
    pub fn soft_delete(&self, user_id: i64, checksum: &str) -> Result<(), ServiceError> {
        self.store
            .soft_delete_image(user_id, &checksum.to_lowercase())?;
        info!(user_id, checksum, "image soft deleted");
        Ok(())
    }

    fn register(&self, request: NewImage, status: ImageStatus) -> Result<Image, ServiceError> {
        let algorithm = ChecksumAlgorithm::parse(&request.algorithm).ok_or_else(|| {
            ServiceError::Validation(format!("unsupported algorithm {}", request.algorithm))
        })?;

        let checksum = request.checksum.to_lowercase();
        if !algorithm.matches_checksum(&checksum) {
            return Err(ServiceError::Validation(format!(
                "invalid {algorithm} checksum"
            )));
        }

        for (value, field) in [
            (&request.name, "name"),
            (&request.file_name, "fileName"),
            (&request.external_id, "externalID"),
            (&request.external_component, "externalComponent"),
        ] {
            if value.is_empty() {
                return Err(ServiceError::Validation(format!("{field} is required")));
            }
        }
        if request.user_id <= 0 {
            return Err(ServiceError::Validation("userID is required".to_string()));
        }

        if let Some(existing) = self
            .store
            .get_image_by_checksum_and_user_id(&checksum, request.user_id)?
        {
            return Err(ServiceError::Duplicate(existing.file_name));
        }

        let now = Utc::now();
        let mut image = Image {
            id: 0,
            external_id: request.external_id,
            external_component: request.external_component,
            user_id: request.user_id,
            name: request.name,
            description: request.description,
            file_name: request.file_name.clone(),
            source_url: request.source_url,
            image_path: layout::image_relative_path(request.user_id, &checksum, &request.file_name),
            checksum_path: layout::checksum_relative_path(
                request.user_id,
                &checksum,
                &request.file_name,
                algorithm,
            ),
            checksum,
            algorithm,
            publish: request.publish,
            status,
            status_detail: String::new(),
            deleted: false,
            create_time: now,
            update_time: now,
        };
        self.store.add_image(&mut image)?;

        self.notifier.notify(
            ImageEvent::Created,
            &image.external_component,
            &image.external_id,
            serde_json::json!({}),
        );
        info!(
            image_id = image.id,
            external_id = %image.external_id,
            status = %image.status,
            "image record created"
        );
        Ok(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::RecordingNotifier;

    const SHA256_EMPTY: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    fn test_service() -> (ImageService, Arc<RecordingNotifier>) {
        let notifier = Arc::new(RecordingNotifier::new());
        let service = ImageService::new(
            ImageStore::open_in_memory().unwrap(),
            notifier.clone(),
            PathBuf::from("/tmp/omni-test-data"),
        );
        (service, notifier)
    }

    fn upload_request() -> NewImage {
        NewImage {
            name: "openEuler-x86_64".to_string(),
            description: "release image".to_string(),
            checksum: SHA256_EMPTY.to_string(),
            algorithm: "sha256".to_string(),
            external_id: "E1".to_string(),
            external_component: "omni-manager".to_string(),
            source_url: None,
            file_name: "a.iso".to_string(),
            user_id: 7,
            publish: false,
        }
    }

    #[test]
    fn upload_enters_at_downloaded_with_derived_paths() {
        let (service, notifier) = test_service();
        let image = service.create_image(upload_request()).unwrap();

        assert_eq!(image.status, ImageStatus::Downloaded);
        assert_eq!(image.image_path, format!("7/{SHA256_EMPTY}/a.iso"));
        assert_eq!(
            image.checksum_path,
            format!("7/{SHA256_EMPTY}/a.iso.sha256sum")
        );
        assert_eq!(notifier.events_of(ImageEvent::Created).len(), 1);
    }

    #[test]
    fn pending_download_requires_http_source() {
        let (service, _) = test_service();

        let missing = service.create_image_pending_download(upload_request());
        assert!(matches!(missing, Err(ServiceError::Validation(_))));

        let mut ftp = upload_request();
        ftp.source_url = Some("ftp://example.com/a.iso".to_string());
        assert!(matches!(
            service.create_image_pending_download(ftp),
            Err(ServiceError::Validation(_))
        ));

        let mut ok = upload_request();
        ok.source_url = Some("https://example.com/a.iso".to_string());
        let image = service.create_image_pending_download(ok).unwrap();
        assert_eq!(image.status, ImageStatus::Created);
    }

    #[test]
    fn checksum_must_match_algorithm() {
        let (service, _) = test_service();

        let mut bad = upload_request();
        bad.algorithm = "md5".to_string(); // 64-hex digest declared md5
        assert!(matches!(
            service.create_image(bad),
            Err(ServiceError::Validation(_))
        ));

        let mut unknown = upload_request();
        unknown.algorithm = "sha1".to_string();
        assert!(matches!(
            service.create_image(unknown),
            Err(ServiceError::Validation(_))
        ));
    }

    #[test]
    fn duplicate_checksum_per_user_is_rejected() {
        let (service, _) = test_service();
        service.create_image(upload_request()).unwrap();

        let mut again = upload_request();
        again.external_id = "E2".to_string();
        assert!(matches!(
            service.create_image(again),
            Err(ServiceError::Duplicate(_))
        ));

        // another user may hold the same bytes
        let mut other_user = upload_request();
        other_user.external_id = "E3".to_string();
        other_user.user_id = 8;
        assert!(service.create_image(other_user).is_ok());
    }

    #[test]
    fn checksum_is_normalized_to_lowercase() {
        let (service, _) = test_service();
        let mut request = upload_request();
        request.checksum = SHA256_EMPTY.to_uppercase();
        let image = service.create_image(request).unwrap();
        assert_eq!(image.checksum, SHA256_EMPTY);
    }

    #[test]
    fn soft_delete_then_query_misses() {
        let (service, _) = test_service();
        service.create_image(upload_request()).unwrap();

        service.soft_delete(7, SHA256_EMPTY).unwrap();
        assert!(matches!(
            service.query_by_external_id("E1"),
            Err(ServiceError::NotFound)
        ));
        assert!(matches!(
            service.soft_delete(7, SHA256_EMPTY),
            Err(ServiceError::NotFound)
        ));
    }
}
