//! Shared application state for the HTTP layer.

use std::path::PathBuf;
use std::sync::Arc;

use crate::service::ImageService;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ImageService>,

    /// Static token required by the mutating endpoints.
    pub upload_token: String,

    /// Data root, served read-only under `/browse`.
    pub data_folder: PathBuf,
}

impl AppState {
    pub fn new(service: Arc<ImageService>, upload_token: String) -> Self {
        let data_folder = service.data_folder().to_path_buf();
        Self {
            service,
            upload_token,
            data_folder,
        }
    }
}
