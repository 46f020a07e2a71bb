//! Local cache eviction.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use omni_events::{CleanedData, ImageEvent};
use tokio::fs;
use tracing::{error, info, warn};

use crate::layout;
use crate::notify::{payload, Notifier};
use crate::store::{Image, ImageStore};

use super::WorkerError;

/// Removes an image's local folder; hard-deletes the record when it was
/// soft-deleted. Best-effort: I/O errors are logged, not fatal.
pub struct ImageCleaner {
    store: ImageStore,
    image: Image,
    local_folder: PathBuf,
    notifier: Arc<dyn Notifier>,
}

impl ImageCleaner {
    pub fn new(
        store: ImageStore,
        image: Image,
        data_folder: &Path,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let local_folder = layout::local_image_folder(data_folder, &image);
        Self {
            store,
            image,
            local_folder,
            notifier,
        }
    }

    pub async fn do_work(self) -> Result<(), WorkerError> {
        if let Err(e) = fs::remove_dir_all(&self.local_folder).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(
                    error = %e,
                    folder = %self.local_folder.display(),
                    "failed to clean up image folder"
                );
            }
        } else {
            info!(folder = %self.local_folder.display(), "image folder removed");
        }

        self.notifier.notify(
            ImageEvent::Cleaned,
            &self.image.external_component,
            &self.image.external_id,
            payload(&CleanedData::default()),
        );

        if self.image.deleted {
            if let Err(e) = self.store.delete_image_by_id(self.image.id) {
                error!(
                    error = %e,
                    image_id = self.image.id,
                    "failed to hard delete image record"
                );
            }
        }
        Ok(())
    }
}
