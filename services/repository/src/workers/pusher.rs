//! Multipart upload of verified images to object storage.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use omni_events::{FailedData, ImageEvent, PushedData};
use tokio::fs;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::notify::{payload, Notifier};
use crate::objstore::{CompletedUploadPart, ObjectStore, ObjectStoreError};
use crate::store::{Image, ImageStatus, ImageStore};

use super::WorkerError;

/// Destination for published images.
#[derive(Clone)]
pub struct PushTarget {
    pub object_store: Arc<dyn ObjectStore>,
    /// Multipart part size in bytes.
    pub part_size: u64,
}

/// Publishes the image and its sidecar to the object store and rewrites
/// the record's paths to their external URLs.
pub struct ImagePusher {
    store: ImageStore,
    image: Image,
    data_folder: PathBuf,
    target: PushTarget,
    notifier: Arc<dyn Notifier>,
}

impl ImagePusher {
    pub fn new(
        target: PushTarget,
        store: ImageStore,
        image: Image,
        data_folder: &Path,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            image,
            data_folder: data_folder.to_path_buf(),
            target,
            notifier,
        }
    }

    pub async fn do_work(self) -> Result<(), WorkerError> {
        self.store
            .update_image_status(self.image.id, ImageStatus::Pushing)?;

        match self.push().await {
            Ok((image_url, checksum_url)) => {
                self.store
                    .update_image_status(self.image.id, ImageStatus::Pushed)?;
                self.store
                    .update_image_external_path(self.image.id, &image_url, &checksum_url)?;
                self.notifier.notify(
                    ImageEvent::Pushed,
                    &self.image.external_component,
                    &self.image.external_id,
                    payload(&PushedData {
                        image_path: image_url.clone(),
                        checksum_path: checksum_url,
                    }),
                );
                info!(image_url = %image_url, "image successfully pushed");
                Ok(())
            }
            Err(e) => {
                self.cleanup(&e);
                Err(e)
            }
        }
    }

    /// Upload sidecar then image. Returns their external URLs.
    async fn push(&self) -> Result<(String, String), WorkerError> {
        let folder_key = format!("{}/{}/", self.image.user_id, self.image.checksum);
        if !self.target.object_store.object_exists(&folder_key).await? {
            // directory marker
            self.target.object_store.put_empty_object(&folder_key).await?;
        }

        let checksum_url = self
            .upload_file(&folder_key, &self.data_folder.join(&self.image.checksum_path))
            .await?;
        let image_url = self
            .upload_file(&folder_key, &self.data_folder.join(&self.image.image_path))
            .await?;
        Ok((image_url, checksum_url))
    }

    async fn upload_file(&self, folder_key: &str, source: &Path) -> Result<String, WorkerError> {
        let basename = source
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| WorkerError::InvalidPath(source.display().to_string()))?;
        let key = format!("{folder_key}{basename}");

        let object_store = &self.target.object_store;
        if object_store.object_exists(&key).await? {
            // re-push replaces the previous object wholesale
            object_store.delete_object(&key).await?;
        }

        let size = fs::metadata(source).await?.len();
        let part_size = self.target.part_size.max(1);
        let part_count = size.div_ceil(part_size).max(1);
        let upload_id = object_store.create_multipart_upload(&key).await?;
        debug!(
            key = %key,
            upload_id = %upload_id,
            parts = part_count,
            size = size,
            "starting multipart upload"
        );

        let mut tasks = JoinSet::new();
        for index in 0..part_count {
            let part_number = (index + 1) as i32;
            let offset = index * part_size;
            let length = part_size.min(size - offset);
            let object_store = object_store.clone();
            let key = key.clone();
            let upload_id = upload_id.clone();
            let source = source.to_path_buf();
            tasks.spawn(async move {
                object_store
                    .upload_part(&key, &upload_id, part_number, &source, offset, length)
                    .await
                    .map(|etag| CompletedUploadPart { part_number, etag })
            });
        }

        let mut parts: Vec<CompletedUploadPart> = Vec::with_capacity(part_count as usize);
        let mut failure: Option<ObjectStoreError> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(part)) => parts.push(part),
                Ok(Err(e)) => {
                    if failure.is_none() {
                        failure = Some(e);
                    }
                    tasks.abort_all();
                }
                // aborted sibling task
                Err(_) => {}
            }
        }

        if let Some(e) = failure {
            if let Err(abort_err) = object_store.abort_multipart_upload(&key, &upload_id).await {
                warn!(error = %abort_err, key = %key, "failed to abort multipart upload");
            }
            return Err(e.into());
        }

        // parts complete in arrival order; the store requires part-number order
        parts.sort_by_key(|p| p.part_number);
        object_store
            .complete_multipart_upload(&key, &upload_id, parts)
            .await?;

        Ok(object_store.external_url(&key))
    }

    fn cleanup(&self, err: &WorkerError) {
        let detail = err.to_string();
        if let Err(e) =
            self.store
                .update_image_status_and_detail(self.image.id, ImageStatus::Failed, &detail)
        {
            error!(error = %e, image_id = self.image.id, "failed to mark image as failed");
        }
        self.notifier.notify(
            ImageEvent::Failed,
            &self.image.external_component,
            &self.image.external_id,
            payload(&FailedData { detail }),
        );
    }
}
