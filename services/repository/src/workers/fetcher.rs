//! Periodic sweep of the store into typed work items.

use async_channel::Sender;
use tracing::info;

use crate::store::{Image, ImageStore, StoreError};

use super::{ImageWork, WorkKind};

/// Maximum items fetched per status family per sweep.
pub const FETCH_BATCH: usize = 20;

/// Discovers pending transitions by polling the store.
///
/// The first sweep of a process additionally re-enqueues images left
/// `Downloading` or `Pushing` by a previous incarnation; block files and
/// uploaded parts are content-addressed, so resumed work is idempotent.
pub struct WorkFetcher {
    store: ImageStore,
    work_tx: Sender<ImageWork>,
    resumed: bool,
}

impl WorkFetcher {
    pub fn new(store: ImageStore, work_tx: Sender<ImageWork>) -> Self {
        Self {
            store,
            work_tx,
            resumed: false,
        }
    }

    /// One sweep: recovery items first (once per process), then up to
    /// [`FETCH_BATCH`] of each pending transition.
    pub async fn fetch(&mut self) -> Result<(), StoreError> {
        if !self.resumed {
            self.resumed = true;

            let downloading = self.store.get_downloading_images()?;
            if !downloading.is_empty() {
                info!(
                    count = downloading.len(),
                    "recovering unfinished downloads from previous run"
                );
                self.enqueue(downloading, WorkKind::Pull).await;
            }

            let pushing = self.store.get_pushing_images()?;
            if !pushing.is_empty() {
                info!(
                    count = pushing.len(),
                    "recovering unfinished pushes from previous run"
                );
                self.enqueue(pushing, WorkKind::Push).await;
            }
        }

        let pending = self.store.get_image_for_download(FETCH_BATCH)?;
        if !pending.is_empty() {
            info!(count = pending.len(), "found images for download");
            self.enqueue(pending, WorkKind::Pull).await;
        }

        let pending = self.store.get_image_for_verify(FETCH_BATCH)?;
        if !pending.is_empty() {
            info!(count = pending.len(), "found images for verify");
            self.enqueue(pending, WorkKind::Sign).await;
        }

        let pending = self.store.get_image_for_push(FETCH_BATCH)?;
        if !pending.is_empty() {
            info!(count = pending.len(), "found images for push");
            self.enqueue(pending, WorkKind::Push).await;
        }

        let pending = self.store.get_image_for_clean(FETCH_BATCH)?;
        if !pending.is_empty() {
            info!(count = pending.len(), "found images for clean");
            self.enqueue(pending, WorkKind::Clean).await;
        }

        Ok(())
    }

    async fn enqueue(&self, images: Vec<Image>, kind: WorkKind) {
        for image in images {
            if self.work_tx.send(ImageWork { image, kind }).await.is_err() {
                return;
            }
        }
    }
}
