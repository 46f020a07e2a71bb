//! Worker pool and dispatch loop.

use std::path::PathBuf;
use std::sync::Arc;

use async_channel::{Receiver, Sender};
use omni_events::{FailedData, ImageEvent};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::config::{PullerSettings, WorkManagerSettings};
use crate::notify::{payload, Notifier};
use crate::store::{ImageStatus, ImageStore};

use super::{
    ImageCleaner, ImagePuller, ImagePusher, ImageVerifier, ImageWork, PushTarget, WorkFetcher,
    WorkKind,
};

/// Fixed worker pool consuming the global work queue.
///
/// The fetcher tick and every worker loop observe the same shutdown
/// channel; signaling it drains both cleanly. Status gating in the
/// fetcher queries keeps two workers of the same kind off one image.
pub struct WorkManager {
    settings: WorkManagerSettings,
    puller: PullerSettings,
    store: ImageStore,
    notifier: Arc<dyn Notifier>,
    push_target: Option<PushTarget>,
    data_folder: PathBuf,
    work_tx: Sender<ImageWork>,
    work_rx: Receiver<ImageWork>,
}

impl WorkManager {
    pub fn new(
        settings: WorkManagerSettings,
        puller: PullerSettings,
        store: ImageStore,
        notifier: Arc<dyn Notifier>,
        push_target: Option<PushTarget>,
        data_folder: PathBuf,
    ) -> Arc<Self> {
        let (work_tx, work_rx) = async_channel::bounded(settings.threads.max(1) * 4);
        Arc::new(Self {
            settings,
            puller,
            store,
            notifier,
            push_target,
            data_folder,
            work_tx,
            work_rx,
        })
    }

    /// Run the fetch loop and worker pool until shutdown is signaled.
    ///
    /// The first fetch happens immediately so in-flight work from a
    /// previous run resumes without waiting a full interval.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        info!(
            threads = self.settings.threads,
            sync_interval_secs = self.settings.sync_interval.as_secs(),
            "starting work manager"
        );

        let mut workers = JoinSet::new();
        for worker_id in 0..self.settings.threads.max(1) {
            let manager = self.clone();
            let shutdown = shutdown.clone();
            workers.spawn(async move {
                manager.worker_loop(worker_id, shutdown).await;
            });
        }

        let mut fetcher = WorkFetcher::new(self.store.clone(), self.work_tx.clone());
        let mut interval = tokio::time::interval(self.settings.sync_interval);
        let mut shutdown_rx = shutdown;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    debug!("fetching available work from the store");
                    if let Err(e) = fetcher.fetch().await {
                        error!(error = %e, "failed to fetch work from the store");
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("work manager shutting down");
                        break;
                    }
                }
            }
        }

        // wake any worker parked on an empty queue
        self.work_tx.close();
        while workers.join_next().await.is_some() {}
        info!("work manager stopped");
    }

    async fn worker_loop(&self, worker_id: usize, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                work = self.work_rx.recv() => {
                    match work {
                        Ok(work) => self.perform(work).await,
                        Err(_) => {
                            debug!(worker_id, "work queue closed, worker exiting");
                            return;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!(worker_id, "worker shutting down");
                        return;
                    }
                }
            }
        }
    }

    /// Construct the matching worker and drive it to a terminal state.
    async fn perform(&self, work: ImageWork) {
        let image_id = work.image.id;
        let kind = work.kind;
        info!(image_id, kind = %kind, "performing image work");

        let result = match kind {
            WorkKind::Pull => match ImagePuller::new(
                self.puller.clone(),
                self.store.clone(),
                work.image,
                &self.data_folder,
                self.notifier.clone(),
            ) {
                Ok(puller) => puller.do_work().await,
                Err(e) => Err(e),
            },
            WorkKind::Sign => {
                ImageVerifier::new(
                    self.store.clone(),
                    work.image,
                    &self.data_folder,
                    self.notifier.clone(),
                )
                .do_work()
                .await
            }
            WorkKind::Push => match &self.push_target {
                Some(target) => {
                    ImagePusher::new(
                        target.clone(),
                        self.store.clone(),
                        work.image,
                        &self.data_folder,
                        self.notifier.clone(),
                    )
                    .do_work()
                    .await
                }
                None => {
                    let detail = "object storage is not configured";
                    error!(image_id, "publish requested but object storage is not configured");
                    let _ = self.store.update_image_status_and_detail(
                        image_id,
                        ImageStatus::Failed,
                        detail,
                    );
                    self.notifier.notify(
                        ImageEvent::Failed,
                        &work.image.external_component,
                        &work.image.external_id,
                        payload(&FailedData {
                            detail: detail.to_string(),
                        }),
                    );
                    Ok(())
                }
            },
            WorkKind::Clean => {
                ImageCleaner::new(
                    self.store.clone(),
                    work.image,
                    &self.data_folder,
                    self.notifier.clone(),
                )
                .do_work()
                .await
            }
        };

        if let Err(e) = result {
            error!(error = %e, image_id, kind = %kind, "image work failed");
        }
    }
}
