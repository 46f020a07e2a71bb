//! Parallel ranged-download worker.
//!
//! The puller splits a remote image into fixed-size byte ranges, fetches
//! them concurrently into per-block temp files, and concatenates the
//! parts once every block is accounted for. Blocks are content-addressed
//! by `(index, start, end)`, so an interrupted download resumes by
//! skipping parts that already exist with the right size.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_channel::{Receiver, Sender};
use futures_util::StreamExt;
use omni_events::{DownloadedData, FailedData, ImageEvent};
use reqwest::header::{CONTENT_LENGTH, RANGE, USER_AGENT};
use reqwest::StatusCode;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::PullerSettings;
use crate::layout;
use crate::notify::{payload, Notifier};
use crate::store::{Image, ImageStatus, ImageStore};

use super::WorkerError;

/// Folder under the image folder holding in-flight part files.
const TEMP_FOLDER: &str = ".temp";

/// Capacity of the per-image block queue.
const BLOCK_QUEUE_CAPACITY: usize = 100;

/// Sentinel added to the outstanding-block counter so block workers
/// cannot observe zero before preparation has added the real count.
const UNREACHABLE_BLOCKS: i64 = 100;

/// Download timeout per HTTP request.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(1200);

/// One byte range of the image; `end` is inclusive.
#[derive(Debug, Clone)]
struct Block {
    /// 1-based block index.
    index: usize,
    start: u64,
    end: u64,
    retry_count: u32,
}

impl Block {
    fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Zero-padded index prefix keeps lexicographic order equal to
    /// numeric order at reassembly time.
    fn part_file_name(&self) -> String {
        format!("{:06}-{}-{}", self.index, self.start, self.end)
    }
}

/// Split `[0, size)` into blocks of at most `block_size` bytes.
fn split_blocks(size: u64, block_size: u64) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut start = 0u64;
    let mut index = 1usize;
    while start < size {
        let end = (start + block_size).min(size) - 1;
        blocks.push(Block {
            index,
            start,
            end,
            retry_count: 1,
        });
        start += block_size;
        index += 1;
    }
    blocks
}

/// Downloads one pending image in parallel byte-range blocks.
pub struct ImagePuller {
    store: ImageStore,
    image: Image,
    local_folder: PathBuf,
    client: reqwest::Client,
    settings: PullerSettings,
    notifier: Arc<dyn Notifier>,
}

impl ImagePuller {
    pub fn new(
        settings: PullerSettings,
        store: ImageStore,
        image: Image,
        data_folder: &Path,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, WorkerError> {
        let client = reqwest::Client::builder().timeout(CLIENT_TIMEOUT).build()?;
        let local_folder = layout::local_image_folder(data_folder, &image);
        Ok(Self {
            store,
            image,
            local_folder,
            client,
            settings,
            notifier,
        })
    }

    pub async fn do_work(self) -> Result<(), WorkerError> {
        Arc::new(self).run().await
    }

    async fn run(self: Arc<Self>) -> Result<(), WorkerError> {
        let temp_folder = self.local_folder.join(TEMP_FOLDER);
        fs::create_dir_all(&temp_folder).await?;

        self.store
            .update_image_status(self.image.id, ImageStatus::Downloading)?;

        let (block_tx, block_rx) = async_channel::bounded::<Block>(BLOCK_QUEUE_CAPACITY);
        let outstanding = Arc::new(AtomicI64::new(UNREACHABLE_BLOCKS));
        let failed_blocks = Arc::new(AtomicU64::new(0));
        let image_size = Arc::new(AtomicU64::new(0));

        let mut workers = JoinSet::new();
        for _ in 0..self.settings.max_concurrency.max(1) {
            let puller = self.clone();
            let rx = block_rx.clone();
            let tx = block_tx.clone();
            let outstanding = outstanding.clone();
            let failed_blocks = failed_blocks.clone();
            let image_size = image_size.clone();
            workers.spawn(async move {
                puller
                    .block_worker(rx, tx, outstanding, failed_blocks, image_size)
                    .await;
            });
        }

        let total_blocks = match self.prepare(&block_tx, &image_size).await {
            Ok(total) => total,
            Err(e) => {
                block_tx.close();
                while workers.join_next().await.is_some() {}
                self.cleanup(&temp_folder, &e).await;
                return Err(e);
            }
        };

        info!(
            source_url = self.image.source_url.as_deref().unwrap_or_default(),
            blocks = total_blocks,
            "image will be downloaded in parallel blocks"
        );
        outstanding.fetch_add(total_blocks as i64, Ordering::SeqCst);
        outstanding.fetch_sub(UNREACHABLE_BLOCKS, Ordering::SeqCst);

        while workers.join_next().await.is_some() {}

        let failed = failed_blocks.load(Ordering::SeqCst);
        if failed > 0 {
            let e = WorkerError::BlocksFailed {
                failed,
                total: total_blocks,
            };
            self.cleanup(&temp_folder, &e).await;
            return Err(e);
        }

        let parts = match self.list_parts(&temp_folder).await {
            Ok(parts) => parts,
            Err(e) => {
                self.cleanup(&temp_folder, &e).await;
                return Err(e);
            }
        };
        if parts.len() != total_blocks {
            let e = WorkerError::PartsMissing {
                expected: total_blocks,
                found: parts.len(),
            };
            self.cleanup(&temp_folder, &e).await;
            return Err(e);
        }

        if let Err(e) = self.assemble(parts).await {
            self.cleanup(&temp_folder, &e).await;
            return Err(e);
        }

        info!(file_name = %self.image.file_name, "image successfully created");
        if let Err(e) = self.store.update_image_status_and_detail(
            self.image.id,
            ImageStatus::Downloaded,
            "image successfully downloaded",
        ) {
            let e = WorkerError::from(e);
            self.cleanup(&temp_folder, &e).await;
            return Err(e);
        }

        let _ = fs::remove_dir_all(&temp_folder).await;
        Ok(())
    }

    /// Probe the source and enqueue one block per byte range.
    /// Returns the number of blocks.
    async fn prepare(
        &self,
        block_tx: &Sender<Block>,
        image_size: &AtomicU64,
    ) -> Result<usize, WorkerError> {
        let source_url = self
            .image
            .source_url
            .clone()
            .ok_or_else(|| WorkerError::InvalidSource("source url is empty".to_string()))?;

        let url = reqwest::Url::parse(&source_url)
            .map_err(|e| WorkerError::InvalidSource(format!("{source_url}: {e}")))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(WorkerError::InvalidSource(format!(
                "source url scheme not supported: {}",
                url.scheme()
            )));
        }

        let response = self
            .client
            .head(url)
            .header(USER_AGENT, "curl")
            .send()
            .await?;
        if response.status() != StatusCode::OK {
            return Err(WorkerError::UnexpectedStatus {
                status: response.status().as_u16(),
                url: source_url,
            });
        }

        let size: u64 = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| WorkerError::MissingContentLength(source_url.clone()))?;
        if size == 0 {
            return Err(WorkerError::EmptySource(source_url));
        }
        image_size.store(size, Ordering::SeqCst);

        let blocks = split_blocks(size, self.settings.block_size);
        let total = blocks.len();
        for block in blocks {
            block_tx
                .send(block)
                .await
                .map_err(|_| WorkerError::QueueClosed)?;
        }
        Ok(total)
    }

    async fn block_worker(
        &self,
        rx: Receiver<Block>,
        tx: Sender<Block>,
        outstanding: Arc<AtomicI64>,
        failed_blocks: Arc<AtomicU64>,
        image_size: Arc<AtomicU64>,
    ) {
        let mut ticker = tokio::time::interval(self.settings.tick_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    // all blocks accounted for, success or permanent failure
                    if outstanding.load(Ordering::SeqCst) == 0 {
                        debug!("image puller block worker finished");
                        return;
                    }
                }
                block = rx.recv() => {
                    let Ok(mut block) = block else {
                        debug!("block queue closed, puller block worker exiting");
                        return;
                    };
                    debug!(
                        index = block.index,
                        start = block.start,
                        end = block.end,
                        file_name = %self.image.file_name,
                        "starting block download"
                    );
                    match self.fetch_single_block(&block).await {
                        Ok(()) => {
                            self.notifier.notify(
                                ImageEvent::Downloaded,
                                &self.image.external_component,
                                &self.image.external_id,
                                payload(&DownloadedData {
                                    block_size: block.len(),
                                    image_size: image_size.load(Ordering::SeqCst),
                                }),
                            );
                            outstanding.fetch_sub(1, Ordering::SeqCst);
                        }
                        Err(e) => {
                            warn!(
                                error = %e,
                                index = block.index,
                                retry = block.retry_count,
                                file_name = %self.image.file_name,
                                "failed to download block"
                            );
                            if block.retry_count <= self.settings.max_retry {
                                block.retry_count += 1;
                                if tx.send(block).await.is_err() {
                                    return;
                                }
                            } else {
                                error!(
                                    index = block.index,
                                    file_name = %self.image.file_name,
                                    "block reached max retries, giving up"
                                );
                                failed_blocks.fetch_add(1, Ordering::SeqCst);
                                outstanding.fetch_sub(1, Ordering::SeqCst);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Fetch one byte range into its part file. A part that already
    /// exists with exactly the expected size is skipped.
    async fn fetch_single_block(&self, block: &Block) -> Result<(), WorkerError> {
        let part_path = self
            .local_folder
            .join(TEMP_FOLDER)
            .join(block.part_file_name());

        if let Ok(meta) = fs::metadata(&part_path).await {
            if meta.len() == block.len() {
                debug!(
                    index = block.index,
                    file_name = %self.image.file_name,
                    "block already exists, skip downloading"
                );
                return Ok(());
            }
            // interrupted write from a previous attempt
            let _ = fs::remove_file(&part_path).await;
        }

        let source_url = self.image.source_url.as_deref().unwrap_or_default();
        let response = self
            .client
            .get(source_url)
            .header(USER_AGENT, "curl")
            .header(RANGE, format!("bytes={}-{}", block.start, block.end))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(WorkerError::UnexpectedStatus {
                status: response.status().as_u16(),
                url: source_url.to_string(),
            });
        }

        let mut file = fs::File::create(&part_path).await?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        drop(file);

        let actual = fs::metadata(&part_path).await?.len();
        if actual != block.len() {
            let _ = fs::remove_file(&part_path).await;
            return Err(WorkerError::BlockSizeMismatch {
                expected: block.len(),
                actual,
            });
        }
        Ok(())
    }

    async fn list_parts(&self, temp_folder: &Path) -> Result<Vec<PathBuf>, WorkerError> {
        let mut parts = Vec::new();
        let mut entries = fs::read_dir(temp_folder).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                parts.push(entry.path());
            }
        }
        parts.sort();
        Ok(parts)
    }

    /// Concatenate the sorted parts into the final image file.
    async fn assemble(&self, parts: Vec<PathBuf>) -> Result<(), WorkerError> {
        let image_path = self.local_folder.join(&self.image.file_name);
        let mut out = fs::File::create(&image_path).await?;
        for part in parts {
            let mut file = fs::File::open(&part).await?;
            let written = tokio::io::copy(&mut file, &mut out).await?;
            debug!(
                bytes = written,
                part = %part.display(),
                image = %image_path.display(),
                "appended part to image file"
            );
        }
        out.flush().await?;
        Ok(())
    }

    async fn cleanup(&self, temp_folder: &Path, err: &WorkerError) {
        let _ = fs::remove_dir_all(temp_folder).await;
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
