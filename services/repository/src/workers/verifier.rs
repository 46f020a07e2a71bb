//! Streaming checksum verification.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use md5::Md5;
use omni_events::{FailedData, ImageEvent, VerifiedData};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncReadExt;
use tracing::{error, info};

use crate::notify::{payload, Notifier};
use crate::store::{ChecksumAlgorithm, Image, ImageStatus, ImageStore};

use super::WorkerError;

/// Read buffer for streaming the image through the hasher.
const HASHING_BUFFER: usize = 10 * 1024 * 1024;

enum ImageHasher {
    Md5(Md5),
    Sha256(Sha256),
}

impl ImageHasher {
    fn new(algorithm: ChecksumAlgorithm) -> Self {
        match algorithm {
            ChecksumAlgorithm::Md5 => Self::Md5(Md5::new()),
            ChecksumAlgorithm::Sha256 => Self::Sha256(Sha256::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Self::Md5(h) => h.update(data),
            Self::Sha256(h) => h.update(data),
        }
    }

    fn finalize_hex(self) -> String {
        match self {
            Self::Md5(h) => hex::encode(h.finalize()),
            Self::Sha256(h) => hex::encode(h.finalize()),
        }
    }
}

/// Checks a downloaded image against its expected digest and writes the
/// checksum sidecar. Never mutates the image file.
pub struct ImageVerifier {
    store: ImageStore,
    image: Image,
    data_folder: PathBuf,
    notifier: Arc<dyn Notifier>,
}

impl ImageVerifier {
    pub fn new(
        store: ImageStore,
        image: Image,
        data_folder: &Path,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            image,
            data_folder: data_folder.to_path_buf(),
            notifier,
        }
    }

    pub async fn do_work(self) -> Result<(), WorkerError> {
        self.store
            .update_image_status(self.image.id, ImageStatus::Verifying)?;

        match self.verify().await {
            Ok(checksum) => {
                self.store.update_image_status_and_detail(
                    self.image.id,
                    ImageStatus::Verified,
                    "checksum are verified",
                )?;
                self.notifier.notify(
                    ImageEvent::Verified,
                    &self.image.external_component,
                    &self.image.external_id,
                    payload(&VerifiedData { checksum }),
                );
                info!(file_name = %self.image.file_name, "image successfully verified");
                Ok(())
            }
            Err(e) => {
                self.cleanup(&e);
                Err(e)
            }
        }
    }

    /// Hash the image file and compare against the expected checksum.
    /// Returns the computed digest.
    async fn verify(&self) -> Result<String, WorkerError> {
        let image_path = self.data_folder.join(&self.image.image_path);
        let mut file = fs::File::open(&image_path).await?;

        let mut hasher = ImageHasher::new(self.image.algorithm);
        let mut buf = vec![0u8; HASHING_BUFFER];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }

        let digest = hasher.finalize_hex();
        if digest != self.image.checksum.to_lowercase() {
            return Err(WorkerError::ChecksumMismatch {
                expected: self.image.checksum.clone(),
                actual: digest,
            });
        }

        self.write_sidecar(&digest).await?;
        Ok(digest)
    }

    /// Sidecar format: `"<digest> <name>"`, overwriting any existing file.
    async fn write_sidecar(&self, digest: &str) -> Result<(), WorkerError> {
        let sidecar_path = self.data_folder.join(&self.image.checksum_path);
        fs::write(&sidecar_path, format!("{digest} {}", self.image.name)).await?;
        Ok(())
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
