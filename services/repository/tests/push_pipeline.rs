//! Integration tests for the pusher against an in-memory object store.

mod support;

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use omni_events::ImageEvent;
use tempfile::TempDir;

use omni_repository::notify::RecordingNotifier;
use omni_repository::objstore::{CompletedUploadPart, ObjectStore, ObjectStoreError};
use omni_repository::store::{ChecksumAlgorithm, Image, ImageStatus, ImageStore};
use omni_repository::workers::{ImagePusher, PushTarget};

#[derive(Default)]
struct PendingUpload {
    key: String,
    parts: HashMap<i32, Vec<u8>>,
}

/// Object store double backed by hash maps.
struct MemoryObjectStore {
    bucket: String,
    endpoint: String,
    objects: Mutex<HashMap<String, Vec<u8>>>,
    uploads: Mutex<HashMap<String, PendingUpload>>,
    next_upload_id: AtomicU64,
    /// Part number whose first upload attempt fails.
    fail_part: Mutex<Option<i32>>,
}

impl MemoryObjectStore {
    fn new() -> Self {
        Self {
            bucket: "omni-images".to_string(),
            endpoint: "obs.example.com".to_string(),
            objects: Mutex::new(HashMap::new()),
            uploads: Mutex::new(HashMap::new()),
            next_upload_id: AtomicU64::new(1),
            fail_part: Mutex::new(None),
        }
    }

    fn fail_part_once(&self, part_number: i32) {
        *self.fail_part.lock().unwrap() = Some(part_number);
    }

    fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    fn pending_upload_count(&self) -> usize {
        self.uploads.lock().unwrap().len()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn object_exists(&self, key: &str) -> Result<bool, ObjectStoreError> {
        Ok(self.objects.lock().unwrap().contains_key(key))
    }

    async fn delete_object(&self, key: &str) -> Result<(), ObjectStoreError> {
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }

    async fn put_empty_object(&self, key: &str) -> Result<(), ObjectStoreError> {
        self.objects.lock().unwrap().insert(key.to_string(), Vec::new());
        Ok(())
    }

    async fn create_multipart_upload(&self, key: &str) -> Result<String, ObjectStoreError> {
        let upload_id = format!("upload-{}", self.next_upload_id.fetch_add(1, Ordering::SeqCst));
        self.uploads.lock().unwrap().insert(
            upload_id.clone(),
            PendingUpload {
                key: key.to_string(),
                parts: HashMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        _key: &str,
        upload_id: &str,
        part_number: i32,
        source: &Path,
        offset: u64,
        length: u64,
    ) -> Result<String, ObjectStoreError> {
        {
            let mut fail_part = self.fail_part.lock().unwrap();
            if *fail_part == Some(part_number) {
                fail_part.take();
                return Err(ObjectStoreError::Request(format!(
                    "injected failure for part {part_number}"
                )));
            }
        }

        let bytes = tokio::fs::read(source).await?;
        let part = bytes[offset as usize..(offset + length) as usize].to_vec();

        let mut uploads = self.uploads.lock().unwrap();
        let pending = uploads
            .get_mut(upload_id)
            .ok_or_else(|| ObjectStoreError::Request(format!("unknown upload {upload_id}")))?;
        pending.parts.insert(part_number, part);
        Ok(format!("etag-{part_number}"))
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedUploadPart>,
    ) -> Result<(), ObjectStoreError> {
        // the completion list must arrive ordered by part number
        assert!(parts.windows(2).all(|w| w[0].part_number < w[1].part_number));

        let pending = self
            .uploads
            .lock()
            .unwrap()
            .remove(upload_id)
            .ok_or_else(|| ObjectStoreError::Request(format!("unknown upload {upload_id}")))?;
        assert_eq!(pending.key, key);

        let mut body = Vec::new();
        for part in &parts {
            let bytes = pending.parts.get(&part.part_number).ok_or_else(|| {
                ObjectStoreError::Request(format!("part {} missing", part.part_number))
            })?;
            body.extend_from_slice(bytes);
        }
        self.objects.lock().unwrap().insert(key.to_string(), body);
        Ok(())
    }

    async fn abort_multipart_upload(
        &self,
        _key: &str,
        upload_id: &str,
    ) -> Result<(), ObjectStoreError> {
        self.uploads.lock().unwrap().remove(upload_id);
        Ok(())
    }

    fn external_url(&self, key: &str) -> String {
        format!("https://{}.{}/{}", self.bucket, self.endpoint, key)
    }
}

const PART_SIZE: u64 = 100_000;

struct PushFixture {
    data: TempDir,
    store: ImageStore,
    notifier: Arc<RecordingNotifier>,
    object_store: Arc<MemoryObjectStore>,
    image: Image,
    body: Vec<u8>,
}

/// A verified, publishable image with its files on disk.
async fn push_fixture(body_len: usize) -> PushFixture {
    let data = TempDir::new().unwrap();
    let body = support::test_body(body_len);
    let checksum = support::sha256_hex(&body);

    let store = ImageStore::open_in_memory().unwrap();
    let mut image = Image {
        id: 0,
        external_id: "E1".to_string(),
        external_component: "omni-manager".to_string(),
        user_id: 7,
        name: "openEuler-x86_64".to_string(),
        description: String::new(),
        file_name: "a.iso".to_string(),
        source_url: None,
        checksum: checksum.clone(),
        algorithm: ChecksumAlgorithm::Sha256,
        image_path: format!("7/{checksum}/a.iso"),
        checksum_path: format!("7/{checksum}/a.iso.sha256sum"),
        publish: true,
        status: ImageStatus::Verified,
        status_detail: String::new(),
        deleted: false,
        create_time: Utc::now(),
        update_time: Utc::now(),
    };
    store.add_image(&mut image).unwrap();

    let folder = data.path().join(format!("7/{checksum}"));
    tokio::fs::create_dir_all(&folder).await.unwrap();
    tokio::fs::write(folder.join("a.iso"), &body).await.unwrap();
    tokio::fs::write(
        folder.join("a.iso.sha256sum"),
        format!("{checksum} {}", image.name),
    )
    .await
    .unwrap();

    PushFixture {
        data,
        store,
        notifier: Arc::new(RecordingNotifier::new()),
        object_store: Arc::new(MemoryObjectStore::new()),
        image,
        body,
    }
}

fn pusher_for(fixture: &PushFixture) -> ImagePusher {
    ImagePusher::new(
        PushTarget {
            object_store: fixture.object_store.clone(),
            part_size: PART_SIZE,
        },
        fixture.store.clone(),
        fixture.image.clone(),
        fixture.data.path(),
        fixture.notifier.clone(),
    )
}

#[tokio::test]
async fn push_uploads_sidecar_and_image_and_rewrites_paths() {
    let fixture = push_fixture(250_000).await;
    let checksum = fixture.image.checksum.clone();

    pusher_for(&fixture).do_work().await.unwrap();

    let folder_key = format!("7/{checksum}/");
    let image_key = format!("{folder_key}a.iso");
    let sidecar_key = format!("{folder_key}a.iso.sha256sum");

    // directory marker plus both objects
    assert!(fixture.object_store.object(&folder_key).is_some());
    assert_eq!(fixture.object_store.object(&image_key).unwrap(), fixture.body);
    assert!(fixture.object_store.object(&sidecar_key).is_some());
    assert_eq!(fixture.object_store.pending_upload_count(), 0);

    let pushed = fixture.store.get_image_by_id(fixture.image.id).unwrap();
    assert_eq!(pushed.status, ImageStatus::Pushed);
    assert_eq!(
        pushed.image_path,
        format!("https://omni-images.obs.example.com/{image_key}")
    );
    assert_eq!(
        pushed.checksum_path,
        format!("https://omni-images.obs.example.com/{sidecar_key}")
    );

    let events = fixture.notifier.events_of(ImageEvent::Pushed);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].data["imagePath"], pushed.image_path.as_str());
    assert_eq!(events[0].data["checksumPath"], pushed.checksum_path.as_str());
}

#[tokio::test]
async fn repush_replaces_objects_with_identical_content() {
    let fixture = push_fixture(250_000).await;
    let checksum = fixture.image.checksum.clone();
    let image_key = format!("7/{checksum}/a.iso");

    pusher_for(&fixture).do_work().await.unwrap();
    let first = fixture.object_store.object(&image_key).unwrap();

    // crash-after-upload scenario: the record is pushed again wholesale
    pusher_for(&fixture).do_work().await.unwrap();
    let second = fixture.object_store.object(&image_key).unwrap();

    assert_eq!(first, second);
    assert_eq!(fixture.object_store.pending_upload_count(), 0);
    assert_eq!(
        fixture.store.get_image_by_id(fixture.image.id).unwrap().status,
        ImageStatus::Pushed
    );
}

#[tokio::test]
async fn part_failure_aborts_the_upload() {
    let fixture = push_fixture(250_000).await;
    let checksum = fixture.image.checksum.clone();

    // the sidecar uploads first as a single part; part 2 only exists for
    // the image upload
    fixture.object_store.fail_part_once(2);

    let result = pusher_for(&fixture).do_work().await;
    assert!(result.is_err());

    let image_key = format!("7/{checksum}/a.iso");
    assert!(fixture.object_store.object(&image_key).is_none());
    assert_eq!(fixture.object_store.pending_upload_count(), 0);

    let failed = fixture.store.get_image_by_id(fixture.image.id).unwrap();
    assert_eq!(failed.status, ImageStatus::Failed);
    assert!(!failed.status_detail.is_empty());
    assert_eq!(fixture.notifier.events_of(ImageEvent::Failed).len(), 1);
}

#[tokio::test]
async fn small_files_upload_as_a_single_part() {
    let fixture = push_fixture(1_000).await;
    let checksum = fixture.image.checksum.clone();

    pusher_for(&fixture).do_work().await.unwrap();

    let sidecar_key = format!("7/{checksum}/a.iso.sha256sum");
    let sidecar = fixture.object_store.object(&sidecar_key).unwrap();
    assert_eq!(
        String::from_utf8(sidecar).unwrap(),
        format!("{checksum} {}", fixture.image.name)
    );
}
