//! End-to-end work dispatch: the manager's tick loop discovers pending
//! records and walks them through the state machine.

mod support;

use std::sync::Arc;
use std::time::{Duration, Instant};

use omni_events::ImageEvent;
use tempfile::TempDir;
use tokio::sync::watch;

use omni_repository::config::{PullerSettings, WorkManagerSettings};
use omni_repository::notify::RecordingNotifier;
use omni_repository::service::{ImageService, NewImage};
use omni_repository::store::{ImageStatus, ImageStore};
use omni_repository::workers::WorkManager;

fn manager_settings() -> WorkManagerSettings {
    WorkManagerSettings {
        threads: 2,
        sync_interval: Duration::from_millis(100),
    }
}

fn puller_settings() -> PullerSettings {
    PullerSettings {
        max_retry: 3,
        max_concurrency: 2,
        block_size: 100_000,
        tick_interval: Duration::from_millis(50),
    }
}

async fn wait_for_status(store: &ImageStore, id: i64, wanted: ImageStatus) {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let image = store.get_image_by_id(id).unwrap();
        if image.status == wanted {
            return;
        }
        assert!(
            image.status != ImageStatus::Failed,
            "image failed: {}",
            image.status_detail
        );
        assert!(
            Instant::now() < deadline,
            "timed out waiting for {wanted}, stuck at {}",
            image.status
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pulled_image_walks_to_verified() {
    let data = TempDir::new().unwrap();
    let body = support::test_body(150_000);
    let checksum = support::sha256_hex(&body);
    let (_server, url) = support::spawn_range_server(body.clone()).await;

    let store = ImageStore::open_in_memory().unwrap();
    let notifier = Arc::new(RecordingNotifier::new());

    let service = ImageService::new(
        store.clone(),
        notifier.clone(),
        data.path().to_path_buf(),
    );
    let image = service
        .create_image_pending_download(NewImage {
            name: "openEuler-x86_64".to_string(),
            description: String::new(),
            checksum: checksum.clone(),
            algorithm: "sha256".to_string(),
            external_id: "E1".to_string(),
            external_component: "omni-manager".to_string(),
            source_url: Some(url),
            file_name: "a.iso".to_string(),
            user_id: 7,
            publish: false,
        })
        .unwrap();
    assert_eq!(image.status, ImageStatus::Created);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let manager = WorkManager::new(
        manager_settings(),
        puller_settings(),
        store.clone(),
        notifier.clone(),
        None,
        data.path().to_path_buf(),
    );
    let handle = tokio::spawn(manager.run(shutdown_rx));

    wait_for_status(&store, image.id, ImageStatus::Verified).await;

    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;

    // Created -> Downloading -> Downloaded -> Verifying -> Verified
    assert_eq!(tokio::fs::read(data.path().join(&image.image_path)).await.unwrap(), body);
    assert!(data.path().join(&image.checksum_path).exists());
    assert_eq!(notifier.events_of(ImageEvent::Created).len(), 1);
    assert_eq!(notifier.events_of(ImageEvent::Downloaded).len(), 2);
    assert_eq!(notifier.events_of(ImageEvent::Verified).len(), 1);
    assert!(notifier.events_of(ImageEvent::Failed).is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn uploaded_image_is_verified_without_download() {
    let data = TempDir::new().unwrap();
    let body = support::test_body(40_000);
    let checksum = support::sha256_hex(&body);

    let store = ImageStore::open_in_memory().unwrap();
    let notifier = Arc::new(RecordingNotifier::new());

    let service = ImageService::new(
        store.clone(),
        notifier.clone(),
        data.path().to_path_buf(),
    );
    let image = service
        .create_image(NewImage {
            name: "toolchain".to_string(),
            description: String::new(),
            checksum: checksum.clone(),
            algorithm: "sha256".to_string(),
            external_id: "E2".to_string(),
            external_component: "omni-manager".to_string(),
            source_url: None,
            file_name: "tc.tar".to_string(),
            user_id: 7,
            publish: false,
        })
        .unwrap();
    assert_eq!(image.status, ImageStatus::Downloaded);

    // the façade writes the uploaded bytes before workers see the record
    let destination = data.path().join(&image.image_path);
    tokio::fs::create_dir_all(destination.parent().unwrap())
        .await
        .unwrap();
    tokio::fs::write(&destination, &body).await.unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let manager = WorkManager::new(
        manager_settings(),
        puller_settings(),
        store.clone(),
        notifier.clone(),
        None,
        data.path().to_path_buf(),
    );
    let handle = tokio::spawn(manager.run(shutdown_rx));

    wait_for_status(&store, image.id, ImageStatus::Verified).await;

    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;

    assert!(notifier.events_of(ImageEvent::Downloaded).is_empty());
    assert_eq!(notifier.events_of(ImageEvent::Verified).len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn publish_without_object_storage_fails_the_image() {
    let data = TempDir::new().unwrap();
    let body = support::test_body(10_000);
    let checksum = support::sha256_hex(&body);

    let store = ImageStore::open_in_memory().unwrap();
    let notifier = Arc::new(RecordingNotifier::new());

    let mut image = support::seed_pending_image(&store, &checksum, "https://unused.example", "E3");
    image.publish = true;
    image.status = ImageStatus::Verified;
    store.update_image(&mut image).unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let manager = WorkManager::new(
        manager_settings(),
        puller_settings(),
        store.clone(),
        notifier.clone(),
        None,
        data.path().to_path_buf(),
    );
    let handle = tokio::spawn(manager.run(shutdown_rx));

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let current = store.get_image_by_id(image.id).unwrap();
        if current.status == ImageStatus::Failed {
            assert_eq!(current.status_detail, "object storage is not configured");
            break;
        }
        assert!(Instant::now() < deadline, "image never failed");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;

    assert_eq!(notifier.events_of(ImageEvent::Failed).len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn interrupted_download_resumes_on_startup() {
    let data = TempDir::new().unwrap();
    let body = support::test_body(250_000);
    let checksum = support::sha256_hex(&body);
    let (server, url) = support::spawn_range_server(body.clone()).await;

    let store = ImageStore::open_in_memory().unwrap();
    let notifier = Arc::new(RecordingNotifier::new());

    // a previous process died mid-download with 2 of 3 parts on disk
    let mut image = support::seed_pending_image(&store, &checksum, &url, "E4");
    image.status = ImageStatus::Downloading;
    store.update_image(&mut image).unwrap();

    let temp = data.path().join(format!("7/{checksum}/.temp"));
    tokio::fs::create_dir_all(&temp).await.unwrap();
    tokio::fs::write(temp.join("000001-0-99999"), &body[..100_000])
        .await
        .unwrap();
    tokio::fs::write(temp.join("000002-100000-199999"), &body[100_000..200_000])
        .await
        .unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let manager = WorkManager::new(
        manager_settings(),
        puller_settings(),
        store.clone(),
        notifier.clone(),
        None,
        data.path().to_path_buf(),
    );
    let handle = tokio::spawn(manager.run(shutdown_rx));

    wait_for_status(&store, image.id, ImageStatus::Verified).await;

    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;

    // only the missing block was fetched
    assert_eq!(server.range_requests(), 1);
    assert_eq!(
        tokio::fs::read(data.path().join(&image.image_path))
            .await
            .unwrap(),
        body
    );
}
