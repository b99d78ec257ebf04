//! Shared helpers for `easyshare-core` integration tests.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use easyshare_core::connection::ConnectionManager;
use easyshare_core::crypto;
use easyshare_core::device::{DeviceInfo, PairedDevice, Platform};
use easyshare_core::events::{Event, EventReceiver};
use easyshare_core::storage::{AppSettings, MemoryStorage, Storage};

/// Create a temporary directory for test files.
pub fn create_temp_dir() -> tempfile::TempDir {
    tempfile::tempdir().expect("failed to create temp directory")
}

/// Create a test file with the given content.
pub fn create_test_file(dir: &std::path::Path, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).expect("failed to write test file");
    path
}

/// Generate deterministic pseudo-random bytes for payloads.
pub fn patterned_bytes(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

/// Assert two files have identical content.
pub fn assert_files_equal(a: &std::path::Path, b: &std::path::Path) {
    let content_a = std::fs::read(a).expect("failed to read first file");
    let content_b = std::fs::read(b).expect("failed to read second file");
    assert_eq!(content_a, content_b, "file contents differ");
}

/// One side of a peer pair under test.
pub struct TestPeer {
    pub device: DeviceInfo,
    pub storage: Arc<MemoryStorage>,
    pub manager: ConnectionManager,
    pub events: EventReceiver,
    pub save_dir: tempfile::TempDir,
}

/// Build a peer with its own storage, save directory and event channel.
pub fn make_peer(name: &str, platform: Platform) -> TestPeer {
    let device = DeviceInfo::generate(name, platform);
    let save_dir = create_temp_dir();

    let settings = AppSettings {
        device_name: name.to_string(),
        device_id: device.id.clone(),
        auto_accept_from_paired: true,
        save_directory: save_dir.path().to_path_buf(),
        notifications_enabled: false,
    };
    let storage = Arc::new(MemoryStorage::with_settings(settings));

    let (events_tx, events) = easyshare_core::events::channel();
    let manager = ConnectionManager::new(
        device.clone(),
        Arc::clone(&storage) as Arc<dyn Storage>,
        events_tx,
    );

    TestPeer {
        device,
        storage,
        manager,
        events,
        save_dir,
    }
}

/// Seed both peers' storage with the credential a completed pairing
/// would have produced.
pub fn pre_pair(a: &TestPeer, b: &TestPeer, passphrase: &str) {
    let secret = crypto::derive_shared_secret(passphrase, &a.device.id, &b.device.id);
    a.storage
        .add_paired_device(PairedDevice::new(b.device.clone(), &secret));
    b.storage
        .add_paired_device(PairedDevice::new(a.device.clone(), &secret));
}

/// Start `server`'s listener and connect `client` to it over loopback.
pub async fn connect_pair(client: &TestPeer, server: &TestPeer) {
    let port = server
        .manager
        .start_server()
        .await
        .expect("server must bind");

    let mut target = server.device.clone();
    target.host = Some("127.0.0.1".to_string());
    target.port = Some(port);

    client
        .manager
        .connect_to_device(&target)
        .await
        .expect("connect must succeed");
}

/// Wait for the first event matching the predicate, panicking after the
/// timeout.
pub async fn wait_for_event<F>(events: &mut EventReceiver, what: &str, predicate: F) -> Event
where
    F: Fn(&Event) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            panic!("timed out waiting for event: {what}");
        }
        match tokio::time::timeout(remaining, events.recv()).await {
            Ok(Some(event)) => {
                if predicate(&event) {
                    return event;
                }
            }
            Ok(None) => panic!("event channel closed while waiting for: {what}"),
            Err(_) => panic!("timed out waiting for event: {what}"),
        }
    }
}
