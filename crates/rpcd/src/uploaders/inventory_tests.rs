// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::metrics::Metrics;
use crate::testing::{MemConfig, MockCloud};
use ap_core::FakeClock;
use std::sync::Arc;

fn device(mac: u64, updated: DateTime<Utc>) -> cloud_rpc::DeviceInfo {
    cloud_rpc::DeviceInfo {
        mac_address: mac,
        created: None,
        updated: Some(ptime::to_proto(updated)),
        manufacturer: "acme".into(),
        model: "widget".into(),
        kind: "iot".into(),
    }
}

fn write_spool(dir: &Path, name: &str, devices: Vec<cloud_rpc::DeviceInfo>) {
    let inv = cloud_rpc::DeviceInventory { timestamp: None, devices };
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(dir.join(name), inv.encode_to_vec()).unwrap();
}

struct Rig {
    uploader: InventoryUploader<FakeClock>,
    cloud: Arc<MockCloud>,
    clock: FakeClock,
    manifest_path: PathBuf,
    spool: PathBuf,
    _dir: tempfile::TempDir,
}

fn rig() -> Rig {
    let dir = tempfile::tempdir().unwrap();
    let spool = dir.path().join("identifierd");
    let manifest_path = dir.path().join("rpcd/identifierd.json.v1");
    let cloud = MockCloud::new();
    let (restart_tx, _) = tokio::sync::mpsc::channel(1);
    let sender = EventSender::new(cloud.clone(), MemConfig::new(), Metrics::new(), restart_tx);
    let clock = FakeClock::new();
    let uploader =
        InventoryUploader::new(sender, spool.clone(), manifest_path.clone(), clock.clone());
    Rig { uploader, cloud, clock, manifest_path, spool, _dir: dir }
}

fn uploaded_macs(cloud: &MockCloud) -> Vec<u64> {
    cloud
        .events
        .lock()
        .iter()
        .filter(|(topic, _)| topic == "inventory")
        .flat_map(|(_, any)| {
            let report = cloud_rpc::InventoryReport::decode(any.value.as_slice()).unwrap();
            report.inventory.unwrap().devices.into_iter().map(|d| d.mac_address)
        })
        .collect()
}

#[tokio::test]
async fn first_run_uploads_then_second_run_skips() {
    let rig = rig();
    let t1 = rig.clock.wall();
    write_spool(&rig.spool, "inventory.0.pb", vec![device(0x00aabbccddee, t1)]);

    rig.uploader.upload(false).await.unwrap();
    assert_eq!(uploaded_macs(&rig.cloud), vec![0x00aabbccddee]);

    // No changes: nothing further is shipped, but the run succeeds.
    rig.clock.advance(Duration::from_secs(60));
    rig.uploader.upload(false).await.unwrap();
    assert_eq!(uploaded_macs(&rig.cloud).len(), 1);
}

#[tokio::test]
async fn updated_device_is_reshipped() {
    let rig = rig();
    let t1 = rig.clock.wall();
    write_spool(&rig.spool, "inventory.0.pb", vec![device(0x01, t1)]);
    rig.uploader.upload(false).await.unwrap();

    rig.clock.advance(Duration::from_secs(3600));
    let t2 = rig.clock.wall();
    write_spool(&rig.spool, "inventory.1.pb", vec![device(0x01, t2)]);
    rig.uploader.upload(false).await.unwrap();

    assert_eq!(uploaded_macs(&rig.cloud), vec![0x01, 0x01]);
}

#[tokio::test]
async fn zero_mac_and_missing_updated_are_skipped() {
    let rig = rig();
    let t1 = rig.clock.wall();
    let mut no_updated = device(0x02, t1);
    no_updated.updated = None;
    write_spool(
        &rig.spool,
        "inventory.0.pb",
        vec![device(0, t1), no_updated, device(0x03, t1)],
    );
    rig.uploader.upload(false).await.unwrap();
    assert_eq!(uploaded_macs(&rig.cloud), vec![0x03]);
}

#[tokio::test]
async fn manifest_untouched_after_publish_failure() {
    let rig = rig();
    let t1 = rig.clock.wall();
    write_spool(&rig.spool, "inventory.0.pb", vec![device(0x04, t1)]);
    rig.uploader.upload(false).await.unwrap();
    let before = Manifest::load(&rig.manifest_path).unwrap();
    assert_eq!(before.len(), 1);

    // Second pass with a new device, but the cloud now rejects events
    rig.clock.advance(Duration::from_secs(10));
    write_spool(&rig.spool, "inventory.1.pb", vec![device(0x05, rig.clock.wall())]);
    *rig.cloud.event_response.lock() = Some(cloud_rpc::PutEventResponse {
        time: None,
        result: cloud_rpc::put_event_response::Result::Error as i32,
        url: String::new(),
    });
    assert!(rig.uploader.upload(false).await.is_err());

    let after = Manifest::load(&rig.manifest_path).unwrap();
    assert_eq!(after, before, "manifest must be unchanged after a failed run");
}

#[tokio::test]
async fn forced_run_rebuilds_manifest_and_reships() {
    let rig = rig();
    let t1 = rig.clock.wall();
    write_spool(&rig.spool, "inventory.0.pb", vec![device(0x06, t1)]);
    rig.uploader.upload(false).await.unwrap();
    rig.uploader.upload(true).await.unwrap();
    assert_eq!(uploaded_macs(&rig.cloud), vec![0x06, 0x06]);
}

#[tokio::test]
async fn undecodable_spool_file_is_skipped() {
    let rig = rig();
    std::fs::create_dir_all(&rig.spool).unwrap();
    std::fs::write(rig.spool.join("garbage.pb"), b"\xff\xff\xff\xff\xffnot proto").unwrap();
    write_spool(&rig.spool, "inventory.1.pb", vec![device(0x07, rig.clock.wall())]);
    rig.uploader.upload(false).await.unwrap();
    assert_eq!(uploaded_macs(&rig.cloud), vec![0x07]);
}

#[test]
fn manifest_round_trips_atomically() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rpcd/identifierd.json.v1");
    let mut manifest = Manifest::default();
    let mac: MacAddr = "aa:bb:cc:dd:ee:ff".parse().unwrap();
    manifest.record(mac, chrono::TimeZone::timestamp_opt(&Utc, 1_700_000_000, 0).single().unwrap());
    manifest.store(&path).unwrap();

    let loaded = Manifest::load(&path).unwrap();
    assert_eq!(loaded, manifest);
    // No temp file left behind
    assert!(!path.with_extension("tmp").exists());
}

#[test]
fn missing_manifest_is_empty() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = Manifest::load(&dir.path().join("absent.json")).unwrap();
    assert!(manifest.is_empty());
}
