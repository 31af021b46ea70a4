// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::metrics::Metrics;
use crate::testing::{FakePlatform, MemConfig, MockCloud};
use ap_core::FakeClock;
use prost::Message;
use tokio::io::AsyncReadExt;

/// Minimal one-shot HTTP server handing out fixed bodies by path.
async fn http_server(routes: Vec<(&'static str, Vec<u8>)>) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else { return };
            let routes = routes.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                let n = sock.read(&mut buf).await.unwrap_or(0);
                let req = String::from_utf8_lossy(&buf[..n]).into_owned();
                let path = req.split_whitespace().nth(1).unwrap_or("/").to_string();
                let body = routes
                    .iter()
                    .find(|(p, _)| *p == path)
                    .map(|(_, b)| b.clone())
                    .unwrap_or_default();
                let header = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let _ = tokio::io::AsyncWriteExt::write_all(&mut sock, header.as_bytes()).await;
                let _ = tokio::io::AsyncWriteExt::write_all(&mut sock, &body).await;
            });
        }
    });
    format!("http://{addr}")
}

struct Rig {
    ctl: Arc<ReleaseController<FakeClock>>,
    cloud: Arc<MockCloud>,
    platform: Arc<FakePlatform>,
    root: PathBuf,
    _dir: tempfile::TempDir,
}

fn rig() -> Rig {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_path_buf();
    let cloud = MockCloud::new();
    let platform = FakePlatform::new(&root);
    let (restart_tx, _) = mpsc::channel(1);
    let sender = EventSender::new(cloud.clone(), MemConfig::new(), Metrics::new(), restart_tx);
    let ctl = ReleaseController::new(
        cloud.clone(),
        sender,
        MemConfig::new(),
        platform.clone(),
        root.join("var/spool/release"),
        root.join("etc/release.json"),
        root.join("etc/versions"),
        root.join("var/spool/faults"),
        Arc::new(Mutex::new(String::new())),
        FakeClock::new(),
    );
    Rig { ctl, cloud, platform, root, _dir: dir }
}

fn sha256_hex(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

fn descriptor(uuid: &str, artifacts: Vec<serde_json::Value>) -> String {
    serde_json::json!({
        "release_uuid": uuid,
        "platform": "mt7623",
        "artifacts": artifacts,
    })
    .to_string()
}

fn upgrade_reports(cloud: &MockCloud) -> Vec<cloud_rpc::UpgradeReport> {
    cloud
        .events
        .lock()
        .iter()
        .filter(|(topic, _)| topic == "upgrade")
        .map(|(_, any)| cloud_rpc::UpgradeReport::decode(any.value.as_slice()).unwrap())
        .collect()
}

const TARGET: &str = "3f2c8f6e-1b7a-4b44-9c6e-aaaabbbbcccc";

#[tokio::test]
async fn successful_upgrade_stages_verifies_and_reports() {
    let rig = rig();
    let body = b"artifact-bytes".to_vec();
    let base = http_server(vec![("/uImage.itb", body.clone())]).await;
    *rig.cloud.descriptor.lock() = Some(descriptor(
        TARGET,
        vec![serde_json::json!({
            "URL": format!("{base}/uImage.itb"),
            "filename": "uImage.itb",
            "hashtype": "SHA256",
            "hash": sha256_hex(&body),
        })],
    ));

    rig.ctl.run_upgrade().await;

    let stage = rig.root.join("var/spool/release").join(TARGET);
    // Descriptor persisted as indented JSON
    let staged = std::fs::read_to_string(stage.join("release.json")).unwrap();
    assert!(staged.contains('\n'), "descriptor should be pretty-printed");
    // Artifact renamed to the installer-expected name, tmp gone
    assert_eq!(std::fs::read(stage.join("uImage")).unwrap(), body);
    assert!(!stage.join("uImage.tmp").exists());
    // Platform upgrade invoked on the stage dir
    assert_eq!(rig.platform.upgrades.lock().as_slice(), &[stage.clone()]);
    // SUCCESS report with the installer's output
    let reports = upgrade_reports(&rig.cloud);
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].result, cloud_rpc::upgrade_report::Result::Success as i32);
    assert_eq!(reports[0].release_uuid, TARGET);
    assert_eq!(reports[0].output, "upgrade ok\n");
    // Dev root: no reboot
    assert_eq!(*rig.platform.reboots.lock(), 0);
}

#[tokio::test]
async fn hash_mismatch_aborts_without_final_file() {
    let rig = rig();
    let base = http_server(vec![("/uImage.itb", b"tampered".to_vec())]).await;
    *rig.cloud.descriptor.lock() = Some(descriptor(
        TARGET,
        vec![serde_json::json!({
            "URL": format!("{base}/uImage.itb"),
            "filename": "uImage.itb",
            "hashtype": "SHA256",
            "hash": sha256_hex(b"the real artifact"),
        })],
    ));

    rig.ctl.run_upgrade().await;

    let stage = rig.root.join("var/spool/release").join(TARGET);
    assert!(!stage.join("uImage").exists(), "no artifact at the final path");
    assert!(!stage.join("uImage.tmp").exists(), "tmp removed on mismatch");
    assert!(rig.platform.upgrades.lock().is_empty(), "installer never invoked");

    let reports = upgrade_reports(&rig.cloud);
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].result, cloud_rpc::upgrade_report::Result::Failure as i32);
    assert!(reports[0].error.contains("hash mismatch"), "{}", reports[0].error);
    // Failure also lands in the fault spool
    let faults = std::fs::read_dir(rig.root.join("var/spool/faults")).unwrap().count();
    assert_eq!(faults, 1);
}

#[tokio::test]
async fn same_release_is_silent() {
    let rig = rig();
    std::fs::create_dir_all(rig.root.join("etc")).unwrap();
    std::fs::write(rig.root.join("etc/release.json"), descriptor(TARGET, vec![])).unwrap();
    *rig.cloud.descriptor.lock() = Some(descriptor(TARGET, vec![]));

    rig.ctl.run_upgrade().await;

    assert!(upgrade_reports(&rig.cloud).is_empty(), "SameRelease is logged, not reported");
    assert!(rig.platform.upgrades.lock().is_empty());
}

#[tokio::test]
async fn platform_mismatch_fails() {
    let rig = rig();
    *rig.cloud.descriptor.lock() = Some(
        serde_json::json!({
            "release_uuid": TARGET,
            "platform": "rpi3",
            "artifacts": [],
        })
        .to_string(),
    );

    rig.ctl.run_upgrade().await;

    let reports = upgrade_reports(&rig.cloud);
    assert_eq!(reports[0].result, cloud_rpc::upgrade_report::Result::Failure as i32);
    assert!(reports[0].error.contains("does not match"));
}

#[tokio::test]
async fn skipped_artifacts_are_not_downloaded() {
    let rig = rig();
    // metadata.json maps to the empty string: skipped entirely; no
    // server is even needed for it.
    *rig.cloud.descriptor.lock() = Some(descriptor(
        TARGET,
        vec![serde_json::json!({
            "URL": "http://127.0.0.1:1/metadata.json",
            "filename": "metadata.json",
            "hashtype": "SHA256",
            "hash": "00",
        })],
    ));

    rig.ctl.run_upgrade().await;

    let reports = upgrade_reports(&rig.cloud);
    assert_eq!(reports[0].result, cloud_rpc::upgrade_report::Result::Success as i32);
}

#[tokio::test]
async fn prune_keeps_current_and_target() {
    let rig = rig();
    let release_root = rig.root.join("var/spool/release");
    let stale = "11111111-2222-4333-8444-555566667777";
    std::fs::create_dir_all(release_root.join(stale)).unwrap();
    std::fs::create_dir_all(release_root.join("not-a-uuid")).unwrap();
    *rig.cloud.descriptor.lock() = Some(descriptor(TARGET, vec![]));

    rig.ctl.run_upgrade().await;

    assert!(!release_root.join(stale).exists(), "stale release pruned");
    assert!(release_root.join(TARGET).exists());
    assert!(release_root.join("not-a-uuid").exists(), "non-release dirs untouched");
}

#[tokio::test]
async fn startup_report_carries_commits_and_serial_exception() {
    let rig = rig();
    let versions = rig.root.join("etc/versions");
    std::fs::create_dir_all(&versions).unwrap();
    std::fs::write(versions.join("product:rpcd"), "abc123\n").unwrap();
    std::fs::write(versions.join("product:configd"), "abc123\n").unwrap();
    std::fs::write(versions.join("vendor:driver"), "d00d00\n").unwrap();
    std::fs::write(versions.join("vendor:firmware"), "f00f00\n").unwrap();

    // Self-assigned serial triggers the exception report
    let random = FakePlatform::new(&rig.root);
    *random.node.lock() = "7c0fb8a9-30f3-4e0a-9d1a-5a2c6b9b8f11".to_string();
    let (restart_tx, _) = mpsc::channel(1);
    let sender =
        EventSender::new(rig.cloud.clone(), MemConfig::new(), Metrics::new(), restart_tx);
    let ctl = ReleaseController::new(
        rig.cloud.clone(),
        sender,
        MemConfig::new(),
        random,
        rig.root.join("var/spool/release"),
        rig.root.join("etc/release.json"),
        versions,
        rig.root.join("var/spool/faults"),
        Arc::new(Mutex::new(String::new())),
        FakeClock::new(),
    );

    ctl.report_startup().await;

    let reports = upgrade_reports(&rig.cloud);
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].result, cloud_rpc::upgrade_report::Result::Report as i32);
    // product collapses to one entry, vendor stays per-package
    assert_eq!(reports[0].commits.get("product").map(String::as_str), Some("abc123"));
    assert_eq!(reports[0].commits.get("vendor:driver").map(String::as_str), Some("d00d00"));
    assert_eq!(reports[0].commits.get("vendor:firmware").map(String::as_str), Some("f00f00"));
    assert!(!reports[0].commits.contains_key("vendor"));

    let exceptions = rig
        .cloud
        .events
        .lock()
        .iter()
        .filter(|(topic, _)| topic == "exception")
        .count();
    assert_eq!(exceptions, 1, "random serial must publish a SerialException");
}

#[test]
fn artifact_name_mapping() {
    assert_eq!(map_artifact_name("uImage.itb"), Some("uImage"));
    assert_eq!(map_artifact_name("root.squashfs"), Some("rootfs.img"));
    assert_eq!(map_artifact_name("metadata.json"), None);
    assert_eq!(map_artifact_name("something-else.bin"), Some("something-else.bin"));
}

#[test]
fn commit_map_missing_dir_is_empty() {
    let dir = tempfile::tempdir().unwrap();
    assert!(read_commit_map(&dir.path().join("absent")).is_empty());
}
