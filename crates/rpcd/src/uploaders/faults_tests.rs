// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::metrics::Metrics;
use crate::testing::{MemConfig, MockCloud};
use ap_core::FakeClock;
use prost::Message;
use std::sync::Arc;

fn rig() -> (FaultUploader<FakeClock>, Arc<MockCloud>, FakeClock, PathBuf, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let spool = dir.path().join("faults");
    let cloud = MockCloud::new();
    let (restart_tx, _) = tokio::sync::mpsc::channel(1);
    let sender = EventSender::new(cloud.clone(), MemConfig::new(), Metrics::new(), restart_tx);
    let clock = FakeClock::new();
    (FaultUploader::new(sender, spool.clone(), clock.clone()), cloud, clock, spool, dir)
}

fn name(kind: &str, ts: DateTime<Utc>, uploaded: bool) -> FaultFileName {
    let mut n = FaultFileName::new(kind, ts);
    n.uploaded = uploaded;
    n
}

#[test]
fn plan_reaps_over_count_oldest_first() {
    let base = chrono::TimeZone::timestamp_opt(&Utc, 1_700_000_000, 0).single().unwrap();
    let spool: Vec<(PathBuf, FaultFileName)> = (0..MAX_RETAIN + 3)
        .map(|i| {
            let n = name("crash", base + chrono::Duration::seconds(i as i64), true);
            (PathBuf::from(n.file_name()), n)
        })
        .collect();
    let plan = plan(&spool, base + chrono::Duration::hours(1), false);
    // Three files over the cap; the three oldest lead the reap list.
    assert!(plan.reap.len() >= 3);
    let reaped: Vec<&PathBuf> = plan.reap.iter().take(3).collect();
    for (i, path) in reaped.iter().enumerate() {
        let parsed = FaultFileName::parse_path(path).unwrap();
        assert_eq!(parsed.timestamp, base + chrono::Duration::seconds(i as i64));
    }
}

#[test]
fn plan_reaps_stale_uploaded_and_may_duplicate() {
    let base = chrono::TimeZone::timestamp_opt(&Utc, 1_700_000_000, 0).single().unwrap();
    let now = base + chrono::Duration::hours(100);
    // Over-cap AND stale: the same file can appear twice in the reap list.
    let spool: Vec<(PathBuf, FaultFileName)> = (0..MAX_RETAIN + 1)
        .map(|i| {
            let n = name("mem", base + chrono::Duration::seconds(i as i64), true);
            (PathBuf::from(n.file_name()), n)
        })
        .collect();
    let plan = plan(&spool, now, false);
    let first = &spool.iter().min_by_key(|(_, n)| n.timestamp).unwrap().0;
    assert_eq!(plan.reap.iter().filter(|p| p == &first).count(), 2);
    // Fresh (non-uploaded) files are never in the upload list here
    assert!(plan.upload.is_empty());
}

#[test]
fn plan_uploads_fresh_files_and_forced_includes_uploaded() {
    let base = chrono::TimeZone::timestamp_opt(&Utc, 1_700_000_000, 0).single().unwrap();
    let fresh = name("crash", base, false);
    let shipped = name("crash", base + chrono::Duration::seconds(1), true);
    let spool = vec![
        (PathBuf::from(fresh.file_name()), fresh.clone()),
        (PathBuf::from(shipped.file_name()), shipped.clone()),
    ];

    let normal = plan(&spool, base + chrono::Duration::hours(1), false);
    assert_eq!(normal.upload, vec![PathBuf::from(fresh.file_name())]);

    let forced = plan(&spool, base + chrono::Duration::hours(1), true);
    assert_eq!(forced.upload.len(), 2);
}

#[tokio::test]
async fn upload_ships_verbatim_and_renames() {
    let (uploader, cloud, clock, spool, _dir) = rig();
    let body = br#"{"kind":"crash","daemon":"ap.dhcpd"}"#;
    let path = write_fault(&spool, "crash", clock.wall(), body).unwrap();

    uploader.upload(false).await.unwrap();

    // Shipped with the pre-serialized bytes intact
    let events = cloud.events.lock().clone();
    assert_eq!(events.len(), 1);
    let report = cloud_rpc::FaultReport::decode(events[0].1.value.as_slice()).unwrap();
    assert_eq!(report.content, body.to_vec());
    assert_eq!(report.kind, "crash");

    // Original renamed to .uploaded.json
    assert!(!path.exists());
    let renamed: Vec<_> = std::fs::read_dir(&spool)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(renamed.len(), 1);
    assert!(renamed[0].ends_with(".uploaded.json"), "{renamed:?}");
}

#[tokio::test]
async fn failed_upload_leaves_file_for_next_cycle() {
    let (uploader, cloud, clock, spool, _dir) = rig();
    *cloud.event_response.lock() = Some(cloud_rpc::PutEventResponse {
        time: None,
        result: cloud_rpc::put_event_response::Result::Error as i32,
        url: String::new(),
    });
    let path = write_fault(&spool, "crash", clock.wall(), b"{}").unwrap();

    uploader.upload(false).await.unwrap();
    assert!(path.exists(), "file must survive a failed upload");
}

#[tokio::test]
async fn stale_uploaded_files_are_reaped() {
    let (uploader, _cloud, clock, spool, _dir) = rig();
    let old = clock.wall() - chrono::Duration::hours(80);
    std::fs::create_dir_all(&spool).unwrap();
    let stale = spool.join(name("mem", old, true).file_name());
    std::fs::write(&stale, b"{}").unwrap();

    uploader.upload(false).await.unwrap();
    assert!(!stale.exists(), "uploaded file older than 72h must be reaped");
}
