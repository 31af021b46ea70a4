// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use chrono::TimeZone;

fn ts() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 14, 9, 26, 53).unwrap() + chrono::Duration::nanoseconds(589_793_238)
}

#[test]
fn format_and_parse_round_trip() {
    let name = FaultFileName::new("crash", ts());
    let file = name.file_name();
    assert!(file.starts_with("crash-2026-03-14T09:26:53.589793238Z"), "{file}");
    assert!(file.ends_with(".json"));
    assert_eq!(FaultFileName::parse(&file), Some(name));
}

#[test]
fn uploaded_round_trip() {
    let name = FaultFileName::new("mem", ts()).as_uploaded();
    let file = name.file_name();
    assert!(file.ends_with(".uploaded.json"), "{file}");
    let parsed = FaultFileName::parse(&file).unwrap();
    assert!(parsed.uploaded);
    assert_eq!(parsed.kind, "mem");
}

#[test]
fn chronological_ordering_by_timestamp() {
    let older = FaultFileName::new("crash", ts());
    let newer = FaultFileName::new("crash", ts() + chrono::Duration::seconds(5));
    assert!(older.timestamp < newer.timestamp);
}

#[test]
fn parse_rejects_foreign_files() {
    assert!(FaultFileName::parse("README.md").is_none());
    assert!(FaultFileName::parse("crash.json").is_none());
    assert!(FaultFileName::parse("-2026-03-14T09:26:53Z.json").is_none());
    assert!(FaultFileName::parse("crash-notatimestamp.json").is_none());
    assert!(FaultFileName::parse("crash-2026-03-14T09:26:53Z.tmp").is_none());
}

#[test]
fn parse_path_uses_file_name_component() {
    let name = FaultFileName::new("crash", ts());
    let path = std::path::Path::new("/var/spool/faults").join(name.file_name());
    assert_eq!(FaultFileName::parse_path(&path), Some(name));
}
