// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

fn descriptor_json() -> String {
    r#"{
        "release_uuid": "0a0b0c0d-1111-4222-8333-444455556666",
        "platform": "mt7623",
        "artifacts": [
            {
                "URL": "https://dist.example.net/mt7623/uImage",
                "filename": "uImage",
                "hashtype": "SHA256",
                "hash": "deadbeef"
            }
        ]
    }"#
    .to_string()
}

#[test]
fn parses_descriptor_json() {
    let desc = ReleaseDescriptor::from_json(&descriptor_json()).unwrap();
    assert_eq!(desc.platform, "mt7623");
    assert_eq!(desc.artifacts.len(), 1);
    assert_eq!(desc.artifacts[0].filename, "uImage");
    assert_eq!(desc.artifacts[0].hash_hex, "deadbeef");
}

#[test]
fn validate_accepts_matching_platform() {
    let desc = ReleaseDescriptor::from_json(&descriptor_json()).unwrap();
    assert!(desc.validate("mt7623").is_ok());
}

#[test]
fn validate_rejects_platform_mismatch() {
    let desc = ReleaseDescriptor::from_json(&descriptor_json()).unwrap();
    let err = desc.validate("rpi3").unwrap_err();
    assert!(matches!(err, ReleaseError::PlatformMismatch { .. }));
}

#[test]
fn validate_rejects_unknown_hash_type() {
    let mut desc = ReleaseDescriptor::from_json(&descriptor_json()).unwrap();
    desc.artifacts[0].hash_type = "MD5".to_string();
    let err = desc.validate("mt7623").unwrap_err();
    assert!(matches!(err, ReleaseError::BadHashType { .. }));
}

#[test]
fn missing_artifacts_defaults_to_empty() {
    let desc = ReleaseDescriptor::from_json(
        r#"{"release_uuid": "0a0b0c0d-1111-4222-8333-444455556666", "platform": "x86"}"#,
    )
    .unwrap();
    assert!(desc.artifacts.is_empty());
}
