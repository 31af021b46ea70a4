// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn envelope_payload_is_base64_in_json() {
    let envelope = BrokerEnvelope { topic: "config".into(), payload: vec![0x00, 0xff, 0x10] };
    let json = serde_json::to_string(&envelope).unwrap();
    assert!(json.contains("\"AP8Q\""), "{json}");

    let back: BrokerEnvelope = serde_json::from_str(&json).unwrap();
    assert_eq!(back, envelope);
}

#[test]
fn envelope_rejects_bad_base64() {
    let json = r#"{"topic":"config","payload":"not base64!!!"}"#;
    assert!(serde_json::from_str::<BrokerEnvelope>(json).is_err());
}

#[test]
fn sub_request_round_trip() {
    let req = SubRequest { topics: vec!["config".into(), "device_inventory".into()] };
    let json = serde_json::to_string(&req).unwrap();
    assert_eq!(serde_json::from_str::<SubRequest>(&json).unwrap(), req);
}
