// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use ap_cloud::cloud_rpc::cfg_prop_op::Operation;
use ap_cloud::cloud_rpc::{CfgCmd, CfgPropOp};

fn op(operation: Operation, property: &str, value: &str) -> CfgPropOp {
    CfgPropOp {
        op: operation as i32,
        property: property.to_string(),
        value: value.to_string(),
        expires: None,
    }
}

#[test]
fn ops_translate_kind_and_value() {
    let cmd = CfgCmd {
        cmd_id: 7,
        ops: vec![
            op(Operation::Set, "@/foo", "bar"),
            op(Operation::Get, "@/foo", ""),
            op(Operation::Delete, "@/baz", ""),
        ],
    };
    let local = to_local_ops(&cmd).unwrap();
    assert_eq!(local.len(), 3);
    assert_eq!(local[0].op, CfgOpKind::Set);
    assert_eq!(local[0].value.as_deref(), Some("bar"));
    assert_eq!(local[1].op, CfgOpKind::Get);
    assert!(local[1].value.is_none());
    assert_eq!(local[2].op, CfgOpKind::Delete);
}

#[test]
fn unknown_op_code_fails_whole_command() {
    let mut bad = op(Operation::Set, "@/foo", "bar");
    bad.op = 42;
    let cmd = CfgCmd { cmd_id: 8, ops: vec![op(Operation::Get, "@/a", ""), bad] };
    assert!(matches!(to_local_ops(&cmd), Err(CfgError::BadProp(_))));
}

#[test]
fn completion_reflects_result() {
    use ap_cloud::cloud_rpc::cfg_completion::Status;
    let ok = completion_for(9, &Ok("value".to_string()));
    assert_eq!(ok.status, Status::Ok as i32);
    assert_eq!(ok.value, "value");
    assert!(ok.errmsg.is_empty());

    let failed = completion_for(10, &Err(CfgError::NoProp));
    assert_eq!(failed.status, Status::Failed as i32);
    assert_eq!(failed.errmsg, "no such property");
}

#[test]
fn refresh_detection() {
    assert!(is_refresh(&CfgCmd { cmd_id: 1, ops: vec![op(Operation::Get, "@/", "")] }));
    assert!(!is_refresh(&CfgCmd { cmd_id: 2, ops: vec![op(Operation::Get, "@/foo", "")] }));
    assert!(!is_refresh(&CfgCmd {
        cmd_id: 3,
        ops: vec![op(Operation::Get, "@/", ""), op(Operation::Get, "@/", "")],
    }));
}

#[test]
fn broker_event_filters_interim_records() {
    use ap_cloud::cloud_rpc::CfgUpdate as WireUpdate;
    // No hash: interim, dropped
    let interim = WireUpdate {
        r#type: 0,
        property: "@/foo".into(),
        value: "v".into(),
        hash: vec![],
        expires: None,
    };
    assert!(from_broker_event(&interim).is_none());

    // No property: dropped
    let anon =
        WireUpdate { r#type: 0, property: String::new(), value: "v".into(), hash: vec![1], expires: None };
    assert!(from_broker_event(&anon).is_none());

    let real = WireUpdate {
        r#type: 1,
        property: "@/foo".into(),
        value: String::new(),
        hash: vec![1, 2],
        expires: None,
    };
    let update = from_broker_event(&real).unwrap();
    assert_eq!(update.kind, UpdateKind::Delete);
    assert_eq!(update.prop, "@/foo");
    assert!(update.value.is_none());
}
