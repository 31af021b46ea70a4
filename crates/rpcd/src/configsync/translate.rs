// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Translation between the cloud's wire types and the local config ops.

use crate::ptime;
use ap_cloud::cloud_rpc;
use ap_core::config::{CfgError, CfgOp, CfgOpKind, CfgUpdate, UpdateKind};

/// Map a cloud command's ops onto local config ops.
///
/// Unknown operation codes fail the whole command; executing a partial
/// batch would leave the tree in a state the cloud never asked for.
pub fn to_local_ops(cmd: &cloud_rpc::CfgCmd) -> Result<Vec<CfgOp>, CfgError> {
    use cloud_rpc::cfg_prop_op::Operation;
    cmd.ops
        .iter()
        .map(|op| {
            let kind = match Operation::try_from(op.op) {
                Ok(Operation::Get) => CfgOpKind::Get,
                Ok(Operation::Set) => CfgOpKind::Set,
                Ok(Operation::Create) => CfgOpKind::Create,
                Ok(Operation::Delete) => CfgOpKind::Delete,
                Err(_) => return Err(CfgError::BadProp(format!("unknown op code {}", op.op))),
            };
            Ok(CfgOp {
                op: kind,
                prop: op.property.clone(),
                value: (!op.value.is_empty()).then(|| op.value.clone()),
                expires: op.expires.as_ref().and_then(ptime::from_proto),
            })
        })
        .collect()
}

/// Build the completion for a finished command.
pub fn completion_for(
    cmd_id: i64,
    result: &Result<String, CfgError>,
) -> cloud_rpc::CfgCompletion {
    use cloud_rpc::cfg_completion::Status;
    match result {
        Ok(value) => cloud_rpc::CfgCompletion {
            cmd_id,
            status: Status::Ok as i32,
            value: value.clone(),
            errmsg: String::new(),
        },
        Err(e) => cloud_rpc::CfgCompletion {
            cmd_id,
            status: Status::Failed as i32,
            value: String::new(),
            errmsg: e.to_string(),
        },
    }
}

/// Convert a local tree-change event for the cloud.
pub fn to_cloud_update(update: &CfgUpdate) -> cloud_rpc::CfgUpdate {
    use cloud_rpc::cfg_update::Type;
    cloud_rpc::CfgUpdate {
        r#type: match update.kind {
            UpdateKind::Update => Type::Update as i32,
            UpdateKind::Delete => Type::Delete as i32,
        },
        property: update.prop.clone(),
        value: update.value.clone().unwrap_or_default(),
        hash: update.hash.clone(),
        expires: update.expires.map(ptime::to_proto),
    }
}

/// Parse a broker `config` event back into a local update record.
///
/// Interim records (no property or no hash) are dropped here: they
/// describe intermediate states subsumed by the change that follows them.
pub fn from_broker_event(update: &cloud_rpc::CfgUpdate) -> Option<CfgUpdate> {
    use cloud_rpc::cfg_update::Type;
    if update.property.is_empty() || update.hash.is_empty() {
        return None;
    }
    let kind = match Type::try_from(update.r#type) {
        Ok(Type::Update) => UpdateKind::Update,
        Ok(Type::Delete) => UpdateKind::Delete,
        Err(_) => return None,
    };
    Some(CfgUpdate {
        kind,
        prop: update.property.clone(),
        value: (!update.value.is_empty()).then(|| update.value.clone()),
        hash: update.hash.clone(),
        expires: update.expires.as_ref().and_then(ptime::from_proto),
    })
}

/// True for a bare full-tree refresh (`GET @/` as the only op).
pub fn is_refresh(cmd: &cloud_rpc::CfgCmd) -> bool {
    use cloud_rpc::cfg_prop_op::Operation;
    cmd.ops.len() == 1
        && cmd.ops[0].op == Operation::Get as i32
        && cmd.ops[0].property == "@/"
}

#[cfg(test)]
#[path = "translate_tests.rs"]
mod tests;
