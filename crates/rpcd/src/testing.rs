// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test doubles for the daemon's collaborators: an in-memory config
//! tree, a local broker, a scripted cloud, and a fake platform.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use crate::cloud_api::{CloudClient, CmdStream};
use ap_cloud::cloud_rpc;
use ap_core::broker::{Broker, TopicCallback};
use ap_core::config::{CfgError, CfgOp, CfgOpKind, ConfigHandle, PropNode, WatchCallback};
use ap_core::platform::{DirTag, Platform, PlatformError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tonic::Status;

// ---------------------------------------------------------------- config

#[derive(Clone)]
struct Watch {
    pattern: Regex,
    cb: WatchCallback,
}

#[derive(Default)]
struct Tree {
    // full path -> (value, expires)
    props: BTreeMap<String, (String, Option<DateTime<Utc>>)>,
    generation: u64,
}

/// In-memory config daemon.
#[derive(Default)]
pub struct MemConfig {
    tree: Mutex<Tree>,
    changes: Mutex<Vec<Watch>>,
    deletes: Mutex<Vec<Watch>>,
    expires: Mutex<Vec<Watch>>,
    pub replaced: Mutex<Option<String>>,
    /// Every op executed, in order. Lets tests assert execution counts.
    pub executed: Mutex<Vec<CfgOp>>,
}

impl MemConfig {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn seed(&self, path: &str, value: &str) {
        let mut tree = self.tree.lock();
        tree.props.insert(path.to_string(), (value.to_string(), None));
        tree.generation += 1;
    }

    pub fn value(&self, path: &str) -> Option<String> {
        self.tree.lock().props.get(path).map(|(v, _)| v.clone())
    }

    pub fn expiry(&self, path: &str) -> Option<DateTime<Utc>> {
        self.tree.lock().props.get(path).and_then(|(_, e)| *e)
    }

    /// Flat copy of the tree, for assertions.
    pub fn tree_snapshot(&self) -> Vec<(String, String)> {
        self.tree.lock().props.iter().map(|(k, (v, _))| (k.clone(), v.clone())).collect()
    }

    /// Force-expire a property, firing expire watches.
    pub fn expire(&self, path: &str) {
        {
            let mut tree = self.tree.lock();
            tree.props.remove(path);
            tree.generation += 1;
        }
        for watch in self.expires.lock().iter() {
            if watch.pattern.is_match(path) {
                (watch.cb)(path, None);
            }
        }
    }

    fn fire(&self, watches: &Mutex<Vec<Watch>>, prop: &str, value: Option<&str>) {
        for watch in watches.lock().iter() {
            if watch.pattern.is_match(prop) {
                (watch.cb)(prop, value);
            }
        }
    }

    fn subtree(&self, path: &str) -> PropNode {
        let prefix = path.trim_end_matches('/');
        let tree = self.tree.lock();
        let mut root = PropNode::default();
        for (prop, (value, expires)) in tree.props.iter() {
            let rel = if prefix == "@" || prefix == "@/" {
                prop.strip_prefix("@/")
            } else {
                prop.strip_prefix(prefix).map(|r| r.trim_start_matches('/'))
            };
            let Some(rel) = rel else { continue };
            if rel.is_empty() {
                root.value = Some(value.clone());
                root.expires = *expires;
                continue;
            }
            let mut node = &mut root;
            for seg in rel.split('/') {
                node = node.children.entry(seg.to_string()).or_default();
            }
            node.value = Some(value.clone());
            node.expires = *expires;
        }
        root.hash = Some(tree.generation.to_be_bytes().to_vec());
        root
    }
}

#[async_trait]
impl ConfigHandle for MemConfig {
    async fn get_prop(&self, path: &str) -> Result<String, CfgError> {
        self.value(path).ok_or(CfgError::NoProp)
    }

    async fn get_props(&self, path: &str) -> Result<PropNode, CfgError> {
        Ok(self.subtree(path))
    }

    async fn execute(&self, ops: &[CfgOp]) -> Result<String, CfgError> {
        // Validate guards first so a failed batch mutates nothing.
        for op in ops {
            if op.op == CfgOpKind::TestEq {
                let current = self.value(&op.prop).unwrap_or_default();
                if current != op.value.clone().unwrap_or_default() {
                    return Err(CfgError::NotEqual);
                }
            }
        }
        self.executed.lock().extend(ops.iter().cloned());
        let mut result = String::new();
        let mut fired = Vec::new();
        {
            let mut tree = self.tree.lock();
            for op in ops {
                match op.op {
                    CfgOpKind::TestEq => {}
                    CfgOpKind::Get => {
                        if op.prop == "@/" {
                            drop(tree);
                            result = serde_json::to_string(&self.subtree("@/"))
                                .map_err(|e| CfgError::BadProp(e.to_string()))?;
                            tree = self.tree.lock();
                        } else {
                            result = tree
                                .props
                                .get(&op.prop)
                                .map(|(v, _)| v.clone())
                                .ok_or(CfgError::NoProp)?;
                        }
                    }
                    CfgOpKind::Set | CfgOpKind::Create => {
                        let value = op.value.clone().unwrap_or_default();
                        tree.props.insert(op.prop.clone(), (value.clone(), op.expires));
                        tree.generation += 1;
                        fired.push((op.prop.clone(), Some(value)));
                    }
                    CfgOpKind::Delete => {
                        let doomed: Vec<String> = tree
                            .props
                            .keys()
                            .filter(|k| k.as_str() == op.prop || k.starts_with(&format!("{}/", op.prop)))
                            .cloned()
                            .collect();
                        for k in doomed {
                            tree.props.remove(&k);
                        }
                        tree.generation += 1;
                        fired.push((op.prop.clone(), None));
                    }
                }
            }
        }
        for (prop, value) in fired {
            match value {
                Some(v) => self.fire(&self.changes, &prop, Some(&v)),
                None => self.fire(&self.deletes, &prop, None),
            }
        }
        Ok(result)
    }

    async fn delete_prop(&self, path: &str) -> Result<(), CfgError> {
        self.execute(&[CfgOp::delete(path)]).await.map(|_| ())
    }

    async fn replace(&self, tree_json: &str) -> Result<(), CfgError> {
        *self.replaced.lock() = Some(tree_json.to_string());
        Ok(())
    }

    async fn handle_change(&self, pattern: &str, cb: WatchCallback) -> Result<(), CfgError> {
        let pattern = Regex::new(pattern).map_err(|e| CfgError::BadProp(e.to_string()))?;
        self.changes.lock().push(Watch { pattern, cb });
        Ok(())
    }

    async fn handle_delete(&self, pattern: &str, cb: WatchCallback) -> Result<(), CfgError> {
        let pattern = Regex::new(pattern).map_err(|e| CfgError::BadProp(e.to_string()))?;
        self.deletes.lock().push(Watch { pattern, cb });
        Ok(())
    }

    async fn handle_expire(&self, pattern: &str, cb: WatchCallback) -> Result<(), CfgError> {
        let pattern = Regex::new(pattern).map_err(|e| CfgError::BadProp(e.to_string()))?;
        self.expires.lock().push(Watch { pattern, cb });
        Ok(())
    }
}

// ---------------------------------------------------------------- broker

#[derive(Default)]
pub struct MemBroker {
    subs: Mutex<HashMap<String, Vec<TopicCallback>>>,
}

impl MemBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn publish(&self, topic: &str, payload: &[u8]) {
        if let Some(cbs) = self.subs.lock().get(topic) {
            for cb in cbs {
                cb(payload);
            }
        }
    }
}

#[async_trait]
impl Broker for MemBroker {
    async fn handle(&self, topic: &str, cb: TopicCallback) -> std::io::Result<()> {
        self.subs.lock().entry(topic.to_string()).or_default().push(cb);
        Ok(())
    }
}

// ---------------------------------------------------------------- cloud

/// Scripted cloud backend recording everything the daemon sends.
#[derive(Default)]
pub struct MockCloud {
    pub hello_count: Mutex<u32>,
    pub fail_hello: Mutex<bool>,
    pub sent_updates: Mutex<Vec<cloud_rpc::CfgUpdate>>,
    pub sent_completions: Mutex<Vec<cloud_rpc::CfgCompletion>>,
    pub fail_updates: Mutex<u32>,
    pub fail_completions: Mutex<u32>,
    /// Each entry becomes one `fetch_stream` call's worth of batches.
    pub fetch_batches: Mutex<VecDeque<Vec<cloud_rpc::FetchResponse>>>,
    pub fetch_requests: Mutex<Vec<i64>>,
    pub download_response: Mutex<Option<cloud_rpc::Download>>,
    pub events: Mutex<Vec<(String, prost_types::Any)>>,
    pub event_response: Mutex<Option<cloud_rpc::PutEventResponse>>,
    pub cert_response: Mutex<Option<cloud_rpc::CertificateResponse>>,
    pub cert_requests: Mutex<Vec<Vec<u8>>>,
    pub descriptor: Mutex<Option<String>>,
}

impl MockCloud {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_batch(&self, cmds: Vec<cloud_rpc::CfgCmd>) {
        self.fetch_batches
            .lock()
            .push_back(vec![cloud_rpc::FetchResponse { time: None, cmds }]);
    }
}

#[async_trait]
impl CloudClient for MockCloud {
    async fn hello(&self, _version: &str) -> Result<(), Status> {
        if *self.fail_hello.lock() {
            return Err(Status::unavailable("scripted hello failure"));
        }
        *self.hello_count.lock() += 1;
        Ok(())
    }

    async fn update(&self, updates: Vec<cloud_rpc::CfgUpdate>) -> Result<(), Status> {
        let mut failures = self.fail_updates.lock();
        if *failures > 0 {
            *failures -= 1;
            return Err(Status::unavailable("scripted update failure"));
        }
        self.sent_updates.lock().extend(updates);
        Ok(())
    }

    async fn complete_cmds(
        &self,
        completions: Vec<cloud_rpc::CfgCompletion>,
    ) -> Result<(), Status> {
        let mut failures = self.fail_completions.lock();
        if *failures > 0 {
            *failures -= 1;
            return Err(Status::unavailable("scripted completion failure"));
        }
        self.sent_completions.lock().extend(completions);
        Ok(())
    }

    async fn fetch_stream(&self, last_cmd_id: i64, _max_cmds: u32) -> Result<CmdStream, Status> {
        self.fetch_requests.lock().push(last_cmd_id);
        let batches = self
            .fetch_batches
            .lock()
            .pop_front()
            .ok_or_else(|| Status::unavailable("no scripted batches"))?;
        Ok(futures_util::stream::iter(batches.into_iter().map(Ok)).boxed())
    }

    async fn download(&self) -> Result<cloud_rpc::Download, Status> {
        self.download_response
            .lock()
            .clone()
            .ok_or_else(|| Status::unavailable("no scripted download"))
    }

    async fn put_event(
        &self,
        sub_topic: &str,
        payload: prost_types::Any,
    ) -> Result<cloud_rpc::PutEventResponse, Status> {
        self.events.lock().push((sub_topic.to_string(), payload));
        Ok(self.event_response.lock().clone().unwrap_or(cloud_rpc::PutEventResponse {
            time: None,
            result: cloud_rpc::put_event_response::Result::Success as i32,
            url: String::new(),
        }))
    }

    async fn cert_download(
        &self,
        fingerprint: Vec<u8>,
    ) -> Result<cloud_rpc::CertificateResponse, Status> {
        self.cert_requests.lock().push(fingerprint);
        self.cert_response.lock().clone().ok_or_else(|| Status::unavailable("no scripted cert"))
    }

    async fn fetch_descriptor(&self) -> Result<String, Status> {
        self.descriptor.lock().clone().ok_or_else(|| Status::unavailable("no scripted descriptor"))
    }
}

// ---------------------------------------------------------------- platform

pub struct FakePlatform {
    root: PathBuf,
    pub name: String,
    boot: DateTime<Utc>,
    pub node: Mutex<String>,
    pub upgrades: Mutex<Vec<PathBuf>>,
    pub upgrade_result: Mutex<Result<String, String>>,
    pub reboots: Mutex<u32>,
}

impl FakePlatform {
    pub fn new(root: &Path) -> Arc<Self> {
        Arc::new(Self {
            root: root.to_path_buf(),
            name: "mt7623".to_string(),
            boot: Utc::now(),
            node: Mutex::new("001-201901BB-000123".to_string()),
            upgrades: Mutex::new(Vec::new()),
            upgrade_result: Mutex::new(Ok("upgrade ok\n".to_string())),
            reboots: Mutex::new(0),
        })
    }
}

#[async_trait]
impl Platform for FakePlatform {
    fn boot_time(&self) -> DateTime<Utc> {
        self.boot
    }

    fn node_id(&self) -> Result<String, PlatformError> {
        Ok(self.node.lock().clone())
    }

    fn platform_name(&self) -> &str {
        &self.name
    }

    fn root(&self) -> &Path {
        &self.root
    }

    fn expand_dir_path(&self, tag: DirTag, rest: &str) -> PathBuf {
        let base = match tag {
            DirTag::Data => self.root.join("var/spool"),
            DirTag::Secret => self.root.join("etc/secret"),
            DirTag::Run => self.root.join("var/run"),
        };
        base.join(rest)
    }

    async fn upgrade(&self, release_dir: &Path) -> Result<String, PlatformError> {
        self.upgrades.lock().push(release_dir.to_path_buf());
        self.upgrade_result.lock().clone().map_err(PlatformError::Upgrade)
    }

    async fn reboot(&self) -> Result<(), PlatformError> {
        *self.reboots.lock() += 1;
        Ok(())
    }
}
