// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared event-publish path: wraps payloads in `PutEventRequest` and
//! reacts to endpoint redirects.

use crate::cloud_api::CloudClient;
use crate::metrics::Metrics;
use ap_cloud::cloud_rpc;
use ap_core::config::CfgOp;
use ap_core::ConfigHandle;
use prost::Message;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

const ENDPOINT_URL_PROP: &str = "@/cloud/svc_rpc/url";

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("transport: {0}")]
    Transport(#[from] tonic::Status),

    #[error("server rejected event")]
    Server,

    /// The server redirected us; a restart has been requested and the
    /// current channel must not be reused.
    #[error("endpoint redirected to {0}")]
    BadEndpoint(String),
}

#[derive(Clone)]
pub struct EventSender {
    cloud: Arc<dyn CloudClient>,
    cfg: Arc<dyn ConfigHandle>,
    metrics: Arc<Metrics>,
    restart_tx: mpsc::Sender<String>,
}

impl EventSender {
    pub fn new(
        cloud: Arc<dyn CloudClient>,
        cfg: Arc<dyn ConfigHandle>,
        metrics: Arc<Metrics>,
        restart_tx: mpsc::Sender<String>,
    ) -> Self {
        Self { cloud, cfg, metrics, restart_tx }
    }

    /// Publish one payload message under `sub_topic`.
    pub async fn put<M: Message>(
        &self,
        sub_topic: &str,
        type_name: &str,
        msg: &M,
    ) -> Result<(), PublishError> {
        let payload = prost_types::Any {
            type_url: ap_cloud::type_url(type_name),
            value: msg.encode_to_vec(),
        };
        let resp = self.cloud.put_event(sub_topic, payload).await?;
        match cloud_rpc::put_event_response::Result::try_from(resp.result) {
            Ok(cloud_rpc::put_event_response::Result::Success) => {
                self.metrics.events_handled.inc();
                Ok(())
            }
            Ok(cloud_rpc::put_event_response::Result::BadEndpoint) => {
                info!(url = %resp.url, "cloud redirected event endpoint");
                if !resp.url.is_empty() {
                    if let Err(e) =
                        self.cfg.execute(&[CfgOp::set(ENDPOINT_URL_PROP, &resp.url)]).await
                    {
                        warn!(error = %e, "failed to record redirected endpoint");
                    }
                }
                let _ = self.restart_tx.try_send("event endpoint redirected".to_string());
                Err(PublishError::BadEndpoint(resp.url))
            }
            _ => Err(PublishError::Server),
        }
    }
}

#[cfg(test)]
#[path = "publish_tests.rs"]
mod tests;
