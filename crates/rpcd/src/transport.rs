// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Cloud channel establishment: endpoint selection, dial, backoff.

use crate::credential::{Credential, CredentialError};
use crate::env;
use crate::ptime;
use ap_cloud::cloud_rpc;
use ap_core::{Clock, ConfigHandle, SystemClock};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tonic::transport::{Channel, ClientTlsConfig};
use tracing::{debug, info, warn};

/// Compiled-in fallback endpoint.
const DEFAULT_HOST: &str = "svc1.b10e.net";
const DEFAULT_PORT: u16 = 4430;

const DIAL_BACKOFF_START: Duration = Duration::from_secs(1);
const DIAL_BACKOFF_CAP: Duration = Duration::from_secs(30 * 60);
const DNS_PROBE_TIMEOUT: Duration = Duration::from_secs(3);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("bad endpoint uri: {0}")]
    BadUri(String),

    #[error("tls configuration rejected: {0}")]
    Tls(tonic::transport::Error),

    #[error("dial failed: {0}")]
    Connect(tonic::transport::Error),

    #[error("channel probe failed: {0}")]
    Probe(#[from] tonic::Status),

    #[error(transparent)]
    Credential(#[from] CredentialError),
}

/// Where the cloud lives, read from the tree with compiled defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudEndpoint {
    pub host: String,
    pub host_ip: Option<String>,
    pub port: u16,
    pub tls: bool,
}

impl Default for CloudEndpoint {
    fn default() -> Self {
        Self { host: DEFAULT_HOST.to_string(), host_ip: None, port: DEFAULT_PORT, tls: true }
    }
}

impl CloudEndpoint {
    /// Resolve the endpoint: environment override first, then the
    /// `@/cloud/svc_rpc` subtree, then compiled defaults.
    pub async fn discover(cfg: &dyn ConfigHandle) -> Self {
        let mut ep = Self::default();
        if let Some(conn) = env::connection_override() {
            if let Some((host, port)) = split_host_port(&conn) {
                ep.host = host;
                ep.port = port;
            } else {
                ep.host = conn;
            }
            ep.tls = !env::tls_disabled();
            return ep;
        }

        // A BAD_ENDPOINT redirect takes precedence over the static config.
        if let Ok(url) = cfg.get_prop("@/cloud/svc_rpc/url").await {
            if let Some((host, port)) = split_host_port(&url) {
                ep.host = host;
                ep.port = port;
            }
        } else {
            if let Ok(host) = cfg.get_prop("@/cloud/svc_rpc/0/host").await {
                if !host.is_empty() {
                    ep.host = host;
                }
            }
            if let Ok(port) = cfg.get_prop("@/cloud/svc_rpc/0/port").await {
                if let Ok(port) = port.parse() {
                    ep.port = port;
                }
            }
        }
        if let Ok(ip) = cfg.get_prop("@/cloud/svc_rpc/0/hostip").await {
            if !ip.is_empty() {
                ep.host_ip = Some(ip);
            }
        }
        if let Ok(tls) = cfg.get_prop("@/cloud/svc_rpc/0/tls").await {
            ep.tls = tls != "false";
        }
        if env::tls_disabled() {
            ep.tls = false;
        }
        ep
    }

    /// Pick the authority to dial. If the hostname does not resolve
    /// quickly, fall back to the numeric `hostip`, keeping the hostname
    /// for TLS verification.
    async fn target(&self) -> (String, String) {
        let resolves = tokio::time::timeout(
            DNS_PROBE_TIMEOUT,
            tokio::net::lookup_host((self.host.as_str(), self.port)),
        )
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false);

        let authority = if resolves {
            self.host.clone()
        } else if let Some(ip) = &self.host_ip {
            warn!(host = %self.host, ip = %ip, "hostname not resolving, using numeric address");
            ip.clone()
        } else {
            self.host.clone()
        };
        let scheme = if self.tls { "https" } else { "http" };
        (format!("{scheme}://{authority}:{}", self.port), self.host.clone())
    }
}

fn split_host_port(s: &str) -> Option<(String, u16)> {
    let (host, port) = s.rsplit_once(':')?;
    let port = port.parse().ok()?;
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port))
}

/// Exponential dial backoff: doubles per failure, capped at 30 minutes.
#[derive(Debug)]
pub struct Backoff {
    current: Duration,
}

impl Backoff {
    pub fn new() -> Self {
        Self { current: DIAL_BACKOFF_START }
    }

    /// The delay to wait after the latest failure.
    pub fn next(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(DIAL_BACKOFF_CAP);
        delay
    }

    pub fn reset(&mut self) {
        self.current = DIAL_BACKOFF_START;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

/// An authenticated channel to the cloud plus the identity that minted it.
#[derive(Clone)]
pub struct CloudConn {
    channel: Channel,
    cred: Arc<Credential>,
    boot_time: DateTime<Utc>,
}

impl CloudConn {
    pub fn new(channel: Channel, cred: Arc<Credential>, boot_time: DateTime<Utc>) -> Self {
        Self { channel, cred, boot_time }
    }

    pub fn boot_time(&self) -> DateTime<Utc> {
        self.boot_time
    }

    pub fn credential(&self) -> &Arc<Credential> {
        &self.cred
    }

    /// Decorated request with deadline + credential metadata.
    pub fn request<T>(&self, msg: T) -> Result<tonic::Request<T>, CredentialError> {
        self.cred.request(msg, &SystemClock)
    }

    pub fn config_client(&self) -> cloud_rpc::config_back_end_client::ConfigBackEndClient<Channel> {
        cloud_rpc::config_back_end_client::ConfigBackEndClient::new(self.channel.clone())
    }

    pub fn event_client(&self) -> cloud_rpc::event_client::EventClient<Channel> {
        cloud_rpc::event_client::EventClient::new(self.channel.clone())
    }

    pub fn cert_client(
        &self,
    ) -> cloud_rpc::certificate_manager_client::CertificateManagerClient<Channel> {
        cloud_rpc::certificate_manager_client::CertificateManagerClient::new(self.channel.clone())
    }

    pub fn release_client(&self) -> cloud_rpc::release_manager_client::ReleaseManagerClient<Channel> {
        cloud_rpc::release_manager_client::ReleaseManagerClient::new(self.channel.clone())
    }

    /// Validate the channel by publishing a heartbeat.
    pub async fn probe(&self) -> Result<(), TransportError> {
        let now = SystemClock.wall();
        let hb = cloud_rpc::Heartbeat {
            boot_time: Some(ptime::to_proto(self.boot_time)),
            record_time: Some(ptime::to_proto(now)),
        };
        let payload = prost::Message::encode_to_vec(&hb);
        let req = self.request(cloud_rpc::PutEventRequest {
            sub_topic: "heartbeat".to_string(),
            payload: Some(prost_types::Any {
                type_url: ap_cloud::type_url("Heartbeat"),
                value: payload,
            }),
        })?;
        let mut client = self.event_client();
        client.put(req).await?;
        debug!("channel probe heartbeat accepted");
        Ok(())
    }
}

/// Dial and validate a channel to `endpoint`.
pub async fn dial(
    endpoint: &CloudEndpoint,
    cred: Arc<Credential>,
    boot_time: DateTime<Utc>,
) -> Result<CloudConn, TransportError> {
    let (uri, domain) = endpoint.target().await;
    let mut chan = Channel::from_shared(uri.clone())
        .map_err(|e| TransportError::BadUri(format!("{uri}: {e}")))?
        .connect_timeout(CONNECT_TIMEOUT);
    if endpoint.tls {
        chan = chan
            .tls_config(ClientTlsConfig::new().domain_name(domain))
            .map_err(TransportError::Tls)?;
    }
    let channel = chan.connect().await.map_err(TransportError::Connect)?;
    let conn = CloudConn::new(channel, cred, boot_time);
    conn.probe().await?;
    info!(%uri, tls = endpoint.tls, "cloud channel established");
    Ok(conn)
}

#[cfg(test)]
#[path = "transport_tests.rs"]
mod tests;
