// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Trait seam over the cloud RPC surface.
//!
//! The daemon's loops talk to this trait rather than to tonic clients
//! directly, so tests can substitute a scripted cloud.

use crate::ptime;
use crate::transport::CloudConn;
use ap_cloud::cloud_rpc;
use ap_core::SystemClock;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use tonic::Status;

/// Stream of command batches from `FetchStream`.
pub type CmdStream = BoxStream<'static, Result<cloud_rpc::FetchResponse, Status>>;

fn now_proto() -> prost_types::Timestamp {
    ptime::to_proto(ap_core::Clock::wall(&SystemClock))
}

fn internal(e: crate::credential::CredentialError) -> Status {
    Status::internal(format!("credential: {e}"))
}

/// The cloud, as seen from the appliance.
#[async_trait]
pub trait CloudClient: Send + Sync {
    async fn hello(&self, version: &str) -> Result<(), Status>;

    async fn update(&self, updates: Vec<cloud_rpc::CfgUpdate>) -> Result<(), Status>;

    async fn complete_cmds(&self, completions: Vec<cloud_rpc::CfgCompletion>)
        -> Result<(), Status>;

    async fn fetch_stream(&self, last_cmd_id: i64, max_cmds: u32) -> Result<CmdStream, Status>;

    async fn download(&self) -> Result<cloud_rpc::Download, Status>;

    async fn put_event(
        &self,
        sub_topic: &str,
        payload: prost_types::Any,
    ) -> Result<cloud_rpc::PutEventResponse, Status>;

    async fn cert_download(
        &self,
        fingerprint: Vec<u8>,
    ) -> Result<cloud_rpc::CertificateResponse, Status>;

    async fn fetch_descriptor(&self) -> Result<String, Status>;
}

fn check_response(resp: cloud_rpc::ConfigResponse) -> Result<(), Status> {
    match cloud_rpc::config_response::OpResult::try_from(resp.result) {
        Ok(cloud_rpc::config_response::OpResult::Success) => Ok(()),
        _ => Err(Status::internal(resp.errmsg)),
    }
}

#[async_trait]
impl CloudClient for CloudConn {
    async fn hello(&self, version: &str) -> Result<(), Status> {
        let req = self
            .request(cloud_rpc::Hello { time: Some(now_proto()), version: version.to_string() })
            .map_err(internal)?;
        let resp = self.config_client().hello(req).await?.into_inner();
        check_response(resp)
    }

    async fn update(&self, updates: Vec<cloud_rpc::CfgUpdate>) -> Result<(), Status> {
        let req = self
            .request(cloud_rpc::BackEndUpdate { time: Some(now_proto()), updates })
            .map_err(internal)?;
        let resp = self.config_client().update(req).await?.into_inner();
        check_response(resp)
    }

    async fn complete_cmds(
        &self,
        completions: Vec<cloud_rpc::CfgCompletion>,
    ) -> Result<(), Status> {
        let req = self
            .request(cloud_rpc::Completions { time: Some(now_proto()), completions })
            .map_err(internal)?;
        let resp = self.config_client().complete_cmds(req).await?.into_inner();
        check_response(resp)
    }

    async fn fetch_stream(&self, last_cmd_id: i64, max_cmds: u32) -> Result<CmdStream, Status> {
        let req = self
            .request(cloud_rpc::FetchCmds { time: Some(now_proto()), last_cmd_id, max_cmds })
            .map_err(internal)?;
        let stream = self.config_client().fetch_stream(req).await?.into_inner();
        Ok(stream.boxed())
    }

    async fn download(&self) -> Result<cloud_rpc::Download, Status> {
        let req = self
            .request(cloud_rpc::DownloadRequest { time: Some(now_proto()) })
            .map_err(internal)?;
        Ok(self.config_client().download(req).await?.into_inner())
    }

    async fn put_event(
        &self,
        sub_topic: &str,
        payload: prost_types::Any,
    ) -> Result<cloud_rpc::PutEventResponse, Status> {
        let req = self
            .request(cloud_rpc::PutEventRequest {
                sub_topic: sub_topic.to_string(),
                payload: Some(payload),
            })
            .map_err(internal)?;
        Ok(self.event_client().put(req).await?.into_inner())
    }

    async fn cert_download(
        &self,
        fingerprint: Vec<u8>,
    ) -> Result<cloud_rpc::CertificateResponse, Status> {
        let req = self
            .request(cloud_rpc::CertificateRequest { cert_fingerprint: fingerprint })
            .map_err(internal)?;
        Ok(self.cert_client().download(req).await?.into_inner())
    }

    async fn fetch_descriptor(&self) -> Result<String, Status> {
        let req =
            self.request(cloud_rpc::ReleaseRequest { time: Some(now_proto()) }).map_err(internal)?;
        Ok(self.release_client().fetch_descriptor(req).await?.into_inner().release)
    }
}
