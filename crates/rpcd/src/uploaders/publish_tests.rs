// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::testing::{MemConfig, MockCloud};

fn sender(
    cloud: Arc<MockCloud>,
    cfg: Arc<MemConfig>,
) -> (EventSender, mpsc::Receiver<String>) {
    let (restart_tx, restart_rx) = mpsc::channel(1);
    (EventSender::new(cloud, cfg, Metrics::new(), restart_tx), restart_rx)
}

#[tokio::test]
async fn success_wraps_payload_with_type_url() {
    let cloud = MockCloud::new();
    let (sender, _rx) = sender(cloud.clone(), MemConfig::new());

    let hb = cloud_rpc::Heartbeat { boot_time: None, record_time: None };
    sender.put("heartbeat", "Heartbeat", &hb).await.unwrap();

    let events = cloud.events.lock().clone();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].0, "heartbeat");
    assert_eq!(events[0].1.type_url, "type.googleapis.com/cloud_rpc.Heartbeat");
}

#[tokio::test]
async fn bad_endpoint_records_url_and_requests_restart() {
    let cloud = MockCloud::new();
    let cfg = MemConfig::new();
    *cloud.event_response.lock() = Some(cloud_rpc::PutEventResponse {
        time: None,
        result: cloud_rpc::put_event_response::Result::BadEndpoint as i32,
        url: "svc2.b10e.net:4430".to_string(),
    });
    let (sender, mut restart_rx) = sender(cloud, cfg.clone());

    let hb = cloud_rpc::Heartbeat { boot_time: None, record_time: None };
    let err = sender.put("heartbeat", "Heartbeat", &hb).await.unwrap_err();
    assert!(matches!(err, PublishError::BadEndpoint(_)));
    assert_eq!(cfg.value(ENDPOINT_URL_PROP).as_deref(), Some("svc2.b10e.net:4430"));
    assert!(restart_rx.try_recv().is_ok());
}

#[tokio::test]
async fn server_error_is_surfaced() {
    let cloud = MockCloud::new();
    *cloud.event_response.lock() = Some(cloud_rpc::PutEventResponse {
        time: None,
        result: cloud_rpc::put_event_response::Result::Error as i32,
        url: String::new(),
    });
    let (sender, _rx) = sender(cloud, MemConfig::new());
    let hb = cloud_rpc::Heartbeat { boot_time: None, record_time: None };
    assert!(matches!(
        sender.put("heartbeat", "Heartbeat", &hb).await,
        Err(PublishError::Server)
    ));
}
