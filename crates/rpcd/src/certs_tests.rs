// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::testing::{MemConfig, MockCloud};
use ap_cloud::cloud_rpc;

struct RecordingInstaller {
    pub installs: Mutex<Vec<(Vec<u8>, Vec<u8>, Vec<u8>)>>,
}

impl RecordingInstaller {
    fn new() -> Arc<Self> {
        Arc::new(Self { installs: Mutex::new(Vec::new()) })
    }
}

#[async_trait]
impl CertInstaller for RecordingInstaller {
    async fn install(&self, key: &[u8], cert: &[u8], issuer: &[u8]) -> std::io::Result<()> {
        self.installs.lock().push((key.to_vec(), cert.to_vec(), issuer.to_vec()));
        Ok(())
    }
}

fn fp(byte: u8) -> CertFingerprint {
    CertFingerprint::new([byte; 20])
}

fn seed_installed(cfg: &MemConfig, fp: CertFingerprint, origin: &str) {
    cfg.seed(&format!("@/certs/{fp}/state"), "installed");
    cfg.seed(&format!("@/certs/{fp}/origin"), origin);
}

fn cert_response(fp: CertFingerprint) -> cloud_rpc::CertificateResponse {
    cloud_rpc::CertificateResponse {
        fingerprint: fp.as_bytes().to_vec(),
        key: b"KEY".to_vec(),
        certificate: b"CERT".to_vec(),
        issuer_cert: b"ISSUER".to_vec(),
        expiration: Some(prost_types::Timestamp { seconds: 2_000_000_000, nanos: 0 }),
    }
}

fn controller(
    cloud: Arc<MockCloud>,
    cfg: Arc<MemConfig>,
    installer: Arc<RecordingInstaller>,
) -> Arc<CertController<ap_core::FakeClock>> {
    CertController::new(cloud, cfg, installer, ap_core::FakeClock::new())
}

#[test]
fn retry_schedule_shape() {
    assert_eq!(RETRY_SCHEDULE[0], 1);
    assert_eq!(RETRY_SCHEDULE[7], 15);
    assert_eq!(RETRY_SCHEDULE[12], 300);
    assert_eq!(*RETRY_SCHEDULE.last().unwrap(), 3600);
}

#[tokio::test]
async fn idempotent_when_server_returns_same_fingerprint() {
    let cloud = MockCloud::new();
    let cfg = MemConfig::new();
    let installer = RecordingInstaller::new();
    seed_installed(&cfg, fp(0xaa), "cloud");
    *cloud.cert_response.lock() = Some(cert_response(fp(0xaa)));

    let ctl = controller(cloud.clone(), cfg.clone(), installer.clone());
    assert_eq!(ctl.tick().await.unwrap(), TickOutcome::UpToDate);
    assert!(installer.installs.lock().is_empty(), "no files touched on fingerprint match");
    // The request carried our fingerprint
    assert_eq!(cloud.cert_requests.lock()[0], fp(0xaa).as_bytes().to_vec());
}

#[tokio::test]
async fn replacement_installs_and_removes_old_subtree() {
    let cloud = MockCloud::new();
    let cfg = MemConfig::new();
    let installer = RecordingInstaller::new();
    seed_installed(&cfg, fp(0xaa), "cloud");
    *cloud.cert_response.lock() = Some(cert_response(fp(0xbb)));

    let ctl = controller(cloud, cfg.clone(), installer.clone());
    assert_eq!(ctl.tick().await.unwrap(), TickOutcome::Installed);

    assert_eq!(installer.installs.lock().len(), 1);
    assert_eq!(cfg.value(&format!("@/certs/{}/state", fp(0xbb))).as_deref(), Some("installed"));
    assert_eq!(cfg.value(&format!("@/certs/{}/origin", fp(0xbb))).as_deref(), Some("cloud"));
    assert!(cfg.value(&format!("@/certs/{}/state", fp(0xaa))).is_none(), "old subtree deleted");
    // Expiration recorded from the server's cert record
    assert!(cfg.expiry(&format!("@/certs/{}/state", fp(0xbb))).is_some());
}

#[tokio::test]
async fn non_cloud_origin_certs_never_short_circuit() {
    let cloud = MockCloud::new();
    let cfg = MemConfig::new();
    let installer = RecordingInstaller::new();
    seed_installed(&cfg, fp(0xcc), "factory");
    *cloud.cert_response.lock() = Some(cert_response(fp(0xdd)));

    let ctl = controller(cloud.clone(), cfg, installer);
    ctl.tick().await.unwrap();
    // Request went out with an empty fingerprint: nothing counted as installed
    assert!(cloud.cert_requests.lock()[0].is_empty());
}

#[tokio::test]
async fn available_event_downloads_that_fingerprint() {
    let cloud = MockCloud::new();
    let cfg = MemConfig::new();
    let installer = RecordingInstaller::new();
    seed_installed(&cfg, fp(0xaa), "cloud");
    *cloud.cert_response.lock() = Some(cert_response(fp(0xbb)));

    let ctl = controller(cloud.clone(), cfg.clone(), installer.clone());
    ctl.register_watches().await.unwrap();

    // Cloud stages a replacement
    cfg.execute(&[ap_core::CfgOp::create(format!("@/certs/{}/state", fp(0xbb)), "available")])
        .await
        .unwrap();
    let event = ctl.pending.lock().pop_front().expect("watch should have enqueued");
    assert_eq!(event, CertEvent::Available(fp(0xbb)));

    ctl.handle_event(event).await.unwrap();
    assert_eq!(cloud.cert_requests.lock()[0], fp(0xbb).as_bytes().to_vec());
    assert_eq!(installer.installs.lock().len(), 1);
    assert_eq!(cfg.value(&format!("@/certs/{}/state", fp(0xbb))).as_deref(), Some("installed"));
    assert!(cfg.value(&format!("@/certs/{}/state", fp(0xaa))).is_none());
}

#[tokio::test]
async fn expiry_with_no_remaining_cert_generates_self_signed() {
    let cloud = MockCloud::new();
    let cfg = MemConfig::new();
    let installer = RecordingInstaller::new();
    seed_installed(&cfg, fp(0xaa), "cloud");

    let ctl = controller(cloud, cfg.clone(), installer.clone());
    ctl.handle_event(CertEvent::Expired(fp(0xaa))).await.unwrap();

    assert!(cfg.value(&format!("@/certs/{}/state", fp(0xaa))).is_none());
    // A self-signed cert was installed and recorded
    assert_eq!(installer.installs.lock().len(), 1);
    let (key, cert, _) = &installer.installs.lock()[0];
    assert!(String::from_utf8_lossy(key).contains("PRIVATE KEY"));
    assert!(String::from_utf8_lossy(cert).contains("BEGIN CERTIFICATE"));
    let self_signed = cfg
        .tree_snapshot()
        .into_iter()
        .any(|(path, value)| path.ends_with("/origin") && value == "self");
    assert!(self_signed, "tree should record a self-origin cert");
}

#[tokio::test]
async fn expiry_with_surviving_cert_skips_fallback() {
    let cloud = MockCloud::new();
    let cfg = MemConfig::new();
    let installer = RecordingInstaller::new();
    seed_installed(&cfg, fp(0xaa), "cloud");
    seed_installed(&cfg, fp(0xbb), "cloud");

    let ctl = controller(cloud, cfg.clone(), installer.clone());
    ctl.handle_event(CertEvent::Expired(fp(0xaa))).await.unwrap();
    assert!(installer.installs.lock().is_empty());
    assert_eq!(cfg.value(&format!("@/certs/{}/state", fp(0xbb))).as_deref(), Some("installed"));
}

#[test]
fn fingerprint_path_parsing() {
    let fp_hex = fp(0xab).to_string();
    assert_eq!(fingerprint_of_path(&format!("@/certs/{fp_hex}/state")), Some(fp(0xab)));
    assert!(fingerprint_of_path("@/certs/nothex/state").is_none());
    assert!(fingerprint_of_path("@/certs/abcd/origin").is_none());
}
