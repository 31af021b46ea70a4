// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Prometheus metrics and the diagnostic HTTP endpoint.

use prometheus::{Encoder, IntCounter, Registry, TextEncoder};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tracing::{info, warn};

/// Counters shared across the daemon's loops.
pub struct Metrics {
    registry: Registry,
    pub events_handled: IntCounter,
    pub updates_sent: IntCounter,
    pub completions_sent: IntCounter,
    pub commands_executed: IntCounter,
    pub reconnects: IntCounter,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        let registry = Registry::new();
        let events_handled = counter(&registry, "rpcd_events_handled", "Events published to the cloud");
        let updates_sent = counter(&registry, "rpcd_updates_sent", "Config updates pushed to the cloud");
        let completions_sent =
            counter(&registry, "rpcd_completions_sent", "Command completions pushed to the cloud");
        let commands_executed =
            counter(&registry, "rpcd_commands_executed", "Cloud commands executed locally");
        let reconnects = counter(&registry, "rpcd_reconnects", "Cloud channel reconnections");
        Arc::new(Self {
            registry,
            events_handled,
            updates_sent,
            completions_sent,
            commands_executed,
            reconnects,
        })
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            warn!(error = %e, "metrics encoding failed");
        }
        String::from_utf8_lossy(&buf).into_owned()
    }
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    // Registration only fails on duplicate or malformed names, which are
    // compile-time constants here.
    #[allow(clippy::expect_used)]
    let c = IntCounter::new(name, help).expect("static counter name");
    let _ = registry.register(Box::new(c.clone()));
    c
}

/// Serve `/metrics` on the diagnostic port until the process exits.
pub async fn serve(metrics: Arc<Metrics>, port: u16) {
    let app = axum::Router::new().route(
        "/metrics",
        axum::routing::get(move || {
            let metrics = Arc::clone(&metrics);
            async move { metrics.render() }
        }),
    );
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            warn!(%addr, error = %e, "diag port unavailable, metrics disabled");
            return;
        }
    };
    info!(%addr, "metrics endpoint up");
    if let Err(e) = axum::serve(listener, app).await {
        warn!(error = %e, "metrics server exited");
    }
}

#[cfg(test)]
#[path = "metrics_tests.rs"]
mod tests;
