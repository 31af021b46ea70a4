// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Binary entry point. Invoked as `ap.rpcd` it runs the daemon; aliased
//! to `ap-rpc` it becomes the one-shot CLI.

use ap_rpcd::{cli, env, lifecycle};
use tracing_subscriber::EnvFilter;

fn invoked_as() -> String {
    std::env::args()
        .next()
        .as_deref()
        .map(std::path::Path::new)
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn init_daemon_logging() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let log_dir = env::aproot().join("var/log");
    if std::fs::create_dir_all(&log_dir).is_ok() {
        let appender = tracing_appender::rolling::daily(&log_dir, "rpcd.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
        None
    }
}

#[tokio::main]
async fn main() {
    if invoked_as() == "ap-rpc" {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
        if let Err(e) = cli::main().await {
            eprintln!("ap-rpc: {e:#}");
            std::process::exit(1);
        }
        return;
    }

    let _log_guard = init_daemon_logging();
    match lifecycle::run().await {
        Ok(_) => {}
        Err(_) => std::process::exit(1),
    }
}
