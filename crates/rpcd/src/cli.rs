// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `ap-rpc` — one-shot CLI surface of the daemon binary.
//!
//! The same executable runs as the daemon when invoked as `ap.rpcd`;
//! aliased to `ap-rpc` it performs a single cloud operation and exits.
//! Exit codes: 0 success, 1 runtime failure, 2 usage error (from clap).

use crate::adapters::UnixConfigHandle;
use crate::cloud_api::CloudClient;
use crate::credential::Credential;
use crate::metrics::Metrics;
use crate::transport::{self, CloudEndpoint};
use crate::uploaders::{heartbeat, EventSender, InventoryUploader};
use crate::env;
use anyhow::{Context, Result};
use ap_core::platform::DirTag;
use ap_core::{ConfigHandle, LinuxPlatform, Platform, SystemClock};
use clap::{Parser, Subcommand};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "ap-rpc", version = env::VERSION, about = "Appliance cloud RPC utility")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Send a config-backend hello and report the result
    Hello,
    /// Publish a single heartbeat event
    Heartbeat,
    /// Publish heartbeats on the daemon's schedule until interrupted
    HeartbeatLoop,
    /// Upload accumulated device inventory
    Inventory {
        /// Ignore the manifest and reship everything
        #[arg(short, long)]
        force: bool,
    },
}

struct Stack {
    cloud: Arc<dyn CloudClient>,
    cfg: Arc<dyn ConfigHandle>,
    platform: Arc<dyn Platform>,
}

async fn build_stack() -> Result<Stack> {
    let platform: Arc<dyn Platform> = Arc::new(LinuxPlatform::probe(env::aproot()));
    let run_dir = platform.expand_dir_path(DirTag::Run, "");
    let cfg: Arc<dyn ConfigHandle> = Arc::new(UnixConfigHandle::new(run_dir.join("configd.sock")));

    let secret_path = platform.expand_dir_path(DirTag::Secret, "rpcd/cloud.secret.json");
    let cred = Arc::new(Credential::load(&secret_path).context("loading cloud credential")?);
    let endpoint = CloudEndpoint::discover(cfg.as_ref()).await;
    let conn = transport::dial(&endpoint, cred, platform.boot_time())
        .await
        .context("dialing cloud endpoint")?;
    Ok(Stack { cloud: Arc::new(conn), cfg, platform })
}

fn sender(stack: &Stack) -> EventSender {
    // One-shot invocations have no orchestrator; restart requests land
    // in a channel nobody reads, which is exactly what we want.
    let (restart_tx, _restart_rx) = tokio::sync::mpsc::channel(1);
    EventSender::new(Arc::clone(&stack.cloud), Arc::clone(&stack.cfg), Metrics::new(), restart_tx)
}

pub async fn main() -> Result<()> {
    let cli = Cli::parse();
    let stack = build_stack().await?;

    match cli.command {
        Command::Hello => {
            stack.cloud.hello(env::VERSION).await.context("hello failed")?;
            println!("hello ok");
        }
        Command::Heartbeat => {
            heartbeat::send_one(&sender(&stack), stack.platform.boot_time(), &SystemClock)
                .await
                .context("heartbeat failed")?;
            println!("heartbeat sent");
        }
        Command::HeartbeatLoop => {
            let (_done_tx, done_rx) = tokio::sync::mpsc::channel(1);
            heartbeat::run(sender(&stack), stack.platform.boot_time(), SystemClock, done_rx).await;
        }
        Command::Inventory { force } => {
            let uploader = InventoryUploader::new(
                sender(&stack),
                stack.platform.expand_dir_path(DirTag::Data, "identifierd"),
                stack.platform.expand_dir_path(DirTag::Data, "rpcd/identifierd.json.v1"),
                SystemClock,
            );
            uploader.upload(force).await.context("inventory upload failed")?;
            println!("inventory uploaded");
        }
    }
    Ok(())
}
