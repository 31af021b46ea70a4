// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Event-broker client: one connection per subscription, delivering
//! serialized payloads to the registered callback.

use ap_core::broker::{Broker, TopicCallback};
use ap_wire::{decode, encode, read_message, write_message, BrokerEnvelope, SubRequest};
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::net::UnixStream;
use tracing::warn;

pub struct UnixBroker {
    socket_path: PathBuf,
}

impl UnixBroker {
    pub fn new(socket_path: PathBuf) -> Self {
        Self { socket_path }
    }
}

#[async_trait]
impl Broker for UnixBroker {
    async fn handle(&self, topic: &str, cb: TopicCallback) -> std::io::Result<()> {
        let mut stream = UnixStream::connect(&self.socket_path).await?;
        let sub = SubRequest { topics: vec![topic.to_string()] };
        let payload =
            encode(&sub).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        write_message(&mut stream, &payload)
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::BrokenPipe, e))?;

        let topic = topic.to_string();
        tokio::spawn(async move {
            loop {
                let raw = match read_message(&mut stream).await {
                    Ok(raw) => raw,
                    Err(e) => {
                        warn!(topic = %topic, error = %e, "broker subscription closed");
                        return;
                    }
                };
                match decode::<BrokerEnvelope>(&raw) {
                    Ok(envelope) => cb(&envelope.payload),
                    Err(e) => warn!(topic = %topic, error = %e, "undecodable broker frame"),
                }
            }
        });
        Ok(())
    }
}
