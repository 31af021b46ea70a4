// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Cloud credential: appliance identity plus a self-refreshing JWT.
//!
//! Every outbound RPC carries `authorization: bearer <jwt>` and a
//! `clientid` naming the appliance within its registry. Tokens live for
//! [`JWT_LIFETIME`] and are re-minted once the remaining lifetime falls
//! below a quarter of that.

use ap_core::Clock;
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const JWT_LIFETIME: Duration = Duration::from_secs(3600);

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("credential file unreadable: {0}")]
    Io(#[from] std::io::Error),

    #[error("credential file malformed: {0}")]
    BadJson(#[from] serde_json::Error),

    #[error("private key rejected: {0}")]
    BadKey(#[from] jsonwebtoken::errors::Error),

    #[error("credential field {0} is empty")]
    MissingField(&'static str),

    #[error("metadata value rejected: {0}")]
    BadMetadata(#[from] tonic::metadata::errors::InvalidMetadataValue),
}

/// On-disk shape of the cloud secret.
#[derive(Deserialize)]
struct SecretFile {
    project: String,
    region: String,
    registry: String,
    appliance_id: String,
    private_key: String,
}

#[derive(Serialize)]
struct Claims {
    aud: String,
    iat: i64,
    exp: i64,
}

struct CachedToken {
    token: String,
    expires: DateTime<Utc>,
}

/// Appliance identity and signing key.
pub struct Credential {
    project: String,
    client_id: String,
    key: EncodingKey,
    cached: Mutex<Option<CachedToken>>,
}

impl Credential {
    /// Load the credential JSON written at appliance provisioning time.
    pub fn load(path: &Path) -> Result<Self, CredentialError> {
        let raw = std::fs::read_to_string(path)?;
        let secret: SecretFile = serde_json::from_str(&raw)?;
        for (name, value) in [
            ("project", &secret.project),
            ("region", &secret.region),
            ("registry", &secret.registry),
            ("appliance_id", &secret.appliance_id),
            ("private_key", &secret.private_key),
        ] {
            if value.is_empty() {
                return Err(CredentialError::MissingField(name));
            }
        }
        let key = EncodingKey::from_rsa_pem(secret.private_key.as_bytes())?;
        let client_id = format!(
            "projects/{}/locations/{}/registries/{}/appliances/{}",
            secret.project, secret.region, secret.registry, secret.appliance_id
        );
        Ok(Self { project: secret.project, client_id, key, cached: Mutex::new(None) })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Current bearer token, minting a fresh one when the cached token has
    /// less than a quarter of its lifetime left.
    pub fn bearer<C: Clock>(&self, clock: &C) -> Result<String, CredentialError> {
        let now = clock.wall();
        let min_left = chrono::Duration::from_std(JWT_LIFETIME / 4)
            .unwrap_or_else(|_| chrono::Duration::seconds(900));
        {
            let cached = self.cached.lock();
            if let Some(tok) = cached.as_ref() {
                if tok.expires - now >= min_left {
                    return Ok(tok.token.clone());
                }
            }
        }
        let lifetime = chrono::Duration::from_std(JWT_LIFETIME)
            .unwrap_or_else(|_| chrono::Duration::seconds(3600));
        let expires = now + lifetime;
        let claims =
            Claims { aud: self.project.clone(), iat: now.timestamp(), exp: expires.timestamp() };
        let token = jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &self.key)?;
        *self.cached.lock() = Some(CachedToken { token: token.clone(), expires });
        Ok(token)
    }

    /// Wrap a message in a request carrying the per-call deadline and the
    /// credential metadata.
    pub fn request<T, C: Clock>(
        &self,
        msg: T,
        clock: &C,
    ) -> Result<tonic::Request<T>, CredentialError> {
        let mut req = tonic::Request::new(msg);
        req.set_timeout(crate::env::rpc_deadline());
        let bearer = format!("bearer {}", self.bearer(clock)?);
        req.metadata_mut().insert("authorization", bearer.parse()?);
        req.metadata_mut().insert("clientid", self.client_id.parse()?);
        Ok(req)
    }
}

#[cfg(test)]
#[path = "credential_tests.rs"]
mod tests;
