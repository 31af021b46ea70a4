// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Release descriptors: a UUID-identified bundle of platform artifacts.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// The only artifact digest the installer accepts.
pub const HASH_TYPE_SHA256: &str = "SHA256";

/// One downloadable artifact within a release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    #[serde(rename = "URL")]
    pub url: String,
    pub filename: String,
    #[serde(rename = "hashtype")]
    pub hash_type: String,
    /// Lower-hex SHA-256 of the artifact body.
    #[serde(rename = "hash")]
    pub hash_hex: String,
}

/// A named, UUID-identified bundle of platform artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseDescriptor {
    #[serde(rename = "release_uuid")]
    pub release_uuid: Uuid,
    pub platform: String,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
}

#[derive(Debug, Error)]
pub enum ReleaseError {
    #[error("descriptor is not valid JSON: {0}")]
    BadJson(#[from] serde_json::Error),

    #[error("descriptor platform {descriptor} does not match appliance platform {appliance}")]
    PlatformMismatch { descriptor: String, appliance: String },

    #[error("artifact {filename} declares unsupported hash type {hash_type}")]
    BadHashType { filename: String, hash_type: String },
}

impl ReleaseDescriptor {
    pub fn from_json(raw: &str) -> Result<Self, ReleaseError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Validate the descriptor against the running platform and the
    /// supported hash types.
    pub fn validate(&self, appliance_platform: &str) -> Result<(), ReleaseError> {
        if self.platform != appliance_platform {
            return Err(ReleaseError::PlatformMismatch {
                descriptor: self.platform.clone(),
                appliance: appliance_platform.to_string(),
            });
        }
        for artifact in &self.artifacts {
            if artifact.hash_type != HASH_TYPE_SHA256 {
                return Err(ReleaseError::BadHashType {
                    filename: artifact.filename.clone(),
                    hash_type: artifact.hash_type.clone(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "release_tests.rs"]
mod tests;
