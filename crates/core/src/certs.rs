// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Certificate records as seen through the config tree.
//!
//! Certs live under `@/certs/<fingerprint>/{state, origin}`. The
//! fingerprint is the SHA-1 of the DER certificate, lower-hex on the wire
//! and in property paths.

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// 20-byte SHA-1 fingerprint of a DER certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CertFingerprint([u8; 20]);

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid certificate fingerprint: {0}")]
pub struct FingerprintError(String);

impl CertFingerprint {
    pub fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Fingerprint of a DER-encoded certificate body.
    pub fn of_der(der: &[u8]) -> Self {
        let digest = Sha1::digest(der);
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for CertFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for CertFingerprint {
    type Err = FingerprintError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = hex::decode(s).map_err(|_| FingerprintError(s.to_string()))?;
        let bytes: [u8; 20] = raw.try_into().map_err(|_| FingerprintError(s.to_string()))?;
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for CertFingerprint {
    type Error = FingerprintError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<CertFingerprint> for String {
    fn from(fp: CertFingerprint) -> Self {
        fp.to_string()
    }
}

/// Lifecycle state of a cert record in the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertState {
    Available,
    Installed,
}

crate::simple_display! {
    CertState {
        Available => "available",
        Installed => "installed",
    }
}

impl FromStr for CertState {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(Self::Available),
            "installed" => Ok(Self::Installed),
            _ => Err(()),
        }
    }
}

/// Where a cert came from. Only cloud-origin certs participate in the
/// replacement schedule; others serve traffic but are never a reason to
/// skip a download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertOrigin {
    Cloud,
    SelfSigned,
    Other,
}

impl CertOrigin {
    pub fn parse(s: &str) -> Self {
        match s {
            "cloud" => Self::Cloud,
            "self" => Self::SelfSigned,
            _ => Self::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cloud => "cloud",
            Self::SelfSigned => "self",
            Self::Other => "other",
        }
    }
}

#[cfg(test)]
#[path = "certs_tests.rs"]
mod tests;
