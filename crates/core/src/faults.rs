// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Fault-report file naming.
//!
//! Spool files are named `kind-<RFC3339Nano>[.uploaded].json`. The
//! timestamp orders reports chronologically; the `.uploaded` suffix marks
//! files already shipped to the cloud.

use chrono::{DateTime, SecondsFormat, Utc};
use std::path::Path;

pub const FAULT_EXT: &str = "json";
pub const UPLOADED_SUFFIX: &str = "uploaded";

/// Parsed form of a fault-spool file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultFileName {
    pub kind: String,
    pub timestamp: DateTime<Utc>,
    pub uploaded: bool,
}

impl FaultFileName {
    pub fn new(kind: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self { kind: kind.into(), timestamp, uploaded: false }
    }

    /// Parse a spool file name. Returns `None` for anything that doesn't
    /// match the `kind-<ts>[.uploaded].json` shape.
    pub fn parse(name: &str) -> Option<Self> {
        let stem = name.strip_suffix(&format!(".{FAULT_EXT}"))?;
        let (stem, uploaded) = match stem.strip_suffix(&format!(".{UPLOADED_SUFFIX}")) {
            Some(s) => (s, true),
            None => (stem, false),
        };
        let (kind, ts) = stem.split_once('-')?;
        if kind.is_empty() {
            return None;
        }
        let timestamp = DateTime::parse_from_rfc3339(ts).ok()?.with_timezone(&Utc);
        Some(Self { kind: kind.to_string(), timestamp, uploaded })
    }

    /// Parse the file-name component of a path.
    pub fn parse_path(path: &Path) -> Option<Self> {
        Self::parse(path.file_name()?.to_str()?)
    }

    /// The on-disk file name for this record.
    pub fn file_name(&self) -> String {
        let ts = self.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true);
        if self.uploaded {
            format!("{}-{}.{}.{}", self.kind, ts, UPLOADED_SUFFIX, FAULT_EXT)
        } else {
            format!("{}-{}.{}", self.kind, ts, FAULT_EXT)
        }
    }

    /// The same name with the uploaded marker set.
    pub fn as_uploaded(&self) -> Self {
        Self { uploaded: true, ..self.clone() }
    }
}

#[cfg(test)]
#[path = "faults_tests.rs"]
mod tests;
