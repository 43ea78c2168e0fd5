//! `x-incus-*` manifest extensions.
//!
//! Every known key parses into a typed [`Extension`]; anything else becomes a
//! diagnostic variant that the converter logs and ignores.

use super::types::scalar_to_string;
use crate::types::SnapshotPolicy;
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::warn;

pub const DEFAULT_PROFILES: &str = "x-incus-default-profiles";
pub const PROJECT: &str = "x-incus-project";
pub const ADDITIONAL_PROFILES: &str = "x-incus-additional-profiles";
pub const STORAGE: &str = "x-incus-storage";
pub const GPU: &str = "x-incus-gpu";
pub const CLOUD_INIT_USER_DATA: &str = "x-incus-cloud-init-user-data";
pub const CLOUD_INIT_USER_DATA_FILE: &str = "x-incus-cloud-init-user-data-file";
pub const SNAPSHOT: &str = "x-incus-snapshot";
pub const SHIFT: &str = "x-incus-shift";

/// A parsed extension key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extension {
    /// Profiles applied to every service
    DefaultProfiles(Vec<String>),
    /// Control-plane project
    Project(String),
    /// Extra profiles for one service
    AdditionalProfiles(Vec<String>),
    /// Root disk pool override
    Storage(String),
    /// GPU passthrough
    Gpu(bool),
    /// Inline cloud-init user data
    CloudInitUserData(String),
    /// Cloud-init user data read from a file
    CloudInitUserDataFile(PathBuf),
    /// Automatic snapshot policy
    Snapshot(SnapshotPolicy),
    /// ID shifting for a mount
    Shift(bool),
    /// Key this tool does not know
    Unsupported { key: String },
    /// Known key with a value of the wrong type
    Invalid { key: String, expected: &'static str },
}

impl Extension {
    /// Parse one extension entry.
    pub fn parse(key: &str, value: &Value) -> Self {
        let invalid = |expected| Extension::Invalid { key: key.to_string(), expected };
        match key {
            DEFAULT_PROFILES => string_list(value)
                .map(Extension::DefaultProfiles)
                .unwrap_or_else(|| invalid("a list of profile names")),
            ADDITIONAL_PROFILES => string_list(value)
                .map(Extension::AdditionalProfiles)
                .unwrap_or_else(|| invalid("a list of profile names")),
            PROJECT => match value.as_str() {
                Some(s) => Extension::Project(s.to_string()),
                None => invalid("a project name"),
            },
            STORAGE => match value.as_str() {
                Some(s) => Extension::Storage(s.to_string()),
                None => invalid("a storage pool name"),
            },
            GPU => match value.as_bool() {
                Some(b) => Extension::Gpu(b),
                None => invalid("a boolean"),
            },
            SHIFT => match value.as_bool() {
                Some(b) => Extension::Shift(b),
                None => invalid("a boolean"),
            },
            CLOUD_INIT_USER_DATA => match value.as_str() {
                Some(s) => Extension::CloudInitUserData(s.to_string()),
                None => invalid("a string"),
            },
            CLOUD_INIT_USER_DATA_FILE => match value.as_str() {
                Some(s) => Extension::CloudInitUserDataFile(PathBuf::from(s)),
                None => invalid("a file path"),
            },
            SNAPSHOT => snapshot_policy(key, value)
                .map(Extension::Snapshot)
                .unwrap_or_else(|| invalid("a map with schedule, expiry or pattern")),
            _ => Extension::Unsupported { key: key.to_string() },
        }
    }

    /// Log the diagnostic for unsupported or invalid extensions.
    ///
    /// Returns `true` when the extension is usable.
    pub fn report(&self, scope: &str) -> bool {
        match self {
            Extension::Unsupported { key } => {
                warn!(scope, extension = %key, "Unsupported compose extension, ignoring");
                false
            }
            Extension::Invalid { key, expected } => {
                warn!(scope, extension = %key, expected, "Invalid compose extension value, ignoring");
                false
            }
            _ => true,
        }
    }
}

/// Parse every `x-` key of `extra` in key order.
pub fn parse_all(extra: &BTreeMap<String, Value>) -> Vec<Extension> {
    extra
        .iter()
        .filter(|(key, _)| key.starts_with("x-"))
        .map(|(key, value)| Extension::parse(key, value))
        .collect()
}

fn string_list(value: &Value) -> Option<Vec<String>> {
    value.as_sequence()?.iter().map(|v| v.as_str().map(str::to_string)).collect()
}

fn snapshot_policy(key: &str, value: &Value) -> Option<SnapshotPolicy> {
    let mapping = value.as_mapping()?;
    let mut policy = SnapshotPolicy::default();
    for (k, v) in mapping {
        let field = k.as_str()?;
        let v = scalar_to_string(v);
        match field {
            "schedule" => policy.schedule = v,
            "expiry" => policy.expiry = v,
            "pattern" => policy.pattern = v,
            other => warn!(extension = key, field = other, "Unsupported snapshot setting, ignoring"),
        }
    }
    Some(policy)
}
