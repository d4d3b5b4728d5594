//! Per-repository command policy.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Parsed `.agent/policy.yaml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RepoPolicy {
    #[serde(default)]
    pub project: Option<ProjectInfo>,
    /// Symbolic key to concrete shell command
    #[serde(default)]
    pub commands: BTreeMap<String, String>,
    #[serde(default)]
    pub security: SecurityPolicy,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectInfo {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecurityPolicy {
    /// Optional allowlist of command keys
    #[serde(default)]
    pub allow: Option<Vec<String>>,
    #[serde(default = "default_forbid_raw")]
    pub forbid_raw_command: bool,
}

const fn default_forbid_raw() -> bool {
    true
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            allow: None,
            forbid_raw_command: default_forbid_raw(),
        }
    }
}
