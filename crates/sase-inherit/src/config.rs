//! Controller Configuration
//!
//! The operator document (`connection` + `inheritance_policies`) and the
//! runtime knobs of the controller.

use crate::error::{InheritError, Result};
use crate::model::{ContainerKind, GroupId};
use crate::policy::{InheritancePolicy, PolicyMap};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Fabric controller endpoint and credentials.
///
/// Opaque to the engine; forwarded to the fabric client session.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub ip_address: String,
    pub user_name: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub use_https: bool,
}

impl ConnectionConfig {
    /// Controller base URL
    pub fn url(&self) -> String {
        let scheme = if self.use_https { "https" } else { "http" };
        format!("{}://{}", scheme, self.ip_address)
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("ip_address", &self.ip_address)
            .field("user_name", &self.user_name)
            .field("password", &"<redacted>")
            .field("use_https", &self.use_https)
            .finish()
    }
}

/// One entry of `inheritance_policies`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyEntry {
    #[serde(alias = "epg")]
    pub group: GroupId,
    pub allowed: bool,
    pub enabled: bool,
}

/// Operator configuration document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InheritConfig {
    #[serde(alias = "apic")]
    pub connection: ConnectionConfig,
    pub inheritance_policies: Vec<PolicyEntry>,
}

impl InheritConfig {
    /// Parse and validate a JSON document
    pub fn from_value(document: &serde_json::Value) -> Result<Self> {
        let config: Self = serde_json::from_value(document.clone())
            .map_err(|e| InheritError::ConfigValidation(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a JSON string
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)
            .map_err(|e| InheritError::ConfigValidation(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Reject documents that cannot be applied as a whole
    pub fn validate(&self) -> Result<()> {
        if self.connection.ip_address.trim().is_empty() {
            return Err(InheritError::ConfigValidation(
                "connection.ip_address is empty".to_string(),
            ));
        }

        let mut seen = BTreeSet::new();
        for (index, entry) in self.inheritance_policies.iter().enumerate() {
            let group = &entry.group;
            if group.tenant.trim().is_empty()
                || group.container.name.trim().is_empty()
                || group.name.trim().is_empty()
            {
                return Err(InheritError::ConfigValidation(format!(
                    "inheritance_policies[{}]: tenant, container and name must be set",
                    index
                )));
            }
            if group.container.kind != ContainerKind::L3Out {
                return Err(InheritError::ConfigValidation(format!(
                    "inheritance_policies[{}]: {} is not in an l3out container",
                    index, group
                )));
            }
            if !seen.insert(group) {
                return Err(InheritError::ConfigValidation(format!(
                    "inheritance_policies[{}]: duplicate entry for {}",
                    index, group
                )));
            }
        }
        Ok(())
    }

    /// Policy map described by this document
    pub fn policy_map(&self) -> PolicyMap {
        self.inheritance_policies
            .iter()
            .map(|e| (e.group.clone(), InheritancePolicy::new(e.allowed, e.enabled)))
            .collect()
    }

    /// Example document for operators
    pub fn sample() -> Self {
        Self {
            connection: ConnectionConfig {
                ip_address: "10.0.0.1".into(),
                user_name: "admin".into(),
                password: "password".into(),
                use_https: true,
            },
            inheritance_policies: vec![
                PolicyEntry {
                    group: GroupId::outside("tenant1", "l3out1", "parent-epg"),
                    allowed: true,
                    enabled: false,
                },
                PolicyEntry {
                    group: GroupId::outside("tenant1", "l3out1", "child-epg"),
                    allowed: false,
                    enabled: true,
                },
            ],
        }
    }
}

/// Runtime settings of the controller
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Size of the worker pool
    pub workers: usize,
    /// Window in which requests for the same scope are coalesced
    pub debounce: Duration,
    /// Backoff for transient fabric failures
    pub retry: RetryPolicy,
    /// Periodic full rescan of known scopes
    pub resync_interval: Option<Duration>,
    /// Fresh recomputes allowed after a push conflict
    pub max_conflict_recomputes: u32,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            debounce: Duration::from_millis(250),
            retry: RetryPolicy::default(),
            resync_interval: Some(Duration::from_secs(300)),
            max_conflict_recomputes: 3,
        }
    }
}
