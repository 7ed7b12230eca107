// Connection profiles
// Seam for persisted per-host connection settings kept outside this crate

use serde::{Deserialize, Serialize};

use crate::auth::types::DeploymentType;

/// Persisted connection settings for one AM host
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionProfile {
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_jwk: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication_service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_type: Option<String>,
}

impl ConnectionProfile {
    pub fn deployment_type(&self) -> Option<DeploymentType> {
        self.deployment_type.as_deref().and_then(|s| s.parse().ok())
    }
}

/// Storage backend for connection profiles.
/// Implementations live outside this crate; the engine only consults `load`
/// when credentials are missing and calls `save` after a fresh connect.
pub trait ConnectionProfileStore: Send + Sync {
    /// Look up a profile for the given host URL
    fn load(&self, host: &str) -> Option<ConnectionProfile>;

    /// Persist a profile, replacing any previous one for the same host
    fn save(&self, profile: &ConnectionProfile) -> anyhow::Result<()>;
}
