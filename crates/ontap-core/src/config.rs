// ── Connection configuration ──
//
// The normalized entry-point options every invocation carries, whether
// they came from a task file, CLI flags, or a config profile.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum::{AsRefStr, Display, EnumString};

use crate::error::CoreError;
use crate::protocol::UseRest;

/// Behaviour toggles shared by all handlers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FeatureFlags {
    /// Log every request and response body.
    pub trace_apis: bool,
    /// Include `modify` in the result of live runs.
    pub show_modified: bool,
    /// Suppress the per-invocation telemetry event.
    pub no_cserver_ems: bool,
}

/// Post-apply verification policy.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    AsRefStr,
    EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ValidateChanges {
    #[default]
    Ignore,
    Warn,
    Error,
}

fn default_true() -> bool {
    true
}

fn default_timeout() -> u64 {
    60
}

fn default_poll_interval() -> u64 {
    1
}

/// Everything needed to reach and drive one cluster.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectionArgs {
    pub hostname: String,
    pub username: String,
    pub password: SecretString,
    #[serde(default = "default_true")]
    pub validate_certs: bool,
    #[serde(default = "default_true")]
    pub https: bool,
    #[serde(default)]
    pub http_port: Option<u16>,
    #[serde(default)]
    pub use_rest: UseRest,
    #[serde(default)]
    pub feature_flags: FeatureFlags,
    #[serde(default)]
    pub ca_cert: Option<PathBuf>,
    /// HTTP request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub validate_changes: ValidateChanges,
    /// Initial job polling interval in seconds.
    #[serde(default = "default_poll_interval")]
    pub job_poll_interval: u64,
}

impl ConnectionArgs {
    pub fn new(
        hostname: impl Into<String>,
        username: impl Into<String>,
        password: SecretString,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            username: username.into(),
            password,
            validate_certs: true,
            https: true,
            http_port: None,
            use_rest: UseRest::Auto,
            feature_flags: FeatureFlags::default(),
            ca_cert: None,
            timeout: default_timeout(),
            validate_changes: ValidateChanges::Ignore,
            job_poll_interval: default_poll_interval(),
        }
    }

    /// Deserialize from the connection half of a parameter mapping.
    pub fn from_map(map: Map<String, Value>) -> Result<Self, CoreError> {
        serde_json::from_value(Value::Object(map)).map_err(|e| CoreError::Config {
            message: format!("invalid connection options: {e}"),
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.job_poll_interval.max(1))
    }
}
