// ── Core error types ──
//
// One variant per failure kind the engine can surface. Controller
// details (API path, code, message, target) ride along in `ApiFailure`
// so the entry point can render a failure envelope without reaching
// back into `ontap_api`.

use serde::Serialize;
use strum::{AsRefStr, Display, IntoStaticStr};
use thiserror::Error;

use crate::version::OntapVersion;

/// What the controller said when a call failed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApiFailure {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

impl From<&ontap_api::Error> for ApiFailure {
    fn from(err: &ontap_api::Error) -> Self {
        Self {
            api: err.api().map(str::to_owned),
            status: err.status(),
            code: err.code().map(str::to_owned),
            message: err.message(),
            target: err.target().map(str::to_owned),
        }
    }
}

/// Stable, machine-readable failure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    MissingRequired,
    MutuallyExclusive,
    RequiredTogether,
    InvalidParameter,
    UnsupportedVersion,
    UnsupportedAttribute,
    FetchError,
    CreateError,
    ModifyError,
    DeleteError,
    RenameError,
    JobFailed,
    JobTimeout,
    ValidationError,
    VerifyError,
    AuthenticationError,
    ConnectionError,
    ConfigError,
    InternalError,
}

/// Unified error type for the engine.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Argument validation ──────────────────────────────────────────
    #[error("missing required arguments: {}", names.join(", "))]
    MissingRequired { names: Vec<String> },

    #[error("parameters are mutually exclusive: {}", names.join("|"))]
    MutuallyExclusive { names: Vec<String> },

    #[error("parameters are required together: {}", names.join(", "))]
    RequiredTogether { names: Vec<String> },

    #[error("{message}")]
    InvalidParameter { message: String },

    // ── Protocol selection ───────────────────────────────────────────
    #[error("Minimum version of ONTAP for {attribute} is {required}.  Current version: {current}.")]
    UnsupportedVersion {
        attribute: String,
        required: OntapVersion,
        current: OntapVersion,
    },

    #[error("{message}")]
    UnsupportedAttribute {
        message: String,
        attributes: Vec<String>,
        protocol: String,
    },

    #[error("Error: modifying {} is not supported for {resource} {name}.", attributes.join(", "))]
    Unmodifiable {
        resource: String,
        name: String,
        attributes: Vec<String>,
    },

    // ── Controller errors ────────────────────────────────────────────
    #[error("Error fetching {resource} {name}: {}", failure.message)]
    Fetch {
        resource: String,
        name: String,
        failure: ApiFailure,
    },

    #[error("Error creating {resource} {name}: {}", failure.message)]
    Create {
        resource: String,
        name: String,
        failure: ApiFailure,
    },

    #[error("Error modifying {resource} {name}: {}", failure.message)]
    Modify {
        resource: String,
        name: String,
        failure: ApiFailure,
    },

    #[error("Error deleting {resource} {name}: {}", failure.message)]
    Delete {
        resource: String,
        name: String,
        failure: ApiFailure,
    },

    #[error("Error renaming {resource} {from} to {name}: {}", failure.message)]
    Rename {
        resource: String,
        from: String,
        name: String,
        failure: ApiFailure,
    },

    // ── Jobs ─────────────────────────────────────────────────────────
    #[error("Error: job {job_id} failed: {message}")]
    JobFailed { job_id: String, message: String },

    #[error("Error: timeout_exceeded waiting for job {job_id} after {timeout_secs}s")]
    JobTimeout { job_id: String, timeout_secs: u64 },

    // ── Handler and verification ─────────────────────────────────────
    /// Handler-level precondition failure; the message is user-facing as is.
    #[error("{message}")]
    Validation { message: String },

    #[error("Error: post-apply verification found differences: {message}")]
    Verify { message: String },

    // ── Session ──────────────────────────────────────────────────────
    #[error("Authentication failed: {}", failure.message)]
    Authentication { failure: ApiFailure },

    #[error("Cannot reach cluster: {message}")]
    Connection {
        message: String,
        failure: ApiFailure,
    },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingRequired { .. } => ErrorKind::MissingRequired,
            Self::MutuallyExclusive { .. } => ErrorKind::MutuallyExclusive,
            Self::RequiredTogether { .. } => ErrorKind::RequiredTogether,
            Self::InvalidParameter { .. } => ErrorKind::InvalidParameter,
            Self::UnsupportedVersion { .. } => ErrorKind::UnsupportedVersion,
            Self::UnsupportedAttribute { .. } | Self::Unmodifiable { .. } => {
                ErrorKind::UnsupportedAttribute
            }
            Self::Fetch { .. } => ErrorKind::FetchError,
            Self::Create { .. } => ErrorKind::CreateError,
            Self::Modify { .. } => ErrorKind::ModifyError,
            Self::Delete { .. } => ErrorKind::DeleteError,
            Self::Rename { .. } => ErrorKind::RenameError,
            Self::JobFailed { .. } => ErrorKind::JobFailed,
            Self::JobTimeout { .. } => ErrorKind::JobTimeout,
            Self::Validation { .. } => ErrorKind::ValidationError,
            Self::Verify { .. } => ErrorKind::VerifyError,
            Self::Authentication { .. } => ErrorKind::AuthenticationError,
            Self::Connection { .. } => ErrorKind::ConnectionError,
            Self::Config { .. } => ErrorKind::ConfigError,
            Self::Internal(_) => ErrorKind::InternalError,
        }
    }

    /// Controller-side details, when the failure came from an API call.
    pub fn details(&self) -> Option<&ApiFailure> {
        match self {
            Self::Fetch { failure, .. }
            | Self::Create { failure, .. }
            | Self::Modify { failure, .. }
            | Self::Delete { failure, .. }
            | Self::Rename { failure, .. }
            | Self::Authentication { failure }
            | Self::Connection { failure, .. } => Some(failure),
            _ => None,
        }
    }

    /// Returns `true` for argument and selection failures raised before any I/O.
    pub fn is_usage(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::MissingRequired
                | ErrorKind::MutuallyExclusive
                | ErrorKind::RequiredTogether
                | ErrorKind::InvalidParameter
                | ErrorKind::ValidationError
        )
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            message: message.into(),
        }
    }
}

// ── Conversion from transport-layer errors ───────────────────────────

/// Errors not tied to a specific resource operation.
///
/// Operation failures are wrapped by the engine with the resource and
/// name, so this only sees probe and session-level failures.
impl From<ontap_api::Error> for CoreError {
    fn from(err: ontap_api::Error) -> Self {
        let failure = ApiFailure::from(&err);
        match err {
            ontap_api::Error::Authentication { .. } => Self::Authentication { failure },
            ontap_api::Error::Transport(_) | ontap_api::Error::Tls(_) => Self::Connection {
                message: err.to_string(),
                failure,
            },
            ontap_api::Error::InvalidUrl(e) => Self::Config {
                message: format!("invalid cluster URL: {e}"),
            },
            other => Self::Internal(other.to_string()),
        }
    }
}
