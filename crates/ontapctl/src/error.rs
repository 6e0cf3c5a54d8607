//! CLI error types with miette diagnostics.
//!
//! Wraps engine and config failures with help text, an exit code, and
//! the failure envelope printed on stdout.

use miette::Diagnostic;
use serde::Serialize;
use thiserror::Error;

use ontap_config::ConfigError;
use ontap_core::error::ApiFailure;
use ontap_core::{CoreError, ErrorKind};

/// Process exit codes for failures; success exits `0`.
pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const AUTH: i32 = 3;
    pub const NOT_FOUND: i32 = 4;
    pub const UNSUPPORTED: i32 = 5;
    pub const CONNECTION: i32 = 7;
    pub const TIMEOUT: i32 = 8;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Engine ───────────────────────────────────────────────────────
    #[error("{message}")]
    #[diagnostic(code(ontapctl::engine))]
    Engine {
        message: String,
        kind: ErrorKind,
        failure: Option<ApiFailure>,
        #[help]
        help: Option<String>,
    },

    // ── Task input ───────────────────────────────────────────────────
    #[error("Invalid task file {path}: {reason}")]
    #[diagnostic(
        code(ontapctl::task),
        help(
            "A task file is either a bare parameter mapping or\n\
             {{ resource: <kind>, check_mode: <bool>, params: {{ ... }} }}"
        )
    )]
    Task { path: String, reason: String },

    #[error("No resource kind given")]
    #[diagnostic(
        code(ontapctl::no_resource),
        help(
            "Pass it as `ontapctl apply <resource> -f task.yaml` or set `resource` in the \
             task file.\nRun: ontapctl resources"
        )
    )]
    NoResource,

    #[error("File not found: {path}")]
    #[diagnostic(code(ontapctl::not_found))]
    FileNotFound { path: String },

    // ── Configuration ────────────────────────────────────────────────
    #[error("Profile '{name}' not found in configuration")]
    #[diagnostic(
        code(ontapctl::profile_not_found),
        help("Available profiles: {available}\nConfig file: {path}")
    )]
    ProfileNotFound {
        name: String,
        available: String,
        path: String,
    },

    #[error("No password configured for profile '{profile}'")]
    #[diagnostic(
        code(ontapctl::no_credentials),
        help(
            "Store one with: ontapctl config set-password --profile {profile}\n\
             Or set ONTAP_PASSWORD, or password_env in the profile."
        )
    )]
    NoCredentials { profile: String },

    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(ontapctl::validation))]
    Validation { field: String, reason: String },

    #[error(transparent)]
    #[diagnostic(code(ontapctl::config))]
    Config(ConfigError),

    // ── IO / Serialization ───────────────────────────────────────────
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Engine { kind, .. } => match kind {
                ErrorKind::MissingRequired
                | ErrorKind::MutuallyExclusive
                | ErrorKind::RequiredTogether
                | ErrorKind::InvalidParameter
                | ErrorKind::ValidationError
                | ErrorKind::ConfigError => exit_code::USAGE,
                ErrorKind::AuthenticationError => exit_code::AUTH,
                ErrorKind::UnsupportedVersion | ErrorKind::UnsupportedAttribute => {
                    exit_code::UNSUPPORTED
                }
                ErrorKind::ConnectionError => exit_code::CONNECTION,
                ErrorKind::JobTimeout => exit_code::TIMEOUT,
                _ => exit_code::GENERAL,
            },
            Self::Task { .. } | Self::NoResource | Self::Validation { .. } => exit_code::USAGE,
            Self::FileNotFound { .. } | Self::ProfileNotFound { .. } => exit_code::NOT_FOUND,
            Self::NoCredentials { .. } => exit_code::AUTH,
            Self::Config(_) | Self::Io(_) => exit_code::GENERAL,
        }
    }

    /// Machine-readable kind for the failure envelope.
    fn kind_name(&self) -> &'static str {
        match self {
            Self::Engine { kind, .. } => kind.into(),
            Self::Task { .. } | Self::NoResource | Self::Validation { .. } => "invalid_parameter",
            Self::NoCredentials { .. } => "authentication_error",
            Self::FileNotFound { .. } | Self::ProfileNotFound { .. } | Self::Config(_) => {
                "config_error"
            }
            Self::Io(_) => "internal_error",
        }
    }

    /// The `{failed, msg, kind, api, code, target}` envelope.
    pub fn envelope(&self) -> FailureEnvelope {
        let failure = match self {
            Self::Engine { failure, .. } => failure.clone(),
            _ => None,
        };
        let failure = failure.unwrap_or_default();
        FailureEnvelope {
            failed: true,
            msg: self.to_string(),
            kind: self.kind_name(),
            api: failure.api,
            code: failure.code,
            target: failure.target,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct FailureEnvelope {
    pub failed: bool,
    pub msg: String,
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

// ── CoreError → CliError mapping ─────────────────────────────────────

fn engine_help(kind: ErrorKind) -> Option<String> {
    let text = match kind {
        ErrorKind::AuthenticationError => {
            "Verify the username and password.\nRun: ontapctl config set-password --profile <name>"
        }
        ErrorKind::ConnectionError => {
            "Check the hostname and that HTTPS is reachable.\n\
             Self-signed certificates need --insecure (-k) or ca_cert in the profile."
        }
        ErrorKind::UnsupportedVersion | ErrorKind::UnsupportedAttribute => {
            "Run: ontapctl resources <resource> to see which attributes each interface supports."
        }
        ErrorKind::JobTimeout => {
            "Raise the resource's time_out option, or rerun once the job finishes."
        }
        ErrorKind::InvalidParameter | ErrorKind::MissingRequired => {
            "Run: ontapctl resources <resource> to list accepted attributes."
        }
        _ => return None,
    };
    Some(text.to_owned())
}

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        let kind = err.kind();
        Self::Engine {
            message: err.to_string(),
            kind,
            failure: err.details().cloned(),
            help: engine_help(kind),
        }
    }
}

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::NoCredentials { profile } => Self::NoCredentials { profile },
            ConfigError::Validation { field, reason } => Self::Validation { field, reason },
            ConfigError::UnknownProfile { profile, path } => Self::ProfileNotFound {
                name: profile,
                available: String::new(),
                path: path.display().to_string(),
            },
            other => Self::Config(other),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn engine_kinds_map_to_exit_codes() {
        let usage: CliError = CoreError::invalid("bad").into();
        assert_eq!(usage.exit_code(), exit_code::USAGE);

        let timeout: CliError = CoreError::JobTimeout {
            job_id: "j-1".into(),
            timeout_secs: 30,
        }
        .into();
        assert_eq!(timeout.exit_code(), exit_code::TIMEOUT);

        let internal: CliError = CoreError::Internal("boom".into()).into();
        assert_eq!(internal.exit_code(), exit_code::GENERAL);
    }

    #[test]
    fn envelope_carries_controller_details() {
        let err: CliError = CoreError::Create {
            resource: "volume".into(),
            name: "vol1".into(),
            failure: ApiFailure {
                api: Some("storage/volumes".into()),
                status: Some(400),
                code: Some("917927".into()),
                message: "Aggregate not found".into(),
                target: Some("aggregates".into()),
            },
        }
        .into();
        let envelope = serde_json::to_value(err.envelope()).unwrap();
        assert_eq!(envelope["failed"], true);
        assert_eq!(envelope["kind"], "create_error");
        assert_eq!(envelope["api"], "storage/volumes");
        assert_eq!(envelope["code"], "917927");
        assert_eq!(envelope["target"], "aggregates");
        assert_eq!(envelope["msg"], "Error creating volume vol1: Aggregate not found");
    }

    #[test]
    fn missing_password_is_an_auth_failure() {
        let err: CliError = ConfigError::NoCredentials {
            profile: "lab".into(),
        }
        .into();
        assert_eq!(err.exit_code(), exit_code::AUTH);
        assert_eq!(err.envelope().kind, "authentication_error");
    }
}
