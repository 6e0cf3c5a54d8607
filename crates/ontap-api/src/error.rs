use thiserror::Error;

/// Top-level error type for the `ontap-api` crate.
///
/// Covers every failure mode of both management surfaces: transport,
/// REST error envelopes, ZAPI `status="failed"` results, and payload
/// decoding. `ontap-core` classifies these into reconciliation outcomes.
#[derive(Debug, Error)]
pub enum Error {
    // ── Transport ───────────────────────────────────────────────────
    /// HTTP transport error (connection refused, DNS failure, timeout, etc.)
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// TLS setup or certificate error.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Credentials rejected (HTTP 401) by either surface.
    #[error("Authentication failed calling {api} (HTTP {status})")]
    Authentication { api: String, status: u16 },

    // ── REST ────────────────────────────────────────────────────────
    /// Structured error from the REST `{"error": {code, message, target}}` envelope.
    #[error("REST error calling {api} (HTTP {status}): {message}")]
    Rest {
        api: String,
        status: u16,
        code: Option<String>,
        message: String,
        target: Option<String>,
    },

    /// A single-record lookup matched more than one record.
    #[error("Expected at most one record from {api}, got {count}")]
    UnexpectedRecords { api: String, count: usize },

    // ── ZAPI ────────────────────────────────────────────────────────
    /// `<results status="failed" errno=".." reason="..">` from ONTAPI.
    #[error("ZAPI error calling {api} (errno {code}): {message}")]
    Zapi {
        api: String,
        code: String,
        message: String,
    },

    /// The ONTAPI response could not be parsed.
    #[error("Malformed ONTAPI XML: {message}")]
    Xml { message: String },

    // ── Data ────────────────────────────────────────────────────────
    /// JSON deserialization failed, with the raw body for debugging.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, body: String },
}

/// Synthesized code for transport timeouts.
pub const TRANSPORT_TIMEOUT_CODE: &str = "60";
/// Synthesized code for every other transport failure.
pub const TRANSPORT_CODE: &str = "transport";

/// First 200 characters of a response body, for error messages.
pub(crate) fn preview(raw: &str) -> String {
    raw.chars().take(200).collect()
}

impl Error {
    /// The controller's error code, or the synthesized transport code.
    ///
    /// REST codes are the envelope's `code` field, ZAPI codes the numeric
    /// `errno` string. Transport timeouts report `"60"`, other transport
    /// failures `"transport"`.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Transport(e) if e.is_timeout() => Some(TRANSPORT_TIMEOUT_CODE),
            Self::Transport(_) => Some(TRANSPORT_CODE),
            Self::Rest { code, .. } => code.as_deref(),
            Self::Zapi { code, .. } => Some(code),
            _ => None,
        }
    }

    /// Human-readable message without the variant prefix.
    pub fn message(&self) -> String {
        match self {
            Self::Rest { message, .. } | Self::Zapi { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// HTTP status, when one was received.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Transport(e) => e.status().map(|s| s.as_u16()),
            Self::Authentication { status, .. } | Self::Rest { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// The offending parameter name reported by the controller, if any.
    pub fn target(&self) -> Option<&str> {
        match self {
            Self::Rest { target, .. } => target.as_deref(),
            _ => None,
        }
    }

    /// The REST path or ZAPI element name the failing call addressed.
    pub fn api(&self) -> Option<&str> {
        match self {
            Self::Authentication { api, .. }
            | Self::Rest { api, .. }
            | Self::UnexpectedRecords { api, .. }
            | Self::Zapi { api, .. } => Some(api),
            _ => None,
        }
    }

    /// Returns `true` for failures below the request/response boundary.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Tls(_))
    }

    /// Returns `true` if the transport gave up waiting for the controller.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Transport(e) if e.is_timeout())
    }

    /// Returns `true` if credentials were rejected.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Authentication { .. })
    }
}
