// Shared transport configuration for building reqwest::Client instances.
//
// Both the REST and ZAPI adapters share TLS and timeout settings through
// this module. There is no retry logic here; retries belong to the caller.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::Error;

/// TLS verification mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsMode {
    /// Use the system certificate store.
    System,
    /// Use a custom CA certificate from the given PEM file.
    CustomCa(PathBuf),
    /// Accept any certificate (`validate_certs: false`).
    DangerAcceptInvalid,
}

/// Shared transport configuration for building HTTP clients.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub tls: TlsMode,
    pub timeout: Duration,
    /// Log request and response bodies under the `ontap_api::trace` target.
    pub trace_apis: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            tls: TlsMode::System,
            timeout: Duration::from_secs(60),
            trace_apis: false,
        }
    }
}

impl TransportConfig {
    /// Build a `reqwest::Client` from this config.
    pub fn build_client(&self) -> Result<reqwest::Client, Error> {
        let mut builder = reqwest::Client::builder()
            .timeout(self.timeout)
            .user_agent(concat!("ontapctl/", env!("CARGO_PKG_VERSION")));

        match &self.tls {
            TlsMode::System => {}
            TlsMode::CustomCa(path) => {
                let cert_pem = std::fs::read(path)
                    .map_err(|e| Error::Tls(format!("failed to read CA cert: {e}")))?;
                let cert = reqwest::Certificate::from_pem(&cert_pem)
                    .map_err(|e| Error::Tls(format!("invalid CA cert: {e}")))?;
                builder = builder.add_root_certificate(cert);
            }
            TlsMode::DangerAcceptInvalid => {
                builder = builder.danger_accept_invalid_certs(true);
            }
        }

        builder
            .build()
            .map_err(|e| Error::Tls(format!("failed to build HTTP client: {e}")))
    }

    /// Map the `validate_certs` entry-point flag onto a TLS mode.
    pub fn with_validate_certs(mut self, validate: bool, ca_cert: Option<PathBuf>) -> Self {
        self.tls = match (validate, ca_cert) {
            (false, _) => TlsMode::DangerAcceptInvalid,
            (true, Some(path)) => TlsMode::CustomCa(path),
            (true, None) => TlsMode::System,
        };
        self
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn validate_certs_false_accepts_invalid() {
        let cfg = TransportConfig::default().with_validate_certs(false, None);
        assert_eq!(cfg.tls, TlsMode::DangerAcceptInvalid);
    }

    #[test]
    fn custom_ca_wins_when_validating() {
        let cfg =
            TransportConfig::default().with_validate_certs(true, Some(PathBuf::from("/ca.pem")));
        assert_eq!(cfg.tls, TlsMode::CustomCa(PathBuf::from("/ca.pem")));
    }

    #[test]
    fn missing_ca_file_is_a_tls_error() {
        let cfg = TransportConfig::default()
            .with_validate_certs(true, Some(PathBuf::from("/nonexistent/ca.pem")));
        assert!(matches!(cfg.build_client(), Err(Error::Tls(_))));
    }
}
