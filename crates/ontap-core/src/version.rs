// ── Version probe ──
//
// One-shot discovery of the controller's ONTAP release, REST
// reachability, and SAN personality. The result is cached for the
// lifetime of a session and never refreshed.

use std::fmt;

use serde::Serialize;
use tracing::{debug, info};

use ontap_api::{NaElement, RestClient, ZapiClient};

use crate::error::{ApiFailure, CoreError};
use crate::protocol::UseRest;

/// `(generation, major, minor)` of an ONTAP release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct OntapVersion {
    pub generation: u16,
    pub major: u16,
    pub minor: u16,
}

impl OntapVersion {
    pub const fn new(generation: u16, major: u16, minor: u16) -> Self {
        Self {
            generation,
            major,
            minor,
        }
    }
}

/// Rendered as a tuple so diagnostics read `(9, 8, 0)`.
impl fmt::Display for OntapVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.generation, self.major, self.minor)
    }
}

/// What the probe learned about the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VersionInfo {
    pub version: OntapVersion,
    pub rest_available: bool,
    /// All-SAN-array personality: volumes are managed by the controller.
    pub san_optimized: bool,
}

impl VersionInfo {
    /// Returns `true` if the controller runs at least `required`.
    pub fn meets(&self, required: OntapVersion) -> bool {
        self.version >= required
    }

    /// Fail with the standard minimum-version diagnostic when unmet.
    pub fn require(&self, attribute: &str, required: OntapVersion) -> Result<(), CoreError> {
        if self.meets(required) {
            Ok(())
        } else {
            Err(CoreError::UnsupportedVersion {
                attribute: attribute.to_owned(),
                required,
                current: self.version,
            })
        }
    }
}

/// Probe the controller.
///
/// REST is tried first unless the caller forbids it; a transport
/// failure or a 4xx/5xx other than 401 marks REST as unavailable and
/// falls through to `system-get-version` over ZAPI.
pub async fn probe(
    rest: &RestClient,
    zapi: &ZapiClient,
    use_rest: UseRest,
) -> Result<VersionInfo, CoreError> {
    if use_rest != UseRest::Never {
        match probe_rest(rest).await {
            Ok(info) => {
                info!(
                    version = %info.version,
                    san_optimized = info.san_optimized,
                    "REST available"
                );
                return Ok(info);
            }
            Err(err) if err.is_auth() => return Err(CoreError::from(err)),
            Err(err) => debug!(error = %err, "REST probe failed, trying ZAPI"),
        }
    }

    let version = probe_zapi(zapi).await.map_err(|err| {
        if err.is_auth() {
            CoreError::from(err)
        } else {
            CoreError::Connection {
                message: "neither REST nor ZAPI answered the version probe".into(),
                failure: ApiFailure::from(&err),
            }
        }
    })?;
    info!(%version, "ZAPI available");
    Ok(VersionInfo {
        version,
        rest_available: false,
        san_optimized: false,
    })
}

async fn probe_rest(rest: &RestClient) -> Result<VersionInfo, ontap_api::Error> {
    let resp = rest
        .get("cluster", &[("fields", "version,san_optimized".into())])
        .await?;
    let body = resp.body.unwrap_or_default();
    let version = body.get("version").ok_or_else(|| ontap_api::Error::Deserialization {
        message: "cluster record has no version".into(),
        body: body.to_string(),
    })?;
    let part = |key: &str| {
        version
            .get(key)
            .and_then(serde_json::Value::as_u64)
            .and_then(|n| u16::try_from(n).ok())
            .unwrap_or(0)
    };
    Ok(VersionInfo {
        version: OntapVersion::new(part("generation"), part("major"), part("minor")),
        rest_available: true,
        san_optimized: body
            .get("san_optimized")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false),
    })
}

async fn probe_zapi(zapi: &ZapiClient) -> Result<OntapVersion, ontap_api::Error> {
    let results = zapi
        .invoke(&NaElement::new("system-get-version"), false)
        .await?;
    let tuple = results.find("version-tuple.system-version-tuple");
    let part = |key: &str| {
        tuple
            .and_then(|t| t.child_int(key))
            .and_then(|n| u16::try_from(n).ok())
            .unwrap_or(0)
    };
    match tuple {
        Some(_) => Ok(OntapVersion::new(part("generation"), part("major"), part("minor"))),
        None => parse_release_string(results.child_str("version").unwrap_or_default()).ok_or_else(
            || ontap_api::Error::Xml {
                message: "system-get-version returned no version".into(),
            },
        ),
    }
}

/// Parse `"NetApp Release 9.8P4: ..."` into `(9, 8, 0)`.
///
/// Pre-9 releases (`8.3.2`) map the leading digit to the generation.
pub fn parse_release_string(release: &str) -> Option<OntapVersion> {
    let rest = release.split("Release").nth(1)?.trim_start();
    let numeric: String = rest
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let mut parts = numeric.split('.').filter_map(|p| p.parse::<u16>().ok());
    let generation = parts.next()?;
    let major = parts.next().unwrap_or(0);
    let minor = parts.next().unwrap_or(0);
    Some(OntapVersion::new(generation, major, minor))
}
