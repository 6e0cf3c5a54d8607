// ── Protocol selection ──
//
// Chooses REST or ZAPI for one invocation from the user preference,
// the probed controller, and the capability gates of the attributes
// the user actually supplied.

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use tracing::warn;

use crate::capability::{Capability, Support};
use crate::error::CoreError;
use crate::version::{OntapVersion, VersionInfo};

/// User preference for the management surface.
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
pub enum UseRest {
    Always,
    #[default]
    Auto,
    Never,
}

/// The surface an invocation runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, AsRefStr)]
pub enum Protocol {
    #[strum(serialize = "REST")]
    #[serde(rename = "REST")]
    Rest,
    #[strum(serialize = "ZAPI")]
    #[serde(rename = "ZAPI")]
    Zapi,
}

/// Which surfaces a resource handler implements at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Surfaces {
    pub rest: bool,
    pub zapi: bool,
    /// Lowest release on which the handler's REST endpoints exist.
    pub rest_min_version: Option<OntapVersion>,
}

impl Surfaces {
    pub const BOTH: Self = Self {
        rest: true,
        zapi: true,
        rest_min_version: None,
    };

    pub const REST_ONLY: Self = Self {
        rest: true,
        zapi: false,
        rest_min_version: None,
    };

    pub const fn rest_since(mut self, version: OntapVersion) -> Self {
        self.rest_min_version = Some(version);
        self
    }
}

/// Outcome of a successful selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub protocol: Protocol,
    pub warnings: Vec<String>,
}

/// Why REST cannot carry a given attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
enum RestBlocker {
    ZapiOnly(&'static str),
    Version(&'static str, OntapVersion),
}

impl RestBlocker {
    fn name(&self) -> &'static str {
        match self {
            Self::ZapiOnly(name) | Self::Version(name, _) => name,
        }
    }
}

/// Pick a protocol for a handler given the requested attribute names.
///
/// `requested` holds only keys the user supplied with a non-null value.
/// Attribute-level `min_version` gates apply to both surfaces and are
/// checked after the protocol is chosen.
pub fn select(
    resource: &str,
    preference: UseRest,
    info: &VersionInfo,
    surfaces: Surfaces,
    capabilities: &[Capability],
    requested: &[String],
) -> Result<Selection, CoreError> {
    let requested_caps: Vec<&Capability> = capabilities
        .iter()
        .filter(|cap| requested.iter().any(|r| r == cap.name))
        .collect();

    let rest_blockers: Vec<RestBlocker> = requested_caps
        .iter()
        .filter_map(|cap| match cap.support {
            Support::ZapiOnly => Some(RestBlocker::ZapiOnly(cap.name)),
            _ => cap
                .rest_min_version
                .filter(|v| !info.meets(*v))
                .map(|v| RestBlocker::Version(cap.name, v)),
        })
        .collect();
    let zapi_blockers: Vec<&'static str> = requested_caps
        .iter()
        .filter(|cap| cap.support == Support::RestOnly)
        .map(|cap| cap.name)
        .collect();

    let handler_rest_version_ok = surfaces.rest_min_version.is_none_or(|v| info.meets(v));
    let rest_viable = surfaces.rest
        && info.rest_available
        && handler_rest_version_ok
        && rest_blockers.is_empty();
    let zapi_viable = surfaces.zapi && zapi_blockers.is_empty();

    let protocol = match preference {
        UseRest::Never => {
            if !surfaces.zapi {
                return Err(unsupported(
                    format!(
                        "Error: {resource} is only supported with REST, but use_rest is set to \
                         never."
                    ),
                    Vec::new(),
                    Protocol::Zapi,
                ));
            }
            if !zapi_blockers.is_empty() {
                return Err(unsupported(
                    format!(
                        "Error: {} only supported with REST, but use_rest is set to never.",
                        zapi_blockers.join(", ")
                    ),
                    zapi_blockers.iter().map(|s| (*s).to_owned()).collect(),
                    Protocol::Zapi,
                ));
            }
            Protocol::Zapi
        }
        UseRest::Always => {
            if !surfaces.rest {
                return Err(unsupported(
                    format!(
                        "Error: {resource} is only supported with ZAPI, but use_rest is set to \
                         always."
                    ),
                    Vec::new(),
                    Protocol::Rest,
                ));
            }
            if !info.rest_available {
                return Err(unsupported(
                    "Error: REST is not available on this cluster, but use_rest is set to always."
                        .into(),
                    Vec::new(),
                    Protocol::Rest,
                ));
            }
            if let Some(required) = surfaces.rest_min_version.filter(|v| !info.meets(*v)) {
                return Err(CoreError::UnsupportedVersion {
                    attribute: format!("{resource} with REST"),
                    required,
                    current: info.version,
                });
            }
            if let Some(err) = rest_blocker_error(&rest_blockers, info) {
                return Err(err);
            }
            Protocol::Rest
        }
        UseRest::Auto => {
            if rest_viable {
                Protocol::Rest
            } else if zapi_viable {
                Protocol::Zapi
            } else if surfaces.rest && info.rest_available && handler_rest_version_ok {
                // REST is up but an attribute is not; say which.
                return Err(rest_blocker_error(&rest_blockers, info).unwrap_or_else(|| {
                    CoreError::Internal("protocol selection exhausted".into())
                }));
            } else if !surfaces.zapi {
                return Err(match surfaces.rest_min_version.filter(|v| !info.meets(*v)) {
                    Some(required) => CoreError::UnsupportedVersion {
                        attribute: format!("{resource} with REST"),
                        required,
                        current: info.version,
                    },
                    None => unsupported(
                        format!(
                            "Error: {resource} requires REST, which is not available on this \
                             cluster."
                        ),
                        Vec::new(),
                        Protocol::Rest,
                    ),
                });
            } else {
                return Err(unsupported(
                    format!(
                        "Error: {} only supported with REST, and REST is not usable for \
                         {resource}.",
                        zapi_blockers.join(", ")
                    ),
                    zapi_blockers.iter().map(|s| (*s).to_owned()).collect(),
                    Protocol::Zapi,
                ));
            }
        }
    };

    let mut warnings = Vec::new();
    if preference == UseRest::Auto
        && protocol == Protocol::Zapi
        && info.rest_available
        && surfaces.rest
    {
        let names: Vec<&str> = rest_blockers.iter().map(RestBlocker::name).collect();
        let reason = if names.is_empty() {
            format!("{resource} is not supported with REST on this version")
        } else {
            format!("unsupported option(s) in REST: {}", names.join(", "))
        };
        let message = format!("Falling back to ZAPI because of {reason}.");
        warn!(resource, %message, "protocol fallback");
        warnings.push(message);
    }

    for cap in &requested_caps {
        if let Some(required) = cap.min_version {
            info.require(cap.name, required)?;
        }
    }

    Ok(Selection { protocol, warnings })
}

fn rest_blocker_error(blockers: &[RestBlocker], info: &VersionInfo) -> Option<CoreError> {
    if let Some(RestBlocker::Version(name, required)) = blockers
        .iter()
        .find(|b| matches!(b, RestBlocker::Version(..)))
    {
        return Some(CoreError::UnsupportedVersion {
            attribute: format!("{name} with REST"),
            required: *required,
            current: info.version,
        });
    }
    let names: Vec<String> = blockers.iter().map(|b| b.name().to_owned()).collect();
    if names.is_empty() {
        return None;
    }
    Some(unsupported(
        format!(
            "REST API currently does not support '{}'",
            names.join(", ")
        ),
        names,
        Protocol::Rest,
    ))
}

fn unsupported(message: String, attributes: Vec<String>, protocol: Protocol) -> CoreError {
    CoreError::UnsupportedAttribute {
        message,
        attributes,
        protocol: protocol.to_string(),
    }
}
