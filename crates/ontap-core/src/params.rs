// ── Parameter intake ──
//
// Splits an invocation's parameter mapping into connection keys and
// resource keys, enforces declarative argument constraints, and then
// deserializes the resource keys into the handler's typed record.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum::{AsRefStr, Display};

use crate::error::CoreError;

/// Keys consumed by the session, never by a handler.
pub const CONNECTION_KEYS: &[&str] = &[
    "hostname",
    "username",
    "password",
    "validate_certs",
    "https",
    "http_port",
    "use_rest",
    "feature_flags",
    "ca_cert",
    "timeout",
    "validate_changes",
    "job_poll_interval",
];

/// Desired presence of the object.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum State {
    #[default]
    Present,
    Absent,
}

/// `key == value` makes `requires` mandatory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequiredIf {
    pub key: &'static str,
    pub value: &'static str,
    pub requires: &'static [&'static str],
}

/// Declarative argument constraints checked before deserialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgSpec {
    pub required: &'static [&'static str],
    pub mutually_exclusive: &'static [&'static [&'static str]],
    pub required_together: &'static [&'static [&'static str]],
    pub required_if: &'static [RequiredIf],
}

impl ArgSpec {
    pub const NONE: Self = Self {
        required: &[],
        mutually_exclusive: &[],
        required_together: &[],
        required_if: &[],
    };

    /// Only `name` is mandatory.
    pub const NAME: Self = Self {
        required: &["name"],
        ..Self::NONE
    };

    pub fn check(&self, params: &Map<String, Value>) -> Result<(), CoreError> {
        let set = |key: &str| params.get(key).is_some_and(|v| !v.is_null());

        let missing: Vec<String> = self
            .required
            .iter()
            .filter(|k| !set(k))
            .map(|k| (*k).to_owned())
            .collect();
        if !missing.is_empty() {
            return Err(CoreError::MissingRequired { names: missing });
        }

        for group in self.mutually_exclusive {
            let present: Vec<String> = group
                .iter()
                .filter(|k| set(k))
                .map(|k| (*k).to_owned())
                .collect();
            if present.len() > 1 {
                return Err(CoreError::MutuallyExclusive { names: present });
            }
        }

        for group in self.required_together {
            let count = group.iter().filter(|k| set(k)).count();
            if count != 0 && count != group.len() {
                return Err(CoreError::RequiredTogether {
                    names: group.iter().map(|k| (*k).to_owned()).collect(),
                });
            }
        }

        for rule in self.required_if {
            let triggered = params
                .get(rule.key)
                .is_some_and(|v| v.as_str() == Some(rule.value));
            if !triggered {
                continue;
            }
            let missing: Vec<String> = rule
                .requires
                .iter()
                .filter(|k| !set(k))
                .map(|k| (*k).to_owned())
                .collect();
            if !missing.is_empty() {
                return Err(CoreError::MissingRequired { names: missing });
            }
        }
        Ok(())
    }
}

/// Separate connection keys from resource keys.
pub fn split_connection(mut input: Map<String, Value>) -> (Map<String, Value>, Map<String, Value>) {
    let mut connection = Map::new();
    for key in CONNECTION_KEYS {
        if let Some(value) = input.remove(*key) {
            connection.insert((*key).to_owned(), value);
        }
    }
    (connection, input)
}

/// Keys the user supplied with a non-null value.
pub fn requested(params: &Map<String, Value>) -> Vec<String> {
    params
        .iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, _)| k.clone())
        .collect()
}

/// Check constraints, then deserialize into the handler's record.
pub fn parse<P: DeserializeOwned>(
    spec: &ArgSpec,
    params: &Map<String, Value>,
) -> Result<P, CoreError> {
    spec.check(params)?;
    serde_json::from_value(Value::Object(params.clone()))
        .map_err(|e| CoreError::invalid(format!("invalid parameters: {e}")))
}
