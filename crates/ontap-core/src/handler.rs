// ── Resource handler contract ──
//
// A handler knows one ONTAP object type: its parameters, its capability
// table, how to read it on either surface, and how to carry out each
// planned step. The engine owns ordering, diffing, tolerations and job
// waits; handlers only translate.

use std::fmt;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::warn;

use ontap_api::{RestClient, ZapiClient};

use crate::capability::{AttrMap, Capability, IgnorableAttribute};
use crate::error::CoreError;
use crate::job::{JobRef, JobTracker};
use crate::params::{ArgSpec, State};
use crate::planner::{DEFAULT_JOB_TIMEOUT, DeleteStages, Plan, Step};
use crate::protocol::{Protocol, Surfaces};
use crate::version::VersionInfo;

/// Observed state of one object.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Current {
    /// Attributes in the internal key space.
    pub attrs: AttrMap,
    /// REST record UUID, when the object has one.
    pub uuid: Option<String>,
    /// Handler-private data needed to execute steps (owner UUIDs,
    /// membership details, raw records).
    pub aux: Value,
}

impl Current {
    pub fn new(attrs: AttrMap) -> Self {
        Self {
            attrs,
            uuid: None,
            aux: Value::Null,
        }
    }

    #[must_use]
    pub fn with_uuid(mut self, uuid: Option<String>) -> Self {
        self.uuid = uuid;
        self
    }

    #[must_use]
    pub fn with_aux(mut self, aux: Value) -> Self {
        self.aux = aux;
        self
    }

    /// String attribute by internal name.
    pub fn str(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).and_then(Value::as_str)
    }

    /// The UUID, or a validation error naming the object.
    pub fn require_uuid(&self, resource: &str, name: &str) -> Result<&str, CoreError> {
        self.uuid
            .as_deref()
            .ok_or_else(|| CoreError::Internal(format!("{resource} {name} has no uuid")))
    }
}

/// Per-invocation state handed to handlers.
#[derive(Debug)]
pub struct Context {
    pub rest: RestClient,
    /// Tunnels to the handler's vserver when it has one.
    pub zapi: ZapiClient,
    pub version: VersionInfo,
    pub protocol: Protocol,
    pub jobs: JobTracker,
    warnings: Vec<String>,
}

impl Context {
    pub fn new(
        rest: RestClient,
        zapi: ZapiClient,
        version: VersionInfo,
        protocol: Protocol,
        jobs: JobTracker,
    ) -> Self {
        Self {
            rest,
            zapi,
            version,
            protocol,
            jobs,
            warnings: Vec::new(),
        }
    }

    pub fn is_rest(&self) -> bool {
        self.protocol == Protocol::Rest
    }

    /// Record a user-visible warning.
    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!(%message);
        self.warnings.push(message);
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn take_warnings(&mut self) -> Vec<String> {
        std::mem::take(&mut self.warnings)
    }
}

/// What a step did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    pub changed: bool,
    /// An asynchronous job the engine must wait for.
    pub job: Option<JobRef>,
}

impl StepOutcome {
    pub const DONE: Self = Self {
        changed: true,
        job: None,
    };

    pub const NOTHING: Self = Self {
        changed: false,
        job: None,
    };

    pub fn job(job: Option<JobRef>) -> Self {
        Self { changed: true, job }
    }
}

/// Failure inside a handler call.
///
/// API errors stay raw so the engine can classify them against the
/// step's tolerations before wrapping them with the operation.
#[derive(Debug)]
pub enum HandlerError {
    Api(ontap_api::Error),
    Core(CoreError),
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Api(e) => e.fmt(f),
            Self::Core(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for HandlerError {}

impl From<ontap_api::Error> for HandlerError {
    fn from(err: ontap_api::Error) -> Self {
        Self::Api(err)
    }
}

impl From<CoreError> for HandlerError {
    fn from(err: CoreError) -> Self {
        Self::Core(err)
    }
}

/// One ONTAP object type.
#[allow(async_fn_in_trait)]
pub trait ResourceHandler: Sized {
    type Params: DeserializeOwned;
    /// Handler-specific compound steps.
    type Extra: fmt::Debug + fmt::Display + Clone;

    /// Resource name used in messages and the registry.
    const KIND: &'static str;
    const SURFACES: Surfaces;
    const ARGS: ArgSpec;

    fn capabilities() -> &'static [Capability];

    /// Build from validated parameters. Cross-field checks go here.
    fn new(params: Self::Params) -> Result<Self, CoreError>;

    fn state(&self) -> State;

    fn name(&self) -> &str;

    /// Rename source.
    fn from_name(&self) -> Option<&str> {
        None
    }

    /// Owning vserver, used for ZAPI tunneling.
    fn vserver(&self) -> Option<&str> {
        None
    }

    /// Treat "vserver does not exist" on delete as already gone.
    fn ignore_missing_vserver_on_delete(&self) -> bool {
        false
    }

    /// Attributes dropped with a warning under this cluster personality.
    fn ignorable(_version: &VersionInfo) -> &'static [IgnorableAttribute] {
        &[]
    }

    /// Desired state in the internal key space. Only user-supplied keys.
    fn desired(&self, protocol: Protocol) -> AttrMap;

    /// Look up the object by name. `None` when it does not exist.
    async fn get_current(
        &self,
        ctx: &mut Context,
        name: &str,
    ) -> Result<Option<Current>, HandlerError>;

    /// Unmodifiable differences may be resolved by delete + create.
    fn recreate_on_unmodifiable(&self) -> bool {
        false
    }

    fn delete_stages(&self, _current: &Current, _protocol: Protocol) -> DeleteStages {
        DeleteStages::NONE
    }

    /// Refine the generic plan: validate, add compound steps, reshape
    /// modify sets. May read from the controller, never write.
    async fn plan_extra(
        &self,
        _ctx: &mut Context,
        _current: Option<&Current>,
        _desired: &AttrMap,
        _plan: &mut Plan<Self::Extra>,
    ) -> Result<(), HandlerError> {
        Ok(())
    }

    async fn execute(
        &self,
        ctx: &mut Context,
        step: &Step<Self::Extra>,
        current: Option<&Current>,
    ) -> Result<StepOutcome, HandlerError>;

    fn job_timeout(&self) -> Duration {
        DEFAULT_JOB_TIMEOUT
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn current_accessors() {
        let mut attrs = AttrMap::new();
        attrs.insert("name".into(), json!("vol1"));
        let current = Current::new(attrs).with_uuid(Some("u-1".into()));
        assert_eq!(current.str("name"), Some("vol1"));
        assert_eq!(current.require_uuid("volume", "vol1").unwrap(), "u-1");
        assert!(Current::default().require_uuid("volume", "vol1").is_err());
    }

    #[test]
    fn handler_error_wraps_both_layers() {
        let err: HandlerError = CoreError::validation("nope").into();
        assert_eq!(err.to_string(), "nope");
        let err: HandlerError = ontap_api::Error::Xml {
            message: "bad".into(),
        }
        .into();
        assert!(matches!(err, HandlerError::Api(_)));
    }
}
