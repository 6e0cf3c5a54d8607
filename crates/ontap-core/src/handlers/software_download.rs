// ── Software download handler ──
//
// Fetches an ONTAP software package onto the cluster. REST only. The
// download is long-running: a 502 or a transport timeout while it runs
// means it is still in progress, and so does a job that outlives the
// step's timeout.

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

use super::{rest_outcome, segment};
use crate::capability::{self, AttrMap, Capability, key, option};
use crate::classify::ErrorClass;
use crate::error::CoreError;
use crate::handler::{Context, Current, HandlerError, ResourceHandler, StepOutcome};
use crate::params::{ArgSpec, RequiredIf, State};
use crate::planner::{NoExtra, Op, Plan, Step};
use crate::protocol::{Protocol, Surfaces};

const PACKAGES_PATH: &str = "cluster/software/packages";
const DOWNLOAD_PATH: &str = "cluster/software/download";
pub const DEFAULT_DOWNLOAD_TIMEOUT: u64 = 1800;

const CAPABILITIES: &[Capability] = &[
    key("package_version").rest("version").rest_only(),
    option("package_url"),
    option("server_username"),
    option("server_password"),
];

fn download_timeout() -> u64 {
    DEFAULT_DOWNLOAD_TIMEOUT
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SoftwareDownloadParams {
    #[serde(default)]
    pub state: State,
    pub package_version: String,
    pub package_url: Option<String>,
    pub server_username: Option<String>,
    pub server_password: Option<SecretString>,
    #[serde(default = "download_timeout")]
    pub time_out: u64,
}

#[derive(Debug, Clone)]
pub struct SoftwareDownload {
    p: SoftwareDownloadParams,
}

impl SoftwareDownload {
    fn download_body(&self) -> Value {
        let mut body = json!({ "url": self.p.package_url });
        if let Some(user) = &self.p.server_username {
            body["username"] = json!(user);
        }
        if let Some(password) = &self.p.server_password {
            body["password"] = json!(password.expose_secret());
        }
        body
    }
}

impl ResourceHandler for SoftwareDownload {
    type Params = SoftwareDownloadParams;
    type Extra = NoExtra;

    const KIND: &'static str = "software_download";
    const SURFACES: Surfaces = Surfaces::REST_ONLY;
    const ARGS: ArgSpec = ArgSpec {
        required: &["package_version"],
        required_together: &[&["server_username", "server_password"]],
        required_if: &[RequiredIf {
            key: "state",
            value: "present",
            requires: &["package_url"],
        }],
        ..ArgSpec::NONE
    };

    fn capabilities() -> &'static [Capability] {
        CAPABILITIES
    }

    fn new(params: SoftwareDownloadParams) -> Result<Self, CoreError> {
        if params.state == State::Present && params.package_url.is_none() {
            return Err(CoreError::MissingRequired {
                names: vec!["package_url".into()],
            });
        }
        Ok(Self { p: params })
    }

    fn state(&self) -> State {
        self.p.state
    }

    fn name(&self) -> &str {
        &self.p.package_version
    }

    fn desired(&self, _protocol: Protocol) -> AttrMap {
        let mut attrs = AttrMap::new();
        attrs.insert("package_version".into(), Value::String(self.p.package_version.clone()));
        attrs
    }

    async fn get_current(
        &self,
        ctx: &mut Context,
        name: &str,
    ) -> Result<Option<Current>, HandlerError> {
        let query = [("version", name.to_owned()), ("fields", "version,state".to_owned())];
        Ok(ctx
            .rest
            .get_one_record(PACKAGES_PATH, &query)
            .await?
            .map(|record| Current::new(capability::from_rest(CAPABILITIES, &record))))
    }

    async fn plan_extra(
        &self,
        _ctx: &mut Context,
        _current: Option<&Current>,
        _desired: &AttrMap,
        plan: &mut Plan<NoExtra>,
    ) -> Result<(), HandlerError> {
        if let Some(at) = plan.position(|s| matches!(s.op, Op::Create(_))) {
            let steps = plan.steps_mut();
            let step = steps.remove(at);
            steps.insert(
                at,
                step.tolerating(&[ErrorClass::Transient502, ErrorClass::TransientTimeout60])
                    .in_flight_ok()
                    .not_found_ok(),
            );
        }
        Ok(())
    }

    async fn execute(
        &self,
        ctx: &mut Context,
        step: &Step<NoExtra>,
        _current: Option<&Current>,
    ) -> Result<StepOutcome, HandlerError> {
        match &step.op {
            Op::Create(_) => {
                info!(version = %self.p.package_version, "starting package download");
                Ok(rest_outcome(ctx.rest.post(DOWNLOAD_PATH, &self.download_body(), &[]).await?))
            }
            Op::Delete => {
                let path = format!("{PACKAGES_PATH}/{}", segment(&self.p.package_version));
                Ok(rest_outcome(ctx.rest.delete(&path, None, &[]).await?))
            }
            Op::Modify(_) | Op::Rename { .. } | Op::Unmount | Op::Offline => {
                Ok(StepOutcome::NOTHING)
            }
            Op::Extra(extra) => match *extra {},
        }
    }

    fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.p.time_out)
    }
}
