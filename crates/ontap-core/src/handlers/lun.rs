// ── LUN handler ──
//
// Block devices addressed as `/vol/<flexvol>/<name>`. Resizes run as a
// separate step so a "same size" refusal from the controller ends the
// step quietly. SAN-optimized clusters manage placement themselves, so
// `flexvol_name` and `space_reserve` are dropped there.

use std::fmt;

use serde::Deserialize;
use serde_json::{Value, json};

use ontap_api::NaElement;

use super::{
    object, observed_uuid, put, rest_body, rest_fields, rest_outcome, size_bytes, uuid_of,
    zapi_call, zapi_one, zapi_query,
};
use crate::capability::{self, AttrMap, Capability, IgnorableAttribute, attr, key, option};
use crate::classify::ErrorClass;
use crate::error::CoreError;
use crate::handler::{Context, Current, HandlerError, ResourceHandler, StepOutcome};
use crate::params::{ArgSpec, State};
use crate::planner::{DeleteStages, Op, Plan, Step};
use crate::protocol::{Protocol, Surfaces};
use crate::version::VersionInfo;

const REST_PATH: &str = "storage/luns";

const CAPABILITIES: &[Capability] = &[
    key("name").rest("location.logical_unit"),
    attr("flexvol_name")
        .rest("location.volume.name")
        .zapi("volume")
        .fixed(),
    attr("size").rest("space.size").zapi("size").size(),
    attr("comment").rest("comment").zapi("comment"),
    attr("os_type").rest("os_type").zapi("multiprotocol-type").fixed(),
    attr("space_reserve")
        .rest("space.guarantee.requested")
        .zapi("is-space-reservation-enabled")
        .boolean(),
    attr("space_allocation")
        .rest("space.scsi_thin_provisioning_support_enabled")
        .zapi("is-space-alloc-enabled")
        .boolean(),
    option("force_remove"),
    option("force_offline"),
];

const SAN_OPTIMIZED_IGNORED: &[IgnorableAttribute] = &[
    IgnorableAttribute {
        name: "flexvol_name",
        message: "{attr} is ignored when using a SAN-optimized cluster.",
    },
    IgnorableAttribute {
        name: "space_reserve",
        message: "{attr} is ignored when using a SAN-optimized cluster.",
    },
];

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LunParams {
    #[serde(default)]
    pub state: State,
    pub name: String,
    pub vserver: String,
    pub from_name: Option<String>,
    pub flexvol_name: Option<String>,
    pub size: Option<Value>,
    pub comment: Option<String>,
    pub os_type: Option<String>,
    pub space_reserve: Option<bool>,
    pub space_allocation: Option<bool>,
    #[serde(default)]
    pub force_remove: bool,
    /// Take an online LUN offline before deleting it.
    #[serde(default)]
    pub force_offline: bool,
}

/// Compound LUN steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LunExtra {
    /// Grow or shrink to the given byte count.
    Resize(u64),
}

impl fmt::Display for LunExtra {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resize(bytes) => write!(f, "resize to {bytes} bytes"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Lun {
    p: LunParams,
    size: Option<u64>,
}

impl Lun {
    fn path(&self, name: &str) -> Option<String> {
        self.p
            .flexvol_name
            .as_ref()
            .map(|vol| format!("/vol/{vol}/{name}"))
    }

    fn zapi_path(&self, name: &str) -> Result<String, CoreError> {
        self.path(name).ok_or_else(|| {
            CoreError::validation(format!(
                "Error: flexvol_name is required to manage LUN {name} with ZAPI."
            ))
        })
    }

    async fn get_rest(&self, ctx: &Context, name: &str) -> Result<Option<Current>, HandlerError> {
        let mut query = vec![
            ("svm.name", self.p.vserver.clone()),
            ("fields", rest_fields(CAPABILITIES, &["name", "enabled"])),
        ];
        match self.path(name) {
            Some(path) => query.push(("name", path)),
            None => query.push(("location.logical_unit", name.to_owned())),
        }
        let Some(record) = ctx.rest.get_one_record(REST_PATH, &query).await? else {
            return Ok(None);
        };
        let attrs = capability::from_rest(CAPABILITIES, &record);
        let aux = json!({
            "path": record.get("name").cloned().unwrap_or(Value::Null),
            "online": record.get("enabled").and_then(Value::as_bool).unwrap_or(false),
        });
        Ok(Some(Current::new(attrs).with_uuid(uuid_of(&record)).with_aux(aux)))
    }

    async fn get_zapi(&self, ctx: &Context, name: &str) -> Result<Option<Current>, HandlerError> {
        let path = self.zapi_path(name)?;
        let request = zapi_query("lun-get-iter", "lun-info", &[("path", path.as_str())]);
        let Some(record) = zapi_one(ctx, &request).await? else {
            return Ok(None);
        };
        let mut attrs = capability::from_zapi(CAPABILITIES, &record);
        attrs.insert("name".into(), Value::String(name.to_owned()));
        let aux = json!({
            "path": path,
            "online": record.child_bool("online").unwrap_or(false),
        });
        Ok(Some(Current::new(attrs).with_aux(aux)))
    }

    fn uuid<'a>(&self, current: Option<&'a Current>) -> Result<&'a str, CoreError> {
        observed_uuid(current, Self::KIND, &self.p.name)
    }

    fn rest_create_body(&self, attrs: &AttrMap) -> Result<Value, CoreError> {
        let path = self.path(&self.p.name).ok_or_else(|| {
            CoreError::validation(format!(
                "Error: flexvol_name is required to create LUN {}.",
                self.p.name
            ))
        })?;
        let mut attrs = attrs.clone();
        attrs.shift_remove("name");
        attrs.shift_remove("flexvol_name");
        let mut body = object(rest_body(CAPABILITIES, &attrs, Some(&self.p.vserver)));
        body.insert("name".into(), Value::String(path));
        Ok(Value::Object(body))
    }

    fn zapi_create_request(&self, path: &str, attrs: &AttrMap) -> NaElement {
        let mut request = NaElement::new("lun-create-by-size").with_child_content("path", path);
        for (attr, element) in [
            ("size", "size"),
            ("os_type", "ostype"),
            ("space_reserve", "space-reservation-enabled"),
            ("space_allocation", "space-allocation-enabled"),
            ("comment", "comment"),
        ] {
            if let Some(value) = attrs.get(attr) {
                request.add_new_child(element, capability::zapi_text(value));
            }
        }
        request
    }

    async fn modify_zapi(&self, ctx: &Context, attrs: &AttrMap) -> Result<(), HandlerError> {
        let path = self.zapi_path(&self.p.name)?;
        if let Some(comment) = attrs.get("comment") {
            let request = NaElement::new("lun-set-comment")
                .with_child_content("path", path.as_str())
                .with_child_content("comment", capability::zapi_text(comment));
            zapi_call(ctx, &request).await?;
        }
        if let Some(enable) = attrs.get("space_reserve") {
            let request = NaElement::new("lun-set-space-reservation-info")
                .with_child_content("path", path.as_str())
                .with_child_content("enable", capability::zapi_text(enable));
            zapi_call(ctx, &request).await?;
        }
        if let Some(enable) = attrs.get("space_allocation") {
            let request = NaElement::new("lun-set-space-alloc")
                .with_child_content("path", path.as_str())
                .with_child_content("enable", capability::zapi_text(enable));
            zapi_call(ctx, &request).await?;
        }
        Ok(())
    }
}

impl ResourceHandler for Lun {
    type Params = LunParams;
    type Extra = LunExtra;

    const KIND: &'static str = "lun";
    const SURFACES: Surfaces = Surfaces::BOTH;
    const ARGS: ArgSpec = ArgSpec {
        required: &["name", "vserver"],
        ..ArgSpec::NONE
    };

    fn capabilities() -> &'static [Capability] {
        CAPABILITIES
    }

    fn new(params: LunParams) -> Result<Self, CoreError> {
        let size = size_bytes("size", params.size.as_ref())?;
        Ok(Self { p: params, size })
    }

    fn state(&self) -> State {
        self.p.state
    }

    fn name(&self) -> &str {
        &self.p.name
    }

    fn from_name(&self) -> Option<&str> {
        self.p.from_name.as_deref()
    }

    fn vserver(&self) -> Option<&str> {
        Some(&self.p.vserver)
    }

    fn ignorable(version: &VersionInfo) -> &'static [IgnorableAttribute] {
        if version.san_optimized {
            SAN_OPTIMIZED_IGNORED
        } else {
            &[]
        }
    }

    fn desired(&self, _protocol: Protocol) -> AttrMap {
        let p = &self.p;
        let mut attrs = AttrMap::new();
        attrs.insert("name".into(), Value::String(p.name.clone()));
        put(&mut attrs, "flexvol_name", p.flexvol_name.as_ref());
        put(&mut attrs, "size", self.size.as_ref());
        put(&mut attrs, "comment", p.comment.as_ref());
        put(&mut attrs, "os_type", p.os_type.as_ref());
        put(&mut attrs, "space_reserve", p.space_reserve.as_ref());
        put(&mut attrs, "space_allocation", p.space_allocation.as_ref());
        attrs
    }

    async fn get_current(
        &self,
        ctx: &mut Context,
        name: &str,
    ) -> Result<Option<Current>, HandlerError> {
        if ctx.is_rest() {
            self.get_rest(ctx, name).await
        } else {
            self.get_zapi(ctx, name).await
        }
    }

    fn delete_stages(&self, current: &Current, protocol: Protocol) -> DeleteStages {
        DeleteStages {
            unmount: false,
            offline: self.p.force_offline
                && protocol == Protocol::Zapi
                && current.aux.get("online").and_then(Value::as_bool) == Some(true),
        }
    }

    async fn plan_extra(
        &self,
        _ctx: &mut Context,
        _current: Option<&Current>,
        _desired: &AttrMap,
        plan: &mut Plan<LunExtra>,
    ) -> Result<(), HandlerError> {
        let resizes =
            |s: &Step<LunExtra>| matches!(&s.op, Op::Modify(a) if a.contains_key("size"));
        let Some(index) = plan.position(resizes) else {
            return Ok(());
        };
        let step = &mut plan.steps_mut()[index];
        let timeout = step.job.timeout;
        let bytes = match &mut step.op {
            Op::Modify(attrs) => attrs.shift_remove("size").and_then(|v| v.as_u64()),
            _ => None,
        };
        let emptied = matches!(&step.op, Op::Modify(a) if a.is_empty());
        if emptied {
            plan.steps_mut().remove(index);
        }
        if let Some(bytes) = bytes {
            let resize = Step::new(Op::Extra(LunExtra::Resize(bytes)))
                .tolerating(&[ErrorClass::SameSize])
                .with_timeout(timeout);
            plan.insert(index, resize);
        }
        Ok(())
    }

    async fn execute(
        &self,
        ctx: &mut Context,
        step: &Step<LunExtra>,
        current: Option<&Current>,
    ) -> Result<StepOutcome, HandlerError> {
        let rest = ctx.is_rest();
        match &step.op {
            Op::Create(attrs) if rest => {
                let body = self.rest_create_body(attrs)?;
                Ok(rest_outcome(ctx.rest.post(REST_PATH, &body, &[]).await?))
            }
            Op::Create(attrs) => {
                let path = self.zapi_path(&self.p.name)?;
                zapi_call(ctx, &self.zapi_create_request(&path, attrs)).await?;
                Ok(StepOutcome::DONE)
            }
            Op::Modify(attrs) if rest => {
                let uuid = self.uuid(current)?;
                let body = capability::to_rest(CAPABILITIES, attrs);
                Ok(rest_outcome(ctx.rest.patch(&format!("{REST_PATH}/{uuid}"), &body, &[]).await?))
            }
            Op::Modify(attrs) => {
                self.modify_zapi(ctx, attrs).await?;
                Ok(StepOutcome::DONE)
            }
            Op::Extra(LunExtra::Resize(bytes)) if rest => {
                let uuid = self.uuid(current)?;
                let body = json!({ "space": { "size": bytes } });
                Ok(rest_outcome(ctx.rest.patch(&format!("{REST_PATH}/{uuid}"), &body, &[]).await?))
            }
            Op::Extra(LunExtra::Resize(bytes)) => {
                let request = NaElement::new("lun-resize")
                    .with_child_content("path", self.zapi_path(&self.p.name)?)
                    .with_child_content("size", bytes.to_string())
                    .with_child_content("force", "true");
                zapi_call(ctx, &request).await?;
                Ok(StepOutcome::DONE)
            }
            Op::Rename { .. } if rest => {
                let uuid = self.uuid(current)?;
                let path = self.path(&self.p.name).ok_or_else(|| {
                    CoreError::validation("Error: flexvol_name is required to rename a LUN.")
                })?;
                let body = json!({ "name": path });
                Ok(rest_outcome(ctx.rest.patch(&format!("{REST_PATH}/{uuid}"), &body, &[]).await?))
            }
            Op::Rename { from } => {
                let request = NaElement::new("lun-move")
                    .with_child_content("path", self.zapi_path(from)?)
                    .with_child_content("new-path", self.zapi_path(&self.p.name)?);
                zapi_call(ctx, &request).await?;
                Ok(StepOutcome::DONE)
            }
            Op::Offline => {
                let request = NaElement::new("lun-offline")
                    .with_child_content("path", self.zapi_path(&self.p.name)?);
                zapi_call(ctx, &request).await?;
                Ok(StepOutcome::DONE)
            }
            Op::Delete if rest => {
                let uuid = self.uuid(current)?;
                let query = [("allow_delete_while_mapped", self.p.force_remove.to_string())];
                Ok(rest_outcome(
                    ctx.rest.delete(&format!("{REST_PATH}/{uuid}"), None, &query).await?,
                ))
            }
            Op::Delete => {
                let request = NaElement::new("lun-destroy")
                    .with_child_content("path", self.zapi_path(&self.p.name)?)
                    .with_child_content("force", self.p.force_remove.to_string());
                zapi_call(ctx, &request).await?;
                Ok(StepOutcome::DONE)
            }
            Op::Unmount => Ok(StepOutcome::NOTHING),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::handlers::offline_context;
    use crate::params;
    use crate::version::OntapVersion;

    fn lun(v: Value) -> Lun {
        Lun::new(params::parse(&Lun::ARGS, v.as_object().unwrap()).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn size_changes_become_a_tolerant_resize() {
        let l = lun(json!({
            "name": "lun1", "vserver": "svm1", "flexvol_name": "vol1", "size": "2g"
        }));
        let mut modify = AttrMap::new();
        modify.insert("size".into(), json!(2_147_483_648_u64));
        modify.insert("comment".into(), json!("new"));
        let mut plan = Plan::default();
        plan.push(Step::new(Op::Modify(modify)));
        let mut ctx = offline_context(Protocol::Rest);
        l.plan_extra(&mut ctx, None, &l.desired(Protocol::Rest), &mut plan)
            .await
            .unwrap();

        assert_eq!(
            plan.describe("lun", "lun1"),
            vec![
                "resize to 2147483648 bytes (lun lun1)".to_owned(),
                "modify lun lun1: comment".to_owned()
            ]
        );
        assert!(plan.steps()[0].tolerate.contains(&ErrorClass::SameSize));
    }

    #[tokio::test]
    async fn size_only_modify_is_replaced() {
        let l = lun(json!({"name": "lun1", "vserver": "svm1", "flexvol_name": "vol1"}));
        let mut modify = AttrMap::new();
        modify.insert("size".into(), json!(1024));
        let mut plan = Plan::default();
        plan.push(Step::new(Op::Modify(modify)));
        let mut ctx = offline_context(Protocol::Zapi);
        l.plan_extra(&mut ctx, None, &AttrMap::new(), &mut plan).await.unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.steps()[0].op, Op::Extra(LunExtra::Resize(1024)));
    }

    #[test]
    fn san_optimized_clusters_ignore_placement() {
        let mut info = VersionInfo {
            version: OntapVersion::new(9, 12, 1),
            rest_available: true,
            san_optimized: false,
        };
        assert!(Lun::ignorable(&info).is_empty());
        info.san_optimized = true;
        let names: Vec<_> = Lun::ignorable(&info).iter().map(|a| a.name).collect();
        assert_eq!(names, vec!["flexvol_name", "space_reserve"]);
        assert_eq!(
            Lun::ignorable(&info)[0].render(),
            "flexvol_name is ignored when using a SAN-optimized cluster."
        );
    }

    #[test]
    fn online_lun_goes_offline_only_when_forced() {
        let online = Current::default().with_aux(json!({"online": true}));

        let l = lun(json!({"name": "lun1", "vserver": "svm1", "state": "absent"}));
        assert_eq!(l.delete_stages(&online, Protocol::Zapi), DeleteStages::NONE);

        let l = lun(json!({
            "name": "lun1", "vserver": "svm1", "state": "absent", "force_offline": true
        }));
        assert!(l.delete_stages(&online, Protocol::Zapi).offline);
        assert!(!l.delete_stages(&online, Protocol::Rest).offline);
    }

    #[test]
    fn zapi_requires_flexvol() {
        let l = lun(json!({"name": "lun1", "vserver": "svm1"}));
        assert!(l.zapi_path("lun1").is_err());
        let l = lun(json!({"name": "lun1", "vserver": "svm1", "flexvol_name": "vol1"}));
        assert_eq!(l.zapi_path("lun1").unwrap(), "/vol/vol1/lun1");
    }

    #[test]
    fn rest_create_names_the_full_path() {
        let l = lun(json!({
            "name": "lun1", "vserver": "svm1", "flexvol_name": "vol1",
            "size": 1024, "os_type": "linux"
        }));
        let body = l.rest_create_body(&l.desired(Protocol::Rest)).unwrap();
        assert_eq!(
            body,
            json!({
                "name": "/vol/vol1/lun1",
                "space": {"size": 1024},
                "os_type": "linux",
                "svm": {"name": "svm1"}
            })
        );
    }
}
