// ── SVM handler ──
//
// Storage virtual machines (vservers). Admin state maps to start/stop;
// REST reports allowed protocols as per-protocol `enabled` flags.

use serde::Deserialize;
use serde_json::{Value, json};
use strum::{AsRefStr, Display};

use ontap_api::NaElement;

use super::{
    named_list, names_at, object, observed_uuid, put, rest_outcome, uuid_of, zapi_call, zapi_one,
    zapi_query,
};
use crate::capability::{self, AttrMap, Capability, Compare, attr, key};
use crate::error::CoreError;
use crate::handler::{Context, Current, HandlerError, ResourceHandler, StepOutcome};
use crate::params::{ArgSpec, State};
use crate::planner::{NoExtra, Op, Step};
use crate::protocol::{Protocol, Surfaces};

const REST_PATH: &str = "svm/svms";

/// Protocols REST reports as `<protocol>.enabled`.
const REST_PROTOCOLS: &[&str] = &["nfs", "cifs", "iscsi", "fcp", "nvme"];

const FIELDS: &str = "uuid,name,state,comment,aggregates,language,subtype,ipspace.name,\
                      snapshot_policy.name,max_volumes,nfs.enabled,cifs.enabled,iscsi.enabled,\
                      fcp.enabled,nvme.enabled";

const CAPABILITIES: &[Capability] = &[
    key("name").rest("name").zapi("vserver-name"),
    attr("admin_state")
        .rest("state")
        .zapi("state")
        .compare(Compare::CaseInsensitive),
    attr("comment").rest("comment").zapi("comment"),
    attr("aggr_list").rest("aggregates").zapi("aggr-list").item("aggr-name").set(),
    attr("allowed_protocols")
        .rest("allowed_protocols")
        .zapi("allowed-protocols")
        .item("protocol")
        .set(),
    attr("language").rest("language").zapi("language").fixed(),
    attr("subtype").rest("subtype").zapi("vserver-subtype").fixed(),
    attr("ipspace").rest("ipspace.name").zapi("ipspace").fixed(),
    attr("snapshot_policy")
        .rest("snapshot_policy.name")
        .zapi("snapshot-policy"),
    attr("max_volumes").rest("max_volumes").zapi("max-volumes"),
    attr("root_volume").zapi("root-volume").zapi_only().fixed(),
    attr("root_volume_aggregate")
        .zapi("root-volume-aggregate")
        .zapi_only()
        .fixed(),
    attr("root_volume_security_style")
        .zapi("root-volume-security-style")
        .zapi_only()
        .fixed(),
];

/// `vserver-create` element names, keyed by attribute.
const ZAPI_CREATE: &[&str] = &[
    "comment",
    "language",
    "vserver-subtype",
    "ipspace",
    "snapshot-policy",
    "root-volume",
    "root-volume-aggregate",
    "root-volume-security-style",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum AdminState {
    Running,
    Stopped,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SvmParams {
    #[serde(default)]
    pub state: State,
    pub name: String,
    pub from_name: Option<String>,
    pub admin_state: Option<AdminState>,
    pub comment: Option<String>,
    pub aggr_list: Option<Vec<String>>,
    pub allowed_protocols: Option<Vec<String>>,
    pub language: Option<String>,
    pub subtype: Option<String>,
    pub ipspace: Option<String>,
    pub snapshot_policy: Option<String>,
    pub max_volumes: Option<String>,
    pub root_volume: Option<String>,
    pub root_volume_aggregate: Option<String>,
    pub root_volume_security_style: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Svm {
    p: SvmParams,
}

impl Svm {
    fn rest_protocols(record: &Value) -> Value {
        Value::Array(
            REST_PROTOCOLS
                .iter()
                .filter(|p| {
                    capability::json_get(record, &format!("{p}.enabled")).and_then(Value::as_bool)
                        == Some(true)
                })
                .map(|p| Value::String((*p).to_owned()))
                .collect(),
        )
    }

    async fn get_rest(&self, ctx: &Context, name: &str) -> Result<Option<Current>, HandlerError> {
        let query = [("name", name.to_owned()), ("fields", FIELDS.to_owned())];
        let Some(record) = ctx.rest.get_one_record(REST_PATH, &query).await? else {
            return Ok(None);
        };
        let mut attrs = capability::from_rest(CAPABILITIES, &record);
        match names_at(&record, "aggregates") {
            Some(names) => attrs.insert("aggr_list".into(), names),
            None => attrs.shift_remove("aggr_list"),
        };
        attrs.insert("allowed_protocols".into(), Self::rest_protocols(&record));
        if let Some(max) = attrs.get_mut("max_volumes") {
            *max = Value::String(capability::zapi_text(max));
        }
        Ok(Some(Current::new(attrs).with_uuid(uuid_of(&record))))
    }

    async fn get_zapi(ctx: &Context, name: &str) -> Result<Option<Current>, HandlerError> {
        let request = zapi_query("vserver-get-iter", "vserver-info", &[("vserver-name", name)]);
        Ok(zapi_one(ctx, &request)
            .await?
            .map(|record| Current::new(capability::from_zapi(CAPABILITIES, &record))))
    }

    fn rest_body(attrs: &AttrMap) -> Value {
        let mut attrs = attrs.clone();
        let aggregates = attrs.shift_remove("aggr_list");
        let protocols = attrs.shift_remove("allowed_protocols");
        let mut body = object(capability::to_rest(CAPABILITIES, &attrs));
        if let Some(aggregates) = aggregates {
            body.insert("aggregates".into(), named_list(&aggregates));
        }
        if let Some(protocols) = protocols {
            let wanted = super::strings(Some(&protocols));
            for protocol in REST_PROTOCOLS {
                body.insert(
                    (*protocol).to_owned(),
                    json!({ "enabled": wanted.iter().any(|w| w == protocol) }),
                );
            }
        }
        Value::Object(body)
    }

    fn zapi_create_request(&self, attrs: &AttrMap) -> NaElement {
        let mut request =
            NaElement::new("vserver-create").with_child_content("vserver-name", &self.p.name);
        for cap in CAPABILITIES {
            let Some(element) = cap.zapi_key().filter(|k| ZAPI_CREATE.contains(k)) else {
                continue;
            };
            if let Some(value) = attrs.get(cap.name) {
                request.add_new_child(element, capability::zapi_text(value));
            }
        }
        request
    }

    /// `vserver-modify` for everything except admin state, if any.
    fn zapi_modify_request(&self, attrs: &AttrMap) -> Option<NaElement> {
        let mut request =
            NaElement::new("vserver-modify").with_child_content("vserver-name", &self.p.name);
        let mut any = false;
        for (key, value) in attrs.iter().filter(|(k, _)| k.as_str() != "admin_state") {
            let cap = capability::find(CAPABILITIES, key).filter(|c| c.zapi_path.is_some());
            if let Some(cap) = cap {
                capability::put_zapi(&mut request, cap, value);
                any = true;
            }
        }
        any.then_some(request)
    }

    async fn set_state_zapi(&self, ctx: &Context, state: &str) -> Result<(), HandlerError> {
        let api = if state.eq_ignore_ascii_case("stopped") {
            "vserver-stop"
        } else {
            "vserver-start"
        };
        let request = NaElement::new(api).with_child_content("vserver-name", &self.p.name);
        zapi_call(ctx, &request).await?;
        Ok(())
    }

    fn item_path(&self, current: Option<&Current>) -> Result<String, CoreError> {
        let uuid = observed_uuid(current, Self::KIND, &self.p.name)?;
        Ok(format!("{REST_PATH}/{uuid}"))
    }
}

impl ResourceHandler for Svm {
    type Params = SvmParams;
    type Extra = NoExtra;

    const KIND: &'static str = "svm";
    const SURFACES: Surfaces = Surfaces::BOTH;
    const ARGS: ArgSpec = ArgSpec::NAME;

    fn capabilities() -> &'static [Capability] {
        CAPABILITIES
    }

    fn new(params: SvmParams) -> Result<Self, CoreError> {
        Ok(Self { p: params })
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

    fn desired(&self, _protocol: Protocol) -> AttrMap {
        let p = &self.p;
        let mut attrs = AttrMap::new();
        attrs.insert("name".into(), Value::String(p.name.clone()));
        put(&mut attrs, "admin_state", p.admin_state.map(|s| s.to_string()).as_ref());
        put(&mut attrs, "comment", p.comment.as_ref());
        put(&mut attrs, "aggr_list", p.aggr_list.as_ref());
        put(&mut attrs, "allowed_protocols", p.allowed_protocols.as_ref());
        put(&mut attrs, "language", p.language.as_ref());
        put(&mut attrs, "subtype", p.subtype.as_ref());
        put(&mut attrs, "ipspace", p.ipspace.as_ref());
        put(&mut attrs, "snapshot_policy", p.snapshot_policy.as_ref());
        put(&mut attrs, "max_volumes", p.max_volumes.as_ref());
        put(&mut attrs, "root_volume", p.root_volume.as_ref());
        put(&mut attrs, "root_volume_aggregate", p.root_volume_aggregate.as_ref());
        put(&mut attrs, "root_volume_security_style", p.root_volume_security_style.as_ref());
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
            Self::get_zapi(ctx, name).await
        }
    }

    async fn execute(
        &self,
        ctx: &mut Context,
        step: &Step<NoExtra>,
        current: Option<&Current>,
    ) -> Result<StepOutcome, HandlerError> {
        let rest = ctx.is_rest();
        match &step.op {
            Op::Create(attrs) if rest => {
                Ok(rest_outcome(ctx.rest.post(REST_PATH, &Self::rest_body(attrs), &[]).await?))
            }
            Op::Create(attrs) => {
                zapi_call(ctx, &self.zapi_create_request(attrs)).await?;
                let mut rest_of = attrs.clone();
                rest_of.retain(|k, _| {
                    matches!(k.as_str(), "aggr_list" | "allowed_protocols" | "max_volumes")
                });
                if let Some(request) = self.zapi_modify_request(&rest_of) {
                    zapi_call(ctx, &request).await?;
                }
                if let Some(state) = attrs.get("admin_state").and_then(Value::as_str) {
                    if state.eq_ignore_ascii_case("stopped") {
                        self.set_state_zapi(ctx, state).await?;
                    }
                }
                Ok(StepOutcome::DONE)
            }
            Op::Modify(attrs) if rest => {
                let path = self.item_path(current)?;
                Ok(rest_outcome(ctx.rest.patch(&path, &Self::rest_body(attrs), &[]).await?))
            }
            Op::Modify(attrs) => {
                let state = attrs.get("admin_state").and_then(Value::as_str);
                if let Some(state) = state.filter(|s| s.eq_ignore_ascii_case("running")) {
                    self.set_state_zapi(ctx, state).await?;
                }
                if let Some(request) = self.zapi_modify_request(attrs) {
                    zapi_call(ctx, &request).await?;
                }
                if let Some(state) = state.filter(|s| s.eq_ignore_ascii_case("stopped")) {
                    self.set_state_zapi(ctx, state).await?;
                }
                Ok(StepOutcome::DONE)
            }
            Op::Rename { .. } if rest => {
                let path = self.item_path(current)?;
                Ok(rest_outcome(ctx.rest.patch(&path, &json!({ "name": self.p.name }), &[]).await?))
            }
            Op::Rename { from } => {
                let request = NaElement::new("vserver-rename")
                    .with_child_content("vserver-name", from.as_str())
                    .with_child_content("new-name", &self.p.name);
                zapi_call(ctx, &request).await?;
                Ok(StepOutcome::DONE)
            }
            Op::Delete if rest => {
                let path = self.item_path(current)?;
                Ok(rest_outcome(ctx.rest.delete(&path, None, &[]).await?))
            }
            Op::Delete => {
                let request = NaElement::new("vserver-destroy")
                    .with_child_content("vserver-name", &self.p.name);
                zapi_call(ctx, &request).await?;
                Ok(StepOutcome::DONE)
            }
            Op::Unmount | Op::Offline => Ok(StepOutcome::NOTHING),
            Op::Extra(extra) => match *extra {},
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::params;

    fn svm(v: Value) -> Svm {
        Svm::new(params::parse(&Svm::ARGS, v.as_object().unwrap()).unwrap()).unwrap()
    }

    #[test]
    fn rest_protocol_flags_become_a_list() {
        let record = json!({
            "nfs": {"enabled": true},
            "cifs": {"enabled": false},
            "iscsi": {"enabled": true}
        });
        assert_eq!(Svm::rest_protocols(&record), json!(["nfs", "iscsi"]));
    }

    #[test]
    fn rest_body_enables_only_listed_protocols() {
        let mut attrs = AttrMap::new();
        attrs.insert("allowed_protocols".into(), json!(["nfs"]));
        attrs.insert("aggr_list".into(), json!(["aggr1"]));
        let body = Svm::rest_body(&attrs);
        assert_eq!(body["nfs"], json!({"enabled": true}));
        assert_eq!(body["fcp"], json!({"enabled": false}));
        assert_eq!(body["aggregates"], json!([{"name": "aggr1"}]));
    }

    #[test]
    fn admin_state_is_not_part_of_vserver_modify() {
        let s = svm(json!({"name": "svm1"}));
        let mut attrs = AttrMap::new();
        attrs.insert("admin_state".into(), json!("stopped"));
        assert!(s.zapi_modify_request(&attrs).is_none());

        attrs.insert("aggr_list".into(), json!(["a1", "a2"]));
        let xml = s.zapi_modify_request(&attrs).unwrap().to_xml();
        assert!(xml.contains(
            "<aggr-list><aggr-name>a1</aggr-name><aggr-name>a2</aggr-name></aggr-list>"
        ));
    }

    #[test]
    fn create_request_skips_post_create_lists() {
        let s = svm(json!({"name": "svm1", "root_volume": "svm1_root", "aggr_list": ["a1"]}));
        let xml = s.zapi_create_request(&s.desired(Protocol::Zapi)).to_xml();
        assert!(xml.contains("<root-volume>svm1_root</root-volume>"));
        assert!(!xml.contains("aggr-list"));
    }

    #[test]
    fn fields_name_every_protocol_flag() {
        for protocol in REST_PROTOCOLS {
            assert!(FIELDS.contains(&format!("{protocol}.enabled")));
        }
        assert!(!FIELDS.contains("allowed_protocols"));
    }

    #[test]
    fn admin_state_renders_lowercase() {
        let s = svm(json!({"name": "svm1", "admin_state": "stopped"}));
        assert_eq!(s.desired(Protocol::Rest).get("admin_state"), Some(&json!("stopped")));
    }
}
