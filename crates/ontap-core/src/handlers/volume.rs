// ── Volume handler ──
//
// FlexVol volumes inside a vserver. Size accepts unit suffixes and
// tolerates small shrinks. Deleting a mounted or online volume needs
// `force_unmount` / `force_offline`; without them the delete is sent as is
// and the controller refuses it.

use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use ontap_api::NaElement;

use super::{
    object, observed_uuid, put, rest_body, rest_fields, rest_outcome, size_bytes, time_out, uuid_of,
    zapi_call, zapi_one, zapi_query,
};
use crate::capability::{self, AttrMap, Capability, Compare, attr, key, option};
use crate::error::CoreError;
use crate::handler::{Context, Current, HandlerError, ResourceHandler, StepOutcome};
use crate::params::{ArgSpec, State};
use crate::planner::{DeleteStages, NoExtra, Op, Step};
use crate::protocol::{Protocol, Surfaces};

const REST_PATH: &str = "storage/volumes";

const CAPABILITIES: &[Capability] = &[
    key("name").rest("name").zapi("volume-id-attributes.name"),
    attr("aggregate_name")
        .rest("aggregates")
        .zapi("volume-id-attributes.containing-aggregate-name")
        .fixed(),
    attr("size").rest("space.size").zapi("volume-space-attributes.size").size(),
    attr("comment").rest("comment").zapi("volume-id-attributes.comment"),
    attr("junction_path")
        .rest("nas.path")
        .zapi("volume-id-attributes.junction-path"),
    attr("is_online")
        .rest("state")
        .zapi("volume-state-attributes.is-online")
        .boolean(),
    attr("vol_type")
        .rest("type")
        .zapi("volume-id-attributes.type")
        .compare(Compare::CaseInsensitive)
        .fixed(),
    attr("language")
        .rest("language")
        .zapi("volume-language-attributes.language-code")
        .fixed(),
    attr("snapshot_policy")
        .rest("snapshot_policy.name")
        .zapi("volume-snapshot-attributes.snapshot-policy"),
    attr("export_policy")
        .rest("nas.export_policy.name")
        .zapi("volume-export-attributes.policy"),
    attr("space_guarantee")
        .rest("guarantee.type")
        .zapi("volume-space-attributes.space-guarantee"),
    attr("percent_snapshot_space")
        .rest("space.snapshot.reserve_percent")
        .zapi("volume-space-attributes.percentage-snapshot-reserve")
        .int(),
    option("force_unmount"),
    option("force_offline"),
];

/// `volume-create` element names, keyed by attribute.
const ZAPI_CREATE: &[(&str, &str)] = &[
    ("aggregate_name", "containing-aggr-name"),
    ("size", "size"),
    ("comment", "volume-comment"),
    ("junction_path", "junction-path"),
    ("vol_type", "volume-type"),
    ("language", "language-code"),
    ("snapshot_policy", "snapshot-policy"),
    ("export_policy", "export-policy"),
    ("space_guarantee", "space-reserve"),
    ("percent_snapshot_space", "percentage-snapshot-reserve"),
];

/// Attributes changed through `volume-modify-iter`.
const ZAPI_MODIFY_ITER: &[&str] = &[
    "comment",
    "snapshot_policy",
    "export_policy",
    "space_guarantee",
    "percent_snapshot_space",
];

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VolumeParams {
    #[serde(default)]
    pub state: State,
    pub name: String,
    pub vserver: String,
    pub from_name: Option<String>,
    pub aggregate_name: Option<String>,
    /// Bytes, or a string with a unit suffix (`"10g"`).
    pub size: Option<Value>,
    pub comment: Option<String>,
    pub junction_path: Option<String>,
    pub is_online: Option<bool>,
    #[serde(rename = "type")]
    pub vol_type: Option<String>,
    pub language: Option<String>,
    pub snapshot_policy: Option<String>,
    pub export_policy: Option<String>,
    pub space_guarantee: Option<String>,
    pub percent_snapshot_space: Option<u8>,
    /// Unmount a mounted volume before deleting it.
    #[serde(default)]
    pub force_unmount: bool,
    /// Take an online volume offline before deleting it.
    #[serde(default)]
    pub force_offline: bool,
    #[serde(default = "time_out")]
    pub time_out: u64,
}

#[derive(Debug, Clone)]
pub struct Volume {
    p: VolumeParams,
    size: Option<u64>,
}

impl Volume {
    async fn get_rest(&self, ctx: &Context, name: &str) -> Result<Option<Current>, HandlerError> {
        let query = [
            ("name", name.to_owned()),
            ("svm.name", self.p.vserver.clone()),
            ("fields", rest_fields(CAPABILITIES, &[])),
        ];
        let Some(record) = ctx.rest.get_one_record(REST_PATH, &query).await? else {
            return Ok(None);
        };
        let mut attrs = capability::from_rest(CAPABILITIES, &record);
        attrs.shift_remove("aggregate_name");
        if let Some(aggr) = record.pointer("/aggregates/0/name") {
            attrs.insert("aggregate_name".into(), aggr.clone());
        }
        if let Some(state) = record.get("state").and_then(Value::as_str) {
            attrs.insert("is_online".into(), Value::Bool(state == "online"));
        }
        Ok(Some(Current::new(attrs).with_uuid(uuid_of(&record))))
    }

    async fn get_zapi(&self, ctx: &Context, name: &str) -> Result<Option<Current>, HandlerError> {
        let request = zapi_query(
            "volume-get-iter",
            "volume-attributes",
            &[
                ("volume-id-attributes.name", name),
                ("volume-id-attributes.owning-vserver-name", self.p.vserver.as_str()),
            ],
        );
        Ok(zapi_one(ctx, &request)
            .await?
            .map(|record| Current::new(capability::from_zapi(CAPABILITIES, &record))))
    }

    fn rest_create_body(&self, attrs: &AttrMap) -> Value {
        let mut attrs = attrs.clone();
        let aggregate = attrs.shift_remove("aggregate_name");
        let online = attrs.shift_remove("is_online");
        let mut body = object(rest_body(CAPABILITIES, &attrs, Some(&self.p.vserver)));
        if let Some(aggregate) = aggregate {
            body.insert("aggregates".into(), json!([{ "name": aggregate }]));
        }
        if let Some(online) = online.as_ref().and_then(Value::as_bool) {
            body.insert("state".into(), json!(if online { "online" } else { "offline" }));
        }
        Value::Object(body)
    }

    fn rest_modify_body(attrs: &AttrMap) -> Value {
        let mut attrs = attrs.clone();
        let online = attrs.shift_remove("is_online");
        let mut body = object(capability::to_rest(CAPABILITIES, &attrs));
        if let Some(online) = online.as_ref().and_then(Value::as_bool) {
            body.insert("state".into(), json!(if online { "online" } else { "offline" }));
        }
        Value::Object(body)
    }

    fn zapi_create_request(&self, attrs: &AttrMap) -> NaElement {
        let mut request =
            NaElement::new("volume-create").with_child_content("volume", &self.p.name);
        for (attr, element) in ZAPI_CREATE {
            if let Some(value) = attrs.get(*attr) {
                request.add_new_child(*element, capability::zapi_text(value));
            }
        }
        request
    }

    /// `volume-modify-iter` for the attributes it covers, if any.
    fn zapi_modify_request(&self, attrs: &AttrMap) -> Option<NaElement> {
        let mut changes = NaElement::new("volume-attributes");
        let mut any = false;
        for (key, value) in attrs.iter().filter(|(k, _)| ZAPI_MODIFY_ITER.contains(&k.as_str())) {
            if let Some(path) = capability::find(CAPABILITIES, key).and_then(|c| c.zapi_path) {
                changes.set_path(path, capability::zapi_text(value));
                any = true;
            }
        }
        if !any {
            return None;
        }
        let mut request = zapi_query(
            "volume-modify-iter",
            "volume-attributes",
            &[
                ("volume-id-attributes.name", self.p.name.as_str()),
                ("volume-id-attributes.owning-vserver-name", self.p.vserver.as_str()),
            ],
        );
        request.add_child(NaElement::new("attributes").with_child(changes));
        Some(request)
    }

    async fn modify_zapi(&self, ctx: &Context, attrs: &AttrMap) -> Result<(), HandlerError> {
        let name = self.p.name.as_str();
        if attrs.get("is_online").and_then(Value::as_bool) == Some(true) {
            zapi_call(ctx, &NaElement::new("volume-online").with_child_content("name", name))
                .await?;
        }
        if let Some(request) = self.zapi_modify_request(attrs) {
            let results = zapi_call(ctx, &request).await?;
            if results.child_int("num-failed").unwrap_or(0) > 0 {
                let failure = results.find("failure-list.volume-modify-iter-info");
                return Err(ontap_api::Error::Zapi {
                    api: "volume-modify-iter".into(),
                    code: failure
                        .and_then(|f| f.child_str("error-code"))
                        .unwrap_or_default()
                        .to_owned(),
                    message: failure
                        .and_then(|f| f.child_str("error-message"))
                        .unwrap_or("volume-modify-iter failed")
                        .to_owned(),
                }
                .into());
            }
        }
        if let Some(size) = attrs.get("size") {
            let request = NaElement::new("volume-size")
                .with_child_content("volume", name)
                .with_child_content("new-size", capability::zapi_text(size));
            zapi_call(ctx, &request).await?;
        }
        if let Some(path) = attrs.get("junction_path").and_then(Value::as_str) {
            self.unmount_zapi(ctx).await?;
            if !path.is_empty() {
                let request = NaElement::new("volume-mount")
                    .with_child_content("volume-name", name)
                    .with_child_content("junction-path", path);
                zapi_call(ctx, &request).await?;
            }
        }
        if attrs.get("is_online").and_then(Value::as_bool) == Some(false) {
            zapi_call(ctx, &NaElement::new("volume-offline").with_child_content("name", name))
                .await?;
        }
        Ok(())
    }

    async fn unmount_zapi(&self, ctx: &Context) -> Result<(), HandlerError> {
        let request = NaElement::new("volume-unmount")
            .with_child_content("volume-name", &self.p.name)
            .with_child_content("force", "false");
        zapi_call(ctx, &request).await?;
        Ok(())
    }

    async fn patch(
        &self,
        ctx: &Context,
        current: Option<&Current>,
        body: &Value,
    ) -> Result<StepOutcome, HandlerError> {
        let uuid = observed_uuid(current, Self::KIND, &self.p.name)?;
        let resp = ctx.rest.patch(&format!("{REST_PATH}/{uuid}"), body, &[]).await?;
        Ok(rest_outcome(resp))
    }
}

impl ResourceHandler for Volume {
    type Params = VolumeParams;
    type Extra = NoExtra;

    const KIND: &'static str = "volume";
    const SURFACES: Surfaces = Surfaces::BOTH;
    const ARGS: ArgSpec = ArgSpec {
        required: &["name", "vserver"],
        ..ArgSpec::NONE
    };

    fn capabilities() -> &'static [Capability] {
        CAPABILITIES
    }

    fn new(params: VolumeParams) -> Result<Self, CoreError> {
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

    fn desired(&self, _protocol: Protocol) -> AttrMap {
        let p = &self.p;
        let mut attrs = AttrMap::new();
        attrs.insert("name".into(), Value::String(p.name.clone()));
        put(&mut attrs, "aggregate_name", p.aggregate_name.as_ref());
        put(&mut attrs, "size", self.size.as_ref());
        put(&mut attrs, "comment", p.comment.as_ref());
        put(&mut attrs, "junction_path", p.junction_path.as_ref());
        put(&mut attrs, "is_online", p.is_online.as_ref());
        put(&mut attrs, "vol_type", p.vol_type.as_ref());
        put(&mut attrs, "language", p.language.as_ref());
        put(&mut attrs, "snapshot_policy", p.snapshot_policy.as_ref());
        put(&mut attrs, "export_policy", p.export_policy.as_ref());
        put(&mut attrs, "space_guarantee", p.space_guarantee.as_ref());
        put(&mut attrs, "percent_snapshot_space", p.percent_snapshot_space.as_ref());
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

    fn delete_stages(&self, current: &Current, _protocol: Protocol) -> DeleteStages {
        let mounted = current.str("junction_path").is_some_and(|p| !p.is_empty());
        let online = current.attrs.get("is_online").and_then(Value::as_bool) == Some(true);
        DeleteStages {
            unmount: self.p.force_unmount && mounted,
            offline: self.p.force_offline && online,
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
                let resp = ctx.rest.post(REST_PATH, &self.rest_create_body(attrs), &[]).await?;
                Ok(rest_outcome(resp))
            }
            Op::Create(attrs) => {
                zapi_call(ctx, &self.zapi_create_request(attrs)).await?;
                if attrs.get("is_online").and_then(Value::as_bool) == Some(false) {
                    let request =
                        NaElement::new("volume-offline").with_child_content("name", &self.p.name);
                    zapi_call(ctx, &request).await?;
                }
                Ok(StepOutcome::DONE)
            }
            Op::Modify(attrs) if rest => {
                debug!(volume = %self.p.name, keys = attrs.len(), "patching volume");
                self.patch(ctx, current, &Self::rest_modify_body(attrs)).await
            }
            Op::Modify(attrs) => {
                self.modify_zapi(ctx, attrs).await?;
                Ok(StepOutcome::DONE)
            }
            Op::Rename { .. } if rest => {
                self.patch(ctx, current, &json!({ "name": self.p.name })).await
            }
            Op::Rename { from } => {
                let request = NaElement::new("volume-rename")
                    .with_child_content("volume", from.as_str())
                    .with_child_content("new-volume-name", &self.p.name);
                zapi_call(ctx, &request).await?;
                Ok(StepOutcome::DONE)
            }
            Op::Unmount if rest => {
                self.patch(ctx, current, &json!({ "nas": { "path": "" } })).await
            }
            Op::Unmount => {
                self.unmount_zapi(ctx).await?;
                Ok(StepOutcome::DONE)
            }
            Op::Offline if rest => self.patch(ctx, current, &json!({ "state": "offline" })).await,
            Op::Offline => {
                let request =
                    NaElement::new("volume-offline").with_child_content("name", &self.p.name);
                zapi_call(ctx, &request).await?;
                Ok(StepOutcome::DONE)
            }
            Op::Delete if rest => {
                let uuid = observed_uuid(current, Self::KIND, &self.p.name)?;
                let resp = ctx.rest.delete(&format!("{REST_PATH}/{uuid}"), None, &[]).await?;
                Ok(rest_outcome(resp))
            }
            Op::Delete => {
                let request =
                    NaElement::new("volume-destroy").with_child_content("name", &self.p.name);
                zapi_call(ctx, &request).await?;
                Ok(StepOutcome::DONE)
            }
            Op::Extra(extra) => match *extra {},
        }
    }

    fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.p.time_out)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::params;

    fn volume(v: Value) -> Volume {
        Volume::new(params::parse(&Volume::ARGS, v.as_object().unwrap()).unwrap()).unwrap()
    }

    #[test]
    fn size_is_normalized_to_bytes() {
        let v = volume(json!({"name": "vol1", "vserver": "svm1", "size": "20m"}));
        assert_eq!(v.desired(Protocol::Rest).get("size"), Some(&json!(20 * 1024 * 1024)));
    }

    #[test]
    fn bad_size_is_rejected() {
        let p = params::parse::<VolumeParams>(
            &Volume::ARGS,
            json!({"name": "vol1", "vserver": "svm1", "size": "huge"}).as_object().unwrap(),
        )
        .unwrap();
        assert!(Volume::new(p).is_err());
    }

    fn mounted_online() -> Current {
        let mut attrs = AttrMap::new();
        attrs.insert("junction_path".into(), json!("/vol1"));
        attrs.insert("is_online".into(), json!(true));
        Current::new(attrs)
    }

    #[test]
    fn forced_delete_unmounts_and_offlines_mounted_volume() {
        let v = volume(json!({
            "name": "vol1", "vserver": "svm1", "state": "absent",
            "force_unmount": true, "force_offline": true
        }));
        let stages = v.delete_stages(&mounted_online(), Protocol::Zapi);
        assert!(stages.unmount && stages.offline);

        let mut attrs = AttrMap::new();
        attrs.insert("junction_path".into(), json!(""));
        attrs.insert("is_online".into(), json!(false));
        assert_eq!(v.delete_stages(&Current::new(attrs), Protocol::Zapi), DeleteStages::NONE);
    }

    #[test]
    fn unforced_delete_leaves_a_live_volume_alone() {
        let v = volume(json!({"name": "vol1", "vserver": "svm1", "state": "absent"}));
        assert_eq!(v.delete_stages(&mounted_online(), Protocol::Rest), DeleteStages::NONE);

        let v = volume(json!({
            "name": "vol1", "vserver": "svm1", "state": "absent", "force_offline": true
        }));
        let stages = v.delete_stages(&mounted_online(), Protocol::Rest);
        assert!(!stages.unmount && stages.offline);
    }

    #[test]
    fn rest_create_body_shapes_aggregate_and_state() {
        let v = volume(json!({
            "name": "vol1", "vserver": "svm1", "aggregate_name": "aggr1",
            "size": 1024, "is_online": false
        }));
        let body = v.rest_create_body(&v.desired(Protocol::Rest));
        assert_eq!(
            body,
            json!({
                "name": "vol1",
                "space": {"size": 1024},
                "svm": {"name": "svm1"},
                "aggregates": [{"name": "aggr1"}],
                "state": "offline"
            })
        );
    }

    #[test]
    fn zapi_modify_iter_carries_only_its_attributes() {
        let v = volume(json!({"name": "vol1", "vserver": "svm1"}));
        let mut attrs = AttrMap::new();
        attrs.insert("comment".into(), json!("c"));
        attrs.insert("size".into(), json!(10));
        let request = v.zapi_modify_request(&attrs).unwrap();
        let xml = request.to_xml();
        assert!(xml.contains(
            "<attributes><volume-attributes><volume-id-attributes><comment>c</comment>"
        ));
        assert!(!xml.contains("<size>"));

        let mut attrs = AttrMap::new();
        attrs.insert("size".into(), json!(10));
        assert!(v.zapi_modify_request(&attrs).is_none());
    }
}
