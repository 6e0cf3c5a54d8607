// ── FlexCache handler ──
//
// Cache volumes backed by an origin volume. Creation and deletion run
// as jobs on both surfaces; deletion can unmount and offline first.

use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};

use ontap_api::NaElement;

use super::{
    named_list, names_at, object, observed_uuid, put, rest_outcome, size_bytes, time_out, uuid_of,
    zapi_call, zapi_one, zapi_query,
};
use crate::capability::{self, AttrMap, Capability, attr, key, option};
use crate::error::CoreError;
use crate::handler::{Context, Current, HandlerError, ResourceHandler, StepOutcome};
use crate::job::zapi_async_job;
use crate::params::{ArgSpec, State};
use crate::planner::{DeleteStages, NoExtra, Op, Step};
use crate::protocol::{Protocol, Surfaces};

const REST_PATH: &str = "storage/flexcache/flexcaches";
const VOLUMES_PATH: &str = "storage/volumes";
const FIELDS: &str = "uuid,name,svm.name,origins,aggregates,constituents_per_aggregate,size,path";

const CAPABILITIES: &[Capability] = &[
    key("name").rest("name").zapi("volume"),
    attr("origin_volume")
        .rest("origins.volume.name")
        .zapi("origin-volume")
        .fixed(),
    attr("origin_vserver")
        .rest("origins.svm.name")
        .zapi("origin-vserver")
        .fixed(),
    attr("origin_cluster")
        .rest("origins.cluster.name")
        .zapi("origin-cluster")
        .fixed(),
    attr("aggr_list")
        .rest("aggregates")
        .zapi("aggr-list")
        .item("aggr-name")
        .set()
        .fixed(),
    attr("aggr_list_multiplier")
        .rest("constituents_per_aggregate")
        .zapi("aggr-list-multiplier")
        .int()
        .fixed(),
    attr("size").rest("size").zapi("size").size(),
    attr("junction_path").rest("path").zapi("junction-path"),
    option("force_unmount"),
    option("force_offline"),
];

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FlexcacheParams {
    #[serde(default)]
    pub state: State,
    pub name: String,
    pub vserver: String,
    pub origin_volume: Option<String>,
    pub origin_vserver: Option<String>,
    pub origin_cluster: Option<String>,
    pub aggr_list: Option<Vec<String>>,
    pub aggr_list_multiplier: Option<u32>,
    pub size: Option<Value>,
    pub junction_path: Option<String>,
    #[serde(default)]
    pub force_unmount: bool,
    #[serde(default)]
    pub force_offline: bool,
    #[serde(default = "time_out")]
    pub time_out: u64,
}

#[derive(Debug, Clone)]
pub struct Flexcache {
    p: FlexcacheParams,
    size: Option<u64>,
}

impl Flexcache {
    async fn get_rest(&self, ctx: &Context, name: &str) -> Result<Option<Current>, HandlerError> {
        let query = [
            ("name", name.to_owned()),
            ("svm.name", self.p.vserver.clone()),
            ("fields", FIELDS.to_owned()),
        ];
        let Some(record) = ctx.rest.get_one_record(REST_PATH, &query).await? else {
            return Ok(None);
        };
        let mut attrs = capability::from_rest(CAPABILITIES, &record);
        for (attr, pointer) in [
            ("origin_volume", "/origins/0/volume/name"),
            ("origin_vserver", "/origins/0/svm/name"),
            ("origin_cluster", "/origins/0/cluster/name"),
        ] {
            if let Some(value) = record.pointer(pointer) {
                attrs.insert(attr.into(), value.clone());
            }
        }
        match names_at(&record, "aggregates") {
            Some(names) => attrs.insert("aggr_list".into(), names),
            None => attrs.shift_remove("aggr_list"),
        };
        Ok(Some(Current::new(attrs).with_uuid(uuid_of(&record))))
    }

    async fn get_zapi(&self, ctx: &Context, name: &str) -> Result<Option<Current>, HandlerError> {
        let request = zapi_query(
            "flexcache-get-iter",
            "flexcache-info",
            &[("volume", name), ("vserver", self.p.vserver.as_str())],
        );
        Ok(zapi_one(ctx, &request)
            .await?
            .map(|record| Current::new(capability::from_zapi(CAPABILITIES, &record))))
    }

    fn rest_create_body(&self, attrs: &AttrMap) -> Value {
        let mut attrs = attrs.clone();
        let mut origin = serde_json::Map::new();
        if let Some(volume) = attrs.shift_remove("origin_volume") {
            capability::json_set(&mut origin, "volume.name", volume);
        }
        if let Some(svm) = attrs.shift_remove("origin_vserver") {
            capability::json_set(&mut origin, "svm.name", svm);
        }
        if let Some(cluster) = attrs.shift_remove("origin_cluster") {
            capability::json_set(&mut origin, "cluster.name", cluster);
        }
        let aggregates = attrs.shift_remove("aggr_list");
        let mut body = object(capability::to_rest(CAPABILITIES, &attrs));
        capability::json_set(&mut body, "svm.name", Value::String(self.p.vserver.clone()));
        body.insert("origins".into(), json!([origin]));
        if let Some(aggregates) = aggregates {
            body.insert("aggregates".into(), named_list(&aggregates));
        }
        Value::Object(body)
    }

    fn zapi_create_request(&self, attrs: &AttrMap) -> NaElement {
        let mut request = NaElement::new("flexcache-create-async");
        capability::to_zapi(CAPABILITIES, &mut request, attrs);
        request
    }

    /// Turn a ZAPI `*-async` result into a step outcome.
    fn async_outcome(api: &str, results: &NaElement) -> Result<StepOutcome, HandlerError> {
        match zapi_async_job(results) {
            Ok(job) => Ok(StepOutcome::job(job)),
            Err(message) => Err(ontap_api::Error::Zapi {
                api: api.to_owned(),
                code: String::new(),
                message,
            }
            .into()),
        }
    }

    fn volume_path(&self, current: Option<&Current>) -> Result<String, CoreError> {
        let uuid = observed_uuid(current, Self::KIND, &self.p.name)?;
        Ok(format!("{VOLUMES_PATH}/{uuid}"))
    }

    async fn modify_zapi(&self, ctx: &Context, attrs: &AttrMap) -> Result<(), HandlerError> {
        if let Some(size) = attrs.get("size") {
            let request = NaElement::new("volume-size")
                .with_child_content("volume", &self.p.name)
                .with_child_content("new-size", capability::zapi_text(size));
            zapi_call(ctx, &request).await?;
        }
        if let Some(path) = attrs.get("junction_path").and_then(Value::as_str) {
            self.unmount_zapi(ctx).await?;
            if !path.is_empty() {
                let request = NaElement::new("volume-mount")
                    .with_child_content("volume-name", &self.p.name)
                    .with_child_content("junction-path", path);
                zapi_call(ctx, &request).await?;
            }
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
}

impl ResourceHandler for Flexcache {
    type Params = FlexcacheParams;
    type Extra = NoExtra;

    const KIND: &'static str = "flexcache";
    const SURFACES: Surfaces = Surfaces::BOTH;
    const ARGS: ArgSpec = ArgSpec {
        required: &["name", "vserver"],
        ..ArgSpec::NONE
    };

    fn capabilities() -> &'static [Capability] {
        CAPABILITIES
    }

    fn new(params: FlexcacheParams) -> Result<Self, CoreError> {
        let size = size_bytes("size", params.size.as_ref())?;
        if params.state == State::Present && params.origin_volume.is_none() {
            return Err(CoreError::MissingRequired {
                names: vec!["origin_volume".into()],
            });
        }
        Ok(Self { p: params, size })
    }

    fn state(&self) -> State {
        self.p.state
    }

    fn name(&self) -> &str {
        &self.p.name
    }

    fn vserver(&self) -> Option<&str> {
        Some(&self.p.vserver)
    }

    fn desired(&self, _protocol: Protocol) -> AttrMap {
        let p = &self.p;
        let mut attrs = AttrMap::new();
        attrs.insert("name".into(), Value::String(p.name.clone()));
        put(&mut attrs, "origin_volume", p.origin_volume.as_ref());
        // The origin vserver defaults to the cache's own.
        let origin_vserver = p
            .origin_vserver
            .clone()
            .or_else(|| p.origin_volume.as_ref().map(|_| p.vserver.clone()));
        put(&mut attrs, "origin_vserver", origin_vserver.as_ref());
        put(&mut attrs, "origin_cluster", p.origin_cluster.as_ref());
        put(&mut attrs, "aggr_list", p.aggr_list.as_ref());
        put(&mut attrs, "aggr_list_multiplier", p.aggr_list_multiplier.as_ref());
        put(&mut attrs, "size", self.size.as_ref());
        put(&mut attrs, "junction_path", p.junction_path.as_ref());
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
        DeleteStages {
            unmount: self.p.force_unmount
                && current.str("junction_path").is_some_and(|p| !p.is_empty()),
            offline: self.p.force_offline,
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
                let results = zapi_call(ctx, &self.zapi_create_request(attrs)).await?;
                Self::async_outcome("flexcache-create-async", &results)
            }
            Op::Modify(attrs) if rest => {
                let mut body = serde_json::Map::new();
                if let Some(size) = attrs.get("size") {
                    capability::json_set(&mut body, "space.size", size.clone());
                }
                if let Some(path) = attrs.get("junction_path") {
                    capability::json_set(&mut body, "nas.path", path.clone());
                }
                let path = self.volume_path(current)?;
                Ok(rest_outcome(ctx.rest.patch(&path, &Value::Object(body), &[]).await?))
            }
            Op::Modify(attrs) => {
                self.modify_zapi(ctx, attrs).await?;
                Ok(StepOutcome::DONE)
            }
            Op::Unmount if rest => {
                let path = self.volume_path(current)?;
                let resp = ctx.rest.patch(&path, &json!({ "nas": { "path": "" } }), &[]).await?;
                Ok(rest_outcome(resp))
            }
            Op::Unmount => {
                self.unmount_zapi(ctx).await?;
                Ok(StepOutcome::DONE)
            }
            Op::Offline if rest => {
                let path = self.volume_path(current)?;
                Ok(rest_outcome(ctx.rest.patch(&path, &json!({ "state": "offline" }), &[]).await?))
            }
            Op::Offline => {
                let request =
                    NaElement::new("volume-offline").with_child_content("name", &self.p.name);
                zapi_call(ctx, &request).await?;
                Ok(StepOutcome::DONE)
            }
            Op::Delete if rest => {
                let uuid = observed_uuid(current, Self::KIND, &self.p.name)?;
                Ok(rest_outcome(ctx.rest.delete(&format!("{REST_PATH}/{uuid}"), None, &[]).await?))
            }
            Op::Delete => {
                let request = NaElement::new("flexcache-destroy-async")
                    .with_child_content("volume", &self.p.name);
                let results = zapi_call(ctx, &request).await?;
                Self::async_outcome("flexcache-destroy-async", &results)
            }
            Op::Rename { .. } => Ok(StepOutcome::NOTHING),
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
    use crate::job::JobRef;
    use crate::params;

    fn cache(v: Value) -> Flexcache {
        Flexcache::new(params::parse(&Flexcache::ARGS, v.as_object().unwrap()).unwrap()).unwrap()
    }

    #[test]
    fn origin_vserver_defaults_to_own_vserver() {
        let f = cache(json!({"name": "fc1", "vserver": "svm1", "origin_volume": "vol1"}));
        assert_eq!(f.desired(Protocol::Zapi).get("origin_vserver"), Some(&json!("svm1")));
    }

    #[test]
    fn present_needs_an_origin() {
        let p = params::parse::<FlexcacheParams>(
            &Flexcache::ARGS,
            json!({"name": "fc1", "vserver": "svm1"}).as_object().unwrap(),
        )
        .unwrap();
        assert!(Flexcache::new(p).is_err());
    }

    #[test]
    fn rest_body_nests_origin_and_aggregates() {
        let f = cache(json!({
            "name": "fc1", "vserver": "svm1", "origin_volume": "vol1",
            "aggr_list": ["aggr1"], "size": "1g"
        }));
        let body = f.rest_create_body(&f.desired(Protocol::Rest));
        assert_eq!(
            body,
            json!({
                "name": "fc1",
                "size": 1_073_741_824,
                "svm": {"name": "svm1"},
                "origins": [{"volume": {"name": "vol1"}, "svm": {"name": "svm1"}}],
                "aggregates": [{"name": "aggr1"}]
            })
        );
    }

    #[test]
    fn zapi_create_lists_aggregates() {
        let f = cache(json!({
            "name": "fc1",
            "vserver": "svm1",
            "origin_volume": "vol1",
            "aggr_list": ["a1"]
        }));
        let xml = f.zapi_create_request(&f.desired(Protocol::Zapi)).to_xml();
        assert!(xml.starts_with(
            "<flexcache-create-async><volume>fc1</volume><origin-volume>vol1</origin-volume>"
        ));
        assert!(xml.contains("<aggr-list><aggr-name>a1</aggr-name></aggr-list>"));
    }

    #[test]
    fn async_results_yield_jobs_or_errors() {
        let running = NaElement::new("results")
            .with_child_content("result-status", "in_progress")
            .with_child_content("result-jobid", "12");
        let outcome = Flexcache::async_outcome("flexcache-create-async", &running).unwrap();
        assert_eq!(outcome, StepOutcome::job(Some(JobRef::Zapi { id: "12".into() })));

        let failed = NaElement::new("results")
            .with_child_content("result-status", "failed")
            .with_child_content("result-error-message", "origin offline");
        let err = Flexcache::async_outcome("flexcache-create-async", &failed).unwrap_err();
        assert!(err.to_string().contains("origin offline"));
    }

    #[test]
    fn delete_stages_follow_force_flags() {
        let f = cache(json!({
            "name": "fc1", "vserver": "svm1", "state": "absent",
            "force_unmount": true, "force_offline": true
        }));
        let mut attrs = AttrMap::new();
        attrs.insert("junction_path".into(), json!("/fc1"));
        let stages = f.delete_stages(&Current::new(attrs), Protocol::Rest);
        assert!(stages.unmount && stages.offline);

        let f = cache(json!({"name": "fc1", "vserver": "svm1", "state": "absent"}));
        assert_eq!(f.delete_stages(&Current::default(), Protocol::Rest), DeleteStages::NONE);
    }
}
