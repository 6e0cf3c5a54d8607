// ── Aggregate handler ──
//
// Disk pools. Creation optionally waits for the aggregate to come
// online; disks can only be added; object stores are attached after
// creation (through the CLI passthrough on REST).

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::time::Instant;
use tracing::{debug, info};

use ontap_api::NaElement;

use super::{
    observed_uuid, put, rest_body, rest_fields, rest_outcome, settle, time_out, uuid_of, zapi_call,
    zapi_one, zapi_query, zapi_records,
};
use crate::capability::{self, AttrMap, Capability, Compare, attr, key, option};
use crate::error::CoreError;
use crate::handler::{Context, Current, HandlerError, ResourceHandler, StepOutcome};
use crate::params::{ArgSpec, State};
use crate::planner::{DeleteStages, NoExtra, Op, Plan, Step};
use crate::protocol::{Protocol, Surfaces};

const REST_PATH: &str = "storage/aggregates";
const CLI_ATTACH: &str = "private/cli/storage/aggregate/object-store/attach";

const CAPABILITIES: &[Capability] = &[
    key("name").rest("name").zapi("aggregate-name"),
    attr("service_state")
        .rest("state")
        .zapi("aggr-raid-attributes.state")
        .compare(Compare::CaseInsensitive),
    attr("disk_count")
        .rest("block_storage.primary.disk_count")
        .zapi("aggr-raid-attributes.disk-count")
        .int(),
    attr("disk_type")
        .rest("block_storage.primary.disk_type")
        .compare(Compare::CaseInsensitive)
        .fixed(),
    attr("disk_class")
        .rest("block_storage.primary.disk_class")
        .rest_only()
        .fixed(),
    attr("nodes")
        .rest("node.name")
        .zapi("nodes")
        .item("node-name")
        .set()
        .fixed(),
    attr("raid_type")
        .rest("block_storage.primary.raid_type")
        .zapi("aggr-raid-attributes.raid-type")
        .fixed(),
    attr("raid_size")
        .rest("block_storage.primary.raid_size")
        .zapi("aggr-raid-attributes.raid-size")
        .int()
        .fixed(),
    attr("is_mirrored")
        .rest("block_storage.mirror.enabled")
        .zapi("aggr-raid-attributes.is-mirrored")
        .boolean()
        .fixed(),
    attr("snaplock_type")
        .rest("snaplock_type")
        .zapi("aggr-snaplock-attributes.snaplock-type")
        .fixed(),
    attr("encryption")
        .rest("data_encryption.software_encryption_enabled")
        .boolean()
        .fixed(),
    attr("object_store_name")
        .rest("object_store_name")
        .zapi("object-store-name")
        .via_cli()
        .after_create(),
    option("unmount_volumes").zapi_only(),
    option("wait_for_online"),
];

/// ZAPI `aggr-create` keys.
const ZAPI_CREATE: &[(&str, &str)] = &[
    ("disk_count", "disk-count"),
    ("disk_type", "disk-type"),
    ("raid_type", "raid-type"),
    ("raid_size", "max-raid-size"),
    ("is_mirrored", "is-mirrored"),
    ("snaplock_type", "snaplock-type"),
    ("encryption", "encrypt-with-aggr-key"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Online,
    Offline,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AggregateParams {
    #[serde(default)]
    pub state: State,
    pub name: String,
    pub from_name: Option<String>,
    pub service_state: Option<ServiceState>,
    pub disk_count: Option<u64>,
    pub disk_type: Option<String>,
    pub disk_class: Option<String>,
    pub nodes: Option<Vec<String>>,
    pub raid_type: Option<String>,
    pub raid_size: Option<u64>,
    pub is_mirrored: Option<bool>,
    pub snaplock_type: Option<String>,
    pub encryption: Option<bool>,
    pub object_store_name: Option<String>,
    pub unmount_volumes: Option<bool>,
    #[serde(default)]
    pub wait_for_online: bool,
    #[serde(default = "time_out")]
    pub time_out: u64,
}

#[derive(Debug, Clone)]
pub struct Aggregate {
    p: AggregateParams,
}

impl Aggregate {
    async fn get_rest(&self, ctx: &Context, name: &str) -> Result<Option<Current>, HandlerError> {
        let query = [
            ("name", name.to_owned()),
            ("fields", rest_fields(CAPABILITIES, &[])),
        ];
        let Some(record) = ctx.rest.get_one_record(REST_PATH, &query).await? else {
            return Ok(None);
        };
        let mut attrs = capability::from_rest(CAPABILITIES, &record);
        let uuid = uuid_of(&record);
        if self.p.object_store_name.is_some() {
            if let Some(uuid) = &uuid {
                let path = format!("{REST_PATH}/{uuid}/cloud-stores");
                let stores = ctx
                    .rest
                    .get_records(&path, &[("fields", "target.name".into())])
                    .await?;
                if let Some(store) = stores
                    .first()
                    .and_then(|s| capability::json_get(s, "target.name"))
                {
                    attrs.insert("object_store_name".into(), store.clone());
                }
            }
        }
        Ok(Some(Current::new(attrs).with_uuid(uuid)))
    }

    async fn get_zapi(&self, ctx: &Context, name: &str) -> Result<Option<Current>, HandlerError> {
        let request = zapi_query("aggr-get-iter", "aggr-attributes", &[("aggregate-name", name)]);
        let Some(record) = zapi_one(ctx, &request).await? else {
            return Ok(None);
        };
        let mut attrs = capability::from_zapi(CAPABILITIES, &record);
        if self.p.object_store_name.is_some() {
            let request = zapi_query(
                "aggr-object-store-get-iter",
                "object-store-information",
                &[("aggregate", name)],
            );
            if let Some(store) = zapi_one(ctx, &request).await? {
                if let Some(value) = store.child_str("object-store-name") {
                    attrs.insert("object_store_name".into(), Value::String(value.to_owned()));
                }
            }
        }
        Ok(Some(Current::new(attrs)))
    }

    async fn create(&self, ctx: &Context, attrs: &AttrMap) -> Result<StepOutcome, HandlerError> {
        let job = if ctx.is_rest() {
            let mut create = attrs.clone();
            let node = create.shift_remove("nodes");
            let mut body = super::object(rest_body(CAPABILITIES, &create, None));
            if let Some(node) = node.as_ref().and_then(|n| n.get(0)).cloned() {
                capability::json_set(&mut body, "node.name", node);
            }
            let resp = ctx.rest.post(REST_PATH, &Value::Object(body), &[]).await?;
            resp.job.map(crate::job::JobRef::Rest)
        } else {
            let mut request =
                NaElement::new("aggr-create").with_child_content("aggregate", &self.p.name);
            for (attr, zapi_key) in ZAPI_CREATE {
                if let Some(value) = attrs.get(*attr) {
                    request.add_new_child(*zapi_key, capability::zapi_text(value));
                }
            }
            if let Some(nodes) = &self.p.nodes {
                request = request.with_list("nodes", "node-name", nodes.iter().cloned());
            }
            zapi_call(ctx, &request).await?;
            None
        };

        if !self.p.wait_for_online {
            return Ok(StepOutcome::job(job));
        }
        settle(ctx, job, self.timeout()).await?;
        self.wait_for_online(ctx).await?;
        Ok(StepOutcome::DONE)
    }

    /// Poll until the aggregate reports `online`, bounded by `time_out`.
    async fn wait_for_online(&self, ctx: &Context) -> Result<(), HandlerError> {
        let deadline = Instant::now() + self.timeout();
        let mut interval = ctx.jobs.initial_interval;
        loop {
            let current = if ctx.is_rest() {
                self.get_rest(ctx, &self.p.name).await?
            } else {
                self.get_zapi(ctx, &self.p.name).await?
            };
            let state = current
                .as_ref()
                .and_then(|c| c.str("service_state"))
                .unwrap_or("unknown")
                .to_owned();
            debug!(aggregate = %self.p.name, %state, "waiting for online");
            if state.eq_ignore_ascii_case("online") {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(CoreError::JobTimeout {
                    job_id: format!("aggregate {} online wait (state {state})", self.p.name),
                    timeout_secs: self.p.time_out,
                }
                .into());
            }
            tokio::time::sleep(interval.min(deadline - now)).await;
            interval = (interval * 2).min(ctx.jobs.max_interval);
        }
    }

    async fn modify(
        &self,
        ctx: &Context,
        attrs: &AttrMap,
        current: Option<&Current>,
    ) -> Result<StepOutcome, HandlerError> {
        let name = self.p.name.as_str();
        let state = attrs.get("service_state").and_then(Value::as_str);

        if state == Some("online") {
            self.set_state(ctx, current, "online").await?;
        }
        if let Some(desired) = attrs.get("disk_count").and_then(Value::as_u64) {
            let have = current
                .and_then(|c| c.attrs.get("disk_count"))
                .and_then(Value::as_u64)
                .unwrap_or(0);
            if ctx.is_rest() {
                let uuid = self.uuid(current)?;
                let body = json!({"block_storage": {"primary": {"disk_count": desired}}});
                let resp = ctx.rest.patch(&format!("{REST_PATH}/{uuid}"), &body, &[]).await?;
                settle(ctx, resp.job.map(crate::job::JobRef::Rest), self.timeout()).await?;
            } else {
                let request = NaElement::new("aggr-add")
                    .with_child_content("aggregate", name)
                    .with_child_content("disk-count", desired.saturating_sub(have).to_string());
                zapi_call(ctx, &request).await?;
            }
        }
        if let Some(store) = attrs.get("object_store_name").and_then(Value::as_str) {
            info!(aggregate = name, store, "attaching object store");
            if ctx.is_rest() {
                let body = json!({"aggregate": name, "object_store_name": store});
                ctx.rest.post(CLI_ATTACH, &body, &[]).await?;
            } else {
                let request = NaElement::new("aggr-object-store-attach")
                    .with_child_content("aggregate", name)
                    .with_child_content("object-store-name", store);
                zapi_call(ctx, &request).await?;
            }
        }
        if state == Some("offline") {
            self.set_state(ctx, current, "offline").await?;
        }
        Ok(StepOutcome::DONE)
    }

    async fn set_state(
        &self,
        ctx: &Context,
        current: Option<&Current>,
        state: &str,
    ) -> Result<(), HandlerError> {
        if ctx.is_rest() {
            let uuid = self.uuid(current)?;
            let resp = ctx
                .rest
                .patch(&format!("{REST_PATH}/{uuid}"), &json!({"state": state}), &[])
                .await?;
            return settle(ctx, resp.job.map(crate::job::JobRef::Rest), self.timeout()).await;
        }
        let request = if state == "online" {
            NaElement::new("aggr-online")
                .with_child_content("aggregate", &self.p.name)
                .with_child_content("force-online", "true")
        } else {
            let mut request = NaElement::new("aggr-offline")
                .with_child_content("aggregate", &self.p.name)
                .with_child_content("force-offline", "false");
            if let Some(unmount) = self.p.unmount_volumes {
                request.add_new_child("unmount-volumes", unmount.to_string());
            }
            request
        };
        zapi_call(ctx, &request).await?;
        Ok(())
    }

    /// Fail early when the first node cannot supply `disk_count` spares.
    async fn check_spares(&self, ctx: &Context) -> Result<(), HandlerError> {
        let (Some(node), Some(wanted)) = (
            self.p.nodes.as_ref().and_then(|n| n.first()),
            self.p.disk_count,
        ) else {
            return Ok(());
        };
        let mut fields = vec![
            ("disk-raid-info.container-type", "spare"),
            ("disk-ownership-info.home-node-name", node.as_str()),
        ];
        if let Some(disk_type) = &self.p.disk_type {
            fields.push(("disk-inventory-info.disk-type", disk_type.as_str()));
        }
        let request = zapi_query("storage-disk-get-iter", "storage-disk-info", &fields);
        let spares = zapi_records(ctx, &request).await?.len() as u64;
        debug!(node = %node, spares, wanted, "spare disks");
        if spares < wanted {
            return Err(CoreError::validation(format!(
                "Error: node {node} has {spares} spare disks, {wanted} requested for aggregate {}.",
                self.p.name
            ))
            .into());
        }
        Ok(())
    }

    fn uuid<'a>(&self, current: Option<&'a Current>) -> Result<&'a str, CoreError> {
        observed_uuid(current, Self::KIND, &self.p.name)
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.p.time_out)
    }
}

impl ResourceHandler for Aggregate {
    type Params = AggregateParams;
    type Extra = NoExtra;

    const KIND: &'static str = "aggregate";
    const SURFACES: Surfaces = Surfaces::BOTH;
    const ARGS: ArgSpec = ArgSpec::NAME;

    fn capabilities() -> &'static [Capability] {
        CAPABILITIES
    }

    fn new(params: AggregateParams) -> Result<Self, CoreError> {
        if params.disk_count == Some(0) {
            return Err(CoreError::invalid("Error: disk_count must be greater than 0."));
        }
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
        put(&mut attrs, "service_state", p.service_state.as_ref());
        put(&mut attrs, "disk_count", p.disk_count.as_ref());
        put(&mut attrs, "disk_type", p.disk_type.as_ref());
        put(&mut attrs, "disk_class", p.disk_class.as_ref());
        put(&mut attrs, "nodes", p.nodes.as_ref());
        put(&mut attrs, "raid_type", p.raid_type.as_ref());
        put(&mut attrs, "raid_size", p.raid_size.as_ref());
        put(&mut attrs, "is_mirrored", p.is_mirrored.as_ref());
        put(&mut attrs, "snaplock_type", p.snaplock_type.as_ref());
        put(&mut attrs, "encryption", p.encryption.as_ref());
        put(&mut attrs, "object_store_name", p.object_store_name.as_ref());
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
            offline: protocol == Protocol::Zapi
                && current
                    .str("service_state")
                    .is_some_and(|s| s.eq_ignore_ascii_case("online")),
        }
    }

    async fn plan_extra(
        &self,
        ctx: &mut Context,
        current: Option<&Current>,
        desired: &AttrMap,
        plan: &mut Plan<NoExtra>,
    ) -> Result<(), HandlerError> {
        if let (Some(current), Some(want)) = (current, self.p.disk_count) {
            let have = current.attrs.get("disk_count").and_then(Value::as_u64).unwrap_or(0);
            if want < have && self.p.state == State::Present {
                return Err(CoreError::validation(format!(
                    "Error: specified disk_count is less than current disk_count. Only adding \
                     disks is allowed.  Current: {have}, desired: {want}."
                ))
                .into());
            }
        }
        if let Some(current) = current {
            if let (Some(have), Some(want)) = (
                current.str("object_store_name"),
                desired.get("object_store_name").and_then(Value::as_str),
            ) {
                if !have.is_empty() && have != want {
                    return Err(CoreError::validation(format!(
                        "Error: object store {have} is already attached to aggregate {}, cannot \
                         attach {want}.",
                        self.p.name
                    ))
                    .into());
                }
            }
        }

        let creating = plan.position(|s| matches!(s.op, Op::Create(_))).is_some();
        if creating && !ctx.is_rest() {
            self.check_spares(ctx).await?;
        }

        // Aggregates are created online; only an offline request needs a follow-up.
        for step in plan.steps_mut() {
            if let Op::Create(attrs) = &mut step.op {
                attrs.shift_remove("service_state");
            }
        }
        if creating && self.p.service_state == Some(ServiceState::Offline) {
            let mut attrs = AttrMap::new();
            attrs.insert("service_state".into(), json!("offline"));
            plan.push(Step::new(Op::Modify(attrs)).with_timeout(self.timeout()));
        }
        Ok(())
    }

    async fn execute(
        &self,
        ctx: &mut Context,
        step: &Step<NoExtra>,
        current: Option<&Current>,
    ) -> Result<StepOutcome, HandlerError> {
        match &step.op {
            Op::Create(attrs) => self.create(ctx, attrs).await,
            Op::Modify(attrs) => self.modify(ctx, attrs, current).await,
            Op::Rename { from } => {
                if ctx.is_rest() {
                    let uuid = self.uuid(current)?;
                    let resp = ctx
                        .rest
                        .patch(&format!("{REST_PATH}/{uuid}"), &json!({"name": self.p.name}), &[])
                        .await?;
                    Ok(rest_outcome(resp))
                } else {
                    let request = NaElement::new("aggr-rename")
                        .with_child_content("aggregate", from.as_str())
                        .with_child_content("new-aggregate-name", &self.p.name);
                    zapi_call(ctx, &request).await?;
                    Ok(StepOutcome::DONE)
                }
            }
            Op::Offline => {
                self.set_state(ctx, current, "offline").await?;
                Ok(StepOutcome::DONE)
            }
            Op::Delete => {
                if ctx.is_rest() {
                    let uuid = self.uuid(current)?;
                    let resp = ctx.rest.delete(&format!("{REST_PATH}/{uuid}"), None, &[]).await?;
                    Ok(rest_outcome(resp))
                } else {
                    let request = NaElement::new("aggr-destroy")
                        .with_child_content("aggregate", &self.p.name);
                    zapi_call(ctx, &request).await?;
                    Ok(StepOutcome::DONE)
                }
            }
            Op::Unmount => Ok(StepOutcome::NOTHING),
            Op::Extra(extra) => match *extra {},
        }
    }

    fn job_timeout(&self) -> Duration {
        self.timeout()
    }
}
