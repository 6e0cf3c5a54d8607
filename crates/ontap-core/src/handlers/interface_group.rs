// ── Interface group handler ──
//
// Link aggregation groups on one node. REST models them as ethernet
// ports of type `lag` and names them itself, so a group missing by name
// is also looked for by its member ports.

use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use ontap_api::NaElement;

use super::{observed_uuid, put, rest_outcome, strings, uuid_of, zapi_call, zapi_one, zapi_query};
use crate::capability::{self, AttrMap, Capability, attr, key};
use crate::error::CoreError;
use crate::handler::{Context, Current, HandlerError, ResourceHandler, StepOutcome};
use crate::params::{ArgSpec, State};
use crate::planner::{NoExtra, Op, Plan, Step};
use crate::protocol::{Protocol, Surfaces};

const REST_PATH: &str = "network/ethernet/ports";
const FIELDS: &str = "uuid,name,node.name,lag,broadcast_domain.name,broadcast_domain.ipspace.name";
pub const REST_CREATE_NEEDS_DOMAIN: &str =
    "Error: broadcast_domain and ipspace are required to create an interface group with REST.";

const CAPABILITIES: &[Capability] = &[
    key("name").rest("name").zapi("ifgrp-name"),
    key("node").rest("node.name").zapi("node"),
    attr("ports").rest("lag.member_ports").zapi("ports").item("lif-bindable").set(),
    attr("distribution_function")
        .rest("lag.distribution_policy")
        .zapi("distribution-function")
        .fixed(),
    attr("mode").rest("lag.mode").zapi("mode").fixed(),
    attr("broadcast_domain")
        .rest("broadcast_domain.name")
        .rest_only()
        .fixed(),
    attr("ipspace")
        .rest("broadcast_domain.ipspace.name")
        .rest_only()
        .fixed(),
];

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InterfaceGroupParams {
    #[serde(default)]
    pub state: State,
    pub name: String,
    pub node: String,
    pub ports: Option<Vec<String>>,
    pub distribution_function: Option<String>,
    pub mode: Option<String>,
    pub broadcast_domain: Option<String>,
    pub ipspace: Option<String>,
}

/// Member port names of a REST `lag` record.
fn member_ports(record: &Value) -> Vec<String> {
    record
        .pointer("/lag/member_ports")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|p| p.get("name").and_then(Value::as_str).map(str::to_owned))
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Debug, Clone)]
pub struct InterfaceGroup {
    p: InterfaceGroupParams,
}

impl InterfaceGroup {
    fn into_current(record: &Value) -> Current {
        let mut attrs = capability::from_rest(CAPABILITIES, record);
        attrs.insert("ports".into(), json!(member_ports(record)));
        Current::new(attrs).with_uuid(uuid_of(record))
    }

    async fn get_rest(
        &self,
        ctx: &mut Context,
        name: &str,
    ) -> Result<Option<Current>, HandlerError> {
        let query = [
            ("type", "lag".to_owned()),
            ("node.name", self.p.node.clone()),
            ("fields", FIELDS.to_owned()),
        ];
        let mut by_name = query.to_vec();
        by_name.push(("name", name.to_owned()));
        if let Some(record) = ctx.rest.get_one_record(REST_PATH, &by_name).await? {
            return Ok(Some(Self::into_current(&record)));
        }
        let wanted = self.p.ports.clone().unwrap_or_default();
        if wanted.is_empty() {
            return Ok(None);
        }
        let lags = ctx.rest.get_records(REST_PATH, &query).await?;
        let Some(record) = lags
            .iter()
            .find(|lag| member_ports(lag).iter().any(|p| wanted.contains(p)))
        else {
            return Ok(None);
        };
        let found = record.get("name").and_then(Value::as_str).unwrap_or_default();
        ctx.warn(format!(
            "interface group {name} not found; using {found}, which holds the requested ports."
        ));
        let mut current = Self::into_current(record);
        current.attrs.insert("name".into(), Value::String(name.to_owned()));
        Ok(Some(current))
    }

    async fn get_zapi(&self, ctx: &Context, name: &str) -> Result<Option<Current>, HandlerError> {
        let probe = zapi_query(
            "net-port-get-iter",
            "net-port-info",
            &[
                ("port", name),
                ("node", self.p.node.as_str()),
                ("port-type", "if_group"),
            ],
        );
        if zapi_one(ctx, &probe).await?.is_none() {
            return Ok(None);
        }
        let request = self.group_request("net-port-ifgrp-get");
        let results = zapi_call(ctx, &request).await?;
        let Some(info) = results.find("attributes.net-ifgrp-info") else {
            return Ok(None);
        };
        let mut attrs = capability::from_zapi(CAPABILITIES, info);
        attrs.insert("name".into(), Value::String(name.to_owned()));
        attrs.entry("ports".into()).or_insert_with(|| json!([]));
        Ok(Some(Current::new(attrs)))
    }

    fn group_request(&self, api: &str) -> NaElement {
        NaElement::new(api)
            .with_child_content("ifgrp-name", &self.p.name)
            .with_child_content("node", &self.p.node)
    }

    fn rest_members(&self, ports: &[String]) -> Value {
        Value::Array(
            ports
                .iter()
                .map(|p| json!({ "name": p, "node": { "name": self.p.node } }))
                .collect(),
        )
    }

    fn rest_create_body(&self, attrs: &AttrMap) -> Value {
        let mut body = serde_json::Map::new();
        body.insert("type".into(), json!("lag"));
        capability::json_set(&mut body, "node.name", json!(self.p.node));
        for (key, value) in attrs {
            match key.as_str() {
                "name" | "node" => {}
                "ports" => capability::json_set(
                    &mut body,
                    "lag.member_ports",
                    self.rest_members(&strings(Some(value))),
                ),
                _ => {
                    let path = capability::find(CAPABILITIES, key).and_then(|c| c.rest_path);
                    if let Some(path) = path {
                        capability::json_set(&mut body, path, value.clone());
                    }
                }
            }
        }
        Value::Object(body)
    }

    async fn change_ports_zapi(
        &self,
        ctx: &Context,
        current: &[String],
        wanted: &[String],
    ) -> Result<(), HandlerError> {
        for port in wanted.iter().filter(|p| !current.contains(p)) {
            let mut request = self.group_request("net-port-ifgrp-add-port");
            request.add_new_child("port", port.as_str());
            zapi_call(ctx, &request).await?;
        }
        for port in current.iter().filter(|p| !wanted.contains(p)) {
            let mut request = self.group_request("net-port-ifgrp-remove-port");
            request.add_new_child("port", port.as_str());
            zapi_call(ctx, &request).await?;
        }
        Ok(())
    }
}

impl ResourceHandler for InterfaceGroup {
    type Params = InterfaceGroupParams;
    type Extra = NoExtra;

    const KIND: &'static str = "interface_group";
    const SURFACES: Surfaces = Surfaces::BOTH;
    const ARGS: ArgSpec = ArgSpec {
        required: &["name", "node"],
        ..ArgSpec::NONE
    };

    fn capabilities() -> &'static [Capability] {
        CAPABILITIES
    }

    fn new(params: InterfaceGroupParams) -> Result<Self, CoreError> {
        Ok(Self { p: params })
    }

    fn state(&self) -> State {
        self.p.state
    }

    fn name(&self) -> &str {
        &self.p.name
    }

    fn desired(&self, protocol: Protocol) -> AttrMap {
        let p = &self.p;
        let mut attrs = AttrMap::new();
        attrs.insert("name".into(), Value::String(p.name.clone()));
        attrs.insert("node".into(), Value::String(p.node.clone()));
        put(&mut attrs, "ports", p.ports.as_ref());
        put(&mut attrs, "distribution_function", p.distribution_function.as_ref());
        put(&mut attrs, "mode", p.mode.as_ref());
        if protocol == Protocol::Rest {
            put(&mut attrs, "broadcast_domain", p.broadcast_domain.as_ref());
            put(&mut attrs, "ipspace", p.ipspace.as_ref());
        }
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

    async fn plan_extra(
        &self,
        ctx: &mut Context,
        _current: Option<&Current>,
        _desired: &AttrMap,
        plan: &mut Plan<NoExtra>,
    ) -> Result<(), HandlerError> {
        let creates = plan.position(|s| matches!(s.op, Op::Create(_))).is_some();
        let placed = self.p.broadcast_domain.is_some() && self.p.ipspace.is_some();
        if creates && ctx.is_rest() && !placed {
            return Err(CoreError::validation(REST_CREATE_NEEDS_DOMAIN).into());
        }
        Ok(())
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
                let mut request = self.group_request("net-port-ifgrp-create");
                for key in ["distribution_function", "mode"] {
                    let cap = capability::find(CAPABILITIES, key);
                    if let (Some(value), Some(cap)) = (attrs.get(key), cap) {
                        capability::put_zapi(&mut request, cap, value);
                    }
                }
                zapi_call(ctx, &request).await?;
                self.change_ports_zapi(ctx, &[], &strings(attrs.get("ports"))).await?;
                Ok(StepOutcome::DONE)
            }
            Op::Modify(attrs) => {
                let current = current.ok_or_else(|| {
                    CoreError::Internal(format!("interface group {} was not read", self.p.name))
                })?;
                let wanted = strings(attrs.get("ports"));
                if rest {
                    let uuid = current.require_uuid(Self::KIND, &self.p.name)?;
                    debug!(group = %self.p.name, ports = ?wanted, "replacing member ports");
                    let mut body = serde_json::Map::new();
                    capability::json_set(&mut body, "lag.member_ports", self.rest_members(&wanted));
                    let resp = ctx
                        .rest
                        .patch(&format!("{REST_PATH}/{uuid}"), &Value::Object(body), &[])
                        .await?;
                    Ok(rest_outcome(resp))
                } else {
                    let members = strings(current.attrs.get("ports"));
                    self.change_ports_zapi(ctx, &members, &wanted).await?;
                    Ok(StepOutcome::DONE)
                }
            }
            Op::Delete if rest => {
                let uuid = observed_uuid(current, Self::KIND, &self.p.name)?;
                Ok(rest_outcome(ctx.rest.delete(&format!("{REST_PATH}/{uuid}"), None, &[]).await?))
            }
            Op::Delete => {
                zapi_call(ctx, &self.group_request("net-port-ifgrp-destroy")).await?;
                Ok(StepOutcome::DONE)
            }
            Op::Rename { .. } | Op::Unmount | Op::Offline => Ok(StepOutcome::NOTHING),
            Op::Extra(extra) => match *extra {},
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

    fn group(v: Value) -> InterfaceGroup {
        let params = params::parse(&InterfaceGroup::ARGS, v.as_object().unwrap()).unwrap();
        InterfaceGroup::new(params).unwrap()
    }

    #[test]
    fn members_are_read_from_lag() {
        let record = json!({"lag": {"member_ports": [{"name": "e0c"}, {"name": "e0d"}]}});
        assert_eq!(member_ports(&record), vec!["e0c".to_owned(), "e0d".to_owned()]);
        assert!(member_ports(&json!({})).is_empty());
    }

    #[test]
    fn rest_create_body_nests_lag_settings() {
        let g = group(json!({
            "name": "a0a", "node": "n1", "ports": ["e0c"], "mode": "multimode_lacp",
            "distribution_function": "ip", "broadcast_domain": "bd1", "ipspace": "Default"
        }));
        let body = g.rest_create_body(&g.desired(Protocol::Rest));
        assert_eq!(
            body,
            json!({
                "type": "lag",
                "node": {"name": "n1"},
                "lag": {
                    "member_ports": [{"name": "e0c", "node": {"name": "n1"}}],
                    "distribution_policy": "ip",
                    "mode": "multimode_lacp"
                },
                "broadcast_domain": {"name": "bd1", "ipspace": {"name": "Default"}}
            })
        );
    }

    #[tokio::test]
    async fn rest_create_needs_a_broadcast_domain() {
        let g = group(json!({"name": "a0a", "node": "n1", "ports": ["e0c"]}));
        let mut ctx = offline_context(Protocol::Rest);
        let mut plan = Plan::default();
        plan.push(Step::new(Op::Create(g.desired(Protocol::Rest))));
        let err = g.plan_extra(&mut ctx, None, &AttrMap::new(), &mut plan).await.unwrap_err();
        assert_eq!(err.to_string(), REST_CREATE_NEEDS_DOMAIN);

        let mut ctx = offline_context(Protocol::Zapi);
        assert!(g.plan_extra(&mut ctx, None, &AttrMap::new(), &mut plan).await.is_ok());
    }

    #[test]
    fn zapi_group_requests_name_the_node() {
        let g = group(json!({"name": "a0a", "node": "n1"}));
        assert_eq!(
            g.group_request("net-port-ifgrp-destroy").to_xml(),
            "<net-port-ifgrp-destroy><ifgrp-name>a0a</ifgrp-name><node>n1</node>\
             </net-port-ifgrp-destroy>"
        );
    }
}
