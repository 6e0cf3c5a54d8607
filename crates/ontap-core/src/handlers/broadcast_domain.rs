// ── Broadcast domain handler ──
//
// Layer-2 port groupings within an IPspace. Creating a domain whose
// ports already form a whole existing domain renames that domain;
// creating one from part of an existing domain splits it.

use std::collections::BTreeSet;
use std::fmt;

use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info};

use ontap_api::NaElement;

use super::{
    observed_uuid, put, rest_outcome, strings, uuid_of, zapi_call, zapi_one, zapi_query,
    zapi_records,
};
use crate::capability::{self, AttrMap, Capability, attr, key};
use crate::error::CoreError;
use crate::handler::{Context, Current, HandlerError, ResourceHandler, StepOutcome};
use crate::job::JobRef;
use crate::params::{ArgSpec, State};
use crate::planner::{DEFAULT_JOB_TIMEOUT, Op, Plan, Step};
use crate::protocol::{Protocol, Surfaces};

const REST_PATH: &str = "network/ethernet/broadcast-domains";
const PORTS_PATH: &str = "network/ethernet/ports";
const FIELDS: &str = "uuid,name,ipspace.name,mtu,ports";
const DEFAULT_IPSPACE: &str = "Default";
const DEFAULT_MTU: u64 = 1500;

const CAPABILITIES: &[Capability] = &[
    key("name").rest("name").zapi("broadcast-domain"),
    attr("ipspace").rest("ipspace.name").zapi("ipspace").fixed(),
    attr("mtu").rest("mtu").zapi("mtu").int(),
    attr("ports").rest("ports").zapi("ports").set(),
];

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BroadcastDomainParams {
    #[serde(default)]
    pub state: State,
    pub name: String,
    pub from_name: Option<String>,
    pub ipspace: Option<String>,
    pub mtu: Option<u64>,
    /// `node:port` names.
    pub ports: Option<Vec<String>>,
}

/// A member port, with its REST UUID when known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortRef {
    pub name: String,
    pub uuid: Option<String>,
}

/// Compound broadcast-domain steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainExtra {
    /// Move `ports` out of `from` into a new domain.
    Split { from: String, ports: Vec<PortRef> },
    /// Rename `from`, whose ports are exactly the desired ones.
    Adopt { from: String, uuid: Option<String> },
}

impl fmt::Display for DomainExtra {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Split { from, ports } => {
                let names: Vec<&str> = ports.iter().map(|p| p.name.as_str()).collect();
                write!(f, "split {} from broadcast domain {from}", names.join(", "))
            }
            Self::Adopt { from, .. } => write!(f, "rename broadcast domain {from}"),
        }
    }
}

/// One domain as read from the controller.
#[derive(Debug, Clone)]
struct Domain {
    name: String,
    uuid: Option<String>,
    attrs: AttrMap,
    ports: Vec<PortRef>,
}

impl Domain {
    fn from_rest(record: &Value) -> Self {
        let ports: Vec<PortRef> = record
            .get("ports")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|p| {
                        let node = capability::json_get(p, "node.name")?.as_str()?;
                        let port = p.get("name")?.as_str()?;
                        Some(PortRef {
                            name: format!("{node}:{port}"),
                            uuid: uuid_of(p),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Self::with_ports(capability::from_rest(CAPABILITIES, record), uuid_of(record), ports)
    }

    fn from_zapi(record: &NaElement) -> Self {
        let ports: Vec<PortRef> = record
            .child("ports")
            .map(|list| {
                list.children()
                    .iter()
                    .filter_map(|info| info.child_str("port"))
                    .map(|name| PortRef {
                        name: name.to_owned(),
                        uuid: None,
                    })
                    .collect()
            })
            .unwrap_or_default();
        Self::with_ports(capability::from_zapi(CAPABILITIES, record), None, ports)
    }

    fn with_ports(mut attrs: AttrMap, uuid: Option<String>, ports: Vec<PortRef>) -> Self {
        attrs.insert(
            "ports".into(),
            json!(ports.iter().map(|p| p.name.clone()).collect::<Vec<_>>()),
        );
        let name = attrs
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        Self {
            name,
            uuid,
            attrs,
            ports,
        }
    }

    fn port_names(&self) -> BTreeSet<&str> {
        self.ports.iter().map(|p| p.name.as_str()).collect()
    }

    fn into_current(self) -> Current {
        let ports: Vec<Value> = self
            .ports
            .iter()
            .map(|p| json!({ "name": p.name, "uuid": p.uuid }))
            .collect();
        Current::new(self.attrs)
            .with_uuid(self.uuid)
            .with_aux(json!({ "ports": ports }))
    }
}

/// What creating a domain with `wanted` ports means given the
/// existing domains of the IPspace.
fn reuse_plan(domains: &[Domain], wanted: &BTreeSet<&str>) -> Option<DomainExtra> {
    let mut holders = domains
        .iter()
        .filter(|d| d.ports.iter().any(|p| wanted.contains(p.name.as_str())));
    let holder = holders.next()?;
    if holders.next().is_some() {
        return None;
    }
    let have = holder.port_names();
    if !wanted.is_subset(&have) {
        return None;
    }
    if have == *wanted {
        return Some(DomainExtra::Adopt {
            from: holder.name.clone(),
            uuid: holder.uuid.clone(),
        });
    }
    Some(DomainExtra::Split {
        from: holder.name.clone(),
        ports: holder
            .ports
            .iter()
            .filter(|p| wanted.contains(p.name.as_str()))
            .cloned()
            .collect(),
    })
}

#[derive(Debug, Clone)]
pub struct BroadcastDomain {
    p: BroadcastDomainParams,
}

impl BroadcastDomain {
    fn ipspace(&self) -> &str {
        self.p.ipspace.as_deref().unwrap_or(DEFAULT_IPSPACE)
    }

    async fn domains(
        &self,
        ctx: &Context,
        name: Option<&str>,
    ) -> Result<Vec<Domain>, HandlerError> {
        if ctx.is_rest() {
            let mut query = vec![
                ("ipspace.name", self.ipspace().to_owned()),
                ("fields", FIELDS.to_owned()),
            ];
            if let Some(name) = name {
                query.insert(0, ("name", name.to_owned()));
            }
            let records = ctx.rest.get_records(REST_PATH, &query).await?;
            Ok(records.iter().map(Domain::from_rest).collect())
        } else {
            let mut fields = vec![("ipspace", self.ipspace())];
            if let Some(name) = name {
                fields.insert(0, ("broadcast-domain", name));
            }
            let request = zapi_query(
                "net-port-broadcast-domain-get-iter",
                "net-port-broadcast-domain-info",
                &fields,
            );
            let records = if name.is_some() {
                zapi_one(ctx, &request).await?.into_iter().collect()
            } else {
                zapi_records(ctx, &request).await?
            };
            Ok(records.iter().map(Domain::from_zapi).collect())
        }
    }

    /// A renamed domain, or a ZAPI split, keeps the source domain's MTU;
    /// a different requested MTU needs its own modify.
    fn mtu_after_reuse(
        &self,
        domains: &[Domain],
        reuse: &DomainExtra,
        rest: bool,
    ) -> Option<Step<DomainExtra>> {
        let from = match reuse {
            DomainExtra::Adopt { from, .. } => from,
            DomainExtra::Split { from, .. } if !rest => from,
            DomainExtra::Split { .. } => return None,
        };
        let wanted = self.p.mtu?;
        let source = domains.iter().find(|d| &d.name == from)?;
        if source.attrs.get("mtu").and_then(Value::as_u64) == Some(wanted) {
            return None;
        }
        let mut attrs = AttrMap::new();
        attrs.insert("mtu".into(), json!(wanted));
        Some(Step::new(Op::Modify(attrs)))
    }

    fn domain_ref(&self, name: &str) -> Value {
        json!({ "name": name, "ipspace": { "name": self.ipspace() } })
    }

    /// Move one port into the domain `name` (REST).
    async fn move_port(
        &self,
        ctx: &Context,
        port: &PortRef,
        name: &str,
    ) -> Result<(), HandlerError> {
        let uuid = match &port.uuid {
            Some(uuid) => uuid.clone(),
            None => self.port_uuid(ctx, &port.name).await?,
        };
        let body = json!({ "broadcast_domain": self.domain_ref(name) });
        ctx.rest.patch(&format!("{PORTS_PATH}/{uuid}"), &body, &[]).await?;
        Ok(())
    }

    async fn port_uuid(&self, ctx: &Context, qualified: &str) -> Result<String, HandlerError> {
        let (node, port) = qualified.split_once(':').ok_or_else(|| {
            CoreError::invalid(format!("Error: port {qualified} must be given as node:port."))
        })?;
        let query = [
            ("node.name", node.to_owned()),
            ("name", port.to_owned()),
            ("fields", "uuid".to_owned()),
        ];
        let record = ctx.rest.get_one_record(PORTS_PATH, &query).await?;
        Ok(record
            .as_ref()
            .and_then(uuid_of)
            .ok_or_else(|| CoreError::validation(format!("Error: port {qualified} not found.")))?)
    }

    fn zapi_ports(&self, api: &str, domain: &str, ports: &[String]) -> NaElement {
        NaElement::new(api)
            .with_child_content("broadcast-domain", domain)
            .with_child_content("ipspace", self.ipspace())
            .with_list("ports", "net-qualified-port-name", ports.iter().cloned())
    }

    async fn create(&self, ctx: &Context, attrs: &AttrMap) -> Result<StepOutcome, HandlerError> {
        let ports = strings(attrs.get("ports"));
        if !ctx.is_rest() {
            let mut request = NaElement::new("net-port-broadcast-domain-create")
                .with_child_content("broadcast-domain", &self.p.name)
                .with_child_content("ipspace", self.ipspace());
            if let Some(mtu) = self.p.mtu {
                request.add_new_child("mtu", mtu.to_string());
            }
            if !ports.is_empty() {
                request = request.with_list("ports", "net-qualified-port-name", ports);
            }
            zapi_call(ctx, &request).await?;
            return Ok(StepOutcome::DONE);
        }
        let body = json!({
            "name": self.p.name,
            "ipspace": { "name": self.ipspace() },
            "mtu": self.p.mtu.unwrap_or(DEFAULT_MTU),
        });
        let resp = ctx.rest.post(REST_PATH, &body, &[]).await?;
        super::settle(ctx, resp.job.map(JobRef::Rest), DEFAULT_JOB_TIMEOUT).await?;
        for name in ports {
            let port = PortRef { name, uuid: None };
            self.move_port(ctx, &port, &self.p.name).await?;
        }
        Ok(StepOutcome::DONE)
    }

    async fn modify(
        &self,
        ctx: &mut Context,
        attrs: &AttrMap,
        current: Option<&Current>,
    ) -> Result<StepOutcome, HandlerError> {
        let fetched;
        let current = match current {
            Some(current) => current,
            None => {
                fetched = self.get_current(ctx, &self.p.name).await?.ok_or_else(|| {
                    CoreError::Internal(format!("broadcast domain {} was not read", self.p.name))
                })?;
                &fetched
            }
        };
        let rest = ctx.is_rest();
        if let Some(mtu) = attrs.get("mtu") {
            if rest {
                let uuid = current.require_uuid(Self::KIND, &self.p.name)?;
                ctx.rest
                    .patch(&format!("{REST_PATH}/{uuid}"), &json!({ "mtu": mtu }), &[])
                    .await?;
            } else {
                let request = NaElement::new("net-port-broadcast-domain-modify")
                    .with_child_content("broadcast-domain", &self.p.name)
                    .with_child_content("ipspace", self.ipspace())
                    .with_child_content("mtu", capability::zapi_text(mtu));
                zapi_call(ctx, &request).await?;
            }
        }
        if let Some(wanted) = attrs.get("ports") {
            let wanted = strings(Some(wanted));
            let have = strings(current.attrs.get("ports"));
            let add: Vec<String> = wanted.iter().filter(|p| !have.contains(p)).cloned().collect();
            let remove: Vec<String> =
                have.iter().filter(|p| !wanted.contains(p)).cloned().collect();
            debug!(add = ?add, remove = ?remove, "broadcast domain ports");
            if rest {
                for name in add {
                    self.move_port(ctx, &PortRef { name, uuid: None }, &self.p.name).await?;
                }
            } else {
                if !add.is_empty() {
                    let api = "net-port-broadcast-domain-add-ports";
                    let request = self.zapi_ports(api, &self.p.name, &add);
                    zapi_call(ctx, &request).await?;
                }
                if !remove.is_empty() {
                    let api = "net-port-broadcast-domain-remove-ports";
                    let request = self.zapi_ports(api, &self.p.name, &remove);
                    zapi_call(ctx, &request).await?;
                }
            }
        }
        Ok(StepOutcome::DONE)
    }

    async fn split(
        &self,
        ctx: &Context,
        from: &str,
        ports: &[PortRef],
    ) -> Result<StepOutcome, HandlerError> {
        info!(from, to = %self.p.name, ports = ports.len(), "splitting broadcast domain");
        if ctx.is_rest() {
            let body = json!({
                "name": self.p.name,
                "ipspace": { "name": self.ipspace() },
                "mtu": self.p.mtu.unwrap_or(DEFAULT_MTU),
            });
            let resp = ctx.rest.post(REST_PATH, &body, &[]).await?;
            super::settle(ctx, resp.job.map(JobRef::Rest), DEFAULT_JOB_TIMEOUT).await?;
            for port in ports {
                self.move_port(ctx, port, &self.p.name).await?;
            }
        } else {
            let names: Vec<String> = ports.iter().map(|p| p.name.clone()).collect();
            let request = NaElement::new("net-port-broadcast-domain-split")
                .with_child_content("broadcast-domain", from)
                .with_child_content("new-broadcast-domain", &self.p.name)
                .with_child_content("ipspace", self.ipspace())
                .with_list("ports", "net-qualified-port-name", names);
            zapi_call(ctx, &request).await?;
        }
        Ok(StepOutcome::DONE)
    }

    async fn rename(
        &self,
        ctx: &Context,
        from: &str,
        uuid: Option<&str>,
    ) -> Result<StepOutcome, HandlerError> {
        if ctx.is_rest() {
            let uuid = uuid.ok_or_else(|| {
                CoreError::Internal(format!("broadcast domain {from} has no uuid"))
            })?;
            let resp = ctx
                .rest
                .patch(&format!("{REST_PATH}/{uuid}"), &json!({ "name": self.p.name }), &[])
                .await?;
            return Ok(rest_outcome(resp));
        }
        let request = NaElement::new("net-port-broadcast-domain-rename")
            .with_child_content("broadcast-domain", from)
            .with_child_content("new-name", &self.p.name)
            .with_child_content("ipspace", self.ipspace());
        zapi_call(ctx, &request).await?;
        Ok(StepOutcome::DONE)
    }
}

impl ResourceHandler for BroadcastDomain {
    type Params = BroadcastDomainParams;
    type Extra = DomainExtra;

    const KIND: &'static str = "broadcast_domain";
    const SURFACES: Surfaces = Surfaces::BOTH;
    const ARGS: ArgSpec = ArgSpec::NAME;

    fn capabilities() -> &'static [Capability] {
        CAPABILITIES
    }

    fn new(params: BroadcastDomainParams) -> Result<Self, CoreError> {
        if let Some(bad) = params
            .ports
            .iter()
            .flatten()
            .find(|p| !p.contains(':'))
        {
            return Err(CoreError::invalid(format!(
                "Error: port {bad} must be given as node:port."
            )));
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
        let mut attrs = AttrMap::new();
        attrs.insert("name".into(), Value::String(self.p.name.clone()));
        put(&mut attrs, "ipspace", self.p.ipspace.as_ref());
        put(&mut attrs, "mtu", self.p.mtu.as_ref());
        put(&mut attrs, "ports", self.p.ports.as_ref());
        attrs
    }

    async fn get_current(
        &self,
        ctx: &mut Context,
        name: &str,
    ) -> Result<Option<Current>, HandlerError> {
        let mut domains = self.domains(ctx, Some(name)).await?;
        if domains.len() > 1 {
            let count = domains.len();
            return Err(CoreError::Internal(format!(
                "broadcast domain {name} matched {count} records"
            ))
            .into());
        }
        Ok(domains.pop().map(Domain::into_current))
    }

    async fn plan_extra(
        &self,
        ctx: &mut Context,
        current: Option<&Current>,
        _desired: &AttrMap,
        plan: &mut Plan<DomainExtra>,
    ) -> Result<(), HandlerError> {
        if let (Some(current), Some(wanted), true) = (current, &self.p.ports, ctx.is_rest()) {
            let have = strings(current.attrs.get("ports"));
            let removed: Vec<&String> = have.iter().filter(|p| !wanted.contains(p)).collect();
            let modifies_ports = plan.modify_attrs_mut().is_some_and(|m| m.contains_key("ports"));
            if modifies_ports && !removed.is_empty() {
                return Err(CoreError::validation(format!(
                    "Error: removing ports from broadcast domain {} is not supported with \
                     REST: {}.",
                    self.p.name,
                    removed.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
                ))
                .into());
            }
        }

        let Some(index) = plan.position(|s| matches!(s.op, Op::Create(_))) else {
            return Ok(());
        };
        let Some(ports) = self.p.ports.as_ref().filter(|p| !p.is_empty()) else {
            return Ok(());
        };
        let wanted: BTreeSet<&str> = ports.iter().map(String::as_str).collect();
        let domains = self.domains(ctx, None).await?;
        let Some(reuse) = reuse_plan(&domains, &wanted) else {
            return Ok(());
        };
        debug!(step = %reuse, "reusing existing ports");
        let mtu_step = self.mtu_after_reuse(&domains, &reuse, ctx.is_rest());
        let timeout = plan.steps()[index].job.timeout;
        plan.steps_mut()[index] = Step::new(Op::Extra(reuse)).with_timeout(timeout);
        if let Some(step) = mtu_step {
            plan.insert(index + 1, step);
        }
        Ok(())
    }

    async fn execute(
        &self,
        ctx: &mut Context,
        step: &Step<DomainExtra>,
        current: Option<&Current>,
    ) -> Result<StepOutcome, HandlerError> {
        match &step.op {
            Op::Create(attrs) => self.create(ctx, attrs).await,
            Op::Modify(attrs) => self.modify(ctx, attrs, current).await,
            Op::Rename { from } => {
                self.rename(ctx, from, current.and_then(|c| c.uuid.as_deref())).await
            }
            Op::Extra(DomainExtra::Split { from, ports }) => self.split(ctx, from, ports).await,
            Op::Extra(DomainExtra::Adopt { from, uuid }) => {
                self.rename(ctx, from, uuid.as_deref()).await
            }
            Op::Delete if ctx.is_rest() => {
                let uuid = observed_uuid(current, Self::KIND, &self.p.name)?;
                let resp = ctx.rest.delete(&format!("{REST_PATH}/{uuid}"), None, &[]).await?;
                Ok(rest_outcome(resp))
            }
            Op::Delete => {
                let request = NaElement::new("net-port-broadcast-domain-destroy")
                    .with_child_content("broadcast-domain", &self.p.name)
                    .with_child_content("ipspace", self.ipspace());
                zapi_call(ctx, &request).await?;
                Ok(StepOutcome::DONE)
            }
            Op::Unmount | Op::Offline => Ok(StepOutcome::NOTHING),
        }
    }
}
