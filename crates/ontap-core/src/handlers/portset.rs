// ── Portset handler ──
//
// SAN portsets. Member interfaces are an unordered set changed one
// interface at a time; REST needs to know whether each is IP or FC.

use serde::Deserialize;
use serde_json::{Value, json};
use strum::{AsRefStr, Display};
use tracing::debug;

use ontap_api::NaElement;

use super::{observed_uuid, put, rest_outcome, strings, uuid_of, zapi_call, zapi_one, zapi_query};
use crate::capability::{self, AttrMap, Capability, attr, key, option};
use crate::error::CoreError;
use crate::handler::{Context, Current, HandlerError, ResourceHandler, StepOutcome};
use crate::params::{ArgSpec, State};
use crate::planner::{NoExtra, Op, Step};
use crate::protocol::{Protocol, Surfaces};

const REST_PATH: &str = "protocols/san/portsets";
const FIELDS: &str = "uuid,name,protocol,interfaces";

const CAPABILITIES: &[Capability] = &[
    key("name").rest("name").zapi("portset-name"),
    attr("protocol").rest("protocol").zapi("portset-type").fixed(),
    attr("ports")
        .rest("interfaces")
        .zapi("portset-port-info")
        .item("portset-port-name")
        .set(),
    option("force"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PortsetProtocol {
    Fcp,
    Iscsi,
    Mixed,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PortsetParams {
    #[serde(default)]
    pub state: State,
    pub name: String,
    pub vserver: String,
    #[serde(rename = "type")]
    pub protocol: Option<PortsetProtocol>,
    pub ports: Option<Vec<String>>,
    #[serde(default)]
    pub force: bool,
}

/// Which LIF family an interface name belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LifFamily {
    Ip,
    Fc,
}

impl LifFamily {
    /// Key of the interface reference in portset bodies.
    const fn key(self) -> &'static str {
        match self {
            Self::Ip => "ip",
            Self::Fc => "fc",
        }
    }
}

/// One member as REST reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Member {
    name: String,
    uuid: String,
}

impl Member {
    fn from_rest(item: &Value) -> Option<Self> {
        let name = item
            .pointer("/ip/name")
            .or_else(|| item.pointer("/fc/name"))
            .and_then(Value::as_str)?;
        Some(Self {
            name: name.to_owned(),
            uuid: item.get("uuid").and_then(Value::as_str)?.to_owned(),
        })
    }
}

/// Members to add and remove to go from `current` to `wanted`.
fn port_changes(current: &[String], wanted: &[String]) -> (Vec<String>, Vec<String>) {
    let add = wanted.iter().filter(|w| !current.contains(w)).cloned().collect();
    let remove = current.iter().filter(|c| !wanted.contains(c)).cloned().collect();
    (add, remove)
}

#[derive(Debug, Clone)]
pub struct Portset {
    p: PortsetParams,
}

impl Portset {
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
        let members: Vec<Member> = record
            .get("interfaces")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Member::from_rest).collect())
            .unwrap_or_default();
        attrs.insert("ports".into(), json!(members.iter().map(|m| &m.name).collect::<Vec<_>>()));
        let aux = Value::Array(
            members
                .iter()
                .map(|m| json!({ "name": m.name, "uuid": m.uuid }))
                .collect(),
        );
        Ok(Some(Current::new(attrs).with_uuid(uuid_of(&record)).with_aux(aux)))
    }

    async fn get_zapi(&self, ctx: &Context, name: &str) -> Result<Option<Current>, HandlerError> {
        let request = zapi_query(
            "portset-get-iter",
            "portset-info",
            &[("portset-name", name), ("vserver", self.p.vserver.as_str())],
        );
        let Some(record) = zapi_one(ctx, &request).await? else {
            return Ok(None);
        };
        let mut attrs = capability::from_zapi(CAPABILITIES, &record);
        attrs.entry("ports".into()).or_insert_with(|| json!([]));
        Ok(Some(Current::new(attrs)))
    }

    /// Look an interface name up among IP LIFs, then FC LIFs.
    async fn lif_family(&self, ctx: &Context, name: &str) -> Result<LifFamily, HandlerError> {
        let query = [
            ("name", name.to_owned()),
            ("svm.name", self.p.vserver.clone()),
            ("fields", "uuid".to_owned()),
        ];
        for (family, path) in [
            (LifFamily::Ip, "network/ip/interfaces"),
            (LifFamily::Fc, "network/fc/interfaces"),
        ] {
            if ctx.rest.get_one_record(path, &query).await?.is_some() {
                return Ok(family);
            }
        }
        Err(CoreError::validation(format!(
            "Error: port {name} not found on vserver {}.",
            self.p.vserver
        ))
        .into())
    }

    async fn add_rest(
        &self,
        ctx: &Context,
        uuid: &str,
        ports: &[String],
    ) -> Result<(), HandlerError> {
        if ports.is_empty() {
            return Ok(());
        }
        let mut records = Vec::with_capacity(ports.len());
        for port in ports {
            let family: &str = self.lif_family(ctx, port).await?.key();
            records.push(json!({ family: { "name": port } }));
        }
        let path = format!("{REST_PATH}/{uuid}/interfaces");
        ctx.rest.post(&path, &json!({ "records": records }), &[]).await?;
        Ok(())
    }

    async fn remove_rest(
        &self,
        ctx: &Context,
        uuid: &str,
        current: &Current,
        ports: &[String],
    ) -> Result<(), HandlerError> {
        let members = current.aux.as_array().map(Vec::as_slice).unwrap_or_default();
        for port in ports {
            let Some(member) = members
                .iter()
                .find(|m| m.get("name").and_then(Value::as_str) == Some(port.as_str()))
                .and_then(|m| m.get("uuid").and_then(Value::as_str))
            else {
                continue;
            };
            debug!(portset = %self.p.name, %port, "removing interface");
            ctx.rest
                .delete(&format!("{REST_PATH}/{uuid}/interfaces/{member}"), None, &[])
                .await?;
        }
        Ok(())
    }

    fn member_request(&self, api: &str, port: &str) -> NaElement {
        NaElement::new(api)
            .with_child_content("portset-name", &self.p.name)
            .with_child_content("portset-port-name", port)
    }

    async fn sync_zapi(
        &self,
        ctx: &Context,
        add: &[String],
        remove: &[String],
    ) -> Result<(), HandlerError> {
        for port in add {
            zapi_call(ctx, &self.member_request("portset-add", port)).await?;
        }
        for port in remove {
            let mut request = self.member_request("portset-remove", port);
            if self.p.force {
                request.add_new_child("force", "true");
            }
            zapi_call(ctx, &request).await?;
        }
        Ok(())
    }
}

impl ResourceHandler for Portset {
    type Params = PortsetParams;
    type Extra = NoExtra;

    const KIND: &'static str = "portset";
    const SURFACES: Surfaces = Surfaces::BOTH;
    const ARGS: ArgSpec = ArgSpec {
        required: &["name", "vserver"],
        ..ArgSpec::NONE
    };

    fn capabilities() -> &'static [Capability] {
        CAPABILITIES
    }

    fn new(params: PortsetParams) -> Result<Self, CoreError> {
        Ok(Self { p: params })
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
        let mut attrs = AttrMap::new();
        attrs.insert("name".into(), Value::String(self.p.name.clone()));
        put(&mut attrs, "protocol", self.p.protocol.map(|p| p.to_string()).as_ref());
        put(&mut attrs, "ports", self.p.ports.as_ref());
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

    async fn execute(
        &self,
        ctx: &mut Context,
        step: &Step<NoExtra>,
        current: Option<&Current>,
    ) -> Result<StepOutcome, HandlerError> {
        let rest = ctx.is_rest();
        match &step.op {
            Op::Create(attrs) if rest => {
                let mut body = json!({
                    "name": self.p.name,
                    "svm": { "name": self.p.vserver },
                });
                if let Some(protocol) = attrs.get("protocol") {
                    body["protocol"] = protocol.clone();
                }
                let ports = strings(attrs.get("ports"));
                if !ports.is_empty() {
                    let mut interfaces = Vec::with_capacity(ports.len());
                    for port in &ports {
                        let family: &str = self.lif_family(ctx, port).await?.key();
                        interfaces.push(json!({ family: { "name": port } }));
                    }
                    body["interfaces"] = Value::Array(interfaces);
                }
                Ok(rest_outcome(ctx.rest.post(REST_PATH, &body, &[]).await?))
            }
            Op::Create(attrs) => {
                let mut request = NaElement::new("portset-create")
                    .with_child_content("portset-name", &self.p.name);
                if let Some(protocol) = attrs.get("protocol") {
                    request.add_new_child("portset-type", capability::zapi_text(protocol));
                }
                zapi_call(ctx, &request).await?;
                self.sync_zapi(ctx, &strings(attrs.get("ports")), &[]).await?;
                Ok(StepOutcome::DONE)
            }
            Op::Modify(attrs) => {
                let Some(current) = current else {
                    let reason = format!("portset {} was not read", self.p.name);
                    return Err(CoreError::Internal(reason).into());
                };
                let have = strings(current.attrs.get("ports"));
                let (add, remove) = port_changes(&have, &strings(attrs.get("ports")));
                if rest {
                    let uuid = current.require_uuid(Self::KIND, &self.p.name)?;
                    self.add_rest(ctx, uuid, &add).await?;
                    self.remove_rest(ctx, uuid, current, &remove).await?;
                } else {
                    self.sync_zapi(ctx, &add, &remove).await?;
                }
                Ok(StepOutcome::DONE)
            }
            Op::Delete if rest => {
                let uuid = observed_uuid(current, Self::KIND, &self.p.name)?;
                Ok(rest_outcome(ctx.rest.delete(&format!("{REST_PATH}/{uuid}"), None, &[]).await?))
            }
            Op::Delete => {
                let request = NaElement::new("portset-destroy")
                    .with_child_content("portset-name", &self.p.name)
                    .with_child_content("force", self.p.force.to_string());
                zapi_call(ctx, &request).await?;
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

    fn names(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn changes_add_missing_and_remove_extra() {
        let (add, remove) = port_changes(&names(&["lif1", "lif2"]), &names(&["lif2", "lif3"]));
        assert_eq!(add, names(&["lif3"]));
        assert_eq!(remove, names(&["lif1"]));
    }

    #[test]
    fn members_read_ip_and_fc_names() {
        let ip = json!({"uuid": "u1", "ip": {"name": "lif1"}});
        let fc = json!({"uuid": "u2", "fc": {"name": "fc_lif"}});
        assert_eq!(Member::from_rest(&ip).unwrap().name, "lif1");
        assert_eq!(Member::from_rest(&fc).unwrap().uuid, "u2");
        assert!(Member::from_rest(&json!({"uuid": "u3"})).is_none());
    }

    #[test]
    fn type_maps_to_protocol() {
        let params: PortsetParams = crate::params::parse(
            &Portset::ARGS,
            json!({"name": "ps1", "vserver": "svm1", "type": "iscsi"}).as_object().unwrap(),
        )
        .unwrap();
        let p = Portset::new(params).unwrap();
        assert_eq!(p.desired(Protocol::Rest).get("protocol"), Some(&json!("iscsi")));
    }

    #[test]
    fn family_keys_render_lowercase() {
        assert_eq!(LifFamily::Ip.key(), "ip");
        assert_eq!(LifFamily::Fc.key(), "fc");
    }
}
