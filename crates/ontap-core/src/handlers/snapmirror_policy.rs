// ── SnapMirror policy handler ──
//
// Policies carry an ordered list of retention rules given as parallel
// lists (label, keep, prefix, schedule). REST replaces the whole list in
// one PATCH; ZAPI adds, modifies and removes rules one by one.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use strum::{AsRefStr, Display};
use tracing::debug;

use ontap_api::NaElement;

use super::{
    object, observed_uuid, put, rest_body, rest_fields, rest_outcome, uuid_of, zapi_call, zapi_one,
    zapi_query,
};
use crate::capability::{self, AttrMap, Capability, Compare, ValueKind, attr, key};
use crate::error::CoreError;
use crate::handler::{Context, Current, HandlerError, ResourceHandler, StepOutcome};
use crate::params::{ArgSpec, State};
use crate::planner::{NoExtra, Op, Plan, Step};
use crate::protocol::{Protocol, Surfaces};

const REST_PATH: &str = "snapmirror/policies";

/// Rule created by the system on mirror-vault policies; never managed.
const SYSTEM_RULE: &str = "sm_created";

const CAPABILITIES: &[Capability] = &[
    key("name").rest("name").zapi("policy-name"),
    attr("policy_type").rest("type").zapi("type").fixed(),
    attr("comment").rest("comment").zapi("comment"),
    attr("transfer_priority")
        .zapi("transfer-priority")
        .zapi_only(),
    attr("is_network_compression_enabled")
        .rest("network_compression_enabled")
        .zapi("is-network-compression-enabled")
        .boolean(),
    attr("snapmirror_label").kind(ValueKind::StrList).compare(Compare::Never),
    attr("keep").kind(ValueKind::IntList).compare(Compare::Never),
    attr("prefix").kind(ValueKind::StrList).compare(Compare::Never),
    attr("schedule").kind(ValueKind::StrList).compare(Compare::Never),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PolicyType {
    AsyncMirror,
    MirrorVault,
    Vault,
    SyncMirror,
    StrictSyncMirror,
}

impl PolicyType {
    /// REST collapses the asynchronous flavours into `async`.
    fn rest_type(self) -> &'static str {
        match self {
            Self::AsyncMirror | Self::MirrorVault | Self::Vault => "async",
            Self::SyncMirror | Self::StrictSyncMirror => "sync",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SnapmirrorPolicyParams {
    #[serde(default)]
    pub state: State,
    pub name: String,
    pub vserver: String,
    pub policy_type: Option<PolicyType>,
    pub comment: Option<String>,
    pub transfer_priority: Option<String>,
    pub is_network_compression_enabled: Option<bool>,
    pub snapmirror_label: Option<Vec<String>>,
    pub keep: Option<Vec<u64>>,
    pub prefix: Option<Vec<String>>,
    pub schedule: Option<Vec<String>>,
}

/// One retention rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub label: String,
    pub keep: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
}

impl Rule {
    /// Equal on label and keep; prefix and schedule only when `self`
    /// (the desired rule) names them.
    fn satisfied_by(&self, other: &Rule) -> bool {
        self.label == other.label
            && self.keep == other.keep
            && self.prefix.as_ref().is_none_or(|p| other.prefix.as_deref().unwrap_or("") == p)
            && self
                .schedule
                .as_ref()
                .is_none_or(|s| other.schedule.as_deref().unwrap_or("") == s)
    }

    fn to_rest(&self) -> Value {
        let mut rule = json!({ "label": self.label, "count": self.keep });
        if let Some(prefix) = self.prefix.as_ref().filter(|p| !p.is_empty()) {
            rule["prefix"] = json!(prefix);
        }
        if let Some(schedule) = self.schedule.as_ref().filter(|s| !s.is_empty()) {
            rule["creation_schedule"] = json!({ "name": schedule });
        }
        rule
    }

    fn from_rest(record: &Value) -> Option<Self> {
        let label = record.get("label")?.as_str()?.to_owned();
        let keep = match record.get("count")? {
            Value::Number(n) => n.as_u64()?,
            Value::String(s) => s.trim().parse().ok()?,
            _ => return None,
        };
        Some(Self {
            label,
            keep,
            prefix: record.get("prefix").and_then(Value::as_str).map(str::to_owned),
            schedule: capability::json_get(record, "creation_schedule.name")
                .and_then(Value::as_str)
                .map(str::to_owned),
        })
    }

    fn from_zapi(info: &NaElement) -> Option<Self> {
        Some(Self {
            label: info.child_str("snapmirror-label")?.to_owned(),
            keep: u64::try_from(info.child_int("keep")?).ok()?,
            prefix: info.child_str("prefix").map(str::to_owned),
            schedule: info.child_str("schedule").map(str::to_owned),
        })
    }

    fn zapi_request(&self, api: &str, policy: &str) -> NaElement {
        let mut request = NaElement::new(api)
            .with_child_content("policy-name", policy)
            .with_child_content("snapmirror-label", &self.label)
            .with_child_content("keep", self.keep.to_string());
        if let Some(prefix) = self.prefix.as_ref().filter(|p| !p.is_empty()) {
            request.add_new_child("prefix", prefix);
        }
        if let Some(schedule) = self.schedule.as_ref().filter(|s| !s.is_empty()) {
            request.add_new_child("schedule", schedule);
        }
        request
    }
}

/// Whether `current` already holds exactly the `desired` rules, in order.
pub fn rules_match(current: &[Rule], desired: &[Rule]) -> bool {
    current.len() == desired.len()
        && desired.iter().zip(current).all(|(want, have)| want.satisfied_by(have))
}

fn managed(rules: Vec<Rule>) -> Vec<Rule> {
    rules.into_iter().filter(|r| r.label != SYSTEM_RULE).collect()
}

fn rules_of(current: &Current) -> Vec<Rule> {
    serde_json::from_value(current.aux.get("rules").cloned().unwrap_or(Value::Null))
        .unwrap_or_default()
}

fn rule_attrs(attrs: &mut AttrMap, rules: &[Rule]) {
    attrs.insert(
        "snapmirror_label".into(),
        json!(rules.iter().map(|r| r.label.clone()).collect::<Vec<_>>()),
    );
    attrs.insert("keep".into(), json!(rules.iter().map(|r| r.keep).collect::<Vec<_>>()));
}

#[derive(Debug, Clone)]
pub struct SnapmirrorPolicy {
    p: SnapmirrorPolicyParams,
    rules: Option<Vec<Rule>>,
}

impl SnapmirrorPolicy {
    fn build_rules(p: &SnapmirrorPolicyParams) -> Result<Option<Vec<Rule>>, CoreError> {
        let (labels, keeps) = match (&p.snapmirror_label, &p.keep) {
            (None, None) => {
                if p.prefix.is_some() || p.schedule.is_some() {
                    return Err(CoreError::validation(
                        "Error: prefix and schedule require snapmirror_label and keep.",
                    ));
                }
                return Ok(None);
            }
            (Some(labels), Some(keeps)) => (labels, keeps),
            _ => {
                return Err(CoreError::RequiredTogether {
                    names: vec!["snapmirror_label".into(), "keep".into()],
                });
            }
        };
        let n = labels.len();
        let mismatched = keeps.len() != n
            || p.prefix.as_ref().is_some_and(|v| v.len() != n)
            || p.schedule.as_ref().is_some_and(|v| v.len() != n);
        if mismatched {
            return Err(CoreError::validation(
                "Error: each rule must have a value for snapmirror_label and keep, and prefix \
                 and schedule when given; the lists must have the same length.",
            ));
        }
        let pick = |list: Option<&Vec<String>>, i: usize| list.and_then(|v| v.get(i)).cloned();
        Ok(Some(
            labels
                .iter()
                .zip(keeps)
                .enumerate()
                .map(|(i, (label, keep))| Rule {
                    label: label.clone(),
                    keep: *keep,
                    prefix: pick(p.prefix.as_ref(), i),
                    schedule: pick(p.schedule.as_ref(), i),
                })
                .collect(),
        ))
    }

    async fn get_rest(&self, ctx: &Context, name: &str) -> Result<Option<Current>, HandlerError> {
        let query = [
            ("name", name.to_owned()),
            ("svm.name", self.p.vserver.clone()),
            ("fields", rest_fields(CAPABILITIES, &["retention"])),
        ];
        let Some(record) = ctx.rest.get_one_record(REST_PATH, &query).await? else {
            return Ok(None);
        };
        let rules: Vec<Rule> = record
            .get("retention")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Rule::from_rest).collect())
            .unwrap_or_default();
        Ok(Some(self.current(
            capability::from_rest(CAPABILITIES, &record),
            managed(rules),
            uuid_of(&record),
        )))
    }

    async fn get_zapi(&self, ctx: &Context, name: &str) -> Result<Option<Current>, HandlerError> {
        let request = zapi_query(
            "snapmirror-policy-get-iter",
            "snapmirror-policy-info",
            &[("policy-name", name), ("vserver-name", self.p.vserver.as_str())],
        );
        let Some(record) = zapi_one(ctx, &request).await? else {
            return Ok(None);
        };
        let rules: Vec<Rule> = record
            .child("snapmirror-policy-rules")
            .map(|list| list.children().iter().filter_map(Rule::from_zapi).collect())
            .unwrap_or_default();
        Ok(Some(self.current(
            capability::from_zapi(CAPABILITIES, &record),
            managed(rules),
            None,
        )))
    }

    fn current(&self, mut attrs: AttrMap, rules: Vec<Rule>, uuid: Option<String>) -> Current {
        rule_attrs(&mut attrs, &rules);
        Current::new(attrs)
            .with_uuid(uuid)
            .with_aux(json!({ "rules": rules }))
    }

    fn rest_retention(attrs: &AttrMap) -> Option<Value> {
        let rules: Vec<Rule> = serde_json::from_value(attrs.get("rules")?.clone()).ok()?;
        Some(Value::Array(rules.iter().map(Rule::to_rest).collect()))
    }

    fn rest_body(&self, attrs: &AttrMap, vserver: Option<&str>) -> Value {
        let mut body = object(rest_body(CAPABILITIES, attrs, vserver));
        if let Some(retention) = Self::rest_retention(attrs) {
            body.insert("retention".into(), retention);
        }
        Value::Object(body)
    }

    /// Bring the policy's rules from `have` to `want` with ZAPI rule calls.
    async fn sync_rules_zapi(
        &self,
        ctx: &Context,
        have: &[Rule],
        want: &[Rule],
    ) -> Result<(), HandlerError> {
        let policy = self.p.name.as_str();
        for rule in have.iter().filter(|h| !want.iter().any(|w| w.label == h.label)) {
            let request = NaElement::new("snapmirror-policy-remove-rule")
                .with_child_content("policy-name", policy)
                .with_child_content("snapmirror-label", &rule.label);
            zapi_call(ctx, &request).await?;
        }
        for rule in want {
            match have.iter().find(|h| h.label == rule.label) {
                Some(existing) if rule.satisfied_by(existing) => {}
                Some(_) => {
                    let request = rule.zapi_request("snapmirror-policy-modify-rule", policy);
                    zapi_call(ctx, &request).await?;
                }
                None => {
                    let request = rule.zapi_request("snapmirror-policy-add-rule", policy);
                    zapi_call(ctx, &request).await?;
                }
            }
        }
        Ok(())
    }

    fn zapi_policy_request(&self, api: &str, attrs: &AttrMap) -> Option<NaElement> {
        let mut request = NaElement::new(api).with_child_content("policy-name", &self.p.name);
        let mut any = false;
        for (attr, element) in [
            ("policy_type", "policy-type"),
            ("comment", "comment"),
            ("transfer_priority", "transfer-priority"),
            ("is_network_compression_enabled", "is-network-compression-enabled"),
        ] {
            if let Some(value) = attrs.get(attr) {
                request.add_new_child(element, capability::zapi_text(value));
                any = true;
            }
        }
        any.then_some(request)
    }

    fn uuid<'a>(&self, current: Option<&'a Current>) -> Result<&'a str, CoreError> {
        observed_uuid(current, Self::KIND, &self.p.name)
    }
}

impl ResourceHandler for SnapmirrorPolicy {
    type Params = SnapmirrorPolicyParams;
    type Extra = NoExtra;

    const KIND: &'static str = "snapmirror_policy";
    const SURFACES: Surfaces = Surfaces::BOTH;
    const ARGS: ArgSpec = ArgSpec {
        required: &["name", "vserver"],
        ..ArgSpec::NONE
    };

    fn capabilities() -> &'static [Capability] {
        CAPABILITIES
    }

    fn new(params: SnapmirrorPolicyParams) -> Result<Self, CoreError> {
        let rules = Self::build_rules(&params)?;
        Ok(Self { p: params, rules })
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

    fn desired(&self, protocol: Protocol) -> AttrMap {
        let p = &self.p;
        let mut attrs = AttrMap::new();
        attrs.insert("name".into(), Value::String(p.name.clone()));
        if let Some(policy_type) = p.policy_type {
            let value = match protocol {
                Protocol::Rest => policy_type.rest_type().to_owned(),
                Protocol::Zapi => policy_type.to_string(),
            };
            attrs.insert("policy_type".into(), Value::String(value));
        }
        put(&mut attrs, "comment", p.comment.as_ref());
        put(&mut attrs, "transfer_priority", p.transfer_priority.as_ref());
        put(
            &mut attrs,
            "is_network_compression_enabled",
            p.is_network_compression_enabled.as_ref(),
        );
        if let Some(rules) = &self.rules {
            rule_attrs(&mut attrs, rules);
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
        _ctx: &mut Context,
        current: Option<&Current>,
        _desired: &AttrMap,
        plan: &mut Plan<NoExtra>,
    ) -> Result<(), HandlerError> {
        let Some(want) = &self.rules else {
            return Ok(());
        };
        let rules = serde_json::to_value(want)
            .map_err(|e| CoreError::Internal(format!("cannot encode rules: {e}")))?;
        for step in plan.steps_mut() {
            if let Op::Create(attrs) = &mut step.op {
                attrs.insert("rules".into(), rules.clone());
                return Ok(());
            }
        }
        if self.p.state == State::Absent {
            return Ok(());
        }
        let Some(current) = current else {
            return Ok(());
        };
        let have = rules_of(current);
        if rules_match(&have, want) {
            return Ok(());
        }
        debug!(policy = %self.p.name, have = have.len(), want = want.len(), "rules differ");
        match plan.modify_attrs_mut() {
            Some(attrs) => {
                attrs.insert("rules".into(), rules);
            }
            None => {
                let mut attrs = AttrMap::new();
                attrs.insert("rules".into(), rules);
                plan.push(Step::new(Op::Modify(attrs)));
            }
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
                let body = self.rest_body(attrs, Some(&self.p.vserver));
                Ok(rest_outcome(ctx.rest.post(REST_PATH, &body, &[]).await?))
            }
            Op::Create(attrs) => {
                if let Some(request) = self.zapi_policy_request("snapmirror-policy-create", attrs) {
                    zapi_call(ctx, &request).await?;
                } else {
                    let request = NaElement::new("snapmirror-policy-create")
                        .with_child_content("policy-name", &self.p.name);
                    zapi_call(ctx, &request).await?;
                }
                if let Some(want) = &self.rules {
                    self.sync_rules_zapi(ctx, &[], want).await?;
                }
                Ok(StepOutcome::DONE)
            }
            Op::Modify(attrs) if rest => {
                let uuid = self.uuid(current)?;
                let body = self.rest_body(attrs, None);
                Ok(rest_outcome(ctx.rest.patch(&format!("{REST_PATH}/{uuid}"), &body, &[]).await?))
            }
            Op::Modify(attrs) => {
                if let Some(request) = self.zapi_policy_request("snapmirror-policy-modify", attrs) {
                    zapi_call(ctx, &request).await?;
                }
                if let (Some(want), true) = (&self.rules, attrs.contains_key("rules")) {
                    let have = current.map(rules_of).unwrap_or_default();
                    self.sync_rules_zapi(ctx, &have, want).await?;
                }
                Ok(StepOutcome::DONE)
            }
            Op::Delete if rest => {
                let uuid = self.uuid(current)?;
                Ok(rest_outcome(ctx.rest.delete(&format!("{REST_PATH}/{uuid}"), None, &[]).await?))
            }
            Op::Delete => {
                let request = NaElement::new("snapmirror-policy-delete")
                    .with_child_content("policy-name", &self.p.name);
                zapi_call(ctx, &request).await?;
                Ok(StepOutcome::DONE)
            }
            Op::Rename { .. } | Op::Unmount | Op::Offline => Ok(StepOutcome::NOTHING),
            Op::Extra(extra) => match *extra {},
        }
    }
}
