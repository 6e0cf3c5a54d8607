// ── Job schedule handler ──
//
// Cron job schedules. Months are kept 1-based internally: ZAPI counts
// from 0 and is shifted on read and write. An empty list or `-1` means
// every value in the field's range.

use serde::Deserialize;
use serde_json::{Value, json};

use ontap_api::NaElement;

use super::{observed_uuid, rest_outcome, uuid_of, zapi_call, zapi_one, zapi_query};
use crate::capability::{self, AttrMap, Capability, Compare, ValueKind, attr, key, option};
use crate::diff::shift_months;
use crate::error::CoreError;
use crate::handler::{Context, Current, HandlerError, ResourceHandler, StepOutcome};
use crate::params::{ArgSpec, State};
use crate::planner::{NoExtra, Op, Plan, Step};
use crate::protocol::{Protocol, Surfaces};

const REST_PATH: &str = "cluster/schedules";
const FIELDS: &str = "uuid,name,cron";
pub const MINUTES_REQUIRED: &str = "Error: missing required parameter for create: job_minutes.";

/// One cron field: attribute, REST key under `cron`, and value range.
struct CronField {
    attr: &'static str,
    rest: &'static str,
    low: i64,
    high: i64,
}

const CRON: &[CronField] = &[
    CronField { attr: "job_minutes", rest: "minutes", low: 0, high: 59 },
    CronField { attr: "job_hours", rest: "hours", low: 0, high: 23 },
    CronField { attr: "job_days_of_month", rest: "days", low: 1, high: 31 },
    CronField { attr: "job_months", rest: "months", low: 1, high: 12 },
    CronField { attr: "job_days_of_week", rest: "weekdays", low: 0, high: 6 },
];

const fn cron(name: &'static str, low: i64, high: i64) -> Capability {
    attr(name)
        .kind(ValueKind::IntList)
        .compare(Compare::AllValues { low, high })
}

const CAPABILITIES: &[Capability] = &[
    key("name").rest("name").zapi("job-schedule-name"),
    cron("job_minutes", 0, 59)
        .rest("cron.minutes")
        .zapi("job-schedule-cron-minute")
        .item("cron-minute"),
    cron("job_hours", 0, 23)
        .rest("cron.hours")
        .zapi("job-schedule-cron-hour")
        .item("cron-hour"),
    cron("job_days_of_month", 1, 31)
        .rest("cron.days")
        .zapi("job-schedule-cron-day-of-month")
        .item("cron-day-of-month"),
    cron("job_months", 1, 12)
        .rest("cron.months")
        .zapi("job-schedule-cron-month")
        .item("cron-month"),
    cron("job_days_of_week", 0, 6)
        .rest("cron.weekdays")
        .zapi("job-schedule-cron-day-of-week")
        .item("cron-day-of-week"),
    option("month_offset"),
];

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobScheduleParams {
    #[serde(default)]
    pub state: State,
    pub name: String,
    pub job_minutes: Option<Vec<i64>>,
    pub job_hours: Option<Vec<i64>>,
    pub job_days_of_month: Option<Vec<i64>>,
    pub job_months: Option<Vec<i64>>,
    pub job_days_of_week: Option<Vec<i64>>,
    /// Base of `job_months`: 0 or 1. Defaults to the surface's own.
    pub month_offset: Option<u8>,
}

fn ints(value: Option<&Value>) -> Vec<i64> {
    value
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_i64).collect())
        .unwrap_or_default()
}

/// REST rejects `-1`: every value is sent as the full range.
fn rest_cron_value(field: &CronField, value: &Value) -> Value {
    let items = ints(Some(value));
    if items.is_empty() || items.contains(&-1) {
        json!((field.low..=field.high).collect::<Vec<_>>())
    } else {
        json!(items)
    }
}

#[derive(Debug, Clone)]
pub struct JobSchedule {
    p: JobScheduleParams,
}

impl JobSchedule {
    async fn get_rest(ctx: &Context, name: &str) -> Result<Option<Current>, HandlerError> {
        let query = [("name", name.to_owned()), ("fields", FIELDS.to_owned())];
        let Some(record) = ctx.rest.get_one_record(REST_PATH, &query).await? else {
            return Ok(None);
        };
        let mut attrs = capability::from_rest(CAPABILITIES, &record);
        for field in CRON {
            attrs.entry(field.attr.into()).or_insert_with(|| json!([]));
        }
        Ok(Some(Current::new(attrs).with_uuid(uuid_of(&record))))
    }

    async fn get_zapi(ctx: &Context, name: &str) -> Result<Option<Current>, HandlerError> {
        let request = zapi_query(
            "job-schedule-cron-get-iter",
            "job-schedule-cron-info",
            &[("job-schedule-name", name)],
        );
        let Some(record) = zapi_one(ctx, &request).await? else {
            return Ok(None);
        };
        let mut attrs = capability::from_zapi(CAPABILITIES, &record);
        for field in CRON {
            attrs.entry(field.attr.into()).or_insert_with(|| json!([]));
        }
        if let Some(months) = attrs.get_mut("job_months") {
            *months = json!(shift_months(&ints(Some(months)), 0, 1));
        }
        Ok(Some(Current::new(attrs)))
    }

    fn rest_cron(attrs: &AttrMap) -> Value {
        let mut cron = serde_json::Map::new();
        for field in CRON {
            if let Some(value) = attrs.get(field.attr) {
                cron.insert(field.rest.into(), rest_cron_value(field, value));
            }
        }
        Value::Object(cron)
    }

    /// Create or modify request; months go back to 0-based.
    fn zapi_request(&self, api: &str, attrs: &AttrMap) -> NaElement {
        let mut request = NaElement::new(api).with_child_content("job-schedule-name", &self.p.name);
        for field in CRON {
            let Some(value) = attrs.get(field.attr) else { continue };
            let value = if field.attr == "job_months" {
                json!(shift_months(&ints(Some(value)), 1, 0))
            } else {
                value.clone()
            };
            if let Some(cap) = capability::find(CAPABILITIES, field.attr) {
                capability::put_zapi(&mut request, cap, &value);
            }
        }
        request
    }
}

impl ResourceHandler for JobSchedule {
    type Params = JobScheduleParams;
    type Extra = NoExtra;

    const KIND: &'static str = "job_schedule";
    const SURFACES: Surfaces = Surfaces::BOTH;
    const ARGS: ArgSpec = ArgSpec::NAME;

    fn capabilities() -> &'static [Capability] {
        CAPABILITIES
    }

    fn new(params: JobScheduleParams) -> Result<Self, CoreError> {
        if params.month_offset.is_some_and(|o| o > 1) {
            return Err(CoreError::invalid("Error: month_offset must be 0 or 1."));
        }
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
        let fields = [
            ("job_minutes", &p.job_minutes),
            ("job_hours", &p.job_hours),
            ("job_days_of_month", &p.job_days_of_month),
            ("job_days_of_week", &p.job_days_of_week),
        ];
        for (key, value) in fields {
            if let Some(value) = value {
                attrs.insert(key.into(), json!(value));
            }
        }
        if let Some(months) = &p.job_months {
            let base = p.month_offset.map_or(
                match protocol {
                    Protocol::Rest => 1,
                    Protocol::Zapi => 0,
                },
                i64::from,
            );
            attrs.insert("job_months".into(), json!(shift_months(months, base, 1)));
        }
        attrs
    }

    async fn get_current(
        &self,
        ctx: &mut Context,
        name: &str,
    ) -> Result<Option<Current>, HandlerError> {
        if ctx.is_rest() {
            Self::get_rest(ctx, name).await
        } else {
            Self::get_zapi(ctx, name).await
        }
    }

    async fn plan_extra(
        &self,
        _ctx: &mut Context,
        _current: Option<&Current>,
        _desired: &AttrMap,
        plan: &mut Plan<NoExtra>,
    ) -> Result<(), HandlerError> {
        let creating = plan.position(|s| matches!(s.op, Op::Create(_))).is_some();
        if creating && self.p.job_minutes.is_none() {
            return Err(CoreError::validation(MINUTES_REQUIRED).into());
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
                let mut cron = serde_json::Map::new();
                // Omitted fields mean every value.
                for field in CRON {
                    let Some(value) = attrs.get(field.attr) else { continue };
                    let items = ints(Some(value));
                    if !items.is_empty() && !items.contains(&-1) {
                        cron.insert(field.rest.into(), json!(items));
                    }
                }
                let body = json!({ "name": self.p.name, "cron": cron });
                Ok(rest_outcome(ctx.rest.post(REST_PATH, &body, &[]).await?))
            }
            Op::Create(attrs) => {
                zapi_call(ctx, &self.zapi_request("job-schedule-cron-create", attrs)).await?;
                Ok(StepOutcome::DONE)
            }
            Op::Modify(attrs) if rest => {
                let uuid = observed_uuid(current, Self::KIND, &self.p.name)?;
                let body = json!({ "cron": Self::rest_cron(attrs) });
                Ok(rest_outcome(ctx.rest.patch(&format!("{REST_PATH}/{uuid}"), &body, &[]).await?))
            }
            Op::Modify(attrs) => {
                zapi_call(ctx, &self.zapi_request("job-schedule-cron-modify", attrs)).await?;
                Ok(StepOutcome::DONE)
            }
            Op::Delete if rest => {
                let uuid = observed_uuid(current, Self::KIND, &self.p.name)?;
                Ok(rest_outcome(ctx.rest.delete(&format!("{REST_PATH}/{uuid}"), None, &[]).await?))
            }
            Op::Delete => {
                let request = NaElement::new("job-schedule-cron-destroy")
                    .with_child_content("job-schedule-name", &self.p.name);
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
    use crate::diff;
    use crate::params;

    fn schedule(v: Value) -> JobSchedule {
        JobSchedule::new(params::parse(&JobSchedule::ARGS, v.as_object().unwrap()).unwrap())
            .unwrap()
    }

    #[test]
    fn zero_based_months_are_shifted() {
        let s = schedule(json!({"name": "s1", "job_months": [0, 11], "month_offset": 0}));
        assert_eq!(s.desired(Protocol::Rest).get("job_months"), Some(&json!([1, 12])));
    }

    #[test]
    fn month_base_defaults_to_the_surface() {
        let s = schedule(json!({"name": "s1", "job_months": [5]}));
        assert_eq!(s.desired(Protocol::Zapi).get("job_months"), Some(&json!([6])));
        assert_eq!(s.desired(Protocol::Rest).get("job_months"), Some(&json!([5])));
    }

    #[test]
    fn zapi_writes_zero_based_months() {
        let s = schedule(json!({"name": "s1", "job_minutes": [15], "job_months": [1]}));
        let xml = s.zapi_request("job-schedule-cron-create", &s.desired(Protocol::Rest)).to_xml();
        assert!(xml.contains(
            "<job-schedule-cron-minute><cron-minute>15</cron-minute></job-schedule-cron-minute>"
        ));
        assert!(xml.contains(
            "<job-schedule-cron-month><cron-month>0</cron-month></job-schedule-cron-month>"
        ));
    }

    #[test]
    fn every_value_sentinel_matches_full_range() {
        let mut current = AttrMap::new();
        current.insert("job_hours".into(), json!((0..=23).collect::<Vec<_>>()));
        let mut desired = AttrMap::new();
        desired.insert("job_hours".into(), json!([-1]));
        let outcome = diff::diff(CAPABILITIES, &current, &desired, Protocol::Rest);
        assert!(outcome.is_empty());
    }

    #[test]
    fn rest_modify_expands_every_value() {
        let mut attrs = AttrMap::new();
        attrs.insert("job_days_of_week".into(), json!([-1]));
        attrs.insert("job_minutes".into(), json!([5, 35]));
        assert_eq!(
            JobSchedule::rest_cron(&attrs),
            json!({"weekdays": [0, 1, 2, 3, 4, 5, 6], "minutes": [5, 35]})
        );
    }

    #[test]
    fn offset_must_be_zero_or_one() {
        let p = params::parse::<JobScheduleParams>(
            &JobSchedule::ARGS,
            json!({"name": "s1", "month_offset": 2}).as_object().unwrap(),
        )
        .unwrap();
        assert!(JobSchedule::new(p).is_err());
    }
}
