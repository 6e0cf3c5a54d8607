// ── Resource handlers ──
//
// One module per ONTAP object type, plus the lookup and body helpers
// they share.

pub mod aggregate;
pub mod broadcast_domain;
pub mod ems_destination;
pub mod flexcache;
pub mod interface_group;
pub mod job_schedule;
pub mod lun;
pub mod portset;
pub mod snapmirror_policy;
pub mod software_download;
pub mod svm;
pub mod user;
pub mod volume;

pub use aggregate::Aggregate;
pub use broadcast_domain::BroadcastDomain;
pub use ems_destination::EmsDestination;
pub use flexcache::Flexcache;
pub use interface_group::InterfaceGroup;
pub use job_schedule::JobSchedule;
pub use lun::Lun;
pub use portset::Portset;
pub use snapmirror_policy::SnapmirrorPolicy;
pub use software_download::SoftwareDownload;
pub use svm::Svm;
pub use user::User;
pub use volume::Volume;

use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};

use ontap_api::{NaElement, RestResponse};

use crate::capability::{self, AttrMap, Capability};
use crate::error::CoreError;
use crate::handler::{Context, Current, HandlerError, StepOutcome};
use crate::job::{JobRef, JobResult};

// ── Parameters ───────────────────────────────────────────────────────

/// Insert `value` under `key` when the user supplied it.
pub(crate) fn put<T: Serialize>(attrs: &mut AttrMap, key: &str, value: Option<&T>) {
    if let Some(value) = value.and_then(|v| serde_json::to_value(v).ok()) {
        if !value.is_null() {
            attrs.insert(key.to_owned(), value);
        }
    }
}

/// Serde default for `time_out` parameters.
pub(crate) fn time_out() -> u64 {
    crate::planner::DEFAULT_JOB_TIMEOUT.as_secs()
}

/// Validate a user-supplied size and return it in bytes.
pub(crate) fn size_bytes(key: &str, value: Option<&Value>) -> Result<Option<u64>, CoreError> {
    value
        .map(|v| {
            crate::diff::parse_size(v)
                .ok_or_else(|| CoreError::invalid(format!("Error: invalid {key}: {v}")))
        })
        .transpose()
}

// ── REST helpers ─────────────────────────────────────────────────────

/// `fields=` projection covering every mapped attribute plus `uuid`.
pub(crate) fn rest_fields(caps: &[Capability], extra: &[&str]) -> String {
    let mut fields: Vec<&str> = vec!["uuid"];
    for path in caps.iter().filter(|c| !c.option && !c.via_cli).filter_map(|c| c.rest_path) {
        if !fields.contains(&path) {
            fields.push(path);
        }
    }
    fields.extend(extra.iter().copied().filter(|f| !f.is_empty()));
    fields.join(",")
}

/// Percent-encode one path segment.
pub(crate) fn segment(raw: &str) -> String {
    url::form_urlencoded::byte_serialize(raw.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}

/// UUID of the object a step acts on; the object must have been read.
pub(crate) fn observed_uuid<'a>(
    current: Option<&'a Current>,
    resource: &str,
    name: &str,
) -> Result<&'a str, CoreError> {
    current
        .ok_or_else(|| CoreError::Internal(format!("{resource} {name} was not read")))?
        .require_uuid(resource, name)
}

pub(crate) fn uuid_of(record: &Value) -> Option<String> {
    record.get("uuid").and_then(Value::as_str).map(str::to_owned)
}

/// Names of a `[{name: ..}]` array at `path`.
pub(crate) fn names_at(record: &Value, path: &str) -> Option<Value> {
    capability::json_get(record, path)
        .and_then(Value::as_array)
        .map(|items| {
            Value::Array(
                items
                    .iter()
                    .filter_map(|i| i.get("name").cloned())
                    .collect(),
            )
        })
}

/// `[{name: ..}]` from a list of names.
pub(crate) fn named_list(value: &Value) -> Value {
    Value::Array(
        value
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .map(|n| serde_json::json!({ "name": n }))
                    .collect()
            })
            .unwrap_or_default(),
    )
}

/// Outcome of a REST mutation: changed, plus the job when `202`.
pub(crate) fn rest_outcome(resp: RestResponse) -> StepOutcome {
    StepOutcome::job(resp.job.map(JobRef::Rest))
}

/// Wait for a job inside a step that issues several calls.
pub(crate) async fn settle(
    ctx: &Context,
    job: Option<JobRef>,
    timeout: Duration,
) -> Result<(), HandlerError> {
    let Some(job) = job else { return Ok(()) };
    let result = ctx
        .jobs
        .wait_for_job(&ctx.rest, &ctx.zapi, &job, timeout, false)
        .await?;
    match result {
        JobResult::Success(_) | JobResult::NotFoundTreatedAsSuccess => Ok(()),
        JobResult::Failure(message) => Err(CoreError::JobFailed {
            job_id: job.id().to_owned(),
            message,
        }
        .into()),
        JobResult::Timeout { limit_secs } => Err(CoreError::JobTimeout {
            job_id: job.id().to_owned(),
            timeout_secs: limit_secs,
        }
        .into()),
    }
}

/// A REST body for `attrs`, with `svm.name` when scoped.
pub(crate) fn rest_body(caps: &[Capability], attrs: &AttrMap, vserver: Option<&str>) -> Value {
    let mut body = capability::to_rest(caps, attrs);
    if let (Some(vserver), Value::Object(map)) = (vserver, &mut body) {
        capability::json_set(map, "svm.name", Value::String(vserver.to_owned()));
    }
    body
}

pub(crate) fn object(body: Value) -> Map<String, Value> {
    match body {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

// ── ZAPI helpers ─────────────────────────────────────────────────────

/// `<api><query><wrapper>..</wrapper></query></api>`; dotted keys nest.
pub(crate) fn zapi_query(api: &str, wrapper: &str, fields: &[(&str, &str)]) -> NaElement {
    let mut info = NaElement::new(wrapper);
    for (path, value) in fields {
        info.set_path(path, *value);
    }
    NaElement::new(api).with_child(NaElement::new("query").with_child(info))
}

/// Every record of a `*-get-iter` call.
pub(crate) async fn zapi_records(
    ctx: &Context,
    request: &NaElement,
) -> Result<Vec<NaElement>, HandlerError> {
    Ok(ctx.zapi.invoke_iter(request, true).await?)
}

/// The single record of a `*-get-iter` call, if any.
pub(crate) async fn zapi_one(
    ctx: &Context,
    request: &NaElement,
) -> Result<Option<NaElement>, HandlerError> {
    let mut records = zapi_records(ctx, request).await?;
    if records.len() > 1 {
        return Err(CoreError::Internal(format!(
            "{} matched {} records",
            request.name(),
            records.len()
        ))
        .into());
    }
    Ok(records.pop())
}

/// Issue a ZAPI call through the context's client.
pub(crate) async fn zapi_call(
    ctx: &Context,
    request: &NaElement,
) -> Result<NaElement, HandlerError> {
    Ok(ctx.zapi.invoke(request, true).await?)
}

/// List-of-strings attribute as owned strings.
pub(crate) fn strings(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_owned))
                .collect()
        })
        .unwrap_or_default()
}

/// A context whose clients point nowhere, for planning tests.
#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) fn offline_context(protocol: crate::protocol::Protocol) -> Context {
    use ontap_api::{Credentials, RestClient, ZapiClient};
    use secrecy::SecretString;

    let credentials = Credentials::new("admin", SecretString::from("netapp1!"));
    let base = url::Url::parse("http://127.0.0.1:9/api/").unwrap();
    let http = reqwest::Client::new();
    Context::new(
        RestClient::with_client(http.clone(), base.clone(), credentials.clone()),
        ZapiClient::with_client(http, base, credentials),
        crate::version::VersionInfo {
            version: crate::version::OntapVersion::new(9, 13, 1),
            rest_available: true,
            san_optimized: false,
        },
        protocol,
        crate::job::JobTracker::default(),
    )
}
