// REST wire shapes
//
// The response envelope, the job reference carried by `202 Accepted`,
// and the error envelope. Resource bodies stay loosely typed
// (`serde_json::Value`) because the engine projects them through
// capability tables rather than per-endpoint structs.

use std::fmt;

use serde::Deserialize;
use serde_json::Value;

/// HTTP verbs the REST surface is driven with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Get,
    Post,
    Patch,
    Delete,
}

impl Verb {
    /// Returns `true` for verbs that change controller state.
    pub fn is_mutating(self) -> bool {
        !matches!(self, Self::Get)
    }

    pub(crate) fn as_method(self) -> reqwest::Method {
        match self {
            Self::Get => reqwest::Method::GET,
            Self::Post => reqwest::Method::POST,
            Self::Patch => reqwest::Method::PATCH,
            Self::Delete => reqwest::Method::DELETE,
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        };
        f.write_str(s)
    }
}

/// Reference to an asynchronous job returned with `202 Accepted`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobLink {
    pub uuid: String,
    /// `_links.self.href`, e.g. `/api/cluster/jobs/<uuid>`.
    pub href: Option<String>,
}

impl JobLink {
    /// Path to poll, relative to the REST prefix.
    ///
    /// Follows the controller's own link when present; otherwise falls
    /// back to `job/jobs/<uuid>`.
    pub fn poll_path(&self) -> String {
        self.href
            .as_deref()
            .and_then(|href| href.strip_prefix("/api/"))
            .map_or_else(|| format!("job/jobs/{}", self.uuid), str::to_owned)
    }

    /// Extract a job reference from a response body (`{"job": {...}}`).
    pub fn from_body(body: &Value) -> Option<Self> {
        let job = body.get("job")?;
        let uuid = job.get("uuid")?.as_str()?.to_owned();
        let href = job
            .pointer("/_links/self/href")
            .and_then(Value::as_str)
            .map(str::to_owned);
        Some(Self { uuid, href })
    }
}

/// Normalized REST response: `(status, decoded body, job reference)`.
///
/// Errors never reach this type; 4xx/5xx are returned as `Error::Rest`.
#[derive(Debug, Clone, PartialEq)]
pub struct RestResponse {
    pub status: u16,
    /// `None` for `204 No Content` and empty bodies.
    pub body: Option<Value>,
    /// Present when the controller accepted the request asynchronously.
    pub job: Option<JobLink>,
}

impl RestResponse {
    /// The `records` array of a collection GET (empty when absent).
    pub fn records(&self) -> Vec<Value> {
        self.body
            .as_ref()
            .and_then(|b| b.get("records"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
    }

    /// `num_records` if reported, otherwise the length of `records`.
    pub fn num_records(&self) -> usize {
        self.body
            .as_ref()
            .and_then(|b| b.get("num_records"))
            .and_then(Value::as_u64)
            .and_then(|n| usize::try_from(n).ok())
            .unwrap_or_else(|| self.records().len())
    }

    /// Returns `true` if the call completed asynchronously.
    pub fn is_accepted(&self) -> bool {
        self.status == 202
    }
}

// ── Error envelope ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub(crate) struct ErrorEnvelope {
    pub error: Option<ErrorBody>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ErrorBody {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub target: Option<String>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn job_link_follows_href() {
        let body = json!({
            "job": {
                "uuid": "d0f3b91a-4ce7-4de4-afb9-7eda668659dd",
                "_links": {
                    "self": { "href": "/api/cluster/jobs/d0f3b91a-4ce7-4de4-afb9-7eda668659dd" }
                }
            }
        });
        let job = JobLink::from_body(&body).expect("job link");
        assert_eq!(
            job.poll_path(),
            "cluster/jobs/d0f3b91a-4ce7-4de4-afb9-7eda668659dd"
        );
    }

    #[test]
    fn job_link_without_href_uses_job_path() {
        let job = JobLink {
            uuid: "abc".into(),
            href: None,
        };
        assert_eq!(job.poll_path(), "job/jobs/abc");
    }

    #[test]
    fn num_records_falls_back_to_len() {
        let resp = RestResponse {
            status: 200,
            body: Some(json!({ "records": [{"name": "a"}, {"name": "b"}] })),
            job: None,
        };
        assert_eq!(resp.num_records(), 2);
        assert_eq!(resp.records().len(), 2);
    }
}
