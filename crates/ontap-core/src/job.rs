// ── Async job tracker ──
//
// Polls controller-side jobs to a terminal state. REST jobs are read
// through their `_links.self.href` (or `job/jobs/<uuid>`); ZAPI jobs
// through `job-get`. Polling backs off from the initial interval by
// doubling, capped at `max_interval`, within the caller's timeout.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use ontap_api::{JobLink, NaElement, RestClient, ZapiClient};

use crate::classify::{self, ErrorClass};

/// Upper bound on a single sleep between polls.
pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// A job to wait for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobRef {
    Rest(JobLink),
    Zapi { id: String },
}

impl JobRef {
    pub fn id(&self) -> &str {
        match self {
            Self::Rest(link) => &link.uuid,
            Self::Zapi { id } => id,
        }
    }
}

/// A job plus its polling deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub job: JobRef,
    pub deadline: Instant,
}

impl JobHandle {
    pub fn new(job: JobRef, timeout: Duration) -> Self {
        Self {
            job,
            deadline: Instant::now() + timeout,
        }
    }
}

/// Terminal classification of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    Success(Option<String>),
    Failure(String),
    Timeout { limit_secs: u64 },
    NotFoundTreatedAsSuccess,
}

/// One observation of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Poll {
    Running,
    Done(JobResult),
}

/// Message used when a failed job carries no completion text.
pub const NO_COMPLETION: &str = "job failed with no completion message";

/// Polls jobs with bounded exponential back-off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobTracker {
    pub initial_interval: Duration,
    pub max_interval: Duration,
}

impl Default for JobTracker {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            max_interval: MAX_POLL_INTERVAL,
        }
    }
}

impl JobTracker {
    pub fn new(initial_interval: Duration) -> Self {
        Self {
            initial_interval,
            max_interval: MAX_POLL_INTERVAL.max(initial_interval),
        }
    }

    /// Poll `job` until it reaches a terminal state or `timeout` elapses.
    ///
    /// A missing job becomes `NotFoundTreatedAsSuccess` only when
    /// `not_found_ok`; otherwise the controller error is returned as is.
    pub async fn wait_for_job(
        &self,
        rest: &RestClient,
        zapi: &ZapiClient,
        job: &JobRef,
        timeout: Duration,
        not_found_ok: bool,
    ) -> Result<JobResult, ontap_api::Error> {
        let handle = JobHandle::new(job.clone(), timeout);
        let mut interval = self.initial_interval;
        info!(job_id = job.id(), timeout_secs = timeout.as_secs(), "waiting for job");

        loop {
            let observed = match job {
                JobRef::Rest(link) => poll_rest(rest, link).await,
                JobRef::Zapi { id } => poll_zapi(zapi, id).await,
            };
            match observed {
                Ok(Poll::Done(result)) => {
                    debug!(job_id = job.id(), ?result, "job finished");
                    return Ok(result);
                }
                Ok(Poll::Running) => {}
                Err(err) if classify::matches(&err, ErrorClass::ObjectNotFound) => {
                    if not_found_ok {
                        warn!(job_id = job.id(), "job not found, treating as complete");
                        return Ok(JobResult::NotFoundTreatedAsSuccess);
                    }
                    return Err(err);
                }
                Err(err) => return Err(err),
            }

            let now = Instant::now();
            if now >= handle.deadline {
                return Ok(JobResult::Timeout {
                    limit_secs: timeout.as_secs(),
                });
            }
            let remaining = handle.deadline - now;
            tokio::time::sleep(interval.min(remaining)).await;
            interval = (interval * 2).min(self.max_interval);
        }
    }
}

async fn poll_rest(rest: &RestClient, link: &JobLink) -> Result<Poll, ontap_api::Error> {
    let resp = rest
        .get(&link.poll_path(), &[("fields", "state,message,code".into())])
        .await?;
    let body = resp.body.unwrap_or_default();
    let state = body.get("state").and_then(|v| v.as_str()).unwrap_or("running");
    let message = body
        .get("message")
        .and_then(|v| v.as_str())
        .map(str::to_owned)
        .filter(|m| !m.is_empty());
    debug!(job_id = %link.uuid, state, "job state");
    Ok(match state {
        "success" => Poll::Done(JobResult::Success(message)),
        "failure" => Poll::Done(JobResult::Failure(
            message.unwrap_or_else(|| NO_COMPLETION.to_owned()),
        )),
        _ => Poll::Running,
    })
}

async fn poll_zapi(zapi: &ZapiClient, id: &str) -> Result<Poll, ontap_api::Error> {
    let request = NaElement::new("job-get").with_child_content("job-id", id);
    let results = zapi.invoke(&request, true).await?;
    let info = results.find("attributes.job-info");
    let state = info.and_then(|i| i.child_str("job-state")).unwrap_or("running");
    let completion = info
        .and_then(|i| i.child_str("job-completion"))
        .map(str::to_owned)
        .filter(|m| !m.is_empty());
    debug!(job_id = id, state, "job state");
    Ok(match state {
        "success" => Poll::Done(JobResult::Success(completion)),
        "failure" | "error" | "quit" | "dead" => Poll::Done(JobResult::Failure(
            completion.unwrap_or_else(|| NO_COMPLETION.to_owned()),
        )),
        _ => Poll::Running,
    })
}

/// Extract a job from a ZAPI `*-async` result.
///
/// `result-status` of `in_progress` with a `result-jobid` yields a job;
/// `failed` yields the error message; anything else is synchronous success.
pub fn zapi_async_job(results: &NaElement) -> Result<Option<JobRef>, String> {
    match results.child_str("result-status") {
        Some("in_progress") => Ok(results
            .child_str("result-jobid")
            .map(|id| JobRef::Zapi { id: id.to_owned() })),
        Some("failed") => Err(results
            .child_str("result-error-message")
            .unwrap_or(NO_COMPLETION)
            .to_owned()),
        _ => Ok(None),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn async_result_in_progress_yields_job() {
        let results = NaElement::new("results")
            .with_child_content("result-status", "in_progress")
            .with_child_content("result-jobid", "77");
        assert_eq!(
            zapi_async_job(&results).unwrap(),
            Some(JobRef::Zapi { id: "77".into() })
        );
    }

    #[test]
    fn async_result_failed_carries_message() {
        let results = NaElement::new("results")
            .with_child_content("result-status", "failed")
            .with_child_content("result-error-message", "origin volume offline");
        assert_eq!(zapi_async_job(&results).unwrap_err(), "origin volume offline");
    }

    #[test]
    fn tracker_interval_never_below_initial() {
        let tracker = JobTracker::new(Duration::from_secs(30));
        assert_eq!(tracker.max_interval, Duration::from_secs(30));
        assert_eq!(JobTracker::default().initial_interval, Duration::from_secs(1));
    }
}
