// REST adapter
//
// Wraps `reqwest::Client` with ONTAP-specific URL construction, basic
// auth, JSON encoding, and error-envelope extraction. Every call goes
// through `send_request`; the verb helpers are thin conveniences.

use secrecy::ExposeSecret;
use serde_json::Value;
use tracing::{debug, info};
use url::Url;

use super::models::{ErrorEnvelope, JobLink, RestResponse, Verb};
use crate::auth::{ClusterEndpoint, Credentials};
use crate::error::{Error, preview};
use crate::transport::TransportConfig;

/// Query parameters as `(name, value)` pairs.
pub type Query<'a> = [(&'a str, String)];

/// Async client for the ONTAP REST surface.
///
/// Paths are relative to `/api/` and never carry a leading slash.
#[derive(Debug, Clone)]
pub struct RestClient {
    http: reqwest::Client,
    base_url: Url,
    credentials: Credentials,
    trace_apis: bool,
}

impl RestClient {
    /// Build a client for the given cluster endpoint.
    pub fn new(
        endpoint: &ClusterEndpoint,
        credentials: Credentials,
        transport: &TransportConfig,
    ) -> Result<Self, Error> {
        let http = transport.build_client()?;
        Ok(Self {
            http,
            base_url: endpoint.rest_url()?,
            credentials,
            trace_apis: transport.trace_apis,
        })
    }

    /// Wrap a pre-built `reqwest::Client`. `base_url` must end in `/api/`.
    pub fn with_client(http: reqwest::Client, base_url: Url, credentials: Credentials) -> Self {
        Self {
            http,
            base_url,
            credentials,
            trace_apis: false,
        }
    }

    /// Enable or disable request/response body tracing.
    pub fn set_trace_apis(&mut self, on: bool) {
        self.trace_apis = on;
    }

    /// The REST base URL (`https://host/api/`).
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url(&self, path: &str) -> Result<Url, Error> {
        debug_assert!(!path.starts_with('/'), "REST paths never start with '/'");
        Ok(self.base_url.join(path.trim_start_matches('/'))?)
    }

    // ── Core request ─────────────────────────────────────────────────

    /// Issue a single request and normalize the response.
    ///
    /// 2xx yields a [`RestResponse`] (with the job reference on `202`),
    /// 4xx/5xx yields `Error::Rest` carrying the controller's
    /// `{code, message, target}`, and transport failures yield
    /// `Error::Transport`. There is no retry.
    pub async fn send_request(
        &self,
        verb: Verb,
        path: &str,
        query: &Query<'_>,
        body: Option<&Value>,
    ) -> Result<RestResponse, Error> {
        let url = self.url(path)?;
        debug!(%verb, api = path, ?query, "REST request");
        if self.trace_apis {
            info!(target: "ontap_api::trace", %verb, api = path, body = ?body, "REST request body");
        }

        let mut builder = self
            .http
            .request(verb.as_method(), url)
            .basic_auth(
                &self.credentials.username,
                Some(self.credentials.password.expose_secret()),
            )
            .header(reqwest::header::ACCEPT, "application/json")
            .query(query);
        if let Some(body) = body {
            builder = builder.json(body);
        }

        let resp = builder.send().await?;
        self.handle_response(path, resp).await
    }

    async fn handle_response(
        &self,
        path: &str,
        resp: reqwest::Response,
    ) -> Result<RestResponse, Error> {
        let status = resp.status();
        let raw = resp.text().await?;

        if self.trace_apis {
            info!(
                target: "ontap_api::trace",
                api = path,
                status = status.as_u16(),
                body = %raw,
                "REST response"
            );
        }

        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(Error::Authentication {
                api: path.to_owned(),
                status: status.as_u16(),
            });
        }

        if !status.is_success() {
            return Err(Self::parse_error(path, status, &raw));
        }

        let body = if status == reqwest::StatusCode::NO_CONTENT || raw.trim().is_empty() {
            None
        } else {
            Some(serde_json::from_str::<Value>(&raw).map_err(|e| {
                Error::Deserialization {
                    message: format!("{e} (body preview: {:?})", preview(&raw)),
                    body: raw.clone(),
                }
            })?)
        };

        let job = if status == reqwest::StatusCode::ACCEPTED {
            body.as_ref().and_then(JobLink::from_body)
        } else {
            None
        };

        debug!(api = path, status = status.as_u16(), has_job = job.is_some(), "REST response");
        Ok(RestResponse {
            status: status.as_u16(),
            body,
            job,
        })
    }

    fn parse_error(path: &str, status: reqwest::StatusCode, raw: &str) -> Error {
        let parsed = serde_json::from_str::<ErrorEnvelope>(raw)
            .ok()
            .and_then(|env| env.error);

        match parsed {
            Some(err) => Error::Rest {
                api: path.to_owned(),
                status: status.as_u16(),
                message: err.message.unwrap_or_else(|| status.to_string()),
                code: err.code,
                target: err.target,
            },
            None => Error::Rest {
                api: path.to_owned(),
                status: status.as_u16(),
                code: None,
                message: if raw.is_empty() {
                    status.to_string()
                } else {
                    preview(raw)
                },
                target: None,
            },
        }
    }

    // ── Verb helpers ─────────────────────────────────────────────────

    pub async fn get(&self, path: &str, query: &Query<'_>) -> Result<RestResponse, Error> {
        self.send_request(Verb::Get, path, query, None).await
    }

    pub async fn post(
        &self,
        path: &str,
        body: &Value,
        query: &Query<'_>,
    ) -> Result<RestResponse, Error> {
        self.send_request(Verb::Post, path, query, Some(body)).await
    }

    pub async fn patch(
        &self,
        path: &str,
        body: &Value,
        query: &Query<'_>,
    ) -> Result<RestResponse, Error> {
        self.send_request(Verb::Patch, path, query, Some(body)).await
    }

    pub async fn delete(
        &self,
        path: &str,
        body: Option<&Value>,
        query: &Query<'_>,
    ) -> Result<RestResponse, Error> {
        self.send_request(Verb::Delete, path, query, body).await
    }

    // ── Record helpers ───────────────────────────────────────────────

    /// GET a collection and return every record.
    pub async fn get_records(&self, path: &str, query: &Query<'_>) -> Result<Vec<Value>, Error> {
        Ok(self.get(path, query).await?.records())
    }

    /// GET a collection expected to hold zero or one matching record.
    ///
    /// Returns `Error::UnexpectedRecords` when the filter is ambiguous.
    pub async fn get_one_record(
        &self,
        path: &str,
        query: &Query<'_>,
    ) -> Result<Option<Value>, Error> {
        let resp = self.get(path, query).await?;
        let mut records = resp.records();
        match records.len() {
            0 => Ok(None),
            1 => Ok(records.pop()),
            count => Err(Error::UnexpectedRecords {
                api: path.to_owned(),
                count,
            }),
        }
    }
}
