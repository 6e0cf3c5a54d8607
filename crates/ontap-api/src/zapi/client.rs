// ZAPI adapter
//
// Posts ONTAPI XML to the filer servlet and unwraps the
// `<netapp><results status=..>` envelope. Vserver tunneling adds the
// `vfiler` attribute to the envelope; the request element is untouched.

use secrecy::ExposeSecret;
use tracing::{debug, info};
use url::Url;

use super::element::NaElement;
use crate::auth::{ClusterEndpoint, Credentials};
use crate::error::{Error, preview};
use crate::transport::TransportConfig;

const ONTAPI_NAMESPACE: &str = "http://www.netapp.com/filer/admin";
const DEFAULT_ONTAPI_VERSION: &str = "1.180";
/// Upper bound on `next-tag` pages followed by [`ZapiClient::invoke_iter`].
const MAX_ITER_PAGES: usize = 1000;

/// Async client for the ONTAPI (ZAPI) surface.
#[derive(Debug, Clone)]
pub struct ZapiClient {
    http: reqwest::Client,
    url: Url,
    credentials: Credentials,
    vserver: Option<String>,
    ontapi_version: String,
    trace_apis: bool,
}

impl ZapiClient {
    pub fn new(
        endpoint: &ClusterEndpoint,
        credentials: Credentials,
        transport: &TransportConfig,
    ) -> Result<Self, Error> {
        let http = transport.build_client()?;
        Ok(Self {
            http,
            url: endpoint.zapi_url()?,
            credentials,
            vserver: None,
            ontapi_version: DEFAULT_ONTAPI_VERSION.into(),
            trace_apis: transport.trace_apis,
        })
    }

    /// Wrap a pre-built `reqwest::Client` pointed at the servlet URL.
    pub fn with_client(http: reqwest::Client, url: Url, credentials: Credentials) -> Self {
        Self {
            http,
            url,
            credentials,
            vserver: None,
            ontapi_version: DEFAULT_ONTAPI_VERSION.into(),
            trace_apis: false,
        }
    }

    /// A copy of this client that tunnels to the given vserver.
    #[must_use]
    pub fn for_vserver(&self, vserver: Option<&str>) -> Self {
        let mut client = self.clone();
        client.vserver = vserver.map(str::to_owned);
        client
    }

    pub fn set_trace_apis(&mut self, on: bool) {
        self.trace_apis = on;
    }

    pub fn vserver(&self) -> Option<&str> {
        self.vserver.as_deref()
    }

    fn envelope(&self, request: &NaElement, enable_tunneling: bool) -> String {
        let mut netapp = NaElement::new("netapp");
        netapp.set_attr("version", self.ontapi_version.as_str());
        netapp.set_attr("xmlns", ONTAPI_NAMESPACE);
        if enable_tunneling {
            if let Some(ref vserver) = self.vserver {
                netapp.set_attr("vfiler", vserver.as_str());
            }
        }
        netapp.add_child(request.clone());
        format!(
            "<?xml version='1.0' encoding='utf-8'?>\
             <!DOCTYPE netapp SYSTEM 'file:/etc/netapp_filer.dtd'>{}",
            netapp.to_xml()
        )
    }

    /// Invoke one ONTAPI call and return its `<results>` element.
    ///
    /// `status="failed"` becomes `Error::Zapi` with the numeric `errno`
    /// as the code. Connection failures surface as `Error::Transport`,
    /// the same shape the REST adapter uses.
    pub async fn invoke(
        &self,
        request: &NaElement,
        enable_tunneling: bool,
    ) -> Result<NaElement, Error> {
        let api = request.name().to_owned();
        let payload = self.envelope(request, enable_tunneling);
        debug!(api, vserver = ?self.vserver, tunneled = enable_tunneling, "ZAPI request");
        if self.trace_apis {
            info!(target: "ontap_api::trace", api, body = %request.to_xml(), "ZAPI request body");
        }

        let resp = self
            .http
            .post(self.url.clone())
            .basic_auth(
                &self.credentials.username,
                Some(self.credentials.password.expose_secret()),
            )
            .header(reqwest::header::CONTENT_TYPE, "text/xml; charset=utf-8")
            .body(payload)
            .send()
            .await?;

        let status = resp.status();
        let raw = resp.text().await?;
        if self.trace_apis {
            info!(
                target: "ontap_api::trace",
                api,
                status = status.as_u16(),
                body = %raw,
                "ZAPI response"
            );
        }

        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(Error::Authentication {
                api,
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            return Err(Error::Zapi {
                api,
                code: status.as_u16().to_string(),
                message: format!("HTTP {status}: {}", preview(&raw)),
            });
        }

        Self::unwrap_results(&api, &raw)
    }

    fn unwrap_results(api: &str, raw: &str) -> Result<NaElement, Error> {
        let root = NaElement::parse(raw)?;
        let results = root.child("results").cloned().ok_or_else(|| Error::Xml {
            message: format!("no <results> element in response to {api}"),
        })?;

        match results.attr("status") {
            Some("passed") => Ok(results),
            Some("failed") => Err(Error::Zapi {
                api: api.to_owned(),
                code: results.attr("errno").unwrap_or("0").to_owned(),
                message: results
                    .attr("reason")
                    .unwrap_or("no reason given")
                    .to_owned(),
            }),
            other => Err(Error::Xml {
                message: format!("unexpected results status {other:?} from {api}"),
            }),
        }
    }

    /// Invoke a `*-get-iter` call, following `next-tag` until exhausted,
    /// and return every child of every `attributes-list`.
    pub async fn invoke_iter(
        &self,
        request: &NaElement,
        enable_tunneling: bool,
    ) -> Result<Vec<NaElement>, Error> {
        let mut records = Vec::new();
        let mut next_tag: Option<String> = None;

        for _ in 0..MAX_ITER_PAGES {
            let mut page = request.clone();
            if let Some(ref tag) = next_tag {
                page.add_new_child("tag", tag.as_str());
            }
            let results = self.invoke(&page, enable_tunneling).await?;
            if let Some(list) = results.child("attributes-list") {
                records.extend(list.children().iter().cloned());
            }
            next_tag = results.child_str("next-tag").map(str::to_owned);
            if next_tag.is_none() {
                return Ok(records);
            }
        }

        Err(Error::Xml {
            message: format!(
                "{} did not terminate after {MAX_ITER_PAGES} pages",
                request.name()
            ),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn failed_results_carry_errno() {
        let raw = r#"<netapp>
            <results status="failed" errno="13214" reason="New password must be different"/>
        </netapp>"#;
        let err = ZapiClient::unwrap_results("security-login-modify-password", raw).unwrap_err();
        assert_eq!(err.code(), Some("13214"));
        assert_eq!(err.api(), Some("security-login-modify-password"));
    }

    #[test]
    fn missing_results_is_xml_error() {
        let err = ZapiClient::unwrap_results("x", "<netapp/>").unwrap_err();
        assert!(matches!(err, Error::Xml { .. }));
    }
}
