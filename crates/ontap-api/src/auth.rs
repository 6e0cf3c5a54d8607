use secrecy::SecretString;
use url::Url;

use crate::error::Error;

/// Basic-auth credentials shared by both management surfaces.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: SecretString,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: SecretString) -> Self {
        Self {
            username: username.into(),
            password,
        }
    }
}

/// Where the cluster management LIF lives.
///
/// Determines the scheme, port, and the two path prefixes the adapters use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterEndpoint {
    pub hostname: String,
    pub https: bool,
    pub port: Option<u16>,
}

impl ClusterEndpoint {
    /// Path of the ONTAPI servlet.
    pub const ZAPI_PATH: &'static str = "/servlets/netapp.servlets.admin.XMLrequest_filer";

    /// Path prefix of every REST resource. Resource paths are appended
    /// without a leading slash.
    pub const REST_PREFIX: &'static str = "/api/";

    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            https: true,
            port: None,
        }
    }

    /// Controller root: `https://host[:port]/`.
    pub fn root_url(&self) -> Result<Url, Error> {
        let scheme = if self.https { "https" } else { "http" };
        let raw = match self.port {
            Some(port) => format!("{scheme}://{}:{port}/", self.hostname),
            None => format!("{scheme}://{}/", self.hostname),
        };
        Ok(Url::parse(&raw)?)
    }

    /// Base URL of the REST surface: `https://host/api/`.
    pub fn rest_url(&self) -> Result<Url, Error> {
        Ok(self.root_url()?.join(Self::REST_PREFIX)?)
    }

    /// URL of the ONTAPI servlet.
    pub fn zapi_url(&self) -> Result<Url, Error> {
        Ok(self.root_url()?.join(Self::ZAPI_PATH)?)
    }
}
