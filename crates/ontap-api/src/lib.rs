//! Async adapters for the two ONTAP management surfaces.
//!
//! - **[`RestClient`]**: JSON over HTTPS under `/api/`. One
//!   [`send_request`](RestClient::send_request) normalizes every call into a
//!   [`RestResponse`] (status, decoded body, job reference) or an [`Error`].
//! - **[`ZapiClient`]**: ONTAPI XML posted to the filer servlet, built from
//!   and parsed into [`NaElement`] trees, with optional vserver tunneling.
//!
//! Neither adapter retries; job polling and error classification live in
//! `ontap-core`.

pub mod auth;
pub mod error;
pub mod rest;
pub mod transport;
pub mod zapi;

pub use auth::{ClusterEndpoint, Credentials};
pub use error::Error;
pub use rest::{JobLink, RestClient, RestResponse, Verb};
pub use transport::{TlsMode, TransportConfig};
pub use zapi::{NaElement, ZapiClient};
