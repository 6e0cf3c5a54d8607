// ONTAP ZAPI surface: ONTAPI XML-RPC over HTTPS.

pub mod client;
pub mod element;

pub use client::ZapiClient;
pub use element::NaElement;
