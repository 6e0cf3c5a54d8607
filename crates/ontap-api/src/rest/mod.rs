// ONTAP REST surface: JSON over HTTPS under `/api/`.

pub mod client;
pub mod models;

pub use client::{Query, RestClient};
pub use models::{JobLink, RestResponse, Verb};
