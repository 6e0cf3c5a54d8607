//! Reconciliation engine between `ontap-api` and its callers.
//!
//! One invocation targets one ONTAP object. The engine reads its current
//! state, diffs it against the requested state, plans the minimal calls
//! and either reports the plan (check mode) or executes it, waiting on
//! controller jobs between steps.
//!
//! - **[`Session`]**: Both protocol adapters plus the once-per-session
//!   version probe. [`ResourceKind::apply`] runs one object through
//!   [`engine::run`].
//! - **[`ResourceHandler`]**: The per-type seam: parameters, capability
//!   table, current-state lookup, plan refinement and step execution.
//!   Implementations live in [`handlers`].
//! - **Capabilities** ([`capability`]): Static per-attribute metadata:
//!   REST and ZAPI paths, comparison rule, modifiability, version floor.
//!   The diff ([`diff`]) and protocol selection ([`protocol`]) are driven
//!   entirely from these tables.
//! - **Errors**: [`CoreError`] for what callers see;
//!   [`classify`] turns controller codes into tolerable outcomes.

pub mod capability;
pub mod classify;
pub mod config;
pub mod diff;
pub mod engine;
pub mod error;
pub mod handler;
pub mod handlers;
pub mod job;
pub mod params;
pub mod planner;
pub mod protocol;
pub mod registry;
pub mod result;
pub mod version;

// ── Primary re-exports ──────────────────────────────────────────────
pub use capability::{AttrMap, Capability, Compare, ValueKind};
pub use classify::ErrorClass;
pub use config::{ConnectionArgs, FeatureFlags, ValidateChanges};
pub use engine::Session;
pub use error::{CoreError, ErrorKind};
pub use handler::{Context, Current, ResourceHandler};
pub use job::{JobRef, JobResult, JobTracker};
pub use params::State;
pub use planner::{CdAction, Op, Plan, Step};
pub use protocol::{Protocol, Surfaces, UseRest};
pub use registry::ResourceKind;
pub use result::Outcome;
pub use version::{OntapVersion, VersionInfo};
