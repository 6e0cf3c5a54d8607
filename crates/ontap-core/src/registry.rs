// ── Handler registry ──
//
// Maps resource names to handler types so callers holding only a
// string (the CLI, a config file) can reach the generic engine.

use serde_json::{Map, Value};
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};

use crate::capability::Capability;
use crate::engine::{self, Session};
use crate::error::CoreError;
use crate::handler::ResourceHandler;
use crate::handlers::{
    Aggregate, BroadcastDomain, EmsDestination, Flexcache, InterfaceGroup, JobSchedule, Lun,
    Portset, SnapmirrorPolicy, SoftwareDownload, Svm, User, Volume,
};
use crate::protocol::Surfaces;
use crate::result::Outcome;

/// Every resource type the engine can reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum ResourceKind {
    Aggregate,
    BroadcastDomain,
    EmsDestination,
    Flexcache,
    InterfaceGroup,
    JobSchedule,
    Lun,
    Portset,
    SnapmirrorPolicy,
    SoftwareDownload,
    Svm,
    User,
    Volume,
}

macro_rules! dispatch {
    ($kind:expr, $handler:ident => $body:expr) => {
        match $kind {
            ResourceKind::Aggregate => { type $handler = Aggregate; $body }
            ResourceKind::BroadcastDomain => { type $handler = BroadcastDomain; $body }
            ResourceKind::EmsDestination => { type $handler = EmsDestination; $body }
            ResourceKind::Flexcache => { type $handler = Flexcache; $body }
            ResourceKind::InterfaceGroup => { type $handler = InterfaceGroup; $body }
            ResourceKind::JobSchedule => { type $handler = JobSchedule; $body }
            ResourceKind::Lun => { type $handler = Lun; $body }
            ResourceKind::Portset => { type $handler = Portset; $body }
            ResourceKind::SnapmirrorPolicy => { type $handler = SnapmirrorPolicy; $body }
            ResourceKind::SoftwareDownload => { type $handler = SoftwareDownload; $body }
            ResourceKind::Svm => { type $handler = Svm; $body }
            ResourceKind::User => { type $handler = User; $body }
            ResourceKind::Volume => { type $handler = Volume; $body }
        }
    };
}

impl ResourceKind {
    pub fn all() -> impl Iterator<Item = Self> {
        Self::iter()
    }

    /// Resolve a resource name, accepting `-` for `_`.
    pub fn parse(name: &str) -> Result<Self, CoreError> {
        name.replace('-', "_").parse().map_err(|_| CoreError::InvalidParameter {
            message: format!(
                "unknown resource {name}; expected one of: {}",
                Self::iter().map(|k| k.to_string()).collect::<Vec<_>>().join(", ")
            ),
        })
    }

    pub fn capabilities(self) -> &'static [Capability] {
        dispatch!(self, H => H::capabilities())
    }

    pub fn surfaces(self) -> Surfaces {
        dispatch!(self, H => H::SURFACES)
    }

    /// Reconcile one object of this kind.
    pub async fn apply(
        self,
        session: &Session,
        params: Map<String, Value>,
        check_mode: bool,
    ) -> Result<Outcome, CoreError> {
        dispatch!(self, H => engine::run::<H>(session, params, check_mode).await)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip_through_strum() {
        for kind in ResourceKind::all() {
            assert_eq!(ResourceKind::parse(&kind.to_string()).unwrap(), kind);
        }
        assert_eq!(ResourceKind::parse("ems-destination").unwrap(), ResourceKind::EmsDestination);
    }

    #[test]
    fn unknown_names_list_the_choices() {
        let err = ResourceKind::parse("qtree").unwrap_err();
        assert!(err.to_string().contains("snapmirror_policy"));
    }

    #[test]
    fn handler_kinds_match_registry_names() {
        for kind in ResourceKind::all() {
            let handler_kind = dispatch!(kind, H => H::KIND);
            assert_eq!(handler_kind, kind.to_string());
        }
    }

    #[test]
    fn rest_only_resources() {
        assert_eq!(ResourceKind::EmsDestination.surfaces(), Surfaces::REST_ONLY);
        assert_eq!(ResourceKind::SoftwareDownload.surfaces(), Surfaces::REST_ONLY);
        assert_eq!(ResourceKind::Volume.surfaces(), Surfaces::BOTH);
    }

    #[test]
    fn every_kind_has_a_name_key() {
        for kind in ResourceKind::all() {
            assert!(!kind.capabilities().is_empty(), "{kind} has no capabilities");
        }
    }
}
