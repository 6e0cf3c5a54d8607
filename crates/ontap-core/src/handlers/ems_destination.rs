// ── EMS destination handler ──
//
// REST only. Destinations are addressed by name; a type change cannot be
// made in place, so the destination is deleted and created again.

use serde::Deserialize;
use serde_json::Value;

use super::{named_list, names_at, put, rest_outcome, segment};
use crate::capability::{self, AttrMap, Capability, Compare, attr, key};
use crate::error::CoreError;
use crate::handler::{Context, Current, HandlerError, ResourceHandler, StepOutcome};
use crate::params::{ArgSpec, RequiredIf, State};
use crate::planner::{NoExtra, Op, Step};
use crate::protocol::{Protocol, Surfaces};

const REST_PATH: &str = "support/ems/destinations";
const FIELDS: &str = "name,type,destination,filters.name";

const CAPABILITIES: &[Capability] = &[
    key("name").rest("name").rest_only(),
    attr("type")
        .rest("type")
        .rest_only()
        .compare(Compare::Aliased)
        .fixed(),
    attr("destination").rest("destination").rest_only(),
    attr("filters").rest("filters").rest_only().set(),
];

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EmsDestinationParams {
    #[serde(default)]
    pub state: State,
    pub name: String,
    #[serde(rename = "type")]
    pub dest_type: Option<String>,
    pub destination: Option<String>,
    pub filters: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct EmsDestination {
    p: EmsDestinationParams,
}

impl EmsDestination {
    fn item_path(&self) -> String {
        format!("{REST_PATH}/{}", segment(&self.p.name))
    }

    fn body(attrs: &AttrMap) -> Value {
        let mut attrs = attrs.clone();
        let filters = attrs.shift_remove("filters");
        let mut body = capability::to_rest(CAPABILITIES, &attrs);
        if let (Some(filters), Value::Object(map)) = (filters, &mut body) {
            map.insert("filters".into(), named_list(&filters));
        }
        body
    }
}

impl ResourceHandler for EmsDestination {
    type Params = EmsDestinationParams;
    type Extra = NoExtra;

    const KIND: &'static str = "ems_destination";
    const SURFACES: Surfaces = Surfaces::REST_ONLY;
    const ARGS: ArgSpec = ArgSpec {
        required: &["name"],
        required_if: &[RequiredIf {
            key: "state",
            value: "present",
            requires: &["type", "destination"],
        }],
        ..ArgSpec::NONE
    };

    fn capabilities() -> &'static [Capability] {
        CAPABILITIES
    }

    fn new(params: EmsDestinationParams) -> Result<Self, CoreError> {
        if params.state == State::Present
            && (params.dest_type.is_none() || params.destination.is_none())
        {
            return Err(CoreError::MissingRequired {
                names: vec!["type".into(), "destination".into()],
            });
        }
        Ok(Self { p: params })
    }

    fn state(&self) -> State {
        self.p.state
    }

    fn name(&self) -> &str {
        &self.p.name
    }

    fn desired(&self, _protocol: Protocol) -> AttrMap {
        let mut attrs = AttrMap::new();
        attrs.insert("name".into(), Value::String(self.p.name.clone()));
        // The controller spells types with underscores.
        let dest_type = self.p.dest_type.as_ref().map(|t| t.replace('-', "_"));
        put(&mut attrs, "type", dest_type.as_ref());
        put(&mut attrs, "destination", self.p.destination.as_ref());
        put(&mut attrs, "filters", self.p.filters.as_ref());
        attrs
    }

    async fn get_current(
        &self,
        ctx: &mut Context,
        name: &str,
    ) -> Result<Option<Current>, HandlerError> {
        let query = [("name", name.to_owned()), ("fields", FIELDS.to_owned())];
        let Some(record) = ctx.rest.get_one_record(REST_PATH, &query).await? else {
            return Ok(None);
        };
        let mut attrs = capability::from_rest(CAPABILITIES, &record);
        match names_at(&record, "filters") {
            Some(filters) => attrs.insert("filters".into(), filters),
            None => attrs.shift_remove("filters"),
        };
        Ok(Some(Current::new(attrs)))
    }

    fn recreate_on_unmodifiable(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        ctx: &mut Context,
        step: &Step<NoExtra>,
        _current: Option<&Current>,
    ) -> Result<StepOutcome, HandlerError> {
        match &step.op {
            Op::Create(attrs) => {
                Ok(rest_outcome(ctx.rest.post(REST_PATH, &Self::body(attrs), &[]).await?))
            }
            Op::Modify(attrs) => {
                let mut attrs = attrs.clone();
                attrs.shift_remove("name");
                Ok(rest_outcome(
                    ctx.rest.patch(&self.item_path(), &Self::body(&attrs), &[]).await?,
                ))
            }
            Op::Delete => Ok(rest_outcome(ctx.rest.delete(&self.item_path(), None, &[]).await?)),
            Op::Rename { .. } | Op::Unmount | Op::Offline => Ok(StepOutcome::NOTHING),
            Op::Extra(extra) => match *extra {},
        }
    }
}
