// ── Action planner ──
//
// Turns (create/delete/none, rename, diff) into an ordered list of
// primitive steps. Each step carries its own error tolerations and job
// policy so the executor never branches on which handler it is driving.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use strum::{AsRefStr, Display};

use crate::capability::{AttrMap, Capability};
use crate::classify::ErrorClass;
use crate::diff::DiffOutcome;
use crate::error::CoreError;
use crate::params::State;

/// Default wall-clock bound for one asynchronous step.
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(100);

/// Whole-object action derived from presence and desired state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum CdAction {
    Create,
    Delete,
    None,
}

/// `CdAction` plus the orthogonal rename flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub cd_action: CdAction,
    pub rename: bool,
}

/// Decide the whole-object action.
///
/// `source_found` is whether the `from_name` object was located; it is
/// only consulted when the target itself is missing.
pub fn decide(exists: bool, state: State, source_found: bool) -> Decision {
    match (exists, state) {
        (false, State::Absent) | (true, State::Present) => Decision {
            cd_action: CdAction::None,
            rename: false,
        },
        (true, State::Absent) => Decision {
            cd_action: CdAction::Delete,
            rename: false,
        },
        (false, State::Present) if source_found => Decision {
            cd_action: CdAction::None,
            rename: true,
        },
        (false, State::Present) => Decision {
            cd_action: CdAction::Create,
            rename: false,
        },
    }
}

/// A primitive operation. `X` carries handler-specific compound steps.
#[derive(Debug, Clone, PartialEq)]
pub enum Op<X> {
    Create(AttrMap),
    Rename { from: String },
    Modify(AttrMap),
    Unmount,
    Offline,
    Delete,
    Extra(X),
}

/// Placeholder for handlers without compound steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoExtra {}

impl fmt::Display for NoExtra {
    fn fmt(&self, _: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {}
    }
}

/// How the executor treats a job returned by a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobPolicy {
    pub timeout: Duration,
    /// A timed-out job is reported as still running, not as a failure.
    pub in_flight_ok: bool,
    /// A job that vanished before completion counts as success.
    pub not_found_ok: bool,
}

impl Default for JobPolicy {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_JOB_TIMEOUT,
            in_flight_ok: false,
            not_found_ok: false,
        }
    }
}

/// One planned call.
#[derive(Debug, Clone, PartialEq)]
pub struct Step<X> {
    pub op: Op<X>,
    /// Error classes that end the step without failing the run.
    pub tolerate: Vec<ErrorClass>,
    pub job: JobPolicy,
}

impl<X> Step<X> {
    pub fn new(op: Op<X>) -> Self {
        let tolerate = match &op {
            Op::Create(_) => vec![ErrorClass::AlreadyExists],
            Op::Delete => vec![ErrorClass::ObjectNotFound, ErrorClass::VserverMissing],
            _ => Vec::new(),
        };
        Self {
            op,
            tolerate,
            job: JobPolicy::default(),
        }
    }

    #[must_use]
    pub fn tolerating(mut self, classes: &[ErrorClass]) -> Self {
        for class in classes {
            if !self.tolerate.contains(class) {
                self.tolerate.push(*class);
            }
        }
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.job.timeout = timeout;
        self
    }

    #[must_use]
    pub fn in_flight_ok(mut self) -> Self {
        self.job.in_flight_ok = true;
        self
    }

    #[must_use]
    pub fn not_found_ok(mut self) -> Self {
        self.job.not_found_ok = true;
        self
    }
}

impl<X: fmt::Display> Step<X> {
    /// Human-readable summary for check-mode output.
    pub fn describe(&self, resource: &str, name: &str) -> String {
        match &self.op {
            Op::Create(attrs) if attrs.is_empty() => format!("create {resource} {name}"),
            Op::Create(attrs) => format!("create {resource} {name} with {}", keys(attrs)),
            Op::Rename { from } => format!("rename {resource} {from} to {name}"),
            Op::Modify(attrs) => format!("modify {resource} {name}: {}", keys(attrs)),
            Op::Unmount => format!("unmount {resource} {name}"),
            Op::Offline => format!("take {resource} {name} offline"),
            Op::Delete => format!("delete {resource} {name}"),
            Op::Extra(extra) => format!("{extra} ({resource} {name})"),
        }
    }
}

fn keys(attrs: &AttrMap) -> String {
    attrs.keys().map(String::as_str).collect::<Vec<_>>().join(", ")
}

/// Ordered steps for one invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan<X> {
    steps: Vec<Step<X>>,
}

impl<X> Default for Plan<X> {
    fn default() -> Self {
        Self { steps: Vec::new() }
    }
}

impl<X> Plan<X> {
    pub fn push(&mut self, step: Step<X>) {
        self.steps.push(step);
    }

    pub fn insert(&mut self, index: usize, step: Step<X>) {
        self.steps.insert(index.min(self.steps.len()), step);
    }

    pub fn steps(&self) -> &[Step<X>] {
        &self.steps
    }

    pub fn steps_mut(&mut self) -> &mut Vec<Step<X>> {
        &mut self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Drop every step matching `predicate`.
    pub fn remove_where(&mut self, predicate: impl Fn(&Step<X>) -> bool) {
        self.steps.retain(|s| !predicate(s));
    }

    /// Position of the first step matching `predicate`.
    pub fn position(&self, predicate: impl Fn(&Step<X>) -> bool) -> Option<usize> {
        self.steps.iter().position(predicate)
    }

    /// The pending modify step's attributes, if any.
    pub fn modify_attrs_mut(&mut self) -> Option<&mut AttrMap> {
        self.steps.iter_mut().find_map(|s| match &mut s.op {
            Op::Modify(attrs) => Some(attrs),
            _ => None,
        })
    }
}

impl<X: fmt::Display> Plan<X> {
    pub fn describe(&self, resource: &str, name: &str) -> Vec<String> {
        self.steps.iter().map(|s| s.describe(resource, name)).collect()
    }
}

/// Which preparatory steps precede a delete.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteStages {
    pub unmount: bool,
    pub offline: bool,
}

impl DeleteStages {
    pub const NONE: Self = Self {
        unmount: false,
        offline: false,
    };
}

/// Inputs to [`plan`].
#[derive(Debug)]
pub struct PlanInput<'a> {
    pub resource: &'a str,
    pub name: &'a str,
    pub decision: Decision,
    pub from_name: Option<&'a str>,
    pub diff: &'a DiffOutcome,
    pub desired: &'a AttrMap,
    pub caps: &'a [Capability],
    pub stages: DeleteStages,
    /// Unmodifiable differences may be resolved by delete + create.
    pub recreate: bool,
    pub job_timeout: Duration,
}

/// Split desired attributes into (create-time, post-create) sets.
pub fn creation_attrs(caps: &[Capability], desired: &AttrMap) -> (AttrMap, AttrMap) {
    let mut create = AttrMap::new();
    let mut later = AttrMap::new();
    for (key, value) in desired.iter().filter(|(_, v)| !v.is_null()) {
        match caps.iter().find(|c| c.name == key) {
            Some(cap) if cap.post_create => {
                later.insert(key.clone(), value.clone());
            }
            _ => {
                create.insert(key.clone(), value.clone());
            }
        }
    }
    (create, later)
}

fn push_delete<X>(plan: &mut Plan<X>, stages: DeleteStages, timeout: Duration) {
    if stages.unmount {
        plan.push(Step::new(Op::Unmount).with_timeout(timeout));
    }
    if stages.offline {
        plan.push(Step::new(Op::Offline).with_timeout(timeout));
    }
    plan.push(Step::new(Op::Delete).with_timeout(timeout));
}

fn push_create<X>(plan: &mut Plan<X>, caps: &[Capability], desired: &AttrMap, timeout: Duration) {
    let (create, later) = creation_attrs(caps, desired);
    plan.push(Step::new(Op::Create(create)).with_timeout(timeout));
    if !later.is_empty() {
        plan.push(Step::new(Op::Modify(later)).with_timeout(timeout));
    }
}

/// Build the generic plan. Handlers refine it in `plan_extra`.
pub fn plan<X>(input: &PlanInput<'_>) -> Result<Plan<X>, CoreError> {
    let mut plan = Plan::default();
    let timeout = input.job_timeout;
    match input.decision {
        Decision {
            cd_action: CdAction::Create,
            ..
        } => push_create(&mut plan, input.caps, input.desired, timeout),
        Decision {
            cd_action: CdAction::Delete,
            ..
        } => push_delete(&mut plan, input.stages, timeout),
        Decision {
            cd_action: CdAction::None,
            rename,
        } => {
            if !input.diff.unmodifiable.is_empty() {
                if !input.recreate {
                    return Err(CoreError::Unmodifiable {
                        resource: input.resource.to_owned(),
                        name: input.name.to_owned(),
                        attributes: input.diff.unmodifiable.clone(),
                    });
                }
                push_delete(&mut plan, input.stages, timeout);
                push_create(&mut plan, input.caps, input.desired, timeout);
                return Ok(plan);
            }
            if rename {
                let from = input.from_name.unwrap_or_default().to_owned();
                plan.push(Step::new(Op::Rename { from }).with_timeout(timeout));
            }
            if !input.diff.modify.is_empty() {
                plan.push(Step::new(Op::Modify(input.diff.modify.clone())).with_timeout(timeout));
            }
        }
    }
    Ok(plan)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::capability::attr;
    use crate::error::ErrorKind;

    const CAPS: &[Capability] = &[
        attr("comment").rest("comment"),
        attr("snapshot_policy").rest("snapshot_policy.name").after_create(),
    ];

    fn input<'a>(decision: Decision, diff: &'a DiffOutcome, desired: &'a AttrMap) -> PlanInput<'a> {
        PlanInput {
            resource: "volume",
            name: "vol1",
            decision,
            from_name: Some("vol0"),
            diff,
            desired,
            caps: CAPS,
            stages: DeleteStages {
                unmount: true,
                offline: true,
            },
            recreate: false,
            job_timeout: DEFAULT_JOB_TIMEOUT,
        }
    }

    fn ops(plan: &Plan<NoExtra>) -> Vec<String> {
        plan.describe("volume", "vol1")
    }

    #[test]
    fn decision_table() {
        assert_eq!(decide(false, State::Absent, false).cd_action, CdAction::None);
        assert_eq!(decide(true, State::Absent, false).cd_action, CdAction::Delete);
        assert_eq!(decide(false, State::Present, false).cd_action, CdAction::Create);
        let d = decide(false, State::Present, true);
        assert_eq!((d.cd_action, d.rename), (CdAction::None, true));
        assert!(!decide(true, State::Present, true).rename);
    }

    #[test]
    fn create_splits_post_create_attributes() {
        let mut desired = AttrMap::new();
        desired.insert("comment".into(), json!("c"));
        desired.insert("snapshot_policy".into(), json!("none"));
        let diff = DiffOutcome::default();
        let plan: Plan<NoExtra> =
            plan(&input(decide(false, State::Present, false), &diff, &desired)).unwrap();
        assert_eq!(
            ops(&plan),
            vec![
                "create volume vol1 with comment".to_owned(),
                "modify volume vol1: snapshot_policy".to_owned()
            ]
        );
    }

    #[test]
    fn delete_orders_unmount_offline_delete() {
        let diff = DiffOutcome::default();
        let desired = AttrMap::new();
        let plan: Plan<NoExtra> =
            plan(&input(decide(true, State::Absent, false), &diff, &desired)).unwrap();
        assert_eq!(
            ops(&plan),
            vec![
                "unmount volume vol1".to_owned(),
                "take volume vol1 offline".to_owned(),
                "delete volume vol1".to_owned()
            ]
        );
        assert!(plan.steps()[2].tolerate.contains(&ErrorClass::ObjectNotFound));
    }

    #[test]
    fn rename_then_modify() {
        let mut diff = DiffOutcome::default();
        diff.modify.insert("comment".into(), json!("new"));
        let desired = AttrMap::new();
        let plan: Plan<NoExtra> =
            plan(&input(decide(false, State::Present, true), &diff, &desired)).unwrap();
        assert_eq!(
            ops(&plan),
            vec![
                "rename volume vol0 to vol1".to_owned(),
                "modify volume vol1: comment".to_owned()
            ]
        );
    }

    #[test]
    fn unmodifiable_fails_without_recreate() {
        let diff = DiffOutcome {
            unmodifiable: vec!["type".into()],
            ..DiffOutcome::default()
        };
        let desired = AttrMap::new();
        let err = plan::<NoExtra>(&input(decide(true, State::Present, false), &diff, &desired))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedAttribute);
    }

    #[test]
    fn unmodifiable_recreates_when_allowed() {
        let diff = DiffOutcome {
            unmodifiable: vec!["type".into()],
            ..DiffOutcome::default()
        };
        let mut desired = AttrMap::new();
        desired.insert("comment".into(), json!("c"));
        let mut inp = input(decide(true, State::Present, false), &diff, &desired);
        inp.recreate = true;
        inp.stages = DeleteStages::NONE;
        let plan: Plan<NoExtra> = plan(&inp).unwrap();
        assert_eq!(
            ops(&plan),
            vec!["delete volume vol1".to_owned(), "create volume vol1 with comment".to_owned()]
        );
    }

    #[test]
    fn nothing_to_do_is_empty() {
        let diff = DiffOutcome::default();
        let desired = AttrMap::new();
        let plan: Plan<NoExtra> =
            plan(&input(decide(true, State::Present, false), &diff, &desired)).unwrap();
        assert!(plan.is_empty());
    }
}
