// ── Result envelope ──
//
// What one invocation reports back: whether anything changed, what was
// (or would be) modified, the observed state, and the warnings and
// tolerated errors collected along the way.

use serde::Serialize;

use crate::capability::AttrMap;
use crate::planner::CdAction;
use crate::protocol::Protocol;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Outcome {
    pub changed: bool,
    pub resource: String,
    pub name: String,
    pub protocol: Protocol,
    pub cd_action: CdAction,
    pub rename: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modify: Option<AttrMap>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current: Option<AttrMap>,
    /// Step descriptions, check mode only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    /// Controller errors that were classified as already-done.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub previous_errors: Vec<String>,
}

impl Outcome {
    pub fn unchanged(resource: &str, name: &str, protocol: Protocol) -> Self {
        Self {
            changed: false,
            resource: resource.to_owned(),
            name: name.to_owned(),
            protocol,
            cd_action: CdAction::None,
            rename: false,
            modify: None,
            current: None,
            plan: None,
            warnings: Vec::new(),
            previous_errors: Vec::new(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn empty_fields_are_omitted() {
        let outcome = Outcome::unchanged("lun", "lun1", Protocol::Rest);
        assert_eq!(
            serde_json::to_value(&outcome).unwrap(),
            json!({
                "changed": false,
                "resource": "lun",
                "name": "lun1",
                "protocol": "REST",
                "cd_action": "none",
                "rename": false
            })
        );
    }
}
