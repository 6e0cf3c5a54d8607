//! `resources`: describe the handler catalogue.

use serde::Serialize;
use tabled::Tabled;

use ontap_core::{Capability, ResourceKind};

use crate::cli::{GlobalOpts, ResourcesArgs};
use crate::error::CliError;
use crate::output;

#[derive(Debug, Serialize)]
struct KindSummary {
    resource: String,
    rest: bool,
    zapi: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    rest_min_version: Option<String>,
    attributes: usize,
}

#[derive(Tabled)]
struct KindRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "REST")]
    rest: String,
    #[tabled(rename = "ZAPI")]
    zapi: &'static str,
    #[tabled(rename = "Attributes")]
    attributes: usize,
}

fn yes_no(flag: bool) -> &'static str {
    if flag { "yes" } else { "-" }
}

fn summarize(kind: ResourceKind) -> KindSummary {
    let surfaces = kind.surfaces();
    KindSummary {
        resource: kind.to_string(),
        rest: surfaces.rest,
        zapi: surfaces.zapi,
        rest_min_version: surfaces.rest_min_version.map(|v| v.to_string()),
        attributes: kind.capabilities().len(),
    }
}

impl From<&KindSummary> for KindRow {
    fn from(s: &KindSummary) -> Self {
        let rest = match (&s.rest_min_version, s.rest) {
            (Some(min), true) => format!("{min}+"),
            (_, flag) => yes_no(flag).to_owned(),
        };
        Self {
            resource: s.resource.clone(),
            rest,
            zapi: yes_no(s.zapi),
            attributes: s.attributes,
        }
    }
}

#[derive(Debug, Serialize)]
struct AttributeSummary {
    attribute: &'static str,
    rest_path: Option<&'static str>,
    zapi_path: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    min_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rest_min_version: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    markers: Vec<&'static str>,
}

impl From<&Capability> for AttributeSummary {
    fn from(cap: &Capability) -> Self {
        Self {
            attribute: cap.name,
            rest_path: cap.rest_path,
            zapi_path: cap.zapi_path,
            min_version: cap.min_version.map(|v| v.to_string()),
            rest_min_version: cap.rest_min_version.map(|v| v.to_string()),
            markers: cap.markers(),
        }
    }
}

#[derive(Tabled)]
struct AttributeRow {
    #[tabled(rename = "Attribute")]
    attribute: &'static str,
    #[tabled(rename = "REST path")]
    rest_path: &'static str,
    #[tabled(rename = "ZAPI path")]
    zapi_path: &'static str,
    #[tabled(rename = "Since")]
    since: String,
    #[tabled(rename = "Notes")]
    notes: String,
}

impl From<&AttributeSummary> for AttributeRow {
    fn from(a: &AttributeSummary) -> Self {
        let since = match (&a.min_version, &a.rest_min_version) {
            (Some(all), _) => all.clone(),
            (None, Some(rest)) => format!("REST {rest}"),
            (None, None) => String::new(),
        };
        Self {
            attribute: a.attribute,
            rest_path: a.rest_path.unwrap_or("-"),
            zapi_path: a.zapi_path.unwrap_or("-"),
            since,
            notes: a.markers.join(", "),
        }
    }
}

pub fn handle(args: ResourcesArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let rendered = match args.resource {
        None => {
            let kinds: Vec<KindSummary> = ResourceKind::all().map(summarize).collect();
            output::render_list(global.output, &kinds, |k| KindRow::from(k))
        }
        Some(name) => {
            let kind = ResourceKind::parse(&name)?;
            let attrs: Vec<AttributeSummary> =
                kind.capabilities().iter().map(AttributeSummary::from).collect();
            output::render_list(global.output, &attrs, |a| AttributeRow::from(a))
        }
    };
    output::print_output(&rendered, global.quiet);
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_has_attributes() {
        for kind in ResourceKind::all() {
            assert!(summarize(kind).attributes > 0, "{kind} has no attributes");
        }
    }

    #[test]
    fn rest_column_shows_the_minimum_release() {
        let summary = KindSummary {
            resource: "ems_destination".into(),
            rest: true,
            zapi: true,
            rest_min_version: Some("(9, 10, 1)".into()),
            attributes: 4,
        };
        let row = KindRow::from(&summary);
        assert_eq!(row.rest, "(9, 10, 1)+");
        assert_eq!(row.zapi, "yes");
    }
}
