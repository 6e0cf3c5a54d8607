//! Output formatting: JSON, compact JSON, YAML, table.
//!
//! Structured formats serialize the data as is. `table` renders lists
//! with `tabled` and single records through a caller-supplied summary.

use std::io::{self, IsTerminal, Write};

use owo_colors::OwoColorize;
use serde::Serialize;
use tabled::{Table, Tabled, settings::Style};

use ontap_core::{CdAction, Outcome};

use crate::cli::{ColorMode, OutputFormat};

// ── Color helpers ────────────────────────────────────────────────────

pub fn should_color(mode: ColorMode) -> bool {
    match mode {
        ColorMode::Always => true,
        ColorMode::Never => false,
        ColorMode::Auto => io::stdout().is_terminal() && std::env::var("NO_COLOR").is_err(),
    }
}

// ── Render dispatchers ───────────────────────────────────────────────

/// Render a list, using `to_row` for tables.
pub fn render_list<T, R>(format: OutputFormat, data: &[T], to_row: impl Fn(&T) -> R) -> String
where
    T: Serialize,
    R: Tabled,
{
    match format {
        OutputFormat::Table => {
            let rows: Vec<R> = data.iter().map(to_row).collect();
            Table::new(rows).with(Style::rounded()).to_string()
        }
        other => render_structured(other, data),
    }
}

/// Render one item, using `detail_fn` for tables.
pub fn render_single<T>(format: OutputFormat, data: &T, detail_fn: impl Fn(&T) -> String) -> String
where
    T: Serialize + ?Sized,
{
    match format {
        OutputFormat::Table => detail_fn(data),
        other => render_structured(other, data),
    }
}

fn render_structured<T: Serialize + ?Sized>(format: OutputFormat, data: &T) -> String {
    let rendered = match format {
        OutputFormat::JsonCompact => serde_json::to_string(data).map_err(|e| e.to_string()),
        OutputFormat::Yaml => serde_yaml::to_string(data).map_err(|e| e.to_string()),
        OutputFormat::Json | OutputFormat::Table => {
            serde_json::to_string_pretty(data).map_err(|e| e.to_string())
        }
    };
    rendered.unwrap_or_else(|e| {
        format!("{{\"failed\": true, \"msg\": \"cannot render output: {e}\"}}")
    })
}

/// Print to stdout unless quiet.
pub fn print_output(output: &str, quiet: bool) {
    if quiet || output.is_empty() {
        return;
    }
    let mut stdout = io::stdout().lock();
    let _ = writeln!(stdout, "{output}");
}

// ── Result envelope summary ──────────────────────────────────────────

/// Human-readable rendering of an invocation result.
pub fn outcome_summary(outcome: &Outcome, color: bool) -> String {
    use std::fmt::Write as _;

    let mut out = String::new();
    let status = if outcome.changed { "changed" } else { "ok" };
    let status = match (color, outcome.changed) {
        (false, _) => status.to_owned(),
        (true, true) => status.yellow().bold().to_string(),
        (true, false) => status.green().bold().to_string(),
    };
    let _ = writeln!(
        out,
        "{status}: {} {} ({})",
        outcome.resource, outcome.name, outcome.protocol
    );
    if outcome.cd_action != CdAction::None {
        let _ = writeln!(out, "  action: {}", outcome.cd_action);
    }
    if outcome.rename {
        let _ = writeln!(out, "  renamed");
    }
    if let Some(modify) = &outcome.modify {
        for (key, value) in modify {
            let _ = writeln!(out, "  modify {key}: {value}");
        }
    }
    if let Some(plan) = &outcome.plan {
        let _ = writeln!(out, "  plan:");
        for step in plan {
            let _ = writeln!(out, "    - {step}");
        }
    }
    for warning in &outcome.warnings {
        let line = format!("  warning: {warning}");
        let _ = writeln!(out, "{}", if color { line.yellow().to_string() } else { line });
    }
    for previous in &outcome.previous_errors {
        let _ = writeln!(out, "  tolerated: {previous}");
    }
    out.trim_end().to_owned()
}
