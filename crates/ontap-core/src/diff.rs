// ── Diff & normalization ──
//
// Compares observed state to desired state attribute by attribute using
// each capability's comparison rule, and reports which differing keys
// cannot be changed in place on the chosen protocol.

use std::collections::BTreeSet;

use serde_json::{Map, Value};
use tracing::debug;

use crate::capability::{AttrMap, Capability, Compare};
use crate::protocol::Protocol;

/// Result of diffing one object.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiffOutcome {
    /// Desired values for keys that differ and can be modified.
    pub modify: AttrMap,
    /// Keys that differ but cannot be changed in place.
    pub unmodifiable: Vec<String>,
    /// Non-fatal notes (ignored shrinks and the like).
    pub warnings: Vec<String>,
}

impl DiffOutcome {
    pub fn is_empty(&self) -> bool {
        self.modify.is_empty() && self.unmodifiable.is_empty()
    }
}

/// Percentage below which a requested shrink is treated as rounding.
pub const SHRINK_TOLERANCE_PERCENT: u64 = 2;

/// Diff `desired` against `current` for every stateful capability.
///
/// Keys absent from `desired` (or null) never contribute. Keys absent
/// from `current` always do, unless the protocol cannot observe them.
pub fn diff(
    caps: &[Capability],
    current: &AttrMap,
    desired: &AttrMap,
    protocol: Protocol,
) -> DiffOutcome {
    let mut out = DiffOutcome::default();
    for cap in caps.iter().filter(|c| c.is_state() && c.readable(protocol)) {
        let Some(want) = desired.get(cap.name).filter(|v| !v.is_null()) else {
            continue;
        };
        let delta = match current.get(cap.name).filter(|v| !v.is_null()) {
            None => Some(want.clone()),
            Some(have) => compare_value(cap, have, want, &mut out.warnings),
        };
        let Some(delta) = delta else { continue };
        debug!(attribute = cap.name, "attribute differs");
        if cap.modifiable.allows(protocol) {
            out.modify.insert(cap.name.to_owned(), delta);
        } else {
            out.unmodifiable.push(cap.name.to_owned());
        }
    }
    out
}

/// `None` when equivalent; otherwise the value to send.
fn compare_value(
    cap: &Capability,
    have: &Value,
    want: &Value,
    warnings: &mut Vec<String>,
) -> Option<Value> {
    let equal = match cap.compare {
        Compare::Never => true,
        Compare::Exact => scalar_eq(have, want),
        Compare::CaseInsensitive => folded(have, false) == folded(want, false),
        Compare::Aliased => folded(have, true) == folded(want, true),
        Compare::Size => return compare_size(cap.name, have, want, warnings),
        Compare::Unordered => set_of(have) == set_of(want),
        Compare::Ordered => ordered_eq(have, want, false),
        Compare::OrderedDedup => ordered_eq(have, want, true),
        Compare::AllValues { low, high } => {
            expand_all(have, low, high) == expand_all(want, low, high)
        }
        Compare::Nested => {
            return match (have, want) {
                (Value::Object(h), Value::Object(w)) => nested_diff(h, w).map(Value::Object),
                _ => (!scalar_eq(have, want)).then(|| want.clone()),
            };
        }
    };
    (!equal).then(|| want.clone())
}

// ── Scalars ──────────────────────────────────────────────────────────

/// Exact equality, tolerating `"5"` vs `5` and `"true"` vs `true`.
pub fn scalar_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::String(x), Value::Number(n)) | (Value::Number(n), Value::String(x)) => {
            x.trim() == n.to_string()
        }
        (Value::String(x), Value::Bool(v)) | (Value::Bool(v), Value::String(x)) => {
            x.trim().eq_ignore_ascii_case(if *v { "true" } else { "false" })
        }
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(p, q)| scalar_eq(p, q))
        }
        (Value::Object(x), Value::Object(y)) => nested_diff(x, y).is_none(),
        _ => a == b,
    }
}

fn folded(value: &Value, alias: bool) -> Option<String> {
    let s = match value {
        Value::String(s) => s.to_lowercase(),
        Value::Null => return None,
        other => other.to_string().to_lowercase(),
    };
    Some(if alias { s.replace('-', "_") } else { s })
}

/// Canonical string key for set membership of any JSON value.
fn canonical(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Object(map) => {
            let sorted: std::collections::BTreeMap<&String, String> =
                map.iter().map(|(k, v)| (k, canonical(v))).collect();
            format!("{sorted:?}")
        }
        Value::Array(items) => {
            let mut parts: Vec<String> = items.iter().map(canonical).collect();
            parts.sort();
            format!("{parts:?}")
        }
        other => other.to_string(),
    }
}

fn as_list(value: &Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items.clone(),
        Value::Null => Vec::new(),
        other => vec![other.clone()],
    }
}

fn set_of(value: &Value) -> BTreeSet<String> {
    as_list(value).iter().map(canonical).collect()
}

fn ordered_eq(have: &Value, want: &Value, dedup: bool) -> bool {
    let mut a = as_list(have);
    let mut b = as_list(want);
    if dedup {
        dedup_keep_first(&mut a);
        dedup_keep_first(&mut b);
    }
    a.len() == b.len() && a.iter().zip(&b).all(|(x, y)| scalar_eq(x, y))
}

/// Drop repeated entries, keeping the first occurrence of each.
pub fn dedup_keep_first(items: &mut Vec<Value>) {
    let mut seen = BTreeSet::new();
    items.retain(|v| seen.insert(canonical(v)));
}

/// Expand the `-1`/empty "every value" sentinel to the full range.
fn expand_all(value: &Value, low: i64, high: i64) -> BTreeSet<i64> {
    let items: Vec<i64> = as_list(value)
        .iter()
        .filter_map(|v| match v {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
        .collect();
    if items.is_empty() || items.contains(&-1) {
        (low..=high).collect()
    } else {
        items.into_iter().collect()
    }
}

/// Leaves of `want` that differ from `have`, as a sparse object.
fn nested_diff(have: &Map<String, Value>, want: &Map<String, Value>) -> Option<Map<String, Value>> {
    let mut out = Map::new();
    for (key, w) in want.iter().filter(|(_, v)| !v.is_null()) {
        match (have.get(key), w) {
            (Some(Value::Object(h)), Value::Object(w)) => {
                if let Some(sub) = nested_diff(h, w) {
                    out.insert(key.clone(), Value::Object(sub));
                }
            }
            (Some(h), w) if scalar_eq(h, w) => {}
            _ => {
                out.insert(key.clone(), w.clone());
            }
        }
    }
    (!out.is_empty()).then_some(out)
}

// ── Sizes ────────────────────────────────────────────────────────────

/// Parse a size given as bytes or with a binary unit suffix
/// (`b`, `k`/`kb`, `m`/`mb`, `g`/`gb`, `t`/`tb`, `p`/`pb`).
pub fn parse_size(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => parse_size_str(s),
        _ => None,
    }
}

pub fn parse_size_str(raw: &str) -> Option<u64> {
    let s = raw.trim().to_ascii_lowercase();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    let multiplier: u64 = match unit.trim() {
        "" | "b" | "bytes" => 1,
        "k" | "kb" => 1 << 10,
        "m" | "mb" => 1 << 20,
        "g" | "gb" => 1 << 30,
        "t" | "tb" => 1 << 40,
        "p" | "pb" => 1 << 50,
        _ => return None,
    };
    if let Ok(whole) = number.parse::<u64>() {
        return whole.checked_mul(multiplier);
    }
    // Fractional values: scale through thousandths to stay in integers.
    let (int_part, frac_part) = number.split_once('.')?;
    let int_part: u64 = if int_part.is_empty() { 0 } else { int_part.parse().ok()? };
    let frac_digits: String = frac_part.chars().take(3).collect();
    let scale = 10u64.pow(u32::try_from(frac_digits.len()).ok()?);
    let frac: u64 = if frac_digits.is_empty() { 0 } else { frac_digits.parse().ok()? };
    let whole = int_part.checked_mul(multiplier)?;
    let part = multiplier.checked_mul(frac)? / scale;
    whole.checked_add(part)
}

fn compare_size(
    name: &str,
    have: &Value,
    want: &Value,
    warnings: &mut Vec<String>,
) -> Option<Value> {
    let (Some(current), Some(desired)) = (parse_size(have), parse_size(want)) else {
        return (!scalar_eq(have, want)).then(|| want.clone());
    };
    if current == desired {
        return None;
    }
    if desired < current && is_small_shrink(current, desired) {
        let message = format!(
            "resize request for {name} ignored: {desired} is within \
             {SHRINK_TOLERANCE_PERCENT}% of current size {current}"
        );
        debug!(attribute = name, current, desired, "ignoring small shrink");
        warnings.push(message);
        return None;
    }
    Some(Value::from(desired))
}

/// Returns `true` when `desired` is less than 2% below `current`.
pub fn is_small_shrink(current: u64, desired: u64) -> bool {
    desired < current
        && u128::from(current - desired) * 100
            < u128::from(current) * u128::from(SHRINK_TOLERANCE_PERCENT)
}

// ── Month offsets ────────────────────────────────────────────────────

/// Shift month numbers from the user's base (0 or 1) to the wire base.
///
/// `-1` (every month) is preserved. Out-of-range values pass through
/// so the controller can reject them.
pub fn shift_months(months: &[i64], user_base: i64, wire_base: i64) -> Vec<i64> {
    months
        .iter()
        .map(|m| if *m == -1 { -1 } else { m - user_base + wire_base })
        .collect()
}
