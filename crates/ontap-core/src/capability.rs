// ── Capability tables ──
//
// Each handler declares its attributes as static data: the internal
// (snake_case) name, the REST JSON path and ZAPI element path it maps
// to, version gates, how values compare, and whether they can change
// in place. Only this module translates between the internal key space
// and the two wire forms.

use indexmap::IndexMap;
use serde_json::{Map, Value};

use ontap_api::NaElement;

use crate::protocol::Protocol;
use crate::version::OntapVersion;

/// Normalized attribute values keyed by internal attribute name.
pub type AttrMap = IndexMap<String, Value>;

/// Shape of an attribute's value on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Str,
    Int,
    Bool,
    /// List of strings; on ZAPI one leaf per item under a wrapper.
    StrList,
    /// List of integers; on ZAPI one leaf per item under a wrapper.
    IntList,
    /// Byte count, accepted from the user with a unit suffix.
    Size,
    /// Structured JSON; handlers project these themselves.
    Raw,
}

/// How the diff engine decides two values are equivalent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compare {
    Exact,
    /// Case-insensitive, for user-facing identifiers.
    CaseInsensitive,
    /// Case-insensitive and hyphen ≡ underscore (`rest-api` ≡ `rest_api`).
    Aliased,
    /// Byte counts after unit conversion, with small-shrink tolerance.
    Size,
    /// Membership only.
    Unordered,
    /// Positional.
    Ordered,
    /// Positional after dropping repeated entries.
    OrderedDedup,
    /// Integer set where `[-1]` or `[]` stands for the whole `range`.
    AllValues { low: i64, high: i64 },
    /// Recurse into objects; leaves compare exactly.
    Nested,
    /// Never diffed (options, write-only secrets).
    Never,
}

/// Which surfaces can carry the attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Support {
    Both,
    RestOnly,
    ZapiOnly,
}

/// Whether a differing value can be changed in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modifiable {
    Yes,
    No,
    NotOnRest,
    NotOnZapi,
}

impl Modifiable {
    pub fn allows(self, protocol: Protocol) -> bool {
        match self {
            Self::Yes => true,
            Self::No => false,
            Self::NotOnRest => protocol == Protocol::Zapi,
            Self::NotOnZapi => protocol == Protocol::Rest,
        }
    }
}

/// Static descriptor for one attribute of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capability {
    pub name: &'static str,
    /// Dotted JSON path in REST records and bodies.
    pub rest_path: Option<&'static str>,
    /// Dotted element path in ZAPI `*-get-iter` records.
    pub zapi_path: Option<&'static str>,
    /// Item element name for ZAPI list wrappers.
    pub zapi_item: Option<&'static str>,
    pub min_version: Option<OntapVersion>,
    pub rest_min_version: Option<OntapVersion>,
    pub kind: ValueKind,
    pub compare: Compare,
    pub support: Support,
    pub modifiable: Modifiable,
    /// Only settable by a modify issued after create.
    pub post_create: bool,
    /// Reached through the REST CLI passthrough (`private/cli/...`).
    pub via_cli: bool,
    /// Behavioural option, not part of the object's state.
    pub option: bool,
}

/// Start a descriptor for a stateful attribute.
pub const fn attr(name: &'static str) -> Capability {
    Capability {
        name,
        rest_path: None,
        zapi_path: None,
        zapi_item: None,
        min_version: None,
        rest_min_version: None,
        kind: ValueKind::Str,
        compare: Compare::Exact,
        support: Support::Both,
        modifiable: Modifiable::Yes,
        post_create: false,
        via_cli: false,
        option: false,
    }
}

/// Start a descriptor for an identity attribute: projected and sent,
/// never diffed (a rename is planned separately).
pub const fn key(name: &'static str) -> Capability {
    let mut cap = attr(name);
    cap.compare = Compare::Never;
    cap.modifiable = Modifiable::No;
    cap
}

/// Start a descriptor for a behavioural option (never diffed).
pub const fn option(name: &'static str) -> Capability {
    let mut cap = attr(name);
    cap.compare = Compare::Never;
    cap.option = true;
    cap
}

impl Capability {
    pub const fn rest(mut self, path: &'static str) -> Self {
        self.rest_path = Some(path);
        self
    }

    pub const fn zapi(mut self, path: &'static str) -> Self {
        self.zapi_path = Some(path);
        self
    }

    pub const fn item(mut self, item: &'static str) -> Self {
        self.zapi_item = Some(item);
        self
    }

    pub const fn rest_only(mut self) -> Self {
        self.support = Support::RestOnly;
        self
    }

    pub const fn zapi_only(mut self) -> Self {
        self.support = Support::ZapiOnly;
        self
    }

    pub const fn since(mut self, version: OntapVersion) -> Self {
        self.min_version = Some(version);
        self
    }

    pub const fn rest_since(mut self, version: OntapVersion) -> Self {
        self.rest_min_version = Some(version);
        self
    }

    pub const fn kind(mut self, kind: ValueKind) -> Self {
        self.kind = kind;
        self
    }

    pub const fn int(self) -> Self {
        self.kind(ValueKind::Int)
    }

    pub const fn boolean(self) -> Self {
        self.kind(ValueKind::Bool)
    }

    pub const fn size(mut self) -> Self {
        self.kind = ValueKind::Size;
        self.compare = Compare::Size;
        self
    }

    /// Unordered list of strings.
    pub const fn set(mut self) -> Self {
        self.kind = ValueKind::StrList;
        self.compare = Compare::Unordered;
        self
    }

    pub const fn compare(mut self, compare: Compare) -> Self {
        self.compare = compare;
        self
    }

    pub const fn fixed(mut self) -> Self {
        self.modifiable = Modifiable::No;
        self
    }

    pub const fn modifiable(mut self, modifiable: Modifiable) -> Self {
        self.modifiable = modifiable;
        self
    }

    pub const fn after_create(mut self) -> Self {
        self.post_create = true;
        self
    }

    pub const fn via_cli(mut self) -> Self {
        self.via_cli = true;
        self
    }

    /// Returns `true` if this attribute takes part in diffing.
    pub fn is_state(&self) -> bool {
        !self.option && self.compare != Compare::Never
    }

    /// Available on `protocol` at all.
    pub fn supports(&self, protocol: Protocol) -> bool {
        match (self.support, protocol) {
            (Support::Both, _) => true,
            (Support::RestOnly, p) => p == Protocol::Rest,
            (Support::ZapiOnly, p) => p == Protocol::Zapi,
        }
    }

    /// Observable on `protocol`, i.e. current state carries it.
    pub fn readable(&self, protocol: Protocol) -> bool {
        match protocol {
            Protocol::Rest => self.rest_path.is_some(),
            Protocol::Zapi => self.zapi_path.is_some(),
        }
    }

    /// Last segment of the ZAPI path: the key used in create/modify calls.
    pub fn zapi_key(&self) -> Option<&'static str> {
        self.zapi_path.and_then(|p| p.rsplit('.').next())
    }

    /// Markers for capability listings: `rest-only`, `zapi-only`, `cli`,
    /// `fixed`, `after-create`, `option`.
    pub fn markers(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        match self.support {
            Support::RestOnly => out.push("rest-only"),
            Support::ZapiOnly => out.push("zapi-only"),
            Support::Both => {}
        }
        if self.via_cli {
            out.push("cli");
        }
        match self.modifiable {
            Modifiable::No => out.push("fixed"),
            Modifiable::NotOnRest => out.push("fixed-on-rest"),
            Modifiable::NotOnZapi => out.push("fixed-on-zapi"),
            Modifiable::Yes => {}
        }
        if self.post_create {
            out.push("after-create");
        }
        if self.option {
            out.push("option");
        }
        out
    }
}

/// Look up a descriptor by internal name.
pub fn find<'a>(caps: &'a [Capability], name: &str) -> Option<&'a Capability> {
    caps.iter().find(|c| c.name == name)
}

// ── REST projection ──────────────────────────────────────────────────

/// Read a dotted path out of a JSON record.
pub fn json_get<'a>(record: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(record, |node, seg| node.get(seg))
}

/// Write a value at a dotted path, creating intermediate objects.
pub fn json_set(body: &mut Map<String, Value>, path: &str, value: Value) {
    let mut segments = path.split('.').peekable();
    let mut node = body;
    while let Some(seg) = segments.next() {
        if segments.peek().is_none() {
            node.insert(seg.to_owned(), value);
            return;
        }
        let entry = node
            .entry(seg.to_owned())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        match entry {
            Value::Object(map) => node = map,
            _ => return,
        }
    }
}

/// Project a REST record into the internal key space.
///
/// Raw-kind attributes are copied verbatim; handlers reshape them.
pub fn from_rest(caps: &[Capability], record: &Value) -> AttrMap {
    let mut out = AttrMap::new();
    for cap in caps.iter().filter(|c| !c.option) {
        let Some(path) = cap.rest_path else { continue };
        if let Some(value) = json_get(record, path).filter(|v| !v.is_null()) {
            out.insert(cap.name.to_owned(), value.clone());
        }
    }
    out
}

/// Build a REST body from internal attributes. Keys without a REST
/// path are skipped.
pub fn to_rest<'a, I>(caps: &[Capability], attrs: I) -> Value
where
    I: IntoIterator<Item = (&'a String, &'a Value)>,
{
    let mut body = Map::new();
    for (key, value) in attrs {
        if let Some(path) = find(caps, key).and_then(|c| c.rest_path) {
            json_set(&mut body, path, value.clone());
        }
    }
    Value::Object(body)
}

// ── ZAPI projection ──────────────────────────────────────────────────

/// Project a ZAPI record into the internal key space.
pub fn from_zapi(caps: &[Capability], record: &NaElement) -> AttrMap {
    let mut out = AttrMap::new();
    for cap in caps.iter().filter(|c| !c.option) {
        let Some(path) = cap.zapi_path else { continue };
        let value = match cap.kind {
            ValueKind::StrList => record.find(path).map(|_| {
                Value::Array(record.list_at(path).into_iter().map(Value::String).collect())
            }),
            ValueKind::IntList => record.find(path).map(|_| {
                Value::Array(
                    record
                        .list_at(path)
                        .iter()
                        .filter_map(|s| s.trim().parse::<i64>().ok())
                        .map(Value::from)
                        .collect(),
                )
            }),
            ValueKind::Int | ValueKind::Size => record
                .find_str(path)
                .and_then(|s| s.trim().parse::<i64>().ok())
                .map(Value::from),
            ValueKind::Bool => record
                .find_str(path)
                .map(|s| Value::Bool(s.trim().eq_ignore_ascii_case("true"))),
            ValueKind::Str | ValueKind::Raw => {
                record.find_str(path).map(|s| Value::String(s.to_owned()))
            }
        };
        if let Some(value) = value {
            out.insert(cap.name.to_owned(), value);
        }
    }
    out
}

/// Render a JSON scalar the way ONTAPI expects it in element content.
pub fn zapi_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Append one attribute to a ZAPI create/modify request.
pub fn put_zapi(request: &mut NaElement, cap: &Capability, value: &Value) {
    let Some(key) = cap.zapi_key() else { return };
    match (value, cap.zapi_item) {
        (Value::Array(items), Some(item)) => {
            let mut list = NaElement::new(key);
            for v in items {
                list.add_new_child(item, zapi_text(v));
            }
            request.add_child(list);
        }
        _ => {
            request.add_new_child(key, zapi_text(value));
        }
    }
}

/// Append every attribute in `attrs` that has a ZAPI mapping.
pub fn to_zapi<'a, I>(caps: &[Capability], request: &mut NaElement, attrs: I)
where
    I: IntoIterator<Item = (&'a String, &'a Value)>,
{
    for (key, value) in attrs {
        if let Some(cap) = find(caps, key).filter(|c| c.zapi_path.is_some()) {
            put_zapi(request, cap, value);
        }
    }
}

/// An attribute the handler drops under a given cluster personality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IgnorableAttribute {
    pub name: &'static str,
    /// `{attr}` is replaced by the attribute name.
    pub message: &'static str,
}

impl IgnorableAttribute {
    pub fn render(&self) -> String {
        self.message.replace("{attr}", self.name)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    const CAPS: &[Capability] = &[
        key("name").rest("name").zapi("volume-id-attributes.name"),
        attr("size").rest("space.size").zapi("volume-space-attributes.size").size(),
        attr("is_online").rest("state").zapi("volume-state-attributes.is-online").boolean(),
        attr("tags").rest("_tags").rest_only().set(),
        attr("nodes").rest("nodes").zapi("nodes").item("node-name").set(),
        option("wait_for_online"),
    ];

    #[test]
    fn rest_projection_follows_dotted_paths() {
        let record = json!({"name": "vol1", "space": {"size": 1024}, "uuid": "u1"});
        let attrs = from_rest(CAPS, &record);
        assert_eq!(attrs.get("name"), Some(&json!("vol1")));
        assert_eq!(attrs.get("size"), Some(&json!(1024)));
        assert!(!attrs.contains_key("tags"));
    }

    #[test]
    fn rest_body_nests_paths() {
        let mut attrs = AttrMap::new();
        attrs.insert("size".into(), json!(2048));
        attrs.insert("name".into(), json!("vol1"));
        attrs.insert("wait_for_online".into(), json!(true));
        assert_eq!(
            to_rest(CAPS, &attrs),
            json!({"space": {"size": 2048}, "name": "vol1"})
        );
    }

    #[test]
    fn zapi_projection_reads_kinds() {
        let record = NaElement::new("volume-attributes")
            .with_child(NaElement::new("volume-id-attributes").with_child_content("name", "vol1"))
            .with_child(
                NaElement::new("volume-space-attributes").with_child_content("size", "4096"),
            )
            .with_child(
                NaElement::new("volume-state-attributes").with_child_content("is-online", "true"),
            )
            .with_list("nodes", "node-name", ["n1", "n2"]);
        let attrs = from_zapi(CAPS, &record);
        assert_eq!(attrs.get("size"), Some(&json!(4096)));
        assert_eq!(attrs.get("is_online"), Some(&json!(true)));
        assert_eq!(attrs.get("nodes"), Some(&json!(["n1", "n2"])));
    }

    #[test]
    fn zapi_request_uses_last_segment_and_item() {
        let mut request = NaElement::new("volume-create");
        let mut attrs = AttrMap::new();
        attrs.insert("size".into(), json!(10));
        attrs.insert("nodes".into(), json!(["n1"]));
        to_zapi(CAPS, &mut request, &attrs);
        assert_eq!(
            request.to_xml(),
            "<volume-create><size>10</size><nodes><node-name>n1</node-name></nodes></volume-create>"
        );
    }

    #[test]
    fn markers_describe_gates() {
        let cap = attr("x").rest("x").rest_only().fixed().via_cli();
        assert_eq!(cap.markers(), vec!["rest-only", "cli", "fixed"]);
        assert!(!find(CAPS, "wait_for_online").unwrap().is_state());
        assert!(!find(CAPS, "name").unwrap().is_state());
        assert!(find(CAPS, "tags").unwrap().readable(Protocol::Rest));
        assert!(!find(CAPS, "tags").unwrap().readable(Protocol::Zapi));
    }
}
