//! Reference/Expression primitives (component C1) and the [`Value`] tree used to represent
//! resource manifests and status shapes that may contain them anywhere.

use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The reserved resource id denoting a schema (spec/status) reference rather than a reference to
/// another resource in the graph.
pub const SCHEMA_RESOURCE_ID: &str = "__schema__";

/// The stable identifier of a resource within a [`crate::model::ResourceGraph`], or the reserved
/// schema sentinel.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(pub String);

impl ResourceId {
    /// The reserved id used for references into the graph's own spec/status schema.
    pub fn schema() -> Self {
        ResourceId(SCHEMA_RESOURCE_ID.to_string())
    }

    /// True if this id is the reserved schema sentinel.
    pub fn is_schema(&self) -> bool {
        self.0 == SCHEMA_RESOURCE_ID
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(s: &str) -> Self {
        ResourceId(s.to_string())
    }
}

impl From<String> for ResourceId {
    fn from(s: String) -> Self {
        ResourceId(s)
    }
}

/// A single step of a [`FieldPath`]: a named field, or a numeric array index.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    /// `.foo`
    Field(String),
    /// `[3]`
    Index(usize),
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Field(name) => f.write_str(name),
            PathSegment::Index(i) => write!(f, "[{i}]"),
        }
    }
}

/// A dotted path with optional numeric indices, e.g. `spec.ports[0].port`.
///
/// `(resourceId, fieldPath)` together are the identity key of a [`Reference`]; two `FieldPath`s
/// are equal iff their segment lists are equal.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldPath(pub Vec<PathSegment>);

impl FieldPath {
    /// An empty path (refers to the subject itself).
    pub fn root() -> Self {
        FieldPath(Vec::new())
    }

    /// Appends a field step, returning the extended path.
    pub fn field(&self, name: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(PathSegment::Field(name.into()));
        FieldPath(segments)
    }

    /// Appends an index step, returning the extended path.
    pub fn index(&self, i: usize) -> Self {
        let mut segments = self.0.clone();
        segments.push(PathSegment::Index(i));
        FieldPath(segments)
    }

    /// The path's segments.
    pub fn segments(&self) -> &[PathSegment] {
        &self.0
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, seg) in self.0.iter().enumerate() {
            match seg {
                PathSegment::Field(name) => {
                    if i > 0 {
                        f.write_str(".")?;
                    }
                    f.write_str(name)?;
                }
                PathSegment::Index(idx) => write!(f, "[{idx}]")?,
            }
        }
        Ok(())
    }
}

impl FromStr for FieldPath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut field = String::new();
        let mut chars = s.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '.' => {
                    if field.is_empty() {
                        return Err(Error::MalformedFieldPath {
                            path: s.to_string(),
                            reason: "empty field name before '.'",
                        });
                    }
                    segments.push(PathSegment::Field(std::mem::take(&mut field)));
                }
                '[' => {
                    if !field.is_empty() {
                        segments.push(PathSegment::Field(std::mem::take(&mut field)));
                    }
                    let mut digits = String::new();
                    for d in chars.by_ref() {
                        if d == ']' {
                            break;
                        }
                        digits.push(d);
                    }
                    let idx: usize = digits.parse().map_err(|_| Error::MalformedFieldPath {
                        path: s.to_string(),
                        reason: "non-numeric array index",
                    })?;
                    segments.push(PathSegment::Index(idx));
                }
                _ => field.push(c),
            }
        }
        if !field.is_empty() {
            segments.push(PathSegment::Field(field));
        }
        if segments.is_empty() {
            return Err(Error::MalformedFieldPath {
                path: s.to_string(),
                reason: "empty path",
            });
        }
        Ok(FieldPath(segments))
    }
}

/// Static type tag carried by a [`Reference`]/[`Expression`] for documentation and build-time
/// type checking at the builder layer. Has no bearing on [`Reference`] equality.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TypeTag {
    /// String-typed.
    String,
    /// Integer-typed.
    Int,
    /// Boolean-typed.
    Bool,
    /// Object-typed (an arbitrary sub-document).
    Object,
    /// Array-typed.
    Array,
    /// Unknown / unconstrained.
    #[default]
    Unknown,
}

/// A typed placeholder for a field of another resource, or of the graph's own schema.
///
/// Identity: `(resource_id, field_path)` is the equality key; `type_tag` does not participate in
/// equality, matching the Testable Property that repeated reads of the same path mint structurally
/// equal references regardless of how the call site annotated the expected type.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Reference {
    /// The target resource, or [`ResourceId::schema`] for schema references.
    pub resource_id: ResourceId,
    /// The field path inside the target.
    pub field_path: FieldPath,
    /// The declared type, for documentation/build-time checking only.
    pub type_tag: TypeTag,
}

impl Reference {
    /// Mints a new reference. Never fails: reference minting is infallible at this layer.
    pub fn new(resource_id: ResourceId, field_path: FieldPath, type_tag: TypeTag) -> Self {
        Reference {
            resource_id,
            field_path,
            type_tag,
        }
    }

    /// Mints a schema reference (`resourceId = __schema__`).
    pub fn schema(field_path: FieldPath, type_tag: TypeTag) -> Self {
        Reference::new(ResourceId::schema(), field_path, type_tag)
    }

    /// True if this reference targets the graph's own schema rather than another resource.
    pub fn is_schema(&self) -> bool {
        self.resource_id.is_schema()
    }
}

impl PartialEq for Reference {
    fn eq(&self, other: &Self) -> bool {
        self.resource_id == other.resource_id && self.field_path == other.field_path
    }
}
impl Eq for Reference {}

/// A typed carrier around a textual expression in the cluster-side dialect.
///
/// `refs` holds every [`Reference`] structurally embedded in `body`, recovered at construction
/// time so the dependency resolver (C3) can walk them without re-parsing `body`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Expression {
    /// The expression source text, in this system's own dialect (see `engine::eval`), not the
    /// cluster controller's dialect — that rewrite happens in `rgd_dialect` at serialization time.
    pub body: String,
    /// The declared evaluation type.
    pub type_tag: TypeTag,
    /// References structurally embedded in `body`.
    pub refs: Vec<Reference>,
    /// Present when this expression was built by [`Expression::template`]: the literal/argument
    /// segments in order, kept alongside `body` so `rgd_dialect` can re-render the printf-style
    /// template as the cluster dialect's concatenation form instead of re-parsing `body`.
    pub parts: Option<Vec<TemplatePart>>,
}

impl Expression {
    /// Builds a general expression from already-rendered source text and its embedded references.
    pub fn new(body: impl Into<String>, type_tag: TypeTag, refs: Vec<Reference>) -> Self {
        Expression {
            body: body.into(),
            type_tag,
            refs,
            parts: None,
        }
    }

    /// Builds a printf-style template: `%s` positions in `fmt` are replaced in order by the
    /// textual rendering of each `arg`, and the resulting references are the union of every
    /// argument's own references (arguments that are themselves plain literals contribute none).
    pub fn template(fmt: &str, args: &[ExprArg]) -> Self {
        let mut body = String::new();
        let mut refs = Vec::new();
        let mut parts = Vec::new();
        let mut literal = String::new();
        let mut arg_iter = args.iter();
        let mut chars = fmt.chars().peekable();
        while let Some(c) = chars.next() {
            if c == '%' && chars.peek() == Some(&'s') {
                chars.next();
                match arg_iter.next() {
                    Some(arg) => {
                        body.push_str(&arg.render());
                        refs.extend(arg.refs());
                        if !literal.is_empty() {
                            parts.push(TemplatePart::Literal(std::mem::take(&mut literal)));
                        }
                        parts.push(TemplatePart::Arg(arg.clone()));
                    }
                    None => {
                        body.push_str("%s");
                        literal.push_str("%s");
                    }
                }
            } else {
                body.push(c);
                literal.push(c);
            }
        }
        if !literal.is_empty() {
            parts.push(TemplatePart::Literal(literal));
        }
        Expression {
            body,
            type_tag: TypeTag::String,
            refs,
            parts: Some(parts),
        }
    }
}

impl PartialEq for Expression {
    fn eq(&self, other: &Self) -> bool {
        self.body == other.body
    }
}
impl Eq for Expression {}

/// A single argument to [`Expression::template`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ExprArg {
    /// A literal value, rendered via `Display`.
    Literal(String),
    /// A reference, rendered as its own textual form and contributing itself to `refs`.
    Reference(Reference),
    /// A nested expression, rendered as its body and contributing its own `refs`.
    Expression(Expression),
}

/// One segment of a template built by [`Expression::template`]: either a literal run of text
/// between `%s` positions, or the argument that filled one of them.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum TemplatePart {
    /// Literal text copied verbatim from the format string.
    Literal(String),
    /// The argument substituted at a `%s` position.
    Arg(ExprArg),
}

impl ExprArg {
    fn render(&self) -> String {
        match self {
            ExprArg::Literal(s) => s.clone(),
            ExprArg::Reference(r) => format!("{}.{}", r.resource_id, r.field_path),
            ExprArg::Expression(e) => e.body.clone(),
        }
    }

    fn refs(&self) -> Vec<Reference> {
        match self {
            ExprArg::Literal(_) => Vec::new(),
            ExprArg::Reference(r) => vec![r.clone()],
            ExprArg::Expression(e) => e.refs.clone(),
        }
    }
}

/// A manifest or status-shape value tree. Scalars and containers behave like ordinary JSON;
/// [`Value::Ref`] and [`Value::Expr`] are leaves that must never be structurally decomposed by a
/// generic walker — every recursive function in this workspace that walks a `Value` matches on
/// these two variants explicitly and stops.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// JSON `null`.
    Null,
    /// A boolean literal.
    Bool(bool),
    /// An integer literal.
    Int(i64),
    /// A string literal.
    String(String),
    /// An ordered list of values.
    Array(Vec<Value>),
    /// An ordered (insertion-order-preserving) map of values.
    Object(IndexMap<String, Value>),
    /// A reference placeholder.
    Ref(Reference),
    /// An expression placeholder.
    Expr(Expression),
}

impl Value {
    /// True if this value (at the top level) is a placeholder.
    pub fn is_placeholder(&self) -> bool {
        matches!(self, Value::Ref(_) | Value::Expr(_))
    }

    /// Converts a plain `serde_json::Value` (no placeholders possible) into a `Value`.
    pub fn from_json(v: serde_json::Value) -> Value {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::String(n.to_string())
                }
            }
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(a) => Value::Array(a.into_iter().map(Value::from_json).collect()),
            serde_json::Value::Object(o) => {
                Value::Object(o.into_iter().map(|(k, v)| (k, Value::from_json(v))).collect())
            }
        }
    }

    /// Recursively collects every [`Reference`] reachable from this value, including references
    /// nested inside [`Expression`] bodies. Array elements are walked; object *keys* never are
    /// (matching the dependency resolver's edge-walking rule).
    pub fn collect_refs(&self, out: &mut Vec<Reference>) {
        match self {
            Value::Ref(r) => out.push(r.clone()),
            Value::Expr(e) => out.extend(e.refs.iter().cloned()),
            Value::Array(items) => {
                for item in items {
                    item.collect_refs(out);
                }
            }
            Value::Object(map) => {
                for v in map.values() {
                    v.collect_refs(out);
                }
            }
            Value::Null | Value::Bool(_) | Value::Int(_) | Value::String(_) => {}
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}
impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}
impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}
impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}
impl From<Reference> for Value {
    fn from(r: Reference) -> Self {
        Value::Ref(r)
    }
}
impl From<Expression> for Value {
    fn from(e: Expression) -> Self {
        Value::Expr(e)
    }
}
impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::Array(items.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_path_round_trips() {
        let p: FieldPath = "spec.ports[0].port".parse().unwrap();
        assert_eq!(p.to_string(), "spec.ports[0].port");
        assert_eq!(
            p.segments(),
            &[
                PathSegment::Field("spec".into()),
                PathSegment::Field("ports".into()),
                PathSegment::Index(0),
                PathSegment::Field("port".into()),
            ]
        );
    }

    #[test]
    fn repeated_reads_mint_equal_references() {
        let a = Reference::new(ResourceId::from("db"), "status.podIP".parse().unwrap(), TypeTag::String);
        let b = Reference::new(ResourceId::from("db"), "status.podIP".parse().unwrap(), TypeTag::Int);
        assert_eq!(a, b, "type_tag must not affect identity");
    }

    #[test]
    fn schema_references_are_tagged() {
        let r = Reference::schema("spec.host".parse().unwrap(), TypeTag::String);
        assert!(r.is_schema());
    }

    #[test]
    fn collect_refs_walks_arrays_not_keys() {
        let mut map = IndexMap::new();
        map.insert(
            "env".to_string(),
            Value::Array(vec![Value::Ref(Reference::new(
                ResourceId::from("db"),
                FieldPath::root().field("status").field("podIP"),
                TypeTag::String,
            ))]),
        );
        let v = Value::Object(map);
        let mut refs = Vec::new();
        v.collect_refs(&mut refs);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].resource_id, ResourceId::from("db"));
    }

    #[test]
    fn template_parenthesization_is_callers_job_here() {
        let arg = ExprArg::Reference(Reference::schema(
            FieldPath::root().field("spec").field("host"),
            TypeTag::String,
        ));
        let e = Expression::template("http://%s", &[arg]);
        assert_eq!(e.body, "http://__schema__.spec.host");
        assert_eq!(e.refs.len(), 1);
        let parts = e.parts.unwrap();
        assert_eq!(parts.len(), 2);
        assert!(matches!(&parts[0], TemplatePart::Literal(s) if s == "http://"));
        assert!(matches!(&parts[1], TemplatePart::Arg(ExprArg::Reference(_))));
    }
}
