//! Rendering of [`api::Value`] trees into the cluster dialect: every [`api::Reference`] and
//! [`api::Expression`] leaf is rewritten to a `${...}` token, everything else passes through as
//! plain JSON.
//!
//! The schema sentinel resource id ([`api::ResourceId::schema`]) renders as the bare token
//! `schema` rather than its internal `__schema__` spelling, matching the cluster dialect's own
//! convention for referring to the instance's own spec/status.

use api::{ExprArg, Expression, Reference, TemplatePart, TypeTag, Value};
use serde_json::Value as Json;

/// Renders a `Value` tree to plain JSON, rewriting every `Ref`/`Expr` leaf to its `${...}` token.
/// Containers keep their shape and order; only placeholder leaves change representation.
pub fn render_value(value: &Value) -> Json {
    match value {
        Value::Null => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::Int(i) => Json::Number((*i).into()),
        Value::String(s) => Json::String(s.clone()),
        Value::Array(items) => Json::Array(items.iter().map(render_value).collect()),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), render_value(v));
            }
            Json::Object(out)
        }
        Value::Ref(r) => Json::String(format!("${{{}}}", render_reference(r))),
        Value::Expr(e) => Json::String(format!("${{{}}}", render_expression(e))),
    }
}

/// True if a value contains a reference to another resource's field (as opposed to only schema
/// references, or no references at all).
pub fn is_dynamic(value: &Value) -> bool {
    let mut refs = Vec::new();
    value.collect_refs(&mut refs);
    refs.iter().any(|r| !r.is_schema())
}

fn render_reference(r: &Reference) -> String {
    let prefix = if r.is_schema() {
        "schema".to_string()
    } else {
        r.resource_id.to_string()
    };
    if r.field_path.segments().is_empty() {
        prefix
    } else {
        format!("{prefix}.{}", r.field_path)
    }
}

/// Renders a single expression's body text for use inside a `${...}` token: templates are
/// re-composed as concatenations of their parts, general expressions pass their body through as
/// written (the two dialects share syntax for the subset this crate renders).
fn render_expression(e: &Expression) -> String {
    match &e.parts {
        Some(parts) => parts.iter().map(render_part).collect::<Vec<_>>().join(" + "),
        None => e.body.clone(),
    }
}

fn render_part(part: &TemplatePart) -> String {
    match part {
        TemplatePart::Literal(s) => quote(s),
        TemplatePart::Arg(arg) => render_arg(arg),
    }
}

fn render_arg(arg: &ExprArg) -> String {
    match arg {
        ExprArg::Literal(s) => quote(s),
        ExprArg::Reference(r) => wrap_if_int(render_reference(r), r.type_tag),
        ExprArg::Expression(e) => {
            let rendered = render_expression(e);
            let rendered = parenthesize_if_or(&rendered);
            wrap_if_int(rendered, e.type_tag)
        }
    }
}

fn quote(s: &str) -> String {
    format!("{s:?}")
}

fn wrap_if_int(s: String, tag: TypeTag) -> String {
    if tag == TypeTag::Int {
        format!("string({s})")
    } else {
        s
    }
}

/// Wraps `body` in parens if it contains a top-level (not nested in quotes/parens/brackets) `||`.
/// Sub-expressions spliced into a larger concatenation must be parenthesized this way so operator
/// precedence in the target dialect matches what the builder intended.
fn parenthesize_if_or(body: &str) -> String {
    if has_top_level_or(body) {
        format!("({body})")
    } else {
        body.to_string()
    }
}

fn has_top_level_or(body: &str) -> bool {
    let mut depth = 0i32;
    let mut in_string = false;
    let mut chars = body.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' => in_string = !in_string,
            '(' | '[' if !in_string => depth = depth.saturating_add(1),
            ')' | ']' if !in_string => depth = depth.saturating_sub(1),
            '|' if !in_string && depth == 0 && chars.peek() == Some(&'|') => return true,
            _ => {}
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use api::{FieldPath, ResourceId};

    #[test]
    fn plain_literal_passes_through() {
        assert_eq!(render_value(&Value::Int(3)), Json::Number(3.into()));
    }

    #[test]
    fn resource_reference_renders_as_dotted_token() {
        let r = Reference::new(ResourceId::from("db"), "status.podIP".parse().unwrap(), TypeTag::String);
        assert_eq!(render_value(&Value::Ref(r)), Json::String("${db.status.podIP}".into()));
    }

    #[test]
    fn schema_reference_renders_with_schema_prefix() {
        let r = Reference::schema(FieldPath::root().field("spec").field("host"), TypeTag::String);
        assert_eq!(render_value(&Value::Ref(r)), Json::String("${schema.spec.host}".into()));
    }

    #[test]
    fn template_with_nested_or_expression_is_parenthesized_and_wrapped() {
        let host = ExprArg::Reference(Reference::schema(FieldPath::root().field("spec").field("host"), TypeTag::String));
        let port_expr = Expression::new(
            "schema.spec.port || 80",
            TypeTag::Int,
            vec![Reference::schema(FieldPath::root().field("spec").field("port"), TypeTag::Int)],
        );
        let port = ExprArg::Expression(port_expr);
        let top = Expression::template("http://%s:%s", &[host, port]);
        assert_eq!(
            render_expression(&top),
            r#""http://" + schema.spec.host + ":" + string((schema.spec.port || 80))"#
        );
    }

    #[test]
    fn dynamic_detection_ignores_schema_only_refs() {
        let schema_only = Value::Ref(Reference::schema("spec.host".parse().unwrap(), TypeTag::String));
        assert!(!is_dynamic(&schema_only));
        let resource_ref = Value::Ref(Reference::new(ResourceId::from("db"), "status.podIP".parse().unwrap(), TypeTag::String));
        assert!(is_dynamic(&resource_ref));
    }
}
