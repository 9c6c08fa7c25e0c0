//! The graph builder / proxy layer (component C2).
//!
//! Per the design note on replacing dynamic proxies with explicit types, there is no runtime
//! proxy object here: [`ResourceHandle::field`] always mints a [`Reference`] against the handle's
//! own id, and "real reads" are simply ordinary Rust field access on the caller's own typed spec
//! before anything is placed into the manifest.

use std::cell::RefCell;
use std::rc::Rc;

use api::{FieldPath, PathSegment, Reference, ResourceEntry, ResourceId, TypeTag, Value};
use indexmap::IndexMap;

use crate::error::{Error, Result};

/// A handle to a single resource under construction inside a [`crate::compose::Composer`].
///
/// Cloning a handle is cheap: the manifest itself lives behind a shared `Rc<RefCell<_>>` owned by
/// the [`crate::compose::Composer`], so every clone of a handle mutates the same manifest.
#[derive(Clone, Debug)]
pub struct ResourceHandle {
    id: ResourceId,
    kind: String,
    api_version: String,
    manifest: Rc<RefCell<ManifestBuilder>>,
}

impl ResourceHandle {
    pub(crate) fn new(
        id: ResourceId,
        kind: impl Into<String>,
        api_version: impl Into<String>,
        manifest: Rc<RefCell<ManifestBuilder>>,
    ) -> Self {
        ResourceHandle {
            id,
            kind: kind.into(),
            api_version: api_version.into(),
            manifest,
        }
    }

    /// The resource's stable id.
    pub fn id(&self) -> &ResourceId {
        &self.id
    }

    /// The resource's Kubernetes kind.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Mints a [`Reference`] to a field of this resource. Synthetic by construction: this never
    /// inspects whatever manifest content has been set so far, matching the contract that a
    /// reference mint never fails and is independent of write order.
    pub fn field(&self, path: &str, type_tag: TypeTag) -> Result<Reference> {
        let field_path: FieldPath = path.parse().map_err(Error::Api)?;
        Ok(Reference::new(self.id.clone(), field_path, type_tag))
    }

    /// Sets a dotted field path in this resource's manifest to a value (literal, [`Reference`],
    /// or [`api::Expression`] — anything convertible into [`Value`]). Setting a field to a
    /// Reference/Expression simply records it; this handle never attempts to resolve it.
    pub fn set(&self, path: &str, value: impl Into<Value>) -> Result<()> {
        let field_path: FieldPath = path.parse().map_err(Error::Api)?;
        self.manifest.borrow_mut().set(&field_path, value.into());
        Ok(())
    }
}

/// The manifest under construction for one [`ResourceHandle`].
#[derive(Clone, Debug, Default)]
pub(crate) struct ManifestBuilder {
    root: IndexMap<String, Value>,
}

impl ManifestBuilder {
    /// Sets a dotted path to a value, creating intermediate objects/array slots as needed.
    ///
    /// Dictionary keys are never walked by the dependency resolver, so only `Field` segments may
    /// appear past the first `Index` segment into an already-present array; setting through a
    /// not-yet-present array index extends the array with `Value::Null` padding.
    pub(crate) fn set(&mut self, path: &FieldPath, value: Value) {
        let segments = path.segments();
        if segments.is_empty() {
            return;
        }
        set_recursive(&mut self.root, segments, value);
    }

    pub(crate) fn into_manifest(self) -> Value {
        Value::Object(self.root)
    }
}

fn set_recursive(map: &mut IndexMap<String, Value>, segments: &[PathSegment], value: Value) {
    let PathSegment::Field(name) = &segments[0] else {
        // A manifest builder only ever starts from a named field; stray leading indices are
        // ignored rather than panicking, since build-time field paths are caller-controlled.
        return;
    };
    if segments.len() == 1 {
        map.insert(name.clone(), value);
        return;
    }
    let rest = &segments[1..];
    let entry = map
        .entry(name.clone())
        .or_insert_with(|| match &rest[0] {
            PathSegment::Index(_) => Value::Array(Vec::new()),
            PathSegment::Field(_) => Value::Object(IndexMap::new()),
        });
    set_in_value(entry, rest, value);
}

fn set_in_value(current: &mut Value, segments: &[PathSegment], value: Value) {
    match &segments[0] {
        PathSegment::Field(name) => {
            if !matches!(current, Value::Object(_)) {
                *current = Value::Object(IndexMap::new());
            }
            let Value::Object(map) = current else {
                unreachable!()
            };
            if segments.len() == 1 {
                map.insert(name.clone(), value);
            } else {
                let rest = &segments[1..];
                let entry = map.entry(name.clone()).or_insert_with(|| match &rest[0] {
                    PathSegment::Index(_) => Value::Array(Vec::new()),
                    PathSegment::Field(_) => Value::Object(IndexMap::new()),
                });
                set_in_value(entry, rest, value);
            }
        }
        PathSegment::Index(idx) => {
            if !matches!(current, Value::Array(_)) {
                *current = Value::Array(Vec::new());
            }
            let Value::Array(arr) = current else {
                unreachable!()
            };
            while arr.len() <= *idx {
                arr.push(Value::Null);
            }
            if segments.len() == 1 {
                arr[*idx] = value;
            } else {
                set_in_value(&mut arr[*idx], &segments[1..], value);
            }
        }
    }
}

/// Produces a complete [`ResourceEntry`] from a handle's accumulated manifest.
pub(crate) fn finish(handle: &ResourceHandle) -> ResourceEntry {
    ResourceEntry {
        id: handle.id.clone(),
        kind: handle.kind.clone(),
        api_version: handle.api_version.clone(),
        manifest: handle.manifest.borrow().clone().into_manifest(),
        readiness: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(id: &str) -> ResourceHandle {
        ResourceHandle::new(
            ResourceId::from(id),
            "Deployment",
            "apps/v1",
            Rc::new(RefCell::new(ManifestBuilder::default())),
        )
    }

    #[test]
    fn field_mints_reference_against_own_id() {
        let h = handle("db");
        let r = h.field("status.podIP", TypeTag::String).unwrap();
        assert_eq!(r.resource_id, ResourceId::from("db"));
        assert_eq!(r.field_path.to_string(), "status.podIP");
    }

    #[test]
    fn repeated_field_reads_are_equal() {
        let h = handle("db");
        let a = h.field("status.podIP", TypeTag::String).unwrap();
        let b = h.field("status.podIP", TypeTag::Unknown).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn set_builds_nested_objects() {
        let h = handle("app");
        h.set("spec.replicas", Value::Int(2)).unwrap();
        h.set(
            "spec.template.spec.containers[0].image",
            Value::String("nginx".into()),
        )
        .unwrap();
        let v = finish(&h).manifest;
        let Value::Object(root) = &v else {
            panic!("expected object")
        };
        let Value::Object(spec) = &root["spec"] else {
            panic!()
        };
        assert_eq!(spec["replicas"], Value::Int(2));
        let Value::Object(tmpl) = &spec["template"] else {
            panic!()
        };
        let Value::Object(tspec) = &tmpl["spec"] else {
            panic!()
        };
        let Value::Array(containers) = &tspec["containers"] else {
            panic!()
        };
        assert_eq!(
            containers[0],
            Value::Object(IndexMap::from([(
                "image".to_string(),
                Value::String("nginx".into()),
            )]))
        );
    }
}
