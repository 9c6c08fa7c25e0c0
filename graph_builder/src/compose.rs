//! The composition context (component C10): an explicit, owned handle passed to a user builder
//! closure, replacing the source's fiber/thread-local implicit context (see the Design Notes on
//! explicit handles). Because the handle is owned by the call rather than installed globally,
//! concurrent builder invocations never interfere — there is no shared state to isolate.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use api::{ResourceEntry, ResourceGraph, ResourceId, Schema, StatusClosure};
use indexmap::IndexMap;

use crate::dag::deterministic_id;
use crate::error::{Error, Result};
use crate::handle::{self, ManifestBuilder, ResourceHandle};

/// A deferred, post-apply action registered through [`Composer::defer`].
///
/// The callback signature is intentionally minimal: the specification leaves the exact argument
/// shape of "deferred deployment steps (post-apply side effects)" unspecified beyond their
/// auto-registration and id-collision semantics, so `run` takes no arguments. The deployment
/// engine (C6) is responsible for sequencing these after every resource in the graph reaches
/// `Deployed`.
#[derive(Clone)]
pub struct DeferredStep {
    /// The step's own id, registered into the same namespace as resource ids.
    pub id: ResourceId,
    /// The action to run.
    pub run: Arc<dyn Fn() + Send + Sync>,
}

impl std::fmt::Debug for DeferredStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredStep").field("id", &self.id).finish()
    }
}

/// The explicit builder handle passed to a user-supplied builder closure.
///
/// Every [`Composer::resource`] call registers into an insertion-ordered map (so that
/// serialization later preserves declaration order); registering an explicit id that collides
/// with an existing resource or deferred step is a [`Error::ContextRegistration`] error.
pub struct Composer {
    handles: IndexMap<ResourceId, (ResourceHandle, Rc<RefCell<ManifestBuilder>>)>,
    deferred: Vec<DeferredStep>,
    kind_counters: HashMap<String, u32>,
}

impl Composer {
    /// Creates an empty composition context.
    pub fn new() -> Self {
        Composer {
            handles: IndexMap::new(),
            deferred: Vec::new(),
            kind_counters: HashMap::new(),
        }
    }

    /// Registers a new resource with a deterministically-derived id (kind + PascalCased name).
    pub fn resource(&mut self, kind: &str, api_version: &str, name: &str) -> Result<ResourceHandle> {
        let id = deterministic_id(kind, name, None);
        self.register(id, kind, api_version)
    }

    /// Registers a new resource with a deterministically-derived id scoped by namespace.
    pub fn resource_namespaced(
        &mut self,
        kind: &str,
        api_version: &str,
        name: &str,
        namespace: &str,
    ) -> Result<ResourceHandle> {
        let id = deterministic_id(kind, name, Some(namespace));
        self.register(id, kind, api_version)
    }

    /// Registers a new resource under an explicit, user-supplied id.
    pub fn resource_with_id(&mut self, id: impl Into<ResourceId>, kind: &str, api_version: &str) -> Result<ResourceHandle> {
        self.register(id.into(), kind, api_version)
    }

    /// Registers a resource with an auto-generated per-kind counter id (`kind` + ordinal), for
    /// callers that have no natural "name" to derive an id from.
    pub fn resource_auto(&mut self, kind: &str, api_version: &str) -> Result<ResourceHandle> {
        let counter = self.kind_counters.entry(kind.to_string()).or_insert(0);
        let id = ResourceId::from(format!("{}{}", crate::dag::lower_first(kind), counter));
        *counter = counter.saturating_add(1);
        self.register(id, kind, api_version)
    }

    fn register(&mut self, id: ResourceId, kind: &str, api_version: &str) -> Result<ResourceHandle> {
        if self.handles.contains_key(&id) || self.deferred.iter().any(|d| d.id == id) {
            return Err(Error::ContextRegistration { id });
        }
        let manifest = Rc::new(RefCell::new(ManifestBuilder::default()));
        let h = ResourceHandle::new(id.clone(), kind, api_version, manifest.clone());
        self.handles.insert(id, (h.clone(), manifest));
        Ok(h)
    }

    /// Registers a deferred post-apply step under an explicit id, in the same id-space as
    /// resources (a collision with a resource id is also a [`Error::ContextRegistration`]).
    pub fn defer(&mut self, id: impl Into<ResourceId>, run: Arc<dyn Fn() + Send + Sync>) -> Result<()> {
        let id = id.into();
        if self.handles.contains_key(&id) || self.deferred.iter().any(|d| d.id == id) {
            return Err(Error::ContextRegistration { id });
        }
        self.deferred.push(DeferredStep { id, run });
        Ok(())
    }

    /// Looks up a previously-registered handle by id, for status builders that need to read back
    /// a resource constructed earlier in the same builder invocation.
    pub fn get(&self, id: &ResourceId) -> Option<&ResourceHandle> {
        self.handles.get(id).map(|(h, _)| h)
    }

    /// The deferred steps registered so far, in registration order.
    pub fn deferred_steps(&self) -> &[DeferredStep] {
        &self.deferred
    }

    fn into_entries(self) -> IndexMap<ResourceId, ResourceEntry> {
        self.handles
            .into_iter()
            .map(|(id, (h, _))| (id, handle::finish(&h)))
            .collect()
    }
}

impl Default for Composer {
    fn default() -> Self {
        Composer::new()
    }
}

/// Runs a user builder closure to completion, then assembles a complete [`ResourceGraph`] from
/// the resources it registered plus the caller-supplied schema and status closure.
pub fn build_graph<F>(schema: Schema, status: StatusClosure, f: F) -> Result<(ResourceGraph, Vec<DeferredStep>)>
where
    F: FnOnce(&mut Composer) -> Result<()>,
{
    let mut composer = Composer::new();
    f(&mut composer)?;
    let deferred = composer.deferred.clone();
    let resources = composer.into_entries();
    Ok((ResourceGraph { resources, schema, status }, deferred))
}

#[cfg(test)]
mod tests {
    use super::*;
    use api::{TypeTag, Value};

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut c = Composer::new();
        c.resource_with_id("dup", "Widget", "v1").unwrap();
        let err = c.resource_with_id("dup", "Widget", "v1").unwrap_err();
        assert!(matches!(err, Error::ContextRegistration { .. }));
    }

    #[test]
    fn builder_closure_registers_resources_in_order() {
        let schema = Schema {
            api_version: "example.com/v1alpha1".into(),
            kind: "Widget".into(),
            spec: Value::Null,
            status: Value::Null,
        };
        let (graph, deferred) = build_graph(schema, Arc::new(|_s, _r| Value::Null), |c| {
            let db = c.resource("Deployment", "apps/v1", "postgres")?;
            db.set("metadata.name", "postgres")?;
            let app = c.resource("Deployment", "apps/v1", "app")?;
            app.set("spec.env", app.field("status.podIP", TypeTag::String)?)?;
            Ok(())
        })
        .unwrap();
        let ids: Vec<_> = graph.resources.keys().cloned().collect();
        assert_eq!(ids, vec![ResourceId::from("deploymentPostgres"), ResourceId::from("deploymentApp")]);
        assert!(deferred.is_empty());
    }
}
