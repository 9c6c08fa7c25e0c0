//! Shared helpers for talking to the cluster through `kube::api::DynamicObject`: GVK parsing,
//! plural guessing when discovery is skipped, and the create-if-absent/patch-if-present apply used
//! by the deployment engine (C6).
//!
//! Grounded on the teacher's `controller::util::check_owned_resource`, which is likewise a small
//! generic wrapper around "does this object exist; if not create it, if so patch it" — generalized
//! here from a single typed `(Build, Resource)` pair to an arbitrary `DynamicObject` manifest,
//! since the engine never deserializes into a concrete k8s-openapi type.

use kube::api::{Api, ApiResource, DeleteParams, DynamicObject, GroupVersionKind, Patch, PatchParams, PostParams};
use kube::Client;
use tracing::{instrument, trace};

use crate::{Error, Result};

/// Parses an `(apiVersion, kind)` pair into a [`GroupVersionKind`].
pub fn parse_gvk(api_version: &str, kind: &str) -> Result<GroupVersionKind> {
    GroupVersionKind::try_from((api_version.to_string(), kind.to_string())).map_err(|e| Error::Validation {
        field_path: "apiVersion/kind".to_string(),
        reason: format!("malformed apiVersion/kind: {e}"),
    })
}

/// A rough pluralization (append `s`, or `es` after a sibilant, or `ies` after a consonant + `y`),
/// used when a caller hasn't supplied a discovered plural and skips server discovery.
pub fn guess_plural(kind: &str) -> String {
    let lower = kind.to_ascii_lowercase();
    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") || lower.ends_with('x') {
        format!("{lower}es")
    } else if let Some(stem) = lower.strip_suffix('y') {
        format!("{stem}ies")
    } else {
        format!("{lower}s")
    }
}

/// Builds a namespaced `Api<DynamicObject>` for `(apiVersion, kind)`, guessing the plural since
/// the engine has no access to server-side discovery results at this layer (callers that have
/// already run `kube::discovery::oneshot::pinned_kind` should build the `Api` themselves with the
/// discovered `ApiResource` instead of calling this).
pub fn dynamic_api(client: Client, namespace: &str, api_version: &str, kind: &str) -> Result<Api<DynamicObject>> {
    let gvk = parse_gvk(api_version, kind)?;
    let ar = ApiResource::from_gvk_with_plural(&gvk, &guess_plural(kind));
    Ok(Api::namespaced_with(client, namespace, &ar))
}

/// Builds a cluster-scoped `Api<DynamicObject>` for `(apiVersion, kind)`.
pub fn dynamic_api_cluster(client: Client, api_version: &str, kind: &str) -> Result<Api<DynamicObject>> {
    let gvk = parse_gvk(api_version, kind)?;
    let ar = ApiResource::from_gvk_with_plural(&gvk, &guess_plural(kind));
    Ok(Api::all_with(client, &ar))
}

/// Applies a manifest: creates it if absent, server-side-applies it otherwise. Returns the live
/// object as last observed by this call.
///
/// Server-side apply (`Patch::Apply`) is used in preference to a plain create-then-replace dance
/// so repeated applies of the same manifest converge without the caller tracking resource versions
/// itself — the same reason the teacher's reconcilers patch rather than replace.
#[instrument(skip(api, manifest), fields(name = %name))]
pub async fn apply(api: &Api<DynamicObject>, name: &str, field_manager: &str, manifest: serde_json::Value) -> Result<DynamicObject> {
    match api.get_opt(name).await.map_err(|e| Error::from_kube("resource", name, e))? {
        Some(_) => {
            trace!("patching existing object");
            let patch = Patch::Apply(&manifest);
            let params = PatchParams::apply(field_manager).force();
            api.patch(name, &params, &patch).await.map_err(|e| Error::from_kube("resource", name, e))
        }
        None => {
            trace!("creating new object");
            let obj: DynamicObject = serde_json::from_value(manifest).map_err(Error::Json)?;
            api.create(&PostParams::default(), &obj).await.map_err(|e| Error::from_kube("resource", name, e))
        }
    }
}

/// Deletes a resource, treating a 404 as success (idempotent delete per §7).
#[instrument(skip(api), fields(name = %name))]
pub async fn delete_idempotent(api: &Api<DynamicObject>, name: &str) -> Result<()> {
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
        Err(e) => Err(Error::from_kube("resource", name, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guesses_regular_plural() {
        assert_eq!(guess_plural("Deployment"), "deployments");
    }

    #[test]
    fn guesses_sibilant_plural() {
        assert_eq!(guess_plural("Ingress"), "ingresses");
        assert_eq!(guess_plural("Namespace"), "namespaces");
    }

    #[test]
    fn guesses_y_plural() {
        assert_eq!(guess_plural("Proxy"), "proxies");
    }
}
