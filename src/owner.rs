//! Owner reference lookups
//!
//! Maps a managed object back to the Bookstore that controls it, and builds
//! the controller reference stamped onto objects the controller creates.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::ResourceExt;

use crate::crd::Bookstore;
use crate::key::ReconcileKey;
use crate::registry::ResourceRegistry;
use crate::Error;

/// The owner reference marked `controller: true`, if any
pub fn controller_of(meta: &ObjectMeta) -> Option<&OwnerReference> {
    meta.owner_references
        .as_deref()?
        .iter()
        .find(|r| r.controller == Some(true))
}

/// Reconcile key of the primary controlling this object
///
/// `None` when there is no controller reference or it points at a kind other
/// than the registry's primary. Owners live in the object's own namespace.
pub fn owner_key(meta: &ObjectMeta, registry: &ResourceRegistry) -> Option<ReconcileKey> {
    let owner = controller_of(meta)?;
    if !registry.is_primary_kind(&owner.kind) || owner.name.is_empty() {
        return None;
    }
    Some(ReconcileKey::new(
        meta.namespace.clone().unwrap_or_default(),
        owner.name.clone(),
    ))
}

/// True if the controller reference of `meta` carries `uid`
pub fn is_controlled_by(meta: &ObjectMeta, uid: &str) -> bool {
    controller_of(meta).is_some_and(|r| r.uid == uid)
}

/// Controller reference pointing at `bookstore`
///
/// Fails when the Bookstore has no uid yet; the API server always assigns one,
/// so this only happens for objects that never went through it.
pub fn controller_reference(
    bookstore: &Bookstore,
    registry: &ResourceRegistry,
) -> Result<OwnerReference, Error> {
    let uid = bookstore
        .uid()
        .ok_or_else(|| Error::internal(format!("Bookstore {} has no uid", bookstore.name_any())))?;
    Ok(OwnerReference {
        api_version: registry.primary_api_version().to_string(),
        kind: registry.primary_kind().to_string(),
        name: bookstore.name_any(),
        uid,
        controller: Some(true),
        block_owner_deletion: Some(true),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::BookstoreSpec;

    fn owned_by(kind: &str, name: &str, uid: &str, controller: Option<bool>) -> ObjectMeta {
        ObjectMeta {
            name: Some("d1".to_string()),
            namespace: Some("shop".to_string()),
            owner_references: Some(vec![OwnerReference {
                api_version: "bookstore.dev/v1alpha1".to_string(),
                kind: kind.to_string(),
                name: name.to_string(),
                uid: uid.to_string(),
                controller,
                block_owner_deletion: None,
            }]),
            ..Default::default()
        }
    }

    #[test]
    fn test_owner_key_resolves_in_object_namespace() {
        let registry = ResourceRegistry::bookstore();
        let meta = owned_by("Bookstore", "store1", "u1", Some(true));
        assert_eq!(
            owner_key(&meta, &registry),
            Some(ReconcileKey::new("shop", "store1"))
        );
    }

    #[test]
    fn test_non_controller_reference_is_ignored() {
        let registry = ResourceRegistry::bookstore();
        let meta = owned_by("Bookstore", "store1", "u1", None);
        assert_eq!(owner_key(&meta, &registry), None);
        assert!(!is_controlled_by(&meta, "u1"));
    }

    #[test]
    fn test_foreign_kind_is_ignored() {
        let registry = ResourceRegistry::bookstore();
        let meta = owned_by("ReplicaSet", "rs1", "u1", Some(true));
        assert_eq!(owner_key(&meta, &registry), None);
    }

    #[test]
    fn test_no_owner_references() {
        let registry = ResourceRegistry::bookstore();
        assert_eq!(owner_key(&ObjectMeta::default(), &registry), None);
    }

    #[test]
    fn test_is_controlled_by_compares_uid() {
        let meta = owned_by("Bookstore", "store1", "u1", Some(true));
        assert!(is_controlled_by(&meta, "u1"));
        assert!(!is_controlled_by(&meta, "u2"));
    }

    #[test]
    fn test_controller_reference() {
        let registry = ResourceRegistry::bookstore();
        let mut store = Bookstore::new("store1", BookstoreSpec::default());
        assert!(controller_reference(&store, &registry).is_err());

        store.metadata.uid = Some("u1".to_string());
        let r = controller_reference(&store, &registry).unwrap();
        assert_eq!(r.kind, "Bookstore");
        assert_eq!(r.api_version, "bookstore.dev/v1alpha1");
        assert_eq!(r.uid, "u1");
        assert_eq!(r.controller, Some(true));
    }
}
