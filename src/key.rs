//! Reconcile keys
//!
//! A [`ReconcileKey`] is the `namespace/name` of one Bookstore. It is the
//! unit of scheduling, deduplication and serialization in the work queue.

use std::fmt;
use std::str::FromStr;

use kube::ResourceExt;

use crate::Error;

/// `namespace/name` identifier of a primary resource
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReconcileKey {
    namespace: String,
    name: String,
}

impl ReconcileKey {
    /// Build a key from its parts
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of an object from its metadata; `None` when the object has no name
    pub fn for_object<K: ResourceExt>(obj: &K) -> Option<Self> {
        let name = obj.meta().name.as_deref().filter(|n| !n.is_empty())?;
        Some(Self::new(obj.namespace().unwrap_or_default(), name))
    }

    /// Namespace part (empty for cluster-scoped objects)
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Name part
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for ReconcileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

impl FromStr for ReconcileKey {
    type Err = Error;

    /// Split `namespace/name`; a bare `name` has an empty namespace
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [name] if !name.is_empty() => Ok(Self::new("", *name)),
            [namespace, name] if !name.is_empty() => Ok(Self::new(*namespace, *name)),
            _ => Err(Error::InvalidKey(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{Bookstore, BookstoreSpec};

    #[test]
    fn test_display_and_parse_agree() {
        let key = ReconcileKey::new("shop", "store1");
        assert_eq!(key.to_string(), "shop/store1");
        assert_eq!("shop/store1".parse::<ReconcileKey>().unwrap(), key);
    }

    #[test]
    fn test_bare_name_has_empty_namespace() {
        let key: ReconcileKey = "store1".parse().unwrap();
        assert_eq!(key.namespace(), "");
        assert_eq!(key.name(), "store1");
        assert_eq!(key.to_string(), "store1");
    }

    #[test]
    fn test_malformed_keys_rejected() {
        for bad in ["a/b/c", "", "ns/", "/"] {
            assert!(bad.parse::<ReconcileKey>().is_err(), "{bad} should fail");
        }
    }

    #[test]
    fn test_key_for_object() {
        let mut store = Bookstore::new("store1", BookstoreSpec::default());
        store.metadata.namespace = Some("shop".to_string());
        assert_eq!(
            ReconcileKey::for_object(&store),
            Some(ReconcileKey::new("shop", "store1"))
        );

        store.metadata.name = None;
        assert_eq!(ReconcileKey::for_object(&store), None);
    }
}
