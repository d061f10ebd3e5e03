use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::StoreError;
use crate::store::{Artifact, Store, StoreKey};

/// An ephemeral, in-process completion store.
///
/// Nothing survives the process; useful for tests and for pipelines whose
/// caching should only span a single session.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<StoreKey, Artifact>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().unwrap().is_empty()
    }

    /// Drops one persisted output, making its instance incomplete again.
    pub fn remove(&self, key: &StoreKey) -> bool {
        self.entries.write().unwrap().remove(key).is_some()
    }

    pub fn clear(&self) {
        self.entries.write().unwrap().clear();
    }
}

impl Store for MemoryStore {
    fn exists(&self, key: &StoreKey) -> Result<bool, StoreError> {
        Ok(self.entries.read().unwrap().contains_key(key))
    }

    fn load(&self, key: &StoreKey) -> Result<Artifact, StoreError> {
        self.entries
            .read()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    fn save(&self, key: &StoreKey, artifact: &Artifact) -> Result<(), StoreError> {
        self.entries
            .write()
            .unwrap()
            .insert(key.clone(), artifact.clone());
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::param::Params;
    use crate::task::TaskInstance;

    fn key(output: &str) -> StoreKey {
        let instance = TaskInstance::new("prices".into(), Params::default());
        StoreKey::new(&instance, output)
    }

    #[test]
    fn test_roundtrip_and_overwrite() {
        let store = MemoryStore::new();
        let key = key("frame");

        assert!(!store.exists(&key).unwrap());
        assert!(matches!(store.load(&key), Err(StoreError::NotFound(_))));

        store.save(&key, &Artifact::from_bytes(vec![1u8])).unwrap();
        assert!(store.exists(&key).unwrap());
        assert_eq!(store.load(&key).unwrap().bytes(), &[1]);

        store.save(&key, &Artifact::from_bytes(vec![2u8])).unwrap();
        assert_eq!(store.load(&key).unwrap().bytes(), &[2]);
    }

    #[test]
    fn test_remove() {
        let store = MemoryStore::new();
        let key = key("frame");

        store.save(&key, &Artifact::from_bytes(vec![1u8])).unwrap();
        assert!(store.remove(&key));
        assert!(!store.exists(&key).unwrap());
        assert!(!store.remove(&key));
    }
}
