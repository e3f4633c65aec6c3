//! In-memory repository for tests and embedding.

use std::collections::BTreeMap;
use std::sync::RwLock;

use prep_types::{ObjectId, Preparation};

use crate::error::{StoreError, StoreResult};
use crate::object::{storage_key, ObjectKind, StoredObject};
use crate::traits::PreparationRepository;

/// A [`PreparationRepository`] backed by a sorted map.
///
/// Keys are storage keys (`<type>/<id>`), so listing one type is a range
/// scan over a shared prefix.
pub struct InMemoryRepository {
    objects: RwLock<BTreeMap<String, StoredObject>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
        }
    }

    /// Number of stored objects of every type.
    pub fn len(&self) -> usize {
        self.objects.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned<E: std::fmt::Display>(e: E) -> StoreError {
    StoreError::LockPoisoned(e.to_string())
}

impl PreparationRepository for InMemoryRepository {
    fn add(&self, object: StoredObject) -> StoreResult<String> {
        let id = object.id();
        let key = object.storage_key();
        let mut map = self.objects.write().map_err(poisoned)?;
        if object.is_content_addressed() {
            map.entry(key).or_insert(object);
        } else {
            map.insert(key, object);
        }
        Ok(id)
    }

    fn get(&self, id: &str, kind: ObjectKind) -> StoreResult<Option<StoredObject>> {
        let map = self.objects.read().map_err(poisoned)?;
        Ok(map.get(&storage_key(kind, id)).cloned())
    }

    fn get_by_dataset(&self, dataset_id: &str) -> StoreResult<Vec<Preparation>> {
        Ok(self
            .list_all(ObjectKind::Preparation)?
            .into_iter()
            .filter_map(|o| match o {
                StoredObject::Preparation(p) if p.dataset_id == dataset_id => Some(p),
                _ => None,
            })
            .collect())
    }

    fn list_all(&self, kind: ObjectKind) -> StoreResult<Vec<StoredObject>> {
        let prefix = format!("{kind}/");
        let map = self.objects.read().map_err(poisoned)?;
        Ok(map
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(_, v)| v.clone())
            .collect())
    }

    fn remove(&self, object: &StoredObject) -> StoreResult<bool> {
        let mut map = self.objects.write().map_err(poisoned)?;
        Ok(map.remove(&object.storage_key()).is_some())
    }

    fn clear(&self) -> StoreResult<()> {
        self.objects.write().map_err(poisoned)?.clear();
        Ok(())
    }

    fn compare_and_set_head(
        &self,
        preparation_id: &str,
        expected: ObjectId,
        head: ObjectId,
    ) -> StoreResult<bool> {
        let key = storage_key(ObjectKind::Preparation, preparation_id);
        let mut map = self.objects.write().map_err(poisoned)?;
        match map.get_mut(&key) {
            Some(StoredObject::Preparation(p)) if p.head == expected => {
                *p = p.with_head(head);
                Ok(true)
            }
            Some(StoredObject::Preparation(_)) => Ok(false),
            _ => Err(StoreError::PreparationNotFound(preparation_id.to_string())),
        }
    }
}

impl std::fmt::Debug for InMemoryRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryRepository")
            .field("object_count", &self.len())
            .finish()
    }
}
