use prep_types::{Content, ObjectId, Preparation, Step};

use crate::error::{StoreError, StoreResult};
use crate::object::{ObjectKind, StoredObject};

/// Storage for preparations and their version objects.
///
/// All implementations must satisfy these invariants:
/// - `add` of a content or step is idempotent: the same payload always maps
///   to the same key and re-adding it is a no-op.
/// - `add` of a preparation replaces the stored record.
/// - Absent objects are `Ok(None)`, never an error.
/// - The store never interprets object contents beyond computing keys.
pub trait PreparationRepository: Send + Sync {
    /// Store an object and return its id.
    fn add(&self, object: StoredObject) -> StoreResult<String>;

    fn get(&self, id: &str, kind: ObjectKind) -> StoreResult<Option<StoredObject>>;

    /// Preparations built on `dataset_id`. A linear scan.
    fn get_by_dataset(&self, dataset_id: &str) -> StoreResult<Vec<Preparation>>;

    fn list_all(&self, kind: ObjectKind) -> StoreResult<Vec<StoredObject>>;

    /// Remove an object. Returns `true` if it existed.
    fn remove(&self, object: &StoredObject) -> StoreResult<bool>;

    fn clear(&self) -> StoreResult<()>;

    /// Point `preparation_id` at `head` if its current head is `expected`.
    ///
    /// Returns `false` when another writer moved the head first.
    fn compare_and_set_head(
        &self,
        preparation_id: &str,
        expected: ObjectId,
        head: ObjectId,
    ) -> StoreResult<bool>;

    fn exists(&self, id: &str, kind: ObjectKind) -> StoreResult<bool> {
        Ok(self.get(id, kind)?.is_some())
    }

    fn content(&self, id: &ObjectId) -> StoreResult<Option<Content>> {
        match self.get(&id.to_hex(), ObjectKind::Content)? {
            Some(StoredObject::Content(c)) => Ok(Some(c)),
            Some(other) => Err(mismatched(ObjectKind::Content, &other)),
            None => Ok(None),
        }
    }

    fn step(&self, id: &ObjectId) -> StoreResult<Option<Step>> {
        match self.get(&id.to_hex(), ObjectKind::Step)? {
            Some(StoredObject::Step(s)) => Ok(Some(s)),
            Some(other) => Err(mismatched(ObjectKind::Step, &other)),
            None => Ok(None),
        }
    }

    fn preparation(&self, id: &str) -> StoreResult<Option<Preparation>> {
        match self.get(id, ObjectKind::Preparation)? {
            Some(StoredObject::Preparation(p)) => Ok(Some(p)),
            Some(other) => Err(mismatched(ObjectKind::Preparation, &other)),
            None => Ok(None),
        }
    }
}

fn mismatched(expected: ObjectKind, found: &StoredObject) -> StoreError {
    StoreError::CorruptObject {
        kind: expected,
        id: found.id(),
        reason: format!("expected {expected}, got {}", found.kind()),
    }
}
