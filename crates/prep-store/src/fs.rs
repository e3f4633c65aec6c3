//! Filesystem repository: one JSON document per object.
//!
//! Layout under the root directory:
//!
//! ```text
//! content/<hash>.json
//! step/<hash>.json
//! preparation/<uuid>.json
//! ```
//!
//! Documents are written to a temporary file in the target directory and
//! renamed into place, so a reader sees either the old document or the new
//! one.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use prep_types::{ObjectId, Preparation};
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};
use crate::object::{ObjectKind, StoredObject};
use crate::traits::PreparationRepository;

pub struct FileSystemRepository {
    root: PathBuf,
    // Serializes read-compare-write of preparation heads.
    head_lock: Mutex<()>,
}

impl FileSystemRepository {
    /// Open (and create if needed) a repository rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        for kind in ObjectKind::ALL {
            fs::create_dir_all(root.join(kind.as_str()))?;
        }
        debug!(root = %root.display(), "opened filesystem repository");
        Ok(Self {
            root,
            head_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, kind: ObjectKind, id: &str) -> StoreResult<PathBuf> {
        if id.is_empty() || id.contains(['/', '\\', '.']) {
            return Err(StoreError::CorruptObject {
                kind,
                id: id.to_string(),
                reason: "id is not a valid file name".into(),
            });
        }
        Ok(self.root.join(kind.as_str()).join(format!("{id}.json")))
    }

    fn write_document(&self, path: &Path, object: &StoredObject) -> StoreResult<()> {
        let dir = path.parent().unwrap_or(&self.root);
        let data =
            serde_json::to_vec_pretty(object).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| StoreError::Io(e.error))?;
        Ok(())
    }

    fn read_document(&self, path: &Path, kind: ObjectKind, id: &str) -> StoreResult<Option<StoredObject>> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let object: StoredObject =
            serde_json::from_slice(&data).map_err(|e| StoreError::CorruptObject {
                kind,
                id: id.to_string(),
                reason: e.to_string(),
            })?;
        if object.kind() != kind || object.id() != id {
            return Err(StoreError::CorruptObject {
                kind,
                id: id.to_string(),
                reason: format!("document holds {}", object.storage_key()),
            });
        }
        Ok(Some(object))
    }

    fn ids(&self, kind: ObjectKind) -> StoreResult<Vec<String>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(self.root.join(kind.as_str()))? {
            let name = entry?.file_name();
            let name = name.to_string_lossy();
            if let Some(id) = name.strip_suffix(".json") {
                if !id.starts_with('.') {
                    ids.push(id.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

impl PreparationRepository for FileSystemRepository {
    fn add(&self, object: StoredObject) -> StoreResult<String> {
        let id = object.id();
        let path = self.path_for(object.kind(), &id)?;
        if object.is_content_addressed() && path.exists() {
            return Ok(id);
        }
        self.write_document(&path, &object)?;
        debug!(key = %object.storage_key(), "stored object");
        Ok(id)
    }

    fn get(&self, id: &str, kind: ObjectKind) -> StoreResult<Option<StoredObject>> {
        let path = self.path_for(kind, id)?;
        self.read_document(&path, kind, id)
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
        let mut objects = Vec::new();
        for id in self.ids(kind)? {
            match self.get(&id, kind) {
                Ok(Some(object)) => objects.push(object),
                Ok(None) => {}
                Err(e) => warn!(kind = %kind, id = %id, error = %e, "skipping unreadable object"),
            }
        }
        Ok(objects)
    }

    fn remove(&self, object: &StoredObject) -> StoreResult<bool> {
        let path = self.path_for(object.kind(), &object.id())?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn clear(&self) -> StoreResult<()> {
        for kind in ObjectKind::ALL {
            let dir = self.root.join(kind.as_str());
            match fs::remove_dir_all(&dir) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            fs::create_dir_all(&dir)?;
        }
        Ok(())
    }

    fn compare_and_set_head(
        &self,
        preparation_id: &str,
        expected: ObjectId,
        head: ObjectId,
    ) -> StoreResult<bool> {
        let _guard = self
            .head_lock
            .lock()
            .map_err(|e| StoreError::LockPoisoned(e.to_string()))?;
        let prep = self
            .preparation(preparation_id)?
            .ok_or_else(|| StoreError::PreparationNotFound(preparation_id.to_string()))?;
        if prep.head != expected {
            return Ok(false);
        }
        let path = self.path_for(ObjectKind::Preparation, preparation_id)?;
        self.write_document(&path, &StoredObject::Preparation(prep.with_head(head)))?;
        Ok(true)
    }
}

impl std::fmt::Debug for FileSystemRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSystemRepository")
            .field("root", &self.root)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prep_types::{root_step, Action, Content, Step};

    fn open() -> (tempfile::TempDir, FileSystemRepository) {
        let dir = tempfile::tempdir().unwrap();
        let repo = FileSystemRepository::open(dir.path().join("store")).unwrap();
        (dir, repo)
    }

    #[test]
    fn objects_are_named_by_type_and_hash() {
        let (_dir, repo) = open();
        let content = Content::new(vec![Action::new("trim").on_column("0000")]);
        let id = repo.add(content.clone().into()).unwrap();
        assert_eq!(id, content.id().to_hex());
        assert!(repo.root().join("content").join(format!("{id}.json")).exists());
        assert_eq!(repo.content(&content.id()).unwrap(), Some(content));
    }

    #[test]
    fn readding_content_is_a_noop() {
        let (_dir, repo) = open();
        let content = Content::new(vec![Action::new("trim")]);
        repo.add(content.clone().into()).unwrap();
        repo.add(content.into()).unwrap();
        assert_eq!(repo.list_all(ObjectKind::Content).unwrap().len(), 1);
    }

    #[test]
    fn tampered_document_is_reported_corrupt() {
        let (_dir, repo) = open();
        let step = *root_step();
        let id = repo.add(step.into()).unwrap();
        let other = Step::new(Some(step.id()), step.content);
        let forged = serde_json::to_vec(&StoredObject::Step(other)).unwrap();
        fs::write(repo.root().join("step").join(format!("{id}.json")), forged).unwrap();

        assert!(matches!(
            repo.get(&id, ObjectKind::Step),
            Err(StoreError::CorruptObject { .. })
        ));
    }

    #[test]
    fn preparations_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let prep = Preparation::new("ds-1", "p", "alice");
        {
            let repo = FileSystemRepository::open(dir.path()).unwrap();
            repo.add(prep.clone().into()).unwrap();
            let next = ObjectId::from_hash([9; 32]);
            assert!(repo.compare_and_set_head(&prep.id, prep.head, next).unwrap());
        }
        let repo = FileSystemRepository::open(dir.path()).unwrap();
        let loaded = repo.preparation(&prep.id).unwrap().unwrap();
        assert_eq!(loaded.head, ObjectId::from_hash([9; 32]));
        assert_eq!(repo.get_by_dataset("ds-1").unwrap().len(), 1);
    }

    #[test]
    fn rejects_path_like_ids() {
        let (_dir, repo) = open();
        assert!(repo.get("../escape", ObjectKind::Preparation).is_err());
    }

    #[test]
    fn clear_empties_every_kind() {
        let (_dir, repo) = open();
        repo.add((*root_step()).into()).unwrap();
        repo.add(Preparation::new("ds", "p", "a").into()).unwrap();
        repo.clear().unwrap();
        for kind in ObjectKind::ALL {
            assert!(repo.list_all(kind).unwrap().is_empty());
        }
    }
}
