//! Cache keys.
//!
//! A key is a path through the hierarchy
//! `datasets/<ds>/preparations/<prep>/steps/<step>/<entry>`, where the entry
//! name combines the sample size, the output format and, for user-scoped
//! results, a digest of the user id. A key that stops early (no step, or no
//! preparation) names a whole subtree and is what prefix eviction takes.

use std::fmt;

use prep_types::{root_step, HEAD, ORIGIN};
use serde::{Deserialize, Serialize};

use crate::error::{CacheError, CacheResult};

/// Format name under which the writer stores final schemas.
pub const METADATA_FORMAT: &str = "metadata";

/// How many rows a result was computed over.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sample {
    #[default]
    Full,
    Rows(u64),
}

impl fmt::Display for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => f.write_str("full"),
            Self::Rows(n) => write!(f, "{n}"),
        }
    }
}

/// Who a cached result belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResultSource {
    /// The shared result at a preparation's head.
    Head,
    /// Any other step, or an unsaved preview.
    User,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    dataset_id: String,
    preparation_id: Option<String>,
    step_id: Option<String>,
    sample: Sample,
    format: Option<String>,
    user_id: Option<String>,
}

impl CacheKey {
    /// A key scoped to a whole dataset.
    pub fn dataset(dataset_id: impl Into<String>) -> Self {
        Self {
            dataset_id: dataset_id.into(),
            preparation_id: None,
            step_id: None,
            sample: Sample::Full,
            format: None,
            user_id: None,
        }
    }

    pub fn preparation(mut self, preparation_id: impl Into<String>) -> Self {
        self.preparation_id = Some(preparation_id.into());
        self
    }

    pub fn step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }

    pub fn sample(mut self, sample: Sample) -> Self {
        self.sample = sample;
        self
    }

    pub fn format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    /// Attach `user_id` unless the result is the shared head result.
    pub fn for_source(mut self, source: ResultSource, user_id: Option<&str>) -> Self {
        self.user_id = match source {
            ResultSource::Head => None,
            ResultSource::User => user_id.map(str::to_string),
        };
        self
    }

    /// The metadata key paired with this content key.
    pub fn metadata(&self) -> Self {
        Self {
            sample: Sample::Full,
            format: Some(METADATA_FORMAT.to_string()),
            ..self.clone()
        }
    }

    pub fn dataset_id(&self) -> &str {
        &self.dataset_id
    }

    pub fn preparation_id(&self) -> Option<&str> {
        self.preparation_id.as_deref()
    }

    pub fn step_id(&self) -> Option<&str> {
        self.step_id.as_deref()
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// Check a key before writing. Only concrete step ids may be cached.
    pub(crate) fn validate_for_put(&self) -> CacheResult<()> {
        match self.step_id.as_deref() {
            None => Err(CacheError::MissingStep {
                dataset: self.dataset_id.clone(),
            }),
            Some(step @ (HEAD | ORIGIN)) => Err(CacheError::ReservedStep(step.to_string())),
            Some(_) => Ok(()),
        }?;
        if self.format.is_none() {
            return Err(CacheError::MissingFormat {
                dataset: self.dataset_id.clone(),
            });
        }
        self.segments().map(|_| ())
    }

    /// Normalize a key for lookup: `origin` becomes the root step id.
    ///
    /// Returns `None` for `head`, which is never cached under that name.
    pub(crate) fn resolve_for_read(&self) -> CacheResult<Option<CacheKey>> {
        match self.step_id.as_deref() {
            None => Err(CacheError::MissingStep {
                dataset: self.dataset_id.clone(),
            }),
            Some(HEAD) => Ok(None),
            Some(ORIGIN) => Ok(Some(self.clone().step(root_step().id().to_hex()))),
            Some(_) => Ok(Some(self.clone())),
        }
    }

    /// Directory segments down to the most specific level this key names.
    pub(crate) fn segments(&self) -> CacheResult<Vec<String>> {
        let mut segments = vec!["datasets".to_string(), directory(&self.dataset_id)?];
        if let Some(prep) = &self.preparation_id {
            segments.push("preparations".into());
            segments.push(directory(prep)?);
            if let Some(step) = &self.step_id {
                segments.push("steps".into());
                segments.push(directory(step)?);
            }
        }
        Ok(segments)
    }

    /// File-name stem of the entry, when this key names a single entry.
    pub(crate) fn entry_name(&self) -> CacheResult<Option<String>> {
        let (Some(_), Some(_), Some(format)) = (&self.preparation_id, &self.step_id, &self.format)
        else {
            return Ok(None);
        };
        let mut name = format!("{}_{}", self.sample, entry_part(format)?);
        if let Some(user) = &self.user_id {
            let digest = blake3::hash(user.as_bytes());
            name.push('_');
            name.push_str(&hex::encode(&digest.as_bytes()[..8]));
        }
        Ok(Some(name))
    }

    /// Logical path of the entry or subtree, `/`-separated.
    pub(crate) fn path(&self) -> CacheResult<String> {
        let mut segments = self.segments()?;
        if let Some(entry) = self.entry_name()? {
            segments.push(entry);
        }
        Ok(segments.join("/"))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.path() {
            Ok(path) => f.write_str(&path),
            Err(_) => write!(f, "<invalid key for dataset {:?}>", self.dataset_id),
        }
    }
}

// Ids become directory names: any name the filesystem accepts as a single
// component is fine.
fn directory(segment: &str) -> CacheResult<String> {
    let reason = if segment.is_empty() {
        Some("empty")
    } else if segment.contains(['/', '\\']) {
        Some("contains a path separator")
    } else if segment == "." || segment == ".." {
        Some("is a relative path component")
    } else {
        None
    };
    invalid_unless(segment, reason)
}

// Parts of the entry file name, where `_` and `.` are delimiters.
fn entry_part(segment: &str) -> CacheResult<String> {
    let reason = if segment.contains(['.', '_']) {
        Some("contains a reserved delimiter")
    } else {
        None
    };
    directory(segment)?;
    invalid_unless(segment, reason)
}

fn invalid_unless(segment: &str, reason: Option<&'static str>) -> CacheResult<String> {
    match reason {
        Some(reason) => Err(CacheError::InvalidSegment {
            segment: segment.to_string(),
            reason,
        }),
        None => Ok(segment.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> CacheKey {
        CacheKey::dataset("ds")
            .preparation("prep")
            .step("abc123")
            .sample(Sample::Rows(100))
            .format("json")
    }

    #[test]
    fn full_key_path() {
        assert_eq!(
            key().path().unwrap(),
            "datasets/ds/preparations/prep/steps/abc123/100_json"
        );
    }

    #[test]
    fn partial_key_names_a_subtree() {
        let scope = CacheKey::dataset("ds").preparation("prep");
        assert_eq!(scope.path().unwrap(), "datasets/ds/preparations/prep");
        assert_eq!(scope.entry_name().unwrap(), None);
    }

    #[test]
    fn head_results_exclude_the_user() {
        let shared = key().for_source(ResultSource::Head, Some("alice"));
        assert_eq!(shared.user_id(), None);
        assert_eq!(shared, key());

        let alice = key().for_source(ResultSource::User, Some("alice"));
        let bob = key().for_source(ResultSource::User, Some("bob"));
        assert_ne!(alice.path().unwrap(), bob.path().unwrap());
        assert!(!alice.path().unwrap().contains("alice"));
    }

    #[test]
    fn put_rejects_sentinels_and_missing_step() {
        for sentinel in [HEAD, ORIGIN] {
            assert!(matches!(
                key().step(sentinel).validate_for_put(),
                Err(CacheError::ReservedStep(_))
            ));
        }
        let no_step = CacheKey::dataset("ds").preparation("p").format("json");
        assert!(matches!(
            no_step.validate_for_put(),
            Err(CacheError::MissingStep { .. })
        ));
    }

    #[test]
    fn read_maps_origin_to_root_and_skips_head() {
        let origin = key().step(ORIGIN).resolve_for_read().unwrap().unwrap();
        assert_eq!(origin.step_id(), Some(root_step().id().to_hex().as_str()));
        assert_eq!(key().step(HEAD).resolve_for_read().unwrap(), None);
    }

    #[test]
    fn rejects_separators_and_entry_delimiters() {
        assert!(CacheKey::dataset("a/b").path().is_err());
        assert!(CacheKey::dataset("..").preparation("p").path().is_err());
        assert!(key().format("csv.gz").path().is_err());
        assert!(key().format("csv_gz").path().is_err());
    }

    #[test]
    fn ids_may_contain_entry_delimiters() {
        let key = CacheKey::dataset("my_data.v2")
            .preparation("prep_1")
            .step("abc123")
            .format("json");
        assert_eq!(
            key.path().unwrap(),
            "datasets/my_data.v2/preparations/prep_1/steps/abc123/full_json"
        );
        assert!(key.validate_for_put().is_ok());
    }

    #[test]
    fn metadata_key_is_a_sibling_entry() {
        let meta = key().metadata();
        assert_eq!(
            meta.path().unwrap(),
            "datasets/ds/preparations/prep/steps/abc123/full_metadata"
        );
    }
}
