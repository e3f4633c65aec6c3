use std::fmt;
use std::str::FromStr;

use prep_types::{Content, Preparation, Step};
use serde::{Deserialize, Serialize};

/// The type of a stored object. Part of every storage key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    Content,
    Step,
    Preparation,
}

impl ObjectKind {
    pub const ALL: [ObjectKind; 3] = [Self::Content, Self::Step, Self::Preparation];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Content => "content",
            Self::Step => "step",
            Self::Preparation => "preparation",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown object kind: {s}"))
    }
}

/// Any object the repository can hold.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "object", rename_all = "lowercase")]
pub enum StoredObject {
    Content(Content),
    Step(Step),
    Preparation(Preparation),
}

impl StoredObject {
    pub fn kind(&self) -> ObjectKind {
        match self {
            Self::Content(_) => ObjectKind::Content,
            Self::Step(_) => ObjectKind::Step,
            Self::Preparation(_) => ObjectKind::Preparation,
        }
    }

    /// Content and steps are keyed by hash, preparations by their own id.
    pub fn id(&self) -> String {
        match self {
            Self::Content(c) => c.id().to_hex(),
            Self::Step(s) => s.id().to_hex(),
            Self::Preparation(p) => p.id.clone(),
        }
    }

    /// Storage key of the form `<type>/<id>`.
    pub fn storage_key(&self) -> String {
        storage_key(self.kind(), &self.id())
    }

    pub fn is_content_addressed(&self) -> bool {
        !matches!(self, Self::Preparation(_))
    }
}

pub fn storage_key(kind: ObjectKind, id: &str) -> String {
    format!("{kind}/{id}")
}

impl From<Content> for StoredObject {
    fn from(c: Content) -> Self {
        Self::Content(c)
    }
}

impl From<Step> for StoredObject {
    fn from(s: Step) -> Self {
        Self::Step(s)
    }
}

impl From<Preparation> for StoredObject {
    fn from(p: Preparation) -> Self {
        Self::Preparation(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prep_types::{root_content, root_step};

    #[test]
    fn storage_key_encodes_kind_and_hash() {
        let step = StoredObject::from(*root_step());
        assert_eq!(step.storage_key(), format!("step/{}", root_step().id()));
        let content = StoredObject::from(root_content().clone());
        assert!(content.storage_key().starts_with("content/"));
    }

    #[test]
    fn kind_parses_from_its_name() {
        for kind in ObjectKind::ALL {
            assert_eq!(kind.as_str().parse::<ObjectKind>().unwrap(), kind);
        }
        assert!("blob".parse::<ObjectKind>().is_err());
    }
}
