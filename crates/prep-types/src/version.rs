//! The version chain model.
//!
//! A [`Content`] is an immutable action list, a [`Step`] links a content to
//! its parent step, and a [`Preparation`] points at its current head step.
//! Content and step ids are pure functions of their payload, so two chains
//! with the same history share every object.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::action::Action;
use crate::error::TypeError;
use crate::hasher::ContentHasher;
use crate::object::ObjectId;

/// Step name resolving to a preparation's current head.
pub const HEAD: &str = "head";
/// Step name resolving to the root step.
pub const ORIGIN: &str = "origin";

static ROOT_CONTENT: LazyLock<Content> = LazyLock::new(Content::empty);
static ROOT_STEP: LazyLock<Step> = LazyLock::new(|| Step::new(None, ROOT_CONTENT.id()));

/// The empty action list every chain starts from.
pub fn root_content() -> &'static Content {
    &ROOT_CONTENT
}

/// The parentless step at the bottom of every chain.
pub fn root_step() -> &'static Step {
    &ROOT_STEP
}

// ---------------------------------------------------------------------------
// Content
// ---------------------------------------------------------------------------

/// An ordered, immutable list of actions.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Content {
    pub actions: Vec<Action>,
}

impl Content {
    pub fn new(actions: Vec<Action>) -> Self {
        Self { actions }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// A new content with `actions` appended. `self` is left intact so any
    /// chain still referencing it keeps its history.
    pub fn append(&self, actions: impl IntoIterator<Item = Action>) -> Content {
        let mut next = self.actions.clone();
        next.extend(actions);
        Content { actions: next }
    }

    /// Content id: hash of the canonical action encoding.
    pub fn id(&self) -> ObjectId {
        let count = (self.actions.len() as u64).to_le_bytes();
        let mut fields: Vec<Vec<u8>> = vec![count.to_vec()];
        for action in &self.actions {
            fields.push(action.name.as_bytes().to_vec());
            fields.push((action.parameters.len() as u64).to_le_bytes().to_vec());
            for (key, value) in &action.parameters {
                fields.push(key.as_bytes().to_vec());
                fields.push(value.as_bytes().to_vec());
            }
        }
        ContentHasher::CONTENT.hash_fields(fields.iter().map(Vec::as_slice))
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// One link in a preparation's history.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Step {
    /// `None` only for the root step.
    pub parent: Option<ObjectId>,
    pub content: ObjectId,
}

impl Step {
    pub fn new(parent: Option<ObjectId>, content: ObjectId) -> Self {
        Self { parent, content }
    }

    /// Step id: hash of parent id and content id.
    pub fn id(&self) -> ObjectId {
        let parent: &[u8] = match &self.parent {
            Some(p) => p.as_bytes(),
            None => &[],
        };
        ContentHasher::STEP.hash_fields([parent, self.content.as_bytes().as_slice()])
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

// ---------------------------------------------------------------------------
// Preparation
// ---------------------------------------------------------------------------

/// A named chain of steps over one dataset. The head is the only mutable
/// field in the version model.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preparation {
    pub id: String,
    pub dataset_id: String,
    pub name: String,
    pub author: String,
    pub head: ObjectId,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

impl Preparation {
    /// A new preparation whose head is the root step.
    pub fn new(
        dataset_id: impl Into<String>,
        name: impl Into<String>,
        author: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            dataset_id: dataset_id.into(),
            name: name.into(),
            author: author.into(),
            head: root_step().id(),
            created_at: now,
            last_modified: now,
        }
    }

    /// A copy pointing at `head`.
    pub fn with_head(&self, head: ObjectId) -> Self {
        Self {
            head,
            last_modified: Utc::now(),
            ..self.clone()
        }
    }
}

// ---------------------------------------------------------------------------
// StepRef
// ---------------------------------------------------------------------------

/// A step as named by a caller: one of the two sentinels or a concrete id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StepRef {
    Head,
    Origin,
    Id(ObjectId),
}

impl FromStr for StepRef {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            HEAD => Ok(Self::Head),
            ORIGIN => Ok(Self::Origin),
            other => ObjectId::from_hex(other)
                .map(Self::Id)
                .map_err(|_| TypeError::InvalidStepRef(other.to_string())),
        }
    }
}

impl fmt::Display for StepRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Head => f.write_str(HEAD),
            Self::Origin => f.write_str(ORIGIN),
            Self::Id(id) => write!(f, "{id}"),
        }
    }
}

impl From<ObjectId> for StepRef {
    fn from(id: ObjectId) -> Self {
        Self::Id(id)
    }
}
