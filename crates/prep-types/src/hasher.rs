use crate::object::ObjectId;

/// Domain-separated BLAKE3 hasher for versioned objects.
///
/// The domain tag is fed to the hasher before any payload so a [`Content`]
/// and a [`Step`] with byte-identical payloads still get distinct ids.
///
/// [`Content`]: crate::Content
/// [`Step`]: crate::Step
pub struct ContentHasher {
    domain: &'static str,
}

impl ContentHasher {
    /// Hasher for action lists.
    pub const CONTENT: Self = Self {
        domain: "prep-content-v1",
    };
    /// Hasher for chain steps.
    pub const STEP: Self = Self {
        domain: "prep-step-v1",
    };

    pub const fn new(domain: &'static str) -> Self {
        Self { domain }
    }

    /// Hash raw bytes.
    pub fn hash(&self, data: &[u8]) -> ObjectId {
        self.hash_fields([data])
    }

    /// Hash a sequence of fields.
    ///
    /// Every field is length-prefixed, so `["ab", "c"]` and `["a", "bc"]`
    /// never collide. This is the canonical encoding used for object ids.
    pub fn hash_fields<'a, I>(&self, fields: I) -> ObjectId
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.domain.as_bytes());
        hasher.update(b":");
        for field in fields {
            hasher.update(&(field.len() as u64).to_le_bytes());
            hasher.update(field);
        }
        ObjectId::from_hash(*hasher.finalize().as_bytes())
    }

    pub fn domain(&self) -> &str {
        self.domain
    }
}
