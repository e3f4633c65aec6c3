//! Content-addressed storage for preparation histories.
//!
//! Action lists ([`Content`](prep_types::Content)) and chain links
//! ([`Step`](prep_types::Step)) are immutable objects keyed by their hash.
//! A [`Preparation`](prep_types::Preparation) is the one mutable record: it
//! names the head step of its chain.
//!
//! # Storage Backends
//!
//! All backends implement [`PreparationRepository`]:
//!
//! - [`InMemoryRepository`] -- map-based store for tests and embedding
//! - [`FileSystemRepository`] -- one JSON file per object under
//!   `<root>/<type>/<id>.json`
//!
//! # Design Rules
//!
//! 1. Content and steps are never modified after they are added.
//! 2. Write-then-publish: content, then step, then the head swap.
//! 3. Head swaps are compare-and-set; a lost race retries on the new head.
//! 4. Unreferenced objects are only removed by a reachability sweep.

pub mod chain;
pub mod error;
pub mod fs;
pub mod memory;
pub mod object;
pub mod traits;

pub use chain::{GcReport, VersionChain};
pub use error::{StoreError, StoreResult};
pub use fs::FileSystemRepository;
pub use memory::InMemoryRepository;
pub use object::{ObjectKind, StoredObject};
pub use traits::PreparationRepository;
