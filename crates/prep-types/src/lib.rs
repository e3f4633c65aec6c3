//! Foundation types for the preparation engine.
//!
//! Every other `prep-*` crate depends on `prep-types`. It defines the values
//! that flow through a pipeline ([`Row`], [`Schema`], [`Signal`]) and the
//! immutable, content-addressed objects that make up a preparation's history
//! ([`Content`], [`Step`]) together with the one mutable pointer into that
//! history ([`Preparation`]).
//!
//! # Key Types
//!
//! - [`ObjectId`] -- BLAKE3 identifier of a content-addressed object
//! - [`ContentHasher`] -- domain-separated hasher producing `ObjectId`s
//! - [`Row`] / [`Schema`] -- one record and its column metadata
//! - [`Action`] -- a named transformation with ordered parameters
//! - [`Content`] / [`Step`] / [`Preparation`] -- the version chain model
//! - [`DiffFlag`] -- row, cell, and column level change markers

pub mod action;
pub mod diff;
pub mod error;
pub mod hasher;
pub mod object;
pub mod row;
pub mod schema;
pub mod signal;
pub mod version;

pub use action::{Action, Parameters};
pub use diff::{diff_values, CellChange, DiffFlag};
pub use error::{TypeError, TypeResult};
pub use hasher::ContentHasher;
pub use object::ObjectId;
pub use row::{Row, RowDiff};
pub use schema::{Column, Schema, SchemaRef};
pub use signal::Signal;
pub use version::{root_content, root_step, Content, Preparation, Step, StepRef, HEAD, ORIGIN};
