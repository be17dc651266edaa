//! Shared identifier and record types for collfs.
//!
//! This crate is the leaf of the workspace: it knows what a collection,
//! project and user look like on the metadata boundary and how their
//! identifiers are spelled, and nothing about storage or filesystems.
//!
//! # Identifier classes
//!
//! |---------------------|--------------------------------------|
//! | Class               | Shape                                |
//! |---------------------|--------------------------------------|
//! | Collection UUID     | `zzzzz-4zz18-0123456789abcde`        |
//! | Project UUID        | `zzzzz-j7d0g-0123456789abcde`        |
//! | User UUID           | `zzzzz-tpzed-0123456789abcde`        |
//! | Portable data hash  | `<64 hex>+<manifest length>`         |
//! |---------------------|--------------------------------------|

pub mod ids;
pub mod records;

pub use ids::{Identifier, ObjectKind, is_portable_data_hash, new_uuid};
pub use records::{CollectionRecord, ProjectItem, ProjectRecord, UserRecord};
