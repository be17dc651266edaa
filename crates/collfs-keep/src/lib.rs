//! Backing store boundary for collfs.
//!
//! Blocks are immutable and addressed by a content-derived [`Locator`],
//! optionally signed with an expiry. Collection metadata (manifest text,
//! owner, name, portable data hash) comes from an [`ApiClient`].
//!
//! Two backends ship with the crate:
//!
//! - [`MemoryStore`]: process-local, with fault injection for tests
//! - [`DirStore`]: persists to a local directory, used by the CLI

pub mod cache;
pub mod client;
pub mod error;
pub mod local;
pub mod locator;
pub mod memory;
pub mod reader;
pub mod signing;

pub use cache::BlockCache;
pub use client::{ApiClient, KeepClient, PutReceipt, SharedApiClient, SharedKeepClient};
pub use error::{KeepError, KeepResult};
pub use local::DirStore;
pub use locator::{Blake3Hash, Locator, Signature, portable_data_hash, strip_signatures};
pub use memory::MemoryStore;
pub use reader::BlockReader;
pub use signing::{Signer, unix_now};
