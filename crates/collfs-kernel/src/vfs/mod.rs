//! Filesystem surface shared by the collection and site layers.
//!
//! - [`VfsOps`] - path-based operations both layers implement
//! - [`VPath`] - path normalization
//! - [`VfsError`] - error kinds surfaced to consumers
//!
//! ## Design Decisions
//!
//! - **Path-based, no inodes**: operations take paths; open handles carry
//!   the node they resolved to.
//! - **Capability trait**: a filesystem declares it serves directories by
//!   implementing [`VfsOps`], checked at compile time.

mod error;
mod ops;
pub mod path;
mod types;

pub use error::{VfsError, VfsResult};
pub use ops::VfsOps;
pub use path::VPath;
pub use types::{DirEntry, FileAttr, FileType, OpenFlags};
