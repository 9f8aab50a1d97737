//! Versioned file metadata
//!
//! A [`Version`] is an immutable view of the table files in every level.
//! The [`VersionSet`] installs new versions by applying [`VersionEdit`]s and
//! persists every edit to the manifest so the tree can be rebuilt on open.

pub(crate) mod edit;
pub mod filename;
#[allow(clippy::module_inception)]
pub(crate) mod version;
mod version_set;

pub use edit::{FileMetaData, VersionEdit};
pub use version::Version;
pub use version_set::VersionSet;
