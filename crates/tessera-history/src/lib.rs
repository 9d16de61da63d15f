//! Source-history tracking for incremental indexing.
//!
//! - [`vcs`]: the [`VersionControl`](vcs::VersionControl) gateway and its git adapter
//! - [`resolver`]: [`ChangeSetResolver`](resolver::ChangeSetResolver), which decides what to re-embed
//! - [`state`]: the persisted [`IndexState`](state::IndexState)
//! - [`lock`]: the single-writer [`IndexLock`](lock::IndexLock)

pub mod lock;
pub mod resolver;
pub mod state;
pub mod vcs;
