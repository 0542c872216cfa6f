//! Session chain for vbak.
//!
//! Each volume owns a singly-linked chain of sessions, oldest (`first`) to
//! newest (`last`), where every session records the name of its
//! predecessor. [`SessionChain`] keeps an explicit ordered index over that
//! chain so traversal, splicing and prune selection never chase pointers.
//!
//! # Invariants
//!
//! - Exactly one session has no predecessor.
//! - The chain is acyclic and every session is reachable from `first`.
//! - Session names strictly increase along the chain.
//! - The newest session can never be deleted or pruned.
//!
//! [`MergePlan`] computes how stored chunks move when a run of old sessions
//! is folded into its successor, and [`MetaStore`] persists records and
//! manifests with write-temp-then-rename.

pub mod chain;
pub mod error;
pub mod merge;
pub mod record;
pub mod store;

pub use chain::{PruneRun, PruneSelector, SessionChain};
pub use error::{ChainError, ChainResult};
pub use merge::MergePlan;
pub use record::{SessionRecord, VolumeRecord};
pub use store::{write_atomic, MetaStore};
