//! Manifest codec for vbak.
//!
//! A session manifest lists, in strictly ascending address order, one line
//! per chunk sent in that session:
//!
//! ```text
//! <64 hex digit content hash> <16 hex digit address>
//! 0 <16 hex digit address>
//! ```
//!
//! The second form is a zero-marker: the chunk is all zeros and nothing is
//! stored for it. Manifests are written once and never mutated; a session's
//! full view of the volume is obtained by merging it with its ancestors
//! ([`merge_manifests`]).
//!
//! Session and volume metadata use a plain `key = value` format
//! ([`KeyValueRecord`]).

pub mod entry;
pub mod error;
pub mod merge;
pub mod reader;
pub mod record;
pub mod writer;

pub use entry::ManifestEntry;
pub use error::{ManifestError, ManifestResult};
pub use merge::{merge_manifests, MergedEntry};
pub use reader::{Manifest, ManifestReader};
pub use record::KeyValueRecord;
pub use writer::ManifestWriter;
