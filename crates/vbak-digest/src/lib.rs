//! Delta digest engine for vbak.
//!
//! Turns block-level diff events reported between two snapshot generations
//! into a durable, accumulating bitmap with one bit per chunk.
//!
//! # Durability
//!
//! The canonical map lives at `<dir>/deltamap`. Before any mutation the map
//! is renamed to `<dir>/deltamap-tmp`; the temp file is renamed back only
//! once the cycle that mutated it is finished. Because bits are only ever
//! ORed in, a temp map left behind by a crash is always safe to adopt as
//! canonical ([`MapFiles::recover`]).

pub mod dirty_map;
pub mod error;
pub mod events;
pub mod files;

pub use dirty_map::DirtyMap;
pub use error::{DigestError, DigestResult};
pub use events::{apply_report, DiffEvent, DiffKind, DiffReport, DigestOutcome};
pub use files::MapFiles;
