//! Backup engine for vbak.
//!
//! Ties the chunk pipeline, dirty map, manifests, session chain, dedup
//! index and destination together into the operations a backup run
//! performs on each volume:
//!
//! - **monitor** -- digest block-level changes into the dirty map
//! - **send** -- stream every dirty chunk to the destination as a new session
//! - **receive** -- rebuild a session from its ancestry and extract it
//! - **verify** / **diff** -- check a session, or compare it with the volume
//! - **prune** -- merge old sessions into their successor
//!
//! # Example
//!
//! ```no_run
//! use vbak_engine::{Engine, EngineConfig};
//! use vbak_types::VolumeName;
//!
//! let config = EngineConfig::from_file("vbak.toml".as_ref())?;
//! let mut engine = Engine::open(config)?;
//! let report = engine.send(&VolumeName::new("root")?)?;
//! println!("sent {:?}", report.session);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Failure handling
//!
//! Every failure falls into an [`ErrorClass`]. Batch runs collect input and
//! diff-source failures per volume and abort on anything else. Work cut
//! short by a crash is finished or discarded the next time the volume's
//! [`EngineContext`] is opened.

pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod lock;
pub mod provider;
pub mod report;

mod monitor;
mod prune;
mod receive;
mod send;

pub use config::{DestinationConfig, DestinationKind, DiffConfig, EngineConfig, VolumeConfig};
pub use context::EngineContext;
pub use engine::Engine;
pub use error::{EngineError, EngineResult, ErrorClass};
pub use lock::InstanceLock;
pub use provider::{
    CommandDiffProducer, CompareDiffProducer, DiffProducer, Generation, ImageSnapshots,
    SnapshotProvider, StaticDiffProducer, VolumeReader,
};
pub use receive::{ExtractTarget, ReceiveMode};
pub use report::{BatchOutcome, MonitorReport, PruneReport, ReceiveReport, SendReport};

pub use vbak_chain::{PruneSelector, SessionRecord};
pub use vbak_dedup::IndexKind;
pub use vbak_types::{SessionName, VolumeName};
