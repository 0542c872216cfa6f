//! Archive destinations for vbak.
//!
//! A destination holds the archive tree:
//!
//! ```text
//! <volume>/volinfo
//! <volume>/<session>/info
//! <volume>/<session>/manifest
//! <volume>/<session>/<hex16[0..9]>/x<hex16>     stored chunk
//! <volume>/<session>-tmp/...                    session being sent
//! ```
//!
//! Chunks travel to the destination as one tar stream per session
//! ([`ContainerWriter`]); duplicate chunks travel as hard-link entries.
//! A consumer (a thread or a helper process) materializes the stream while
//! the producer keeps writing, with a bounded pipe between the two.
//!
//! # Backends
//!
//! All backends implement the [`Destination`] trait:
//!
//! - [`LocalDestination`] -- a directory on a local filesystem
//! - [`ShellDestination`] -- a directory reached through `sh`, `ssh`, or `qvm-run`
//! - [`MemoryDestination`] -- `BTreeMap`-based, for tests
//!
//! Every path handed to a destination is relative to its root and may not
//! contain `..` components.

pub mod channel;
pub mod container;
pub mod error;
pub mod local;
pub mod memory;
pub mod shell;
pub mod traits;

pub use channel::{pipe, ChannelReader, ChannelWriter};
pub use container::{read_container, ContainerEntry, ContainerWriter};
pub use error::{StoreError, StoreResult};
pub use local::LocalDestination;
pub use memory::MemoryDestination;
pub use shell::{ShellDestination, Transport};
pub use traits::{check_path, Destination, FetchStream, FileOp, StreamSink};
