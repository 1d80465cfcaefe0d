//! Siltstone: a Bitcask-style embedded key-value store.
//!
//! Writes append length-prefixed, CRC-protected records to segmented
//! append-only log files; an in-memory key directory maps each key to the
//! position of its latest record and is rebuilt by replaying the log at
//! open. Deletes append tombstones, batches commit atomically through a
//! finish-marker record, and a merge pass rewrites live records into a
//! compacted directory that is swapped in on the next open.
//!
//! ```no_run
//! use bytes::Bytes;
//! use siltstone::{Engine, Options};
//!
//! fn main() -> siltstone::Result<()> {
//!     let engine = Engine::open(Options {
//!         dir_path: "/tmp/siltstone-demo".into(),
//!         ..Options::default()
//!     })?;
//!
//!     engine.put(Bytes::from("name"), Bytes::from("siltstone"))?;
//!     assert_eq!(engine.get(Bytes::from("name"))?, "siltstone");
//!     engine.delete(Bytes::from("name"))?;
//!     engine.close()
//! }
//! ```

mod batch;
mod data_file;
mod engine;
mod error;
mod fio;
mod index;
mod iterator;
mod merge;
mod options;
mod record;
mod util;

pub use batch::WriteBatch;
pub use engine::{Engine, Stat};
pub use error::{Error, Result};
pub use iterator::EngineIterator;
pub use options::{IndexType, IteratorOptions, Options, WriteBatchOptions};
