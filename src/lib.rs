//! # syncstore: embedded incremental storage for project-sync indices
//!
//! syncstore keeps the indices a project sync produces between runs and
//! hands changed keys to a background re-indexing loop. It provides:
//!
//! - **Codecs**: a position/limit byte buffer with varint, zig-zag and fixed
//!   width encodings, composable `Codec<T>` implementations for primitives,
//!   collections and domain identifiers, and version-tagged formats
//! - **KV stores**: ordered key-value maps whose writes land in a dirty
//!   overlay and reach the backend on flush, as one atomic batch
//! - **Flat stores**: single records materialized at most once
//! - **Backends**: volatile in-memory maps or persistent sled trees, picked
//!   per store when it is built
//! - **Coalescing queue**: multi-writer, single-reader FIFO that queues each
//!   key at most once
//!
//! # Usage
//!
//! ```no_run
//! use syncstore::codec::{of_int, of_string};
//! use syncstore::storage::{StorageConfig, StorageContext, StorageHint};
//!
//! # fn main() -> Result<(), syncstore::storage::StorageError> {
//! let ctx = StorageContext::open("project", StorageConfig::persistent("/tmp/sync"))?;
//! let targets = ctx
//!     .create_kv_store::<i32, String>("targets", StorageHint::UsePagedStore)
//!     .with_key_codec(of_int())
//!     .with_value_codec(of_string())
//!     .build()?;
//!
//! targets.put(1, "//app:bin".to_string())?;
//! targets.flush()?;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod queue;
pub mod storage;

pub use codec::{Codec, CodecBuffer, CodecContext, CodecError, CodecExt};
pub use queue::{CoalescingQueue, QueueError};
pub use storage::{FlatStore, KvStore, StorageConfig, StorageContext, StorageError, StorageHint};
