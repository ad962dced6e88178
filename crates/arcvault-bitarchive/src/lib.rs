//! # arcvault-bitarchive: File-based replica store
//!
//! A bitarchive replica keeps full copies of archive files on each of its
//! storage nodes. This crate is the node-local half: the [`Bitarchive`]
//! directory store that batch jobs run over, and [`ArchiveRecordHandle`]
//! retrieval of single records by file and offset.

mod error;
mod record;
mod store;

pub use error::{BitarchiveError, Result};
pub use record::{ArchiveRecordHandle, RecordPayload};
pub use store::{Bitarchive, BitarchiveOptions};
