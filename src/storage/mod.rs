//! Storage seams: objects, records + audit trail, and dispatch.
//!
//! The pipeline reaches every external system through one of three narrow
//! traits, so the decision logic never depends on a particular backend:
//!
//! | Trait | Operations | Bundled implementation |
//! |-------|------------|------------------------|
//! | [`ObjectStore`] | get object, put object | [`LocalObjectStore`] (filesystem, `root/bucket/key`) |
//! | [`RecordStore`] | atomic commit of record + audit rows, read back | [`SqliteRecordStore`] |
//! | [`Dispatcher`] | send message to a handler | [`ChannelDispatcher`] (tokio mpsc) |
//!
//! Callers wrap each operation in [`crate::retry::with_retry`] so every call
//! has one scoped timeout and transient failures back off.

pub mod dispatch;
pub mod object;
pub mod records;

pub use dispatch::{ChannelDispatcher, Dispatcher, QueueMessage};
pub use object::{LocalObjectStore, ObjectStore};
pub use records::{CommitOutcome, RecordStore, SqliteRecordStore};
