//! # docsync Protocol
//!
//! Wire-format types for docsync replication.
//!
//! This crate provides:
//! - `ChangeEntry` and `FeedMode` for the remote change feed
//! - `JsonObjectSplitter` for incremental change-feed parsing
//! - `CheckpointSpec` for deterministic checkpoint identifiers
//! - `AttachmentInfo` for declared attachment metadata
//! - `MultipartTokenizer` for streamed MIME multipart bodies
//! - Serde types for the `_session`, `_revs_diff` and `_bulk_docs` bodies
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod attachment;
mod change;
mod checkpoint;
mod error;
mod json_stream;
mod messages;
pub mod mime;
mod revision;

pub use attachment::{declared_attachments, AttachmentInfo, INLINE_SIZE_WARNING};
pub use change::{sequence_to_string, ChangeEntry, FeedMode};
pub use checkpoint::{checkpoint_body, last_sequence_of, CheckpointSpec, LAST_SEQUENCE_KEY};
pub use error::{ProtocolError, ProtocolResult};
pub use json_stream::{JsonObjectSplitter, SplitMode};
pub use messages::{
    BulkDocsItem, BulkDocsRequest, PutResponse, RevsDiffEntry, RevsDiffRequest, RevsDiffResponse,
    SessionInfo, UserContext,
};
pub use mime::{MultipartTokenizer, PartHandler, PartHeaders};
pub use revision::{generation_of, identity_of, is_deletion, PendingRevision};
