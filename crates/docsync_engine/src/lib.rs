//! # docsync engine
//!
//! Replication sessions between a local document store and a remote
//! CouchDB-compatible database.
//!
//! This crate provides:
//! - The session lifecycle state machine ([`state`])
//! - A change tracker for one-shot, long-poll and continuous `_changes`
//!   feeds, with exponential backoff
//! - Checkpoint fetch and coalesced saves under `_local/{id}`
//! - A revision batcher that bounds in-flight work
//! - Verified reading of `multipart/related` document responses
//! - Pull (`_changes` + document GET) and push (`_revs_diff` +
//!   `_bulk_docs`) transfers
//!
//! ## Architecture
//!
//! Each [`ReplicationSession`] is a handle to a task that owns all mutable
//! session state. Triggers, tracker callbacks, batch deliveries and request
//! completions are commands on that task's queue, so they are handled one at
//! a time and never re-enter each other. HTTP goes through the
//! [`HttpClient`] seam; [`ReqwestClient`] is the production client.
//!
//! ## Key Invariants
//!
//! - Every state change passes through [`state::transition`]
//! - At most one checkpoint save is in flight per session
//! - The checkpoint never moves past a revision that is not yet stored
//! - Listeners observe events in the order the session produced them

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
mod backoff;
mod batcher;
mod checkpoint;
mod config;
mod error;
mod event;
pub mod http;
mod manager;
mod memory_store;
mod multipart;
mod reqwest_client;
mod session;
pub mod state;
mod store;
mod tracker;

pub use auth::{Authenticator, BasicAuthenticator, SessionAuthenticator};
pub use backoff::{Backoff, BackoffPolicy};
pub use batcher::Batcher;
pub use checkpoint::{agreed_sequence, CheckpointState, RefreshOutcome, SaveAction, SaveOutcome, SaveRequest};
pub use config::{BatcherConfig, Direction, FeedConfig, ReplicationConfig, BY_CHANNEL_FILTER, CHANNELS_PARAM};
pub use error::{SyncError, SyncResult};
pub use event::{ChangeEvent, ChangeListener, SessionId, StateTransition};
pub use http::{HttpClient, HttpRequest, HttpResponse, Method};
pub use manager::{SessionKey, SessionManager};
pub use memory_store::{MemoryBlobWriter, MemoryStore};
pub use multipart::MultipartDocumentReader;
pub use reqwest_client::ReqwestClient;
pub use session::{checkpoint_spec, ReplicationSession, SessionBuilder};
pub use state::{ReplicationState, ReplicationTrigger};
pub use store::{AttachmentWriters, BlobWriter, LocalStore, StoreHandle};
pub use tracker::{ChangeTracker, ChangeTrackerClient, TrackerOptions};
pub use docsync_protocol::FeedMode;
