//! # docsync testkit
//!
//! Test utilities for docsync.
//!
//! This crate provides:
//! - [`MockRemote`], an in-memory CouchDB-style database behind the
//!   engine's `HttpClient` seam, with scripted change feeds and failure
//!   injection
//! - Fixtures for revision bodies and `multipart/related` documents
//! - Waits on session state that fail instead of hanging
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use docsync_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn pulls_one_document() {
//!     let remote = MockRemote::new();
//!     remote.put_document("doc1", json!({"n": 1}));
//!     let store = Arc::new(MemoryStore::new());
//!     let config = ReplicationConfig::new(&remote.url_str(), Direction::Pull).unwrap();
//!     let session = ReplicationSession::new(config, store.clone(), remote.client()).unwrap();
//!     session.start();
//!     wait_for_stop(&session).await;
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod remote;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::init_tracing;
    pub use crate::remote::*;
}

pub use fixtures::*;
pub use generators::*;
pub use remote::*;

/// Installs a `tracing` subscriber for tests, filtered by `RUST_LOG`.
///
/// Safe to call from every test; only the first call installs it.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
