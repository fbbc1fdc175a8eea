#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # quotabox
//!
//! Per-key admission control for async Rust: "at most N operations per window",
//! enforced independently for every caller-supplied key, plus a small key-scoped
//! data store.
//!
//! ## Features
//!
//! - **Fixed-window quotas**, refreshed lazily on the first call after expiry
//! - **One actor per key**: calls for a key are serialized, keys run in parallel
//! - **Exactly-once lazy creation** under concurrent first access
//! - **Idle reclamation**: buckets retire after a quiet period and are recreated
//!   fresh on the next call
//! - **Fault isolation**: a failing bucket is cleaned up without touching others
//! - **Tower middleware** and structured telemetry events
//!
//! ## Quick Start
//!
//! ```rust
//! use quotabox::{BucketConfig, BucketManager, Data, Decision};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let manager = BucketManager::new();
//!     let cfg = BucketConfig::new(5, Duration::from_secs(30), Duration::from_secs(60)).unwrap();
//!
//!     let bucket = manager.ensure("api-key-123", &cfg);
//!     match bucket.put(Data::new()).await.unwrap() {
//!         Decision::Allowed(()) => { /* proceed */ }
//!         Decision::Denied { retry_after } => eprintln!("retry in {retry_after:?}"),
//!     }
//! }
//! ```

pub mod adaptive;
pub mod bucket;
pub mod clock;
pub mod config;
pub mod directory;
pub mod error;
pub mod manager;
pub mod middleware;
pub mod prelude;
pub mod telemetry;

// Re-exports
pub use adaptive::DynamicConfig;
pub use bucket::{BucketHandle, BucketId, Data, Decision, Usage};
pub use clock::{Clock, MonotonicClock};
pub use config::{BucketConfig, ConfigError};
pub use directory::{DefaultDirectory, Directory, InMemoryDirectory, Registration};
pub use error::{LimitError, QuotaError};
pub use manager::{BucketManager, DEFAULT_MAILBOX_CAPACITY};
pub use middleware::{QuotaLayer, QuotaService};
pub use telemetry::{LogSink, MemorySink, NullSink, QuotaEvent, TelemetrySink, TerminationReason};
