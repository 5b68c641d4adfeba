#![deny(missing_docs)]
//! # atmo
//! A small weather-data aggregation service: content publishers push station
//! observations over HTTP PUT, query clients read them back over HTTP GET,
//! and a single aggregation server keeps the most recent observations
//! in memory and durably on disk. Logical ordering of events across all
//! participants is maintained by Lamport clocks carried in `Lamport-Clock`
//! headers.
//!
//! The crate ships three binaries built on this library:
//! `atmo-server`, `atmo-publisher` and `atmo-client`.

/// the query client: GET, pretty-print, retry
pub mod client;
/// the per-process Lamport clock and wall-clock helpers
pub mod clock;
/// the crate's error type and `Result` alias
pub mod error;
/// the hand-parsed HTTP subset spoken on the wire
pub mod http;
/// the opaque station observation record
pub mod observation;
/// the content publisher: feed-file parsing and periodic uploads
pub mod publisher;
/// the aggregation server: accept loop, handlers, sweeper, lifecycle
pub mod server;
/// the bounded, expiring observation store and its snapshot file
pub mod store;
/// the worker pool that services connections
pub mod thread_pool;

pub use client::QueryClient;
pub use clock::LamportClock;
pub use error::{AtmoError, Result};
pub use observation::Observation;
pub use publisher::ContentPublisher;
pub use server::{AggregationServer, ServerConfig, ServerHandle};
pub use store::{ObservationStore, PutOutcome, StoreEntry};
