//! Offline-first request layer: versioned response caching plus a durable
//! mutation replay queue.
//!
//! Reads are classified by URL and served network-first or cache-first per
//! class, with synthetic 503 replies when both the network and the cache
//! come up empty. Mutations issued while offline land in a SQLite-backed
//! queue and are replayed in order, with bounded retries, once
//! connectivity returns.
//!
//! [`OfflineService`] wires the pieces together; the individual components
//! remain public for callers that need finer control.

pub mod config;
pub mod connectivity;
pub mod db;
pub mod http;
pub mod intercept;
pub mod queue;
pub mod service;
pub mod store;
pub mod sync;
pub mod transport;

pub use config::Config;
pub use connectivity::ConnectivityMonitor;
pub use http::{HttpRequest, HttpResponse, Method};
pub use intercept::{FetchOutcome, ResponseSource};
pub use service::{MutationOutcome, OfflineService, ServiceStatus};
pub use sync::{SyncEvent, SyncResult};
