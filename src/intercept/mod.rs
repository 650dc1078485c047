//! Request interception: the read path of the subsystem.
//!
//! Incoming read requests are:
//! - Classified by origin and path shape
//! - Routed through the caching strategy their class prescribes
//!   (network-first, cache-first, or network-only)
//! - Answered from the network, a cache bucket, or a synthetic offline
//!   reply when nothing else is available

mod classify;
mod router;

pub use classify::{Action, Classifier, RequestClass};
pub use router::{FetchOutcome, FetchRouter, ResponseSource, FETCHED_AT_HEADER};
