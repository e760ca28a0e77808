//! Response cache for the GenCore inference gateway.
//!
//! Two pieces live here:
//!
//! - [`Fingerprint`] — a canonical hash identifying a generation request
//!   (model, prompt or message list, sampling parameters). Requests that
//!   differ only in stop-sequence order or in unset-vs-default optional
//!   parameters produce the same fingerprint.
//! - [`ResponseCache`] — a bounded LRU map with per-entry TTL plus a
//!   single-flight table: at most one producer runs per fingerprint, and
//!   every concurrent duplicate request waits for (and shares) its result.
//!
//! Streaming responses never go through the body cache; the gateway calls
//! the backend directly for those.

pub mod cache;
pub mod fingerprint;

pub use cache::{CacheConfig, CacheError, CacheStats, ResponseCache};
pub use fingerprint::{Fingerprint, SamplingKey, chat_fingerprint, completion_fingerprint};
