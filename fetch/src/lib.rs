//! A sharded, single-flight memoizing fetch layer for async Rust.
//!
//! Wrap any expensive "fetch by key" operation in a [`FetchManager`] and it will:
//! - **Deduplicate**: concurrent requests for the same key share one in-flight fetch.
//! - **Memoize**: successful results are served for a fixed time-to-live, measured
//!   from the moment the fetch resolved (not sliding on access).
//! - **Forget failures**: an error is handed to every caller that was waiting on it,
//!   then discarded so the next request tries again.
//! - **Cancel per caller**: a caller may abandon its own wait without disturbing the
//!   shared fetch or the other callers waiting on it.
//! - **Shard**: state is partitioned across independently locked shards, each with its
//!   own expiration scheduler and closed signal.

// Public modules that form the API
pub mod builder;
pub mod error;
pub mod fetcher;
pub mod key;
pub mod manager;
pub mod metrics;
pub mod runtime;

// Internal, crate-only modules
mod flight;
mod router;
mod shard;
mod task;

// Re-export the primary user-facing types for convenience
pub use builder::{FetchConfig, FetchManagerBuilder};
pub use error::{BuildError, CloseError, FetchError, SerializedError, ShardCloseFailure};
pub use fetcher::{from_cancelable_fn, from_fn, from_serialized, FetchFuture, Fetcher, SerialFetcher, Serialized};
pub use key::{FloatKey, Hashed, ShardKey};
pub use manager::FetchManager;
pub use metrics::MetricsSnapshot;
pub use runtime::TaskSpawner;

pub use tokio_util::sync::CancellationToken;
