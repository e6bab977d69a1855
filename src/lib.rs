//! # Ratelimitd - Distributed Rate Limiting Core
//!
//! The counting engine of a distributed rate limit service, invoked by an
//! edge proxy. For each incoming `(domain, descriptors)` request it answers,
//! per descriptor, whether taking N additional hits stays within the
//! configured per-unit quota. Counters live in a shared key-value store so
//! that many stateless replicas agree on usage.
//!
//! ## Architecture
//!
//! - `ratelimit`: fixed-window engine, hot-key detection and micro-batching,
//!   slot-aware pipeline dispatch, local over-limit cache
//! - `store`: counter store abstraction, slot hashing, redis driver and an
//!   in-process store
//! - `config`: typed settings for everything above
//!
//! The transport edge (gRPC/HTTP), rule loading and stats sinks live in the
//! embedding service; this crate is the core they call into.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use ratelimitd::ratelimit::engine::{EngineConfig, FixedWindowEngine};
//! use ratelimitd::{Descriptor, MemoryStore, RateLimitRule, RateLimitUnit};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = FixedWindowEngine::new(
//!     EngineConfig::default(),
//!     Arc::new(MemoryStore::new()),
//!     None,
//! );
//!
//! let verdicts = engine
//!     .check(
//!         "edge",
//!         &[Descriptor::new(vec![("api_key", "X")])],
//!         &[Some(RateLimitRule::new(50, RateLimitUnit::Second))],
//!     )
//!     .await?;
//! assert!(verdicts[0].is_ok());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

// Configuration surface
pub mod config;

// Rate limiting core
pub mod ratelimit;

// Counter stores
pub mod store;

// Re-export commonly used types
pub use config::Settings;
pub use ratelimit::{
    Descriptor, FixedWindowEngine, RateLimitError, RateLimitResult, RateLimitRule, RateLimitUnit,
    Verdict, VerdictCode,
};
pub use store::{CounterStore, MemoryStore};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");
