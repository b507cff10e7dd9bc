//! Read-through response cache.
//!
//! Memoizes successful GET responses in a key/value backend and drops them
//! again when the underlying collection changes:
//!
//! - **Interceptor**: [`response_cache_layer`], an axum middleware
//! - **Invalidation**: [`Invalidator`], pattern sweeps by resource path
//! - **Events**: [`MutationHub`] fans out writes; [`MutationBridge`] turns
//!   them into invalidation
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! enabled = true
//! max_age_seconds = 300
//! excluded_prefixes = ["/admin", "/api/auth"]
//! include_query = true
//! # ... see config.rs for all options
//! ```

pub mod backend;
mod bridge;
mod config;
mod events;
mod invalidation;
mod keys;
mod lock;
mod middleware;
mod runtime;
mod store;
mod throttle;

pub use bridge::{MutationBridge, resource_path};
pub use config::{CacheConfig, ClearScope, MAX_AGE_LIMIT_SECS};
pub use events::{MutationEvent, MutationHub, MutationSubscriber, OperationKind, Topic};
pub use invalidation::Invalidator;
pub use keys::{
    CacheKey, DEFAULT_NAMESPACE, InvalidationPattern, KeyError, QueryParams, QueryValue,
    escape_glob, glob_matches,
};
pub use middleware::{CacheState, response_cache_layer};
pub use runtime::CacheRuntime;
pub use store::{
    CachedResponse, EntryError, HEADER_CACHE, HEADER_CACHE_KEY, HEADER_CACHE_STORED,
    HEADER_CACHE_TTL, LookupOutcome, ResponseStore, StoreError,
};
pub use throttle::LogThrottle;
