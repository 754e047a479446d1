//! Read Cache Stack
//!
//! Four pieces, composed by [`store::CacheLayer`]:
//!
//! - [`memory`]: the per-process TTL map and its janitor
//! - [`policy`]: per-key admission decisions with skip-reason counters
//! - [`store`]: the write-through invalidation layer on the command path
//! - [`invalidator`]: cross-process invalidation over LISTEN/NOTIFY
//!
//! Only string `GET` is ever cached; every other data type reads straight
//! from the database.

pub mod invalidator;
pub mod memory;
pub mod policy;
pub mod store;

pub use invalidator::{spawn_invalidation_listener, InvalidationPublisher};
pub use memory::{Cache, CacheStats};
pub use policy::{CacheDecision, CachePolicy, PolicyConfig, SkipReason};
pub use store::{CacheLayer, WriteEffect};
