//! # Postkeys - A Redis-Wire-Compatible Server Backed by PostgreSQL
//!
//! Postkeys speaks RESP2/RESP3 on a TCP port while every key, hash,
//! list, set, sorted set and HyperLogLog lives as rows in PostgreSQL.
//! Applications keep their Redis client and API; operators get SQL
//! durability, backups, replication, and the ability to run several
//! stateless front-end processes against one database.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                            postkeys                              │
//! │                                                                  │
//! │  TCP ──> server::listener ──> protocol::parser ──> commands      │
//! │                                                       │          │
//! │                 ┌────────────┬────────────────────────┤          │
//! │                 ▼            ▼                        ▼          │
//! │            cache (GET)   storage (SQL)           pubsub::hub     │
//! │                 │            │                        │          │
//! │                 │            ▼                        ▼          │
//! │                 │       PostgreSQL <── NOTIFY ── LISTEN conns    │
//! │                 │            ▲                        │          │
//! │                 └── invalidations ────────────────────┘          │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! - [`protocol`]: RESP2/RESP3 framing
//! - [`commands`]: dispatch, AUTH and subscription gates, MULTI/EXEC
//! - [`storage`]: every data-type command as SQL over six tables
//! - [`cache`]: per-process string read cache with distributed
//!   invalidation over LISTEN/NOTIFY
//! - [`pubsub`]: SUBSCRIBE/PUBLISH routing and BRPOP/BLPOP wakeups on
//!   the same notification bus
//! - [`server`]: accept loop, sessions, graceful shutdown
//! - [`hll`]: the HyperLogLog estimator behind PFADD/PFCOUNT/PFMERGE

pub mod cache;
pub mod commands;
pub mod config;
pub mod glob;
pub mod hll;
pub mod protocol;
pub mod pubsub;
pub mod server;
pub mod storage;

pub use commands::{CommandHandler, ServerContext};
pub use config::Config;
pub use protocol::{ParseError, RespParser, RespValue, RespVersion};
pub use server::{serve, ServerStats, Session, SessionHandle};
pub use storage::{Store, StorageError};

/// The default port, same as Redis.
pub const DEFAULT_PORT: u16 = 6379;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
