//! # peer-conn-cache
//!
//! Deduplicating, address-keyed connection cache.
//!
//! Given a numeric [`Address`](domain::Address), a store hands back one shared
//! connection for that address. Concurrent requests for the same address share
//! a single useful establishment, and a connection pushed in by the remote
//! peer preempts a local open that is still in flight. Connections that lose
//! a race are closed, never cached and never returned.
//!
//! ## Architecture
//!
//! ```text
//! Callers (get_connection, on_new_remote_connection)
//!     │
//!     ├── ConnectionStore (store/)
//!     │     ├── CommandLoopStore   single loop owns the cache
//!     │     └── LockedStore        RwLock + double-check
//!     │
//!     ├── TopicBus (domain/)       one topic per address
//!     │
//!     └── Connection / ConnectionFactory (domain/)
//! ```

pub mod config;
pub mod domain;
pub mod error;
pub mod store;
