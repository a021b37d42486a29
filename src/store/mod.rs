//! Connection stores: the get-or-create contract and its two strategies.
//!
//! Both strategies race a cache lookup, a fresh open and any remote push for
//! the requested address through a [`TopicBus`], return whichever value
//! resolves the request first, and release the connections that lost.
//!
//! - [`CommandLoopStore`] funnels every cache access through one command
//!   loop that owns the cache.
//! - [`LockedStore`] keeps the cache behind a read/write lock and re-checks
//!   it once the race has settled.
//!
//! [`TopicBus`]: crate::domain::TopicBus

pub mod command_loop;
pub mod locked;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;

use crate::domain::{Address, Connection, ConnectionFactory, SharedConnection};
use crate::error::CacheError;

pub use command_loop::CommandLoopStore;
pub use locked::LockedStore;

/// The get-or-create contract shared by every store.
#[async_trait]
pub trait ConnectionStore: Send + Sync + fmt::Debug {
    /// Returns the connection for `address`, opening one if nothing better
    /// arrives first.
    ///
    /// Concurrent callers for the same address receive the same instance.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::ShutDown`] if the store is shut down before the
    /// request resolves.
    async fn get_connection(&self, address: Address) -> Result<SharedConnection, CacheError>;

    /// Installs `connection`, established by the remote peer, as the
    /// authoritative entry for `address`. Any previous entry is closed in
    /// the background, and requests waiting on `address` resolve to
    /// `connection`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::ShutDown`] if the store is shut down. The caller
    /// keeps responsibility for `connection` in that case.
    async fn on_new_remote_connection(
        &self,
        address: Address,
        connection: SharedConnection,
    ) -> Result<(), CacheError>;

    /// Runs the store's background processing until [`Self::shutdown`].
    /// Returns immediately for stores that need none.
    async fn run(&self);

    /// Stops the store and closes every cached connection. Returns once all
    /// of them are closed.
    async fn shutdown(&self);
}

/// Where a published connection came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Read from the cache; already authoritative.
    Cached,
    /// Opened locally for the request; not cached yet.
    Opened,
    /// Pushed by the remote peer through `on_new_remote_connection`.
    Remote,
}

impl Origin {
    /// Returns `true` if a request resolved by this value must write it into
    /// the cache. Remote pushes are installed before they are published.
    #[must_use]
    pub const fn needs_cache_update(self) -> bool {
        matches!(self, Self::Opened)
    }
}

/// A connection published on an address topic, tagged with its origin.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// The published connection.
    pub connection: SharedConnection,
    /// Where it came from.
    pub origin: Origin,
}

impl Candidate {
    /// Tags `connection` with `origin`.
    #[must_use]
    pub fn new(connection: SharedConnection, origin: Origin) -> Self {
        Self { connection, origin }
    }
}

/// Selects the store strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreKind {
    /// [`CommandLoopStore`].
    #[default]
    CommandLoop,
    /// [`LockedStore`].
    Locked,
}

impl StoreKind {
    /// Returns the configuration name of this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CommandLoop => "command_loop",
            Self::Locked => "locked",
        }
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StoreKind {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "command_loop" | "command-loop" => Ok(Self::CommandLoop),
            "locked" => Ok(Self::Locked),
            _ => Err(CacheError::InvalidConfig {
                key: "STORE_KIND".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

/// Builds a store of the given kind.
///
/// `capacity` pre-sizes the cache and, for [`StoreKind::CommandLoop`], sets
/// the command queue depth at which submitters start to wait.
#[must_use]
pub fn build_store(
    kind: StoreKind,
    capacity: usize,
    factory: Arc<dyn ConnectionFactory>,
) -> Arc<dyn ConnectionStore> {
    match kind {
        StoreKind::CommandLoop => Arc::new(CommandLoopStore::new(capacity, factory)),
        StoreKind::Locked => Arc::new(LockedStore::new(capacity, factory)),
    }
}

/// Closes every connection of a cache that has been taken out of service,
/// concurrently, and returns how many were closed.
pub(crate) async fn close_all(cache: HashMap<Address, SharedConnection>) -> usize {
    let closed = join_all(cache.into_iter().map(|(address, connection)| async move {
        connection.close().await;
        tracing::trace!(%address, "cached connection closed");
    }))
    .await;
    closed.len()
}
