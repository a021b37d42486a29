//! Connection capability consumed by the stores.
//!
//! The stores never look inside a connection: they create one through a
//! [`ConnectionFactory`], drive it with [`Connection::open`] and
//! [`Connection::close`], and hand it out as a [`SharedConnection`].

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;

use super::Address;

/// A connection to a remote peer.
///
/// `open` and `close` complete within an implementation-chosen, bounded
/// latency and cannot be aborted once started. `is_open` reflects the last
/// completed transition; it says nothing about an `open` or `close` that is
/// still in flight on the same instance.
#[async_trait]
pub trait Connection: Send + Sync + Debug {
    /// Establishes the connection.
    async fn open(&self);

    /// Releases the connection.
    async fn close(&self);

    /// Returns `true` if the connection is currently open.
    fn is_open(&self) -> bool;
}

/// Shared handle to a connection. Two handles refer to the same connection
/// when [`same_connection`] says so.
pub type SharedConnection = Arc<dyn Connection>;

/// Creates fresh, not yet opened connections for an address.
pub trait ConnectionFactory: Send + Sync + Debug {
    /// Returns a new connection for `address`. The store opens it.
    fn create(&self, address: Address) -> SharedConnection;
}

/// Returns `true` if both handles point at the same connection instance.
#[must_use]
pub fn same_connection(a: &SharedConnection, b: &SharedConnection) -> bool {
    Arc::ptr_eq(a, b)
}

/// Closes `connection` on a background task.
///
/// Superseded and losing connections are released this way so that closing
/// never holds up a cache mutation or the caller. Outside a tokio runtime the
/// connection is dropped unclosed with a warning.
pub fn close_in_background(address: Address, connection: SharedConnection) {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        tracing::warn!(%address, "no runtime to close connection on");
        return;
    };
    runtime.spawn(async move {
        connection.close().await;
        tracing::trace!(%address, "background close finished");
    });
}
