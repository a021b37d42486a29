//! Simulated connections with configurable latency.
//!
//! No I/O happens here: opening and closing sleep for a fixed time and flip a
//! flag. The demo binary and the test suites use these to exercise the stores.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::Address;
use super::connection::{Connection, ConnectionFactory, SharedConnection};

/// Time taken by each transition of a [`SimulatedConnection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Latency {
    /// Duration of [`Connection::open`].
    pub open: Duration,
    /// Duration of [`Connection::close`].
    pub close: Duration,
}

impl Latency {
    /// Creates a latency profile.
    #[must_use]
    pub const fn new(open: Duration, close: Duration) -> Self {
        Self { open, close }
    }
}

impl Default for Latency {
    /// Five seconds to open, one second to close.
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(1))
    }
}

/// A connection whose transitions are simulated with `tokio::time::sleep`.
#[derive(Debug)]
pub struct SimulatedConnection {
    address: Address,
    latency: Latency,
    opened: AtomicBool,
}

impl SimulatedConnection {
    /// Creates a closed connection.
    #[must_use]
    pub fn new(address: Address, latency: Latency) -> Self {
        Self {
            address,
            latency,
            opened: AtomicBool::new(false),
        }
    }

    /// Creates a connection that is already open, as if established by the
    /// remote side.
    #[must_use]
    pub fn new_opened(address: Address, latency: Latency) -> Self {
        Self {
            address,
            latency,
            opened: AtomicBool::new(true),
        }
    }

    /// Returns the address this connection was created for.
    #[must_use]
    pub const fn address(&self) -> Address {
        self.address
    }
}

#[async_trait]
impl Connection for SimulatedConnection {
    async fn open(&self) {
        tokio::time::sleep(self.latency.open).await;
        self.opened.store(true, Ordering::Release);
    }

    async fn close(&self) {
        tokio::time::sleep(self.latency.close).await;
        self.opened.store(false, Ordering::Release);
    }

    fn is_open(&self) -> bool {
        self.opened.load(Ordering::Acquire)
    }
}

/// Factory producing [`SimulatedConnection`]s.
///
/// A factory built with [`SimulatedFactory::new`] is an audit tool: it keeps
/// a handle to every connection it has created, for its whole lifetime, so
/// that tests can check after the fact which ones were left open. Use
/// [`SimulatedFactory::untracked`] for long-running callers.
#[derive(Debug)]
pub struct SimulatedFactory {
    latency: Latency,
    record: bool,
    created: Mutex<Vec<(Address, SharedConnection)>>,
}

impl SimulatedFactory {
    /// Creates a recording factory whose connections use `latency`.
    #[must_use]
    pub fn new(latency: Latency) -> Self {
        Self {
            latency,
            record: true,
            created: Mutex::new(Vec::new()),
        }
    }

    /// Creates a factory that keeps no handle to what it creates.
    /// [`Self::created`] stays empty.
    #[must_use]
    pub fn untracked(latency: Latency) -> Self {
        Self {
            record: false,
            ..Self::new(latency)
        }
    }

    /// Returns every connection created so far, in creation order.
    #[must_use]
    pub fn created(&self) -> Vec<(Address, SharedConnection)> {
        self.created
            .lock()
            .iter()
            .map(|(address, conn)| (*address, Arc::clone(conn)))
            .collect()
    }

    /// Returns how many connections have been created for `address`.
    #[must_use]
    pub fn created_for(&self, address: Address) -> usize {
        self.created
            .lock()
            .iter()
            .filter(|(addr, _)| *addr == address)
            .count()
    }
}

impl Default for SimulatedFactory {
    fn default() -> Self {
        Self::new(Latency::default())
    }
}

impl ConnectionFactory for SimulatedFactory {
    fn create(&self, address: Address) -> SharedConnection {
        let conn: SharedConnection = Arc::new(SimulatedConnection::new(address, self.latency));
        if self.record {
            self.created.lock().push((address, Arc::clone(&conn)));
        }
        conn
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    fn fast() -> Latency {
        Latency::new(Duration::from_millis(50), Duration::from_millis(10))
    }

    #[tokio::test(start_paused = true)]
    async fn open_then_close_transitions() {
        let conn = SimulatedConnection::new(Address::new(1), fast());
        assert!(!conn.is_open());

        conn.open().await;
        assert!(conn.is_open());

        conn.close().await;
        assert!(!conn.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn open_takes_configured_latency() {
        let conn = SimulatedConnection::new(Address::new(1), fast());
        let started = tokio::time::Instant::now();
        conn.open().await;
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn new_opened_starts_open() {
        let conn = SimulatedConnection::new_opened(Address::new(9), fast());
        assert!(conn.is_open());
        assert_eq!(conn.address(), Address::new(9));
    }

    #[test]
    fn factory_records_created_connections() {
        let factory = SimulatedFactory::new(fast());
        let a = factory.create(Address::new(1));
        let _b = factory.create(Address::new(2));
        let _c = factory.create(Address::new(1));

        assert_eq!(factory.created().len(), 3);
        assert_eq!(factory.created_for(Address::new(1)), 2);
        assert_eq!(factory.created_for(Address::new(3)), 0);

        let first = factory.created().into_iter().next();
        let Some((addr, conn)) = first else {
            panic!("expected a recorded connection");
        };
        assert_eq!(addr, Address::new(1));
        assert!(Arc::ptr_eq(&conn, &a));
    }

    #[test]
    fn untracked_factory_keeps_no_handles() {
        let factory = SimulatedFactory::untracked(fast());
        let conn = factory.create(Address::new(1));

        assert!(factory.created().is_empty());
        assert_eq!(factory.created_for(Address::new(1)), 0);
        assert_eq!(Arc::strong_count(&conn), 1);
    }

    #[test]
    fn default_latency_is_five_and_one_seconds() {
        let latency = Latency::default();
        assert_eq!(latency.open, Duration::from_secs(5));
        assert_eq!(latency.close, Duration::from_secs(1));
    }
}
