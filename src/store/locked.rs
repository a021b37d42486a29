//! Store whose cache sits behind a read/write lock.
//!
//! [`LockedStore`] has no background task. A request races a cache lookup
//! against a fresh open through the [`TopicBus`], then re-reads the cache
//! once the race has settled: an entry written meanwhile (typically by a
//! remote push) wins over the value that resolved the race.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::{Candidate, ConnectionStore, Origin, close_all};
use crate::domain::connection::close_in_background;
use crate::domain::{
    Address, Connection, ConnectionFactory, SharedConnection, TopicBus, same_connection,
};
use crate::error::CacheError;

/// Connection store backed by a `RwLock<HashMap<..>>`.
///
/// Cloning is cheap and yields another handle to the same store.
/// [`ConnectionStore::run`] does nothing and need not be called.
///
/// # Concurrency
///
/// - Lookups take the read lock and may run concurrently.
/// - Installing a connection takes the write lock, and so does the
///   check-and-insert that settles a request.
/// - The lock is never held across a connection `open` or `close`.
#[derive(Debug, Clone)]
pub struct LockedStore {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    cache: RwLock<HashMap<Address, SharedConnection>>,
    bus: Arc<TopicBus<Candidate>>,
    factory: Arc<dyn ConnectionFactory>,
    shut_down: CancellationToken,
}

/// Link between one request and its open attempt.
///
/// The opener checks for cancellation and publishes under the same mutex the
/// requester holds while cancelling, so a fresh connection is either seen by
/// the requester or closed by the opener, never neither. A published
/// connection the requester never took is closed when the attempt is dropped.
#[derive(Debug)]
struct OpenAttempt {
    address: Address,
    cancel: CancellationToken,
    published: Mutex<Option<SharedConnection>>,
}

impl OpenAttempt {
    fn new(address: Address) -> Self {
        Self {
            address,
            cancel: CancellationToken::new(),
            published: Mutex::new(None),
        }
    }

    /// Publishes `connection` unless the request already resolved. Returns
    /// `false` if the caller must close it instead.
    fn publish(&self, bus: &TopicBus<Candidate>, connection: &SharedConnection) -> bool {
        let mut published = self.published.lock();
        if self.cancel.is_cancelled() {
            return false;
        }
        *published = Some(Arc::clone(connection));
        bus.publish(
            &self.address.topic(),
            Candidate::new(Arc::clone(connection), Origin::Opened),
        );
        true
    }

    /// Cancels the attempt and hands over the connection it published, if
    /// any.
    fn resolve(&self) -> Option<OwnedOpen> {
        let mut published = self.published.lock();
        self.cancel.cancel();
        published.take().map(|connection| OwnedOpen {
            address: self.address,
            connection: Some(connection),
        })
    }
}

impl Drop for OpenAttempt {
    fn drop(&mut self) {
        if let Some(connection) = self.published.get_mut().take() {
            tracing::debug!(address = %self.address, "request dropped before resolving, closing fresh connection");
            close_in_background(self.address, connection);
        }
    }
}

/// A connection opened for a request, closed on drop unless kept.
#[derive(Debug)]
struct OwnedOpen {
    address: Address,
    connection: Option<SharedConnection>,
}

impl OwnedOpen {
    /// Releases ownership if `returned` is this connection.
    fn keep_if_returned(&mut self, returned: &SharedConnection) {
        if self
            .connection
            .as_ref()
            .is_some_and(|own| same_connection(own, returned))
        {
            self.connection = None;
        }
    }
}

impl Drop for OwnedOpen {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            tracing::debug!(address = %self.address, "closing superseded fresh connection");
            close_in_background(self.address, connection);
        }
    }
}

impl LockedStore {
    /// Creates a store whose cache is pre-sized for `capacity` addresses.
    #[must_use]
    pub fn new(capacity: usize, factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            inner: Arc::new(Inner {
                cache: RwLock::new(HashMap::with_capacity(capacity)),
                bus: Arc::new(TopicBus::new()),
                factory,
                shut_down: CancellationToken::new(),
            }),
        }
    }

    /// Returns the number of cached connections.
    pub async fn len(&self) -> usize {
        self.inner.cache.read().await.len()
    }

    /// Returns `true` if nothing is cached.
    pub async fn is_empty(&self) -> bool {
        self.inner.cache.read().await.is_empty()
    }
}

impl Inner {
    async fn lookup(&self, address: Address) -> Option<SharedConnection> {
        self.cache.read().await.get(&address).map(Arc::clone)
    }

    async fn open_and_publish(&self, address: Address, attempt: Arc<OpenAttempt>) {
        let connection = self.factory.create(address);
        connection.open().await;

        if !attempt.publish(&self.bus, &connection) {
            tracing::debug!(%address, "request resolved during open, closing fresh connection");
            connection.close().await;
        }
    }

    async fn publish_cached(&self, address: Address, cancel: CancellationToken) {
        let Some(connection) = self.lookup(address).await else {
            return;
        };
        if !cancel.is_cancelled() {
            self.bus.publish(
                &address.topic(),
                Candidate::new(connection, Origin::Cached),
            );
        }
    }

    /// Re-reads the cache after a race and decides the connection to return.
    ///
    /// A cached entry always wins. Otherwise the candidate is returned, and
    /// written into the cache first if it was opened for this request.
    async fn settle(&self, address: Address, candidate: Candidate) -> Result<SharedConnection, CacheError> {
        if let Some(current) = self.lookup(address).await {
            return Ok(current);
        }
        if !candidate.origin.needs_cache_update() {
            return Ok(candidate.connection);
        }

        let mut cache = self.cache.write().await;
        if self.shut_down.is_cancelled() {
            return Err(CacheError::ShutDown);
        }
        // Another request may have installed a connection between the read
        // above and taking the write lock.
        if let Some(current) = cache.get(&address) {
            return Ok(Arc::clone(current));
        }
        cache.insert(address, Arc::clone(&candidate.connection));
        tracing::debug!(%address, "opened connection installed");
        Ok(candidate.connection)
    }
}

#[async_trait]
impl ConnectionStore for LockedStore {
    async fn get_connection(&self, address: Address) -> Result<SharedConnection, CacheError> {
        if self.inner.shut_down.is_cancelled() {
            return Err(CacheError::ShutDown);
        }

        let mut subscription = self.inner.bus.subscribe_scoped(address.topic());
        let attempt = Arc::new(OpenAttempt::new(address));
        let _cancel_on_drop = attempt.cancel.clone().drop_guard();

        let opener = Arc::clone(&self.inner);
        let open_attempt = Arc::clone(&attempt);
        tokio::spawn(async move { opener.open_and_publish(address, open_attempt).await });

        let reader = Arc::clone(&self.inner);
        let read_cancel = attempt.cancel.clone();
        tokio::spawn(async move { reader.publish_cached(address, read_cancel).await });

        let received = tokio::select! {
            candidate = subscription.recv() => candidate.ok_or(CacheError::ShutDown),
            () = self.inner.shut_down.cancelled() => Err(CacheError::ShutDown),
        };
        let mut own = attempt.resolve();
        drop(subscription);

        // The connection this request opened is closed unless it is the one
        // being returned, including when this future is dropped mid-settle.
        let settled = match received {
            Ok(candidate) => {
                tracing::trace!(%address, origin = ?candidate.origin, "request resolved");
                self.inner.settle(address, candidate).await
            }
            Err(err) => Err(err),
        };
        if let (Some(own), Ok(returned)) = (own.as_mut(), settled.as_ref()) {
            own.keep_if_returned(returned);
        }
        drop(own);

        settled
    }

    async fn on_new_remote_connection(
        &self,
        address: Address,
        connection: SharedConnection,
    ) -> Result<(), CacheError> {
        {
            let mut cache = self.inner.cache.write().await;
            if self.inner.shut_down.is_cancelled() {
                return Err(CacheError::ShutDown);
            }
            if let Some(previous) = cache.insert(address, Arc::clone(&connection))
                && !same_connection(&previous, &connection)
            {
                tracing::debug!(%address, "replacing cached connection");
                close_in_background(address, previous);
            }
        }

        let delivered = self.inner.bus.publish(
            &address.topic(),
            Candidate::new(connection, Origin::Remote),
        );
        tracing::debug!(%address, delivered, "remote connection installed");
        Ok(())
    }

    async fn run(&self) {
        tracing::debug!("locked store has no background loop");
    }

    async fn shutdown(&self) {
        let drained = {
            let mut cache = self.inner.cache.write().await;
            self.inner.shut_down.cancel();
            std::mem::take(&mut *cache)
        };
        let closed = close_all(drained).await;
        tracing::info!(closed, "locked store shut down");
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::domain::{Latency, SimulatedConnection, SimulatedFactory};
    use std::time::Duration;
    use tokio_test::{assert_pending, task};

    const OPEN: Duration = Duration::from_secs(5);
    const CLOSE: Duration = Duration::from_secs(1);

    fn latency() -> Latency {
        Latency::new(OPEN, CLOSE)
    }

    fn store() -> (LockedStore, Arc<SimulatedFactory>) {
        let factory = Arc::new(SimulatedFactory::new(latency()));
        let store = LockedStore::new(16, Arc::clone(&factory) as Arc<dyn ConnectionFactory>);
        (store, factory)
    }

    fn remote(address: Address) -> SharedConnection {
        Arc::new(SimulatedConnection::new_opened(address, latency()))
    }

    #[tokio::test(start_paused = true)]
    async fn opened_connection_is_cached() {
        let (store, _factory) = store();
        assert!(store.is_empty().await);

        let Ok(conn) = store.get_connection(Address::new(1)).await else {
            panic!("expected a connection");
        };
        assert!(conn.is_open());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_push_without_waiters_is_written_directly() {
        let (store, _factory) = store();
        let addr = Address::new(2);
        let conn = remote(addr);

        let Ok(()) = store.on_new_remote_connection(addr, Arc::clone(&conn)).await else {
            panic!("write failed");
        };
        assert_eq!(store.len().await, 1);

        let Ok(got) = store.get_connection(addr).await else {
            panic!("expected a connection");
        };
        assert!(same_connection(&got, &conn));
    }

    #[tokio::test(start_paused = true)]
    async fn double_check_prefers_entry_written_after_race() {
        let (store, _factory) = store();
        let addr = Address::new(3);
        let pushed = remote(addr);

        // Simulate a request whose own open won the race, while a remote
        // connection was installed before it could settle.
        let Ok(()) = store.on_new_remote_connection(addr, Arc::clone(&pushed)).await else {
            panic!("write failed");
        };
        let fresh = remote(addr);
        let settled = store
            .inner
            .settle(addr, Candidate::new(Arc::clone(&fresh), Origin::Opened))
            .await;
        let Ok(settled) = settled else {
            panic!("settle failed");
        };
        assert!(same_connection(&settled, &pushed));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cached_candidate_is_not_rewritten() {
        let (store, _factory) = store();
        let addr = Address::new(4);
        let conn = remote(addr);

        let settled = store
            .inner
            .settle(addr, Candidate::new(Arc::clone(&conn), Origin::Cached))
            .await;
        let Ok(settled) = settled else {
            panic!("settle failed");
        };
        assert!(same_connection(&settled, &conn));
        assert!(store.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn losing_open_is_closed() {
        let (store, factory) = store();
        let addr = Address::new(5);
        let requester = store.clone();
        let pending = tokio::spawn(async move { requester.get_connection(addr).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        let pushed = remote(addr);
        let Ok(()) = store.on_new_remote_connection(addr, Arc::clone(&pushed)).await else {
            panic!("write failed");
        };

        let Ok(Ok(got)) = pending.await else {
            panic!("request failed");
        };
        assert!(same_connection(&got, &pushed));

        tokio::time::sleep(OPEN + CLOSE * 2).await;
        assert_eq!(factory.created_for(addr), 1);
        assert!(factory.created().iter().all(|(_, conn)| !conn.is_open()));
    }

    #[test]
    fn open_attempt_rejects_publish_after_resolve() {
        let bus = TopicBus::new();
        let attempt = OpenAttempt::new(Address::new(6));
        let conn = remote(Address::new(6));

        assert!(attempt.resolve().is_none());
        assert!(!attempt.publish(&bus, &conn));
        assert!(attempt.resolve().is_none());
    }

    #[test]
    fn open_attempt_hands_published_connection_to_requester() {
        let bus = TopicBus::new();
        let attempt = OpenAttempt::new(Address::new(6));
        let conn = remote(Address::new(6));

        assert!(attempt.publish(&bus, &conn));
        let Some(mut own) = attempt.resolve() else {
            panic!("expected the published connection");
        };
        own.keep_if_returned(&conn);
        assert!(own.connection.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn unkept_fresh_connection_is_closed_on_drop() {
        let attempt = OpenAttempt::new(Address::new(6));
        let conn = remote(Address::new(6));
        assert!(attempt.publish(&TopicBus::new(), &conn));

        let Some(mut own) = attempt.resolve() else {
            panic!("expected the published connection");
        };
        own.keep_if_returned(&remote(Address::new(6)));
        drop(own);

        tokio::time::sleep(CLOSE * 2).await;
        assert!(!conn.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_request_closes_published_connection() {
        let (store, factory) = store();
        let addr = Address::new(8);

        let mut request = task::spawn(store.get_connection(addr));
        assert_pending!(request.poll());

        // The opener publishes while nobody polls the request.
        tokio::time::sleep(OPEN + Duration::from_millis(10)).await;
        drop(request);

        tokio::time::sleep(CLOSE * 2).await;
        assert_eq!(factory.created_for(addr), 1);
        assert!(factory.created().iter().all(|(_, conn)| !conn.is_open()));
        assert!(store.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn request_dropped_while_settling_closes_its_connection() {
        let (store, factory) = store();
        let addr = Address::new(9);

        let mut request = task::spawn(store.get_connection(addr));
        assert_pending!(request.poll());
        tokio::time::sleep(OPEN + Duration::from_millis(10)).await;

        // Hold the cache so the request blocks after resolving the race.
        let held = store.inner.cache.write().await;
        assert_pending!(request.poll());
        drop(request);
        drop(held);

        tokio::time::sleep(CLOSE * 2).await;
        assert_eq!(factory.created_for(addr), 1);
        assert!(factory.created().iter().all(|(_, conn)| !conn.is_open()));
        assert!(store.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_closes_cache_and_rejects_requests() {
        let (store, _factory) = store();
        let conns: Vec<_> = (1..=3).map(|raw| remote(Address::new(raw))).collect();
        for (raw, conn) in (1..=3).zip(&conns) {
            let Ok(()) = store
                .on_new_remote_connection(Address::new(raw), Arc::clone(conn))
                .await
            else {
                panic!("write failed");
            };
        }

        store.shutdown().await;
        assert!(store.is_empty().await);
        assert!(conns.iter().all(|conn| !conn.is_open()));

        assert_eq!(
            store
                .on_new_remote_connection(Address::new(1), remote(Address::new(1)))
                .await,
            Err(CacheError::ShutDown)
        );
        assert!(matches!(
            store.get_connection(Address::new(1)).await,
            Err(CacheError::ShutDown)
        ));
    }
}
