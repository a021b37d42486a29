//! Store whose cache is owned by a single command loop.
//!
//! [`CommandLoopStore`] never shares its cache. Every lookup and every write
//! is a [`Command`] sent over a bounded queue to the task running
//! [`ConnectionStore::run`], which executes commands one at a time and
//! acknowledges each through a oneshot channel. Cache mutations are therefore
//! totally ordered, and a full queue makes submitters wait.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::{Candidate, ConnectionStore, Origin, close_all};
use crate::domain::connection::close_in_background;
use crate::domain::{
    Address, Connection, ConnectionFactory, SharedConnection, TopicBus, same_connection,
};
use crate::error::CacheError;

/// A pending cache operation, consumed exactly once by the loop.
#[derive(Debug)]
enum Command {
    /// Publish the cached connection for `address`, if any. Acknowledged
    /// with whether one was found.
    Read {
        address: Address,
        ack: oneshot::Sender<bool>,
    },
    /// Install `connection` for `address` and publish it. Acknowledged with
    /// whether it was installed.
    Write {
        address: Address,
        connection: SharedConnection,
        origin: Origin,
        ack: oneshot::Sender<bool>,
    },
}

/// Connection store backed by a serialized command loop.
///
/// Cloning is cheap and yields another handle to the same store. The loop
/// must be driven by calling [`ConnectionStore::run`] on some task before
/// any request can complete.
///
/// # Example
///
/// ```no_run
/// # async fn demo() -> Result<(), peer_conn_cache::error::CacheError> {
/// use std::sync::Arc;
/// use peer_conn_cache::domain::{Address, Connection, SimulatedFactory};
/// use peer_conn_cache::store::{CommandLoopStore, ConnectionStore};
///
/// let store = CommandLoopStore::new(1024, Arc::new(SimulatedFactory::default()));
/// let runner = store.clone();
/// tokio::spawn(async move { runner.run().await });
///
/// let conn = store.get_connection(Address::new(123)).await?;
/// assert!(conn.is_open());
/// store.shutdown().await;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct CommandLoopStore {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    capacity: usize,
    commands: mpsc::Sender<Command>,
    /// Receiving half of the queue until the loop (or shutdown) claims it.
    queue: Mutex<Option<mpsc::Receiver<Command>>>,
    bus: Arc<TopicBus<Candidate>>,
    factory: Arc<dyn ConnectionFactory>,
    shutdown: CancellationToken,
    stopped: CancellationToken,
}

impl CommandLoopStore {
    /// Creates a store whose cache is pre-sized for `capacity` addresses and
    /// whose command queue holds up to `capacity` commands (at least one).
    #[must_use]
    pub fn new(capacity: usize, factory: Arc<dyn ConnectionFactory>) -> Self {
        let (commands, queue) = mpsc::channel(capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                capacity,
                commands,
                queue: Mutex::new(Some(queue)),
                bus: Arc::new(TopicBus::new()),
                factory,
                shutdown: CancellationToken::new(),
                stopped: CancellationToken::new(),
            }),
        }
    }

    /// Returns the number of commands waiting in the queue.
    #[must_use]
    pub fn queued_commands(&self) -> usize {
        self.inner
            .commands
            .max_capacity()
            .saturating_sub(self.inner.commands.capacity())
    }

    /// Returns `true` once the loop has stopped and the cache is closed.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.is_cancelled()
    }
}

impl Inner {
    /// Enqueues a command and waits for the loop to acknowledge it.
    async fn submit<R>(
        &self,
        command: impl FnOnce(oneshot::Sender<R>) -> Command,
    ) -> Result<R, CacheError> {
        if self.shutdown.is_cancelled() {
            return Err(CacheError::ShutDown);
        }
        let (ack, acked) = oneshot::channel();
        self.commands
            .send(command(ack))
            .await
            .map_err(|_| CacheError::ShutDown)?;
        acked.await.map_err(|_| CacheError::ShutDown)
    }

    async fn read(&self, address: Address) -> Result<bool, CacheError> {
        self.submit(|ack| Command::Read { address, ack }).await
    }

    async fn write(
        &self,
        address: Address,
        connection: SharedConnection,
        origin: Origin,
    ) -> Result<bool, CacheError> {
        self.submit(|ack| Command::Write {
            address,
            connection,
            origin,
            ack,
        })
        .await
    }

    /// Opens a fresh connection and offers it to the loop unless the request
    /// resolved meanwhile. A connection that is not installed is closed.
    async fn open_and_offer(&self, address: Address, cancel: CancellationToken) {
        let connection = self.factory.create(address);
        connection.open().await;

        if cancel.is_cancelled() {
            tracing::debug!(%address, "request resolved during open, closing fresh connection");
            connection.close().await;
            return;
        }

        match self
            .write(address, Arc::clone(&connection), Origin::Opened)
            .await
        {
            Ok(true) => tracing::debug!(%address, "opened connection installed"),
            Ok(false) => {
                tracing::debug!(%address, "address already served, closing fresh connection");
                connection.close().await;
            }
            Err(err) => {
                tracing::debug!(%address, %err, "opened connection not installed");
                connection.close().await;
            }
        }
    }
}

/// State owned by the running loop.
struct CommandLoop {
    cache: HashMap<Address, SharedConnection>,
    bus: Arc<TopicBus<Candidate>>,
}

impl CommandLoop {
    fn execute(&mut self, command: Command) {
        match command {
            Command::Read { address, ack } => {
                let found = match self.cache.get(&address) {
                    Some(conn) => {
                        let candidate = Candidate::new(Arc::clone(conn), Origin::Cached);
                        self.bus.publish(&address.topic(), candidate);
                        true
                    }
                    None => false,
                };
                let _ = ack.send(found);
            }
            Command::Write {
                address,
                connection,
                origin,
                ack,
            } => {
                let installed = self.install(address, connection, origin);
                let _ = ack.send(installed);
            }
        }
    }

    /// Installs `connection` and publishes it.
    ///
    /// A locally opened connection only fills a vacant address; if the address
    /// is already served, the current entry is published instead and `false`
    /// is returned. Remote connections always replace the current entry, which
    /// is closed in the background.
    fn install(&mut self, address: Address, connection: SharedConnection, origin: Origin) -> bool {
        let topic = address.topic();

        if origin == Origin::Opened
            && let Some(current) = self.cache.get(&address)
        {
            self.bus
                .publish(&topic, Candidate::new(Arc::clone(current), Origin::Cached));
            return false;
        }

        if let Some(previous) = self.cache.insert(address, Arc::clone(&connection))
            && !same_connection(&previous, &connection)
        {
            tracing::debug!(%address, "replacing cached connection");
            close_in_background(address, previous);
        }

        let delivered = self.bus.publish(&topic, Candidate::new(connection, origin));
        tracing::debug!(%address, ?origin, delivered, "connection installed");
        true
    }
}

#[async_trait]
impl ConnectionStore for CommandLoopStore {
    async fn get_connection(&self, address: Address) -> Result<SharedConnection, CacheError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(CacheError::ShutDown);
        }

        let mut subscription = self.inner.bus.subscribe_scoped(address.topic());
        let cancel = CancellationToken::new();
        let _cancel_on_drop = cancel.clone().drop_guard();

        let reader = Arc::clone(&self.inner);
        tokio::spawn(async move {
            if let Err(err) = reader.read(address).await {
                tracing::debug!(%address, %err, "cache read not processed");
            }
        });

        let opener = Arc::clone(&self.inner);
        let open_cancel = cancel.clone();
        tokio::spawn(async move { opener.open_and_offer(address, open_cancel).await });

        let resolved = tokio::select! {
            candidate = subscription.recv() => candidate.ok_or(CacheError::ShutDown),
            () = self.inner.shutdown.cancelled() => Err(CacheError::ShutDown),
        };
        cancel.cancel();
        drop(subscription);

        let candidate = resolved?;
        tracing::trace!(%address, origin = ?candidate.origin, "request resolved");
        Ok(candidate.connection)
    }

    async fn on_new_remote_connection(
        &self,
        address: Address,
        connection: SharedConnection,
    ) -> Result<(), CacheError> {
        self.inner
            .write(address, connection, Origin::Remote)
            .await
            .map(|_| ())
    }

    async fn run(&self) {
        let queue = self.inner.queue.lock().take();
        let Some(mut queue) = queue else {
            tracing::warn!("command loop already started or store shut down");
            return;
        };

        let mut state = CommandLoop {
            cache: HashMap::with_capacity(self.inner.capacity),
            bus: Arc::clone(&self.inner.bus),
        };
        tracing::info!(capacity = self.inner.capacity, "command loop started");

        loop {
            tokio::select! {
                biased;
                () = self.inner.shutdown.cancelled() => break,
                command = queue.recv() => match command {
                    Some(command) => state.execute(command),
                    None => break,
                },
            }
        }

        // Commands still queued are dropped unprocessed; their submitters
        // observe `ShutDown` through the dropped acknowledgement.
        queue.close();
        let mut discarded = 0usize;
        while queue.try_recv().is_ok() {
            discarded += 1;
        }

        let closed = close_all(std::mem::take(&mut state.cache)).await;
        tracing::info!(closed, discarded, "command loop stopped");
        self.inner.stopped.cancel();
    }

    async fn shutdown(&self) {
        self.inner.shutdown.cancel();

        let unclaimed = self.inner.queue.lock().take();
        if let Some(queue) = unclaimed {
            // The loop never ran, so nothing was cached.
            drop(queue);
            self.inner.stopped.cancel();
            tracing::info!("store shut down before its loop started");
            return;
        }

        self.inner.stopped.cancelled().await;
    }
}
