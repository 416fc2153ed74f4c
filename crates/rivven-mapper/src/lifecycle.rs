//! Connection lease lifecycle for rivven-mapper
//!
//! An operation starts idle and acquires a connection from the factory; the
//! [`ConnectionLease`] created for it then moves through
//! `Active → Releasing → Closed`. The lease is released exactly once,
//! whichever comes first of normal completion, an error or the consumer
//! dropping the result stream. A release interrupted by cancellation is run
//! again from the drop guard. Release is delegated to a
//! [`ReleaseStrategy`] chosen when the lease is created:
//!
//! - [`CloseConnection`]: close the raw connection (default)
//! - [`SuppressClose`]: leave the connection to the enclosing scope
//! - [`TransactionAwareRelease`]: let external transaction bookkeeping decide
//!
//! A release failure never hides the error that triggered the release; it is
//! logged and suppressed. With no primary error it becomes the operation's
//! error.

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::connection::{Connection, ConnectionFactory, ConnectionMetadata};
use crate::error::{Error, Result};

static NEXT_LEASE_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle state of a lease
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LeaseState {
    /// Connection handed to the operation
    Active = 0,
    /// Release strategy running
    Releasing = 1,
    /// Released
    Closed = 2,
}

impl LeaseState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Active,
            1 => Self::Releasing,
            _ => Self::Closed,
        }
    }
}

impl fmt::Display for LeaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Releasing => write!(f, "releasing"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

// ============================================================================
// Release strategies
// ============================================================================

/// How a lease gives its connection back
#[async_trait]
pub trait ReleaseStrategy: Send + Sync {
    /// Release the connection
    async fn release(&self, connection: &dyn Connection) -> Result<()>;

    /// Strategy name for diagnostics
    fn name(&self) -> &'static str;
}

/// Close the raw connection
#[derive(Debug, Clone, Copy, Default)]
pub struct CloseConnection;

#[async_trait]
impl ReleaseStrategy for CloseConnection {
    async fn release(&self, connection: &dyn Connection) -> Result<()> {
        connection.close().await
    }

    fn name(&self) -> &'static str {
        "close"
    }
}

/// Leave the connection open for the scope that owns it
#[derive(Debug, Clone, Copy, Default)]
pub struct SuppressClose;

#[async_trait]
impl ReleaseStrategy for SuppressClose {
    async fn release(&self, _connection: &dyn Connection) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "suppress-close"
    }
}

/// What external transaction bookkeeping reported on release
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// An external transaction still uses the connection
    TransactionActive,
    /// No external transaction; the raw connection may be closed
    NoTransaction,
}

/// Externally managed transactional resources
#[async_trait]
pub trait TransactionResources: Send + Sync {
    /// Hand the connection back to the resource's own bookkeeping
    async fn release(&self, connection: &dyn Connection) -> Result<ReleaseOutcome>;
}

/// Delegate to [`TransactionResources`], closing only outside a transaction
#[derive(Clone)]
pub struct TransactionAwareRelease {
    resources: Arc<dyn TransactionResources>,
}

impl TransactionAwareRelease {
    /// Create the strategy
    pub fn new(resources: Arc<dyn TransactionResources>) -> Self {
        Self { resources }
    }
}

#[async_trait]
impl ReleaseStrategy for TransactionAwareRelease {
    async fn release(&self, connection: &dyn Connection) -> Result<()> {
        match self.resources.release(connection).await? {
            ReleaseOutcome::TransactionActive => {
                trace!("Connection kept open for active external transaction");
                Ok(())
            }
            ReleaseOutcome::NoTransaction => connection.close().await,
        }
    }

    fn name(&self) -> &'static str {
        "transaction-aware"
    }
}

// ============================================================================
// Lease
// ============================================================================

struct LeaseInner {
    id: u64,
    connection: Arc<dyn Connection>,
    strategy: Arc<dyn ReleaseStrategy>,
    state: AtomicU8,
    // set once the release strategy has run to completion
    released: AtomicBool,
    release_lock: tokio::sync::Mutex<()>,
    released_externally: AtomicBool,
    // shared between a transaction and the leases scoped inside it
    dirty: Arc<AtomicBool>,
}

/// Exclusive ownership of one connection for one operation.
///
/// Cloning shares the same lease; release happens once across all clones.
#[derive(Clone)]
pub struct ConnectionLease {
    inner: Arc<LeaseInner>,
}

impl ConnectionLease {
    /// Lease `connection`, released with `strategy`
    pub fn new(connection: Arc<dyn Connection>, strategy: Arc<dyn ReleaseStrategy>) -> Self {
        Self::with_dirty_flag(connection, strategy, Arc::new(AtomicBool::new(false)))
    }

    fn with_dirty_flag(
        connection: Arc<dyn Connection>,
        strategy: Arc<dyn ReleaseStrategy>,
        dirty: Arc<AtomicBool>,
    ) -> Self {
        let id = NEXT_LEASE_ID.fetch_add(1, Ordering::Relaxed);
        trace!(lease = id, strategy = strategy.name(), "Lease active");
        Self {
            inner: Arc::new(LeaseInner {
                id,
                connection,
                strategy,
                state: AtomicU8::new(LeaseState::Active as u8),
                released: AtomicBool::new(false),
                release_lock: tokio::sync::Mutex::new(()),
                released_externally: AtomicBool::new(false),
                dirty,
            }),
        }
    }

    /// A lease on the same connection whose release leaves it open.
    ///
    /// Mutations through the scoped lease mark this lease dirty.
    pub fn scoped(&self) -> Self {
        Self::with_dirty_flag(
            self.inner.connection.clone(),
            Arc::new(SuppressClose),
            self.inner.dirty.clone(),
        )
    }

    /// Lease id, for diagnostics
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The leased connection
    pub fn connection(&self) -> &dyn Connection {
        self.inner.connection.as_ref()
    }

    /// Identity of the leased connection's database
    pub fn metadata(&self) -> ConnectionMetadata {
        self.inner.connection.metadata()
    }

    /// Current lifecycle state
    pub fn state(&self) -> LeaseState {
        LeaseState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    fn transition(&self, state: LeaseState) {
        let previous = LeaseState::from_u8(self.inner.state.swap(state as u8, Ordering::AcqRel));
        trace!(lease = self.inner.id, from = %previous, to = %state, "Lease state");
    }

    /// Whether the lease has been released
    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }

    /// Record that a mutating statement ran on this lease
    pub fn mark_mutated(&self) {
        self.inner.dirty.store(true, Ordering::Release);
    }

    /// Whether a mutating statement ran since the last commit/rollback
    pub fn is_dirty(&self) -> bool {
        self.inner.dirty.load(Ordering::Acquire)
    }

    /// Record that the caller already released the connection itself.
    ///
    /// Release then only finishes the lease without touching the connection.
    pub fn mark_released_externally(&self) {
        self.inner.released_externally.store(true, Ordering::Release);
    }

    /// Begin a transaction on the leased connection
    pub async fn begin(&self) -> Result<()> {
        self.inner.connection.begin().await
    }

    /// Commit when `force` is set or a mutating statement ran
    pub async fn commit(&self, force: bool) -> Result<()> {
        if !force && !self.is_dirty() {
            trace!(lease = self.inner.id, "Commit skipped, nothing to commit");
            return Ok(());
        }
        self.inner.connection.commit().await?;
        self.inner.dirty.store(false, Ordering::Release);
        debug!(lease = self.inner.id, force, "Committed");
        Ok(())
    }

    /// Roll back when `force` is set or a mutating statement ran
    pub async fn rollback(&self, force: bool) -> Result<()> {
        if !force && !self.is_dirty() {
            trace!(lease = self.inner.id, "Rollback skipped, nothing to roll back");
            return Ok(());
        }
        self.inner.connection.rollback().await?;
        self.inner.dirty.store(false, Ordering::Release);
        debug!(lease = self.inner.id, force, "Rolled back");
        Ok(())
    }

    /// Run the release strategy; calls after it completed are no-ops.
    ///
    /// Concurrent calls are serialized. A call dropped before the strategy
    /// completes leaves the lease unreleased, so a later call runs it again.
    pub async fn release(&self) -> Result<()> {
        if self.is_released() {
            return Ok(());
        }
        let _serial = self.inner.release_lock.lock().await;
        if self.is_released() {
            return Ok(());
        }

        self.transition(LeaseState::Releasing);
        let result = if self.inner.released_externally.load(Ordering::Acquire) {
            Ok(())
        } else {
            self.inner
                .strategy
                .release(self.inner.connection.as_ref())
                .await
        };
        self.inner.released.store(true, Ordering::Release);
        self.transition(LeaseState::Closed);
        result
    }
}

impl fmt::Debug for ConnectionLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionLease")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("strategy", &self.inner.strategy.name())
            .field("dirty", &self.is_dirty())
            .finish()
    }
}

// ============================================================================
// Guard
// ============================================================================

/// Releases its lease when dropped before being settled
pub(crate) struct LeaseGuard {
    lease: Option<ConnectionLease>,
    transactional: bool,
}

impl LeaseGuard {
    pub(crate) fn new(lease: ConnectionLease, transactional: bool) -> Self {
        Self {
            lease: Some(lease),
            transactional,
        }
    }

    /// Give up ownership without releasing
    pub(crate) fn disarm(mut self) {
        self.lease = None;
    }

    /// End a transactional lease, then release. `outcome` is the primary result.
    ///
    /// The guard keeps the lease until release completes; dropping this
    /// future earlier hands the lease to [`Drop`].
    pub(crate) async fn settle<R>(mut self, outcome: Result<R>) -> Result<R> {
        let Some(lease) = self.lease.clone() else {
            return outcome;
        };

        let outcome = if self.transactional {
            match outcome {
                Ok(value) => lease.commit(false).await.map(|_| value),
                Err(e) => {
                    if let Err(rollback) = lease.rollback(false).await {
                        warn!(lease = lease.id(), error = %rollback, "Suppressed rollback failure");
                    }
                    Err(e)
                }
            }
        } else {
            outcome
        };

        let released = lease.release().await;
        self.lease = None;

        match (outcome, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(release)) => Err(release),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(release)) => {
                warn!(lease = lease.id(), error = %release, "Suppressed connection release failure");
                Err(e)
            }
        }
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        let Some(lease) = self.lease.take() else {
            return;
        };
        if lease.is_released() {
            return;
        }
        let transactional = self.transactional;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    debug!(lease = lease.id(), "Operation cancelled, releasing connection");
                    if transactional {
                        if let Err(e) = lease.rollback(false).await {
                            warn!(lease = lease.id(), error = %e, "Rollback after cancellation failed");
                        }
                    }
                    if let Err(e) = lease.release().await {
                        warn!(lease = lease.id(), error = %e, "Release after cancellation failed");
                    }
                });
            }
            Err(_) => {
                warn!(lease = lease.id(), "No runtime to release cancelled lease");
            }
        }
    }
}

// ============================================================================
// Manager
// ============================================================================

#[derive(Clone)]
enum LeaseSource {
    Factory(Arc<dyn ConnectionFactory>),
    Shared(ConnectionLease),
}

/// Acquires leases and guarantees their release
#[derive(Clone)]
pub struct LifecycleManager {
    source: LeaseSource,
    strategy: Arc<dyn ReleaseStrategy>,
    auto_commit: bool,
}

impl LifecycleManager {
    /// Manager opening a new connection per operation
    pub fn new(factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            source: LeaseSource::Factory(factory),
            strategy: Arc::new(CloseConnection),
            auto_commit: true,
        }
    }

    /// Manager running every operation on `lease`, leaving it open
    pub fn scoped(lease: ConnectionLease) -> Self {
        Self {
            source: LeaseSource::Shared(lease),
            strategy: Arc::new(SuppressClose),
            auto_commit: true,
        }
    }

    /// Use `strategy` to release new connections
    pub fn with_strategy(mut self, strategy: Arc<dyn ReleaseStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    /// Without auto-commit each operation runs in its own transaction
    pub fn with_auto_commit(mut self, auto_commit: bool) -> Self {
        self.auto_commit = auto_commit;
        self
    }

    /// Whether operations run on a lease owned by an enclosing scope
    pub fn is_scoped(&self) -> bool {
        matches!(self.source, LeaseSource::Shared(_))
    }

    fn transactional(&self) -> bool {
        !self.auto_commit && matches!(self.source, LeaseSource::Factory(_))
    }

    /// Metadata of the database the manager leases from
    pub fn metadata(&self) -> ConnectionMetadata {
        match &self.source {
            LeaseSource::Factory(factory) => factory.metadata(),
            LeaseSource::Shared(lease) => lease.metadata(),
        }
    }

    /// Acquire an active lease
    pub async fn acquire(&self) -> Result<ConnectionLease> {
        let factory = match &self.source {
            LeaseSource::Shared(lease) => {
                if lease.is_released() {
                    return Err(Error::transaction("transaction scope already closed"));
                }
                return Ok(lease.scoped());
            }
            LeaseSource::Factory(factory) => factory,
        };

        trace!("Acquiring connection");
        let connection: Arc<dyn Connection> = Arc::from(factory.connect().await?);
        let lease = ConnectionLease::new(connection, self.strategy.clone());

        if self.transactional() {
            let guard = LeaseGuard::new(lease.clone(), false);
            if let Err(e) = lease.begin().await {
                return guard.settle(Err(e)).await;
            }
            guard.disarm();
        }
        Ok(lease)
    }

    /// Run `action` on a fresh lease and release it afterwards.
    ///
    /// Dropping the returned future mid-flight still releases the lease.
    pub async fn run<R, F, Fut>(&self, action: F) -> Result<R>
    where
        F: FnOnce(ConnectionLease) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let lease = self.acquire().await?;
        let guard = LeaseGuard::new(lease.clone(), self.transactional());
        let outcome = action(lease).await;
        guard.settle(outcome).await
    }

    /// Run a streaming `action` on a fresh lease.
    ///
    /// The lease is released when the inner stream ends, fails, or when the
    /// returned stream is dropped.
    pub fn stream<T, F, Fut>(&self, action: F) -> BoxStream<'static, Result<T>>
    where
        T: Send + 'static,
        F: FnOnce(ConnectionLease) -> Fut + Send + 'static,
        Fut: Future<Output = Result<BoxStream<'static, Result<T>>>> + Send + 'static,
    {
        let manager = self.clone();
        let stream = async_stream::stream! {
            let lease = match manager.acquire().await {
                Ok(lease) => lease,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            let guard = LeaseGuard::new(lease.clone(), manager.transactional());

            let mut inner = match action(lease).await {
                Ok(inner) => inner,
                Err(e) => {
                    if let Err(e) = guard.settle::<()>(Err(e)).await {
                        yield Err(e);
                    }
                    return;
                }
            };

            let mut failure = None;
            while let Some(item) = inner.next().await {
                match item {
                    Ok(value) => yield Ok(value),
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
            drop(inner);

            let outcome = match failure {
                Some(e) => Err(e),
                None => Ok(()),
            };
            if let Err(e) = guard.settle(outcome).await {
                yield Err(e);
            }
        };
        Box::pin(stream)
    }
}

impl fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let source = match &self.source {
            LeaseSource::Factory(_) => "factory",
            LeaseSource::Shared(_) => "shared",
        };
        f.debug_struct("LifecycleManager")
            .field("source", &source)
            .field("strategy", &self.strategy.name())
            .field("auto_commit", &self.auto_commit)
            .finish()
    }
}
