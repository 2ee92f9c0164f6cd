//! Connection pool implementation

use std::collections::VecDeque;
use std::future::Future;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tidepool_core::{PoolError, PoolResult, RawConnection};
use tokio::sync::{Notify, OnceCell, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::PoolConfig;
use crate::connection::PoolConnection;
use crate::stats::PoolStats;

/// Delay between opportunistic factory retries while an acquire deadline
/// still has time left.
const CREATE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Floor for the background sweep period so a zero-length trust window
/// does not turn the sweeper into a busy loop.
const SWEEP_MIN_PERIOD: Duration = Duration::from_millis(10);

/// Factory trait for creating new raw connections
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    /// Open a new raw connection to the backing store
    async fn connect(&self) -> PoolResult<Arc<dyn RawConnection>>;

    /// Hook run once on every newly created connection before it enters
    /// the pool (e.g. to apply session pragmas).
    ///
    /// Default implementation is a no-op.
    async fn on_create(&self, _conn: &dyn RawConnection) -> PoolResult<()> {
        Ok(())
    }
}

#[async_trait]
impl<T: ConnectionFactory> ConnectionFactory for Arc<T> {
    async fn connect(&self) -> PoolResult<Arc<dyn RawConnection>> {
        (**self).connect().await
    }

    async fn on_create(&self, conn: &dyn RawConnection) -> PoolResult<()> {
        (**self).on_create(conn).await
    }
}

/// Shared pool state behind the `ConnectionPool` handle
struct PoolInner {
    /// Pool configuration
    config: PoolConfig,
    /// Connection factory
    factory: Arc<dyn ConnectionFactory>,
    /// Idle connections, oldest first
    idle: Mutex<VecDeque<PoolConnection>>,
    /// Semaphore bounding concurrent borrowers
    semaphore: Arc<Semaphore>,
    /// Notified whenever a connection is requeued or a slot frees up
    idle_notify: Notify,
    /// Number of live connections (idle + borrowed + mid-creation)
    live: AtomicUsize,
    /// Number of connections currently borrowed
    checked_out: AtomicUsize,
    /// Number of callers inside `acquire`
    waiting: AtomicUsize,
    /// One-way shutdown latch
    closed: AtomicBool,
    /// Warm-up runs exactly once, on first use
    warmup: OnceCell<()>,
    /// Background idle sweeper, spawned at warm-up
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

/// A bounded pool of database connections
///
/// Hands out exclusive, verified-healthy connections to concurrent
/// callers. A caller gets a connection by:
///
/// 1. Reusing an idle connection (probed first unless it was used
///    recently enough to fall inside the trust window)
/// 2. Creating a new connection while under `max_size`
/// 3. Waiting, bounded by `connect_timeout`, for another caller's release
///
/// Waiters are not served in strict FIFO order: any free caller may
/// opportunistically claim a newly idle connection. The guarantee is
/// "served eventually or time out", which trades fairness for latency.
///
/// The pool handle is cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Create a new connection pool with the given configuration and factory
    ///
    /// No connections are opened here; warm-up happens on first use.
    pub fn new<F: ConnectionFactory>(config: PoolConfig, factory: F) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_size()));
        Self {
            inner: Arc::new(PoolInner {
                config,
                factory: Arc::new(factory),
                idle: Mutex::new(VecDeque::new()),
                semaphore,
                idle_notify: Notify::new(),
                live: AtomicUsize::new(0),
                checked_out: AtomicUsize::new(0),
                waiting: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                warmup: OnceCell::new(),
                sweeper: Mutex::new(None),
            }),
        }
    }

    /// Acquire a connection from the pool
    ///
    /// Returns a connection that is known healthy at hand-off time, or
    /// fails with `PoolError::ConnectTimeout` when the pool stayed at
    /// capacity for the whole `connect_timeout`, or with
    /// `PoolError::PoolClosed` after `close()`.
    #[tracing::instrument(skip(self))]
    pub async fn acquire(&self) -> PoolResult<PooledConnection> {
        let inner = &self.inner;

        if inner.closed.load(Ordering::SeqCst) {
            return Err(PoolError::PoolClosed);
        }

        inner.ensure_warm().await;

        let started = Instant::now();
        let deadline = started + inner.config.connect_timeout();
        let _waiting = WaitingGuard::new(&inner.waiting);

        // One permit per borrower bounds checked-out connections.
        let remaining = deadline.saturating_duration_since(Instant::now());
        let permit = match tokio::time::timeout(
            remaining,
            Arc::clone(&inner.semaphore).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(PoolError::PoolClosed),
            Err(_) => {
                return Err(PoolError::ConnectTimeout {
                    waited: started.elapsed(),
                });
            }
        };

        loop {
            if inner.closed.load(Ordering::SeqCst) {
                return Err(PoolError::PoolClosed);
            }

            // Register for wakeups before looking at the queue so a
            // release between the check and the wait is not missed.
            let notified = inner.idle_notify.notified();

            if let Some(conn) = inner.next_idle_candidate(deadline).await {
                return Ok(inner.hand_out(conn, permit));
            }

            if Instant::now() >= deadline {
                return Err(PoolError::ConnectTimeout {
                    waited: started.elapsed(),
                });
            }

            if inner.try_reserve_slot() {
                let slot = SlotGuard::new(inner);
                match inner.create_connection().await {
                    Ok(conn) => {
                        slot.disarm();
                        return Ok(inner.hand_out(conn, permit));
                    }
                    Err(e) => {
                        drop(slot);
                        tracing::warn!(error = %e, "connection creation failed; retrying until deadline");
                        let backoff = CREATE_RETRY_DELAY
                            .min(deadline.saturating_duration_since(Instant::now()));
                        tokio::time::sleep(backoff).await;
                    }
                }
            } else {
                // At capacity with nothing idle: wait for a release or a
                // retirement to free something up.
                let remaining = deadline.saturating_duration_since(Instant::now());
                let _ = tokio::time::timeout(remaining, notified).await;
            }
        }
    }

    /// Run a closure against a pooled connection, releasing it on every
    /// exit path
    ///
    /// The connection is acquired on entry and released exactly once: on
    /// normal return, on error, and (via the guard) on panic or
    /// cancellation.
    pub async fn with_connection<T, F, Fut>(&self, f: F) -> PoolResult<T>
    where
        F: FnOnce(Arc<dyn RawConnection>) -> Fut,
        Fut: Future<Output = PoolResult<T>>,
    {
        let conn = self.acquire().await?;
        let raw = Arc::clone(conn.raw());
        let result = f(raw).await;
        conn.release().await;
        result
    }

    /// Number of live connections (idle + borrowed)
    pub fn size(&self) -> usize {
        self.inner.live.load(Ordering::SeqCst)
    }

    /// Number of connections currently borrowed
    pub fn checked_out(&self) -> usize {
        self.inner.checked_out.load(Ordering::SeqCst)
    }

    /// Whether `close()` has been called
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Get the pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Get current pool statistics
    pub fn stats(&self) -> PoolStats {
        let idle = self.inner.idle.lock().len();
        PoolStats::new(
            self.inner.live.load(Ordering::SeqCst),
            idle,
            self.inner.checked_out.load(Ordering::SeqCst),
            self.inner.waiting.load(Ordering::SeqCst),
        )
    }

    /// Close the pool
    ///
    /// One-way: sets the shutdown latch, closes all idle connections
    /// concurrently, then waits, bounded by `operation_timeout`, for
    /// in-flight borrows to come home. Borrows that do not return in time
    /// are abandoned; their release path still force-closes them when the
    /// guard drops. Subsequent `acquire()` calls fail with `PoolClosed`.
    #[tracing::instrument(skip(self))]
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("closing connection pool");

        if let Some(handle) = self.inner.sweeper.lock().take() {
            handle.abort();
        }

        // Wake queued acquires so they observe the latch.
        self.inner.idle_notify.notify_waiters();

        let drained: Vec<PoolConnection> = { self.inner.idle.lock().drain(..).collect() };
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), "closing idle connections");
            futures::future::join_all(drained.into_iter().map(|c| self.inner.retire(c))).await;
        }

        // Claiming every borrow permit proves all borrows were released;
        // the release path force-closes each one once the latch is set.
        let all = self.inner.config.max_size() as u32;
        let wait = tokio::time::timeout(
            self.inner.config.operation_timeout(),
            Arc::clone(&self.inner.semaphore).acquire_many_owned(all),
        )
        .await;
        match wait {
            Ok(Ok(permits)) => drop(permits),
            Ok(Err(_)) => {}
            Err(_) => {
                tracing::warn!(
                    checked_out = self.inner.checked_out.load(Ordering::SeqCst),
                    "pool closed with connections still checked out; they close on release"
                );
            }
        }

        self.inner.semaphore.close();
        tracing::info!("connection pool closed");
    }
}

impl PoolInner {
    /// Run warm-up exactly once, on first use. Concurrent first acquires
    /// all await its completion, which also keeps `size()` within
    /// `max_size` during warm-up.
    async fn ensure_warm(self: &Arc<Self>) {
        self.warmup
            .get_or_init(|| async {
                self.spawn_sweeper();
                self.warm_up().await;
            })
            .await;
    }

    async fn warm_up(&self) {
        let target = self.config.min_size();
        if target == 0 {
            return;
        }
        let results = futures::future::join_all((0..target).map(|_| self.warm_one())).await;
        let created = results.into_iter().filter(|ok| *ok).count();
        tracing::debug!(created, target, "pool warm-up complete");
    }

    /// Create one warm connection. Failures are logged, never fatal.
    async fn warm_one(&self) -> bool {
        if !self.try_reserve_slot_below(self.config.min_size()) {
            return false;
        }
        let slot = SlotGuard::new(self);
        match self.create_connection().await {
            Ok(conn) => {
                slot.disarm();
                self.idle.lock().push_back(conn);
                self.idle_notify.notify_waiters();
                true
            }
            Err(e) => {
                drop(slot);
                tracing::warn!(error = %e, "warm-up connection creation failed");
                false
            }
        }
    }

    fn spawn_sweeper(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let period = self.config.health_check_interval().max(SWEEP_MIN_PERIOD);
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; a fresh pool has nothing
            // worth sweeping yet.
            tick.tick().await;
            loop {
                tick.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                if inner.closed.load(Ordering::SeqCst) {
                    break;
                }
                inner.sweep().await;
            }
        });
        *self.sweeper.lock() = Some(handle);
    }

    /// Retire idle-expired connections and top the pool back up to its
    /// warm floor.
    async fn sweep(&self) {
        let stale = {
            let mut idle = self.idle.lock();
            let mut keep = VecDeque::with_capacity(idle.len());
            let mut stale = Vec::new();
            while let Some(conn) = idle.pop_front() {
                if conn
                    .idle_for()
                    .is_some_and(|d| d >= self.config.idle_timeout())
                {
                    stale.push(conn);
                } else {
                    keep.push_back(conn);
                }
            }
            *idle = keep;
            stale
        };
        if !stale.is_empty() {
            tracing::debug!(count = stale.len(), "retiring idle-expired connections");
            futures::future::join_all(stale.into_iter().map(|c| self.retire(c))).await;
        }

        while !self.closed.load(Ordering::SeqCst)
            && self.try_reserve_slot_below(self.config.min_size())
        {
            let slot = SlotGuard::new(self);
            match self.create_connection().await {
                Ok(conn) => {
                    slot.disarm();
                    self.idle.lock().push_back(conn);
                    self.idle_notify.notify_waiters();
                }
                Err(e) => {
                    drop(slot);
                    tracing::warn!(error = %e, "top-up connection creation failed");
                    break;
                }
            }
        }
    }

    /// Pop idle connections until one passes the health policy.
    ///
    /// Entries past `idle_timeout` are retired. Entries inside the trust
    /// window are handed out without a probe. Everything else gets an
    /// active ping bounded by `operation_timeout`; failures retire the
    /// candidate and move on to the next.
    ///
    /// The popped entry rides in a guard so a caller cancelled mid-probe
    /// puts it back instead of dropping it on the floor.
    async fn next_idle_candidate(&self, deadline: Instant) -> Option<PoolConnection> {
        loop {
            let popped = { self.idle.lock().pop_front() }?;
            let mut candidate = CandidateGuard::new(self, popped);

            if candidate
                .get()
                .idle_for()
                .is_some_and(|d| d >= self.config.idle_timeout())
            {
                tracing::debug!(id = %candidate.get().id(), "idle timeout exceeded; retiring connection");
                self.retire(candidate.take()).await;
                continue;
            }

            if candidate
                .get()
                .idle_for()
                .is_some_and(|d| d < self.config.health_check_interval())
            {
                return Some(candidate.take());
            }

            if Instant::now() >= deadline {
                // Out of time; the guard requeues it for the next caller.
                return None;
            }

            if candidate
                .get_mut()
                .is_alive(self.config.operation_timeout())
                .await
            {
                return Some(candidate.take());
            }
            tracing::debug!(id = %candidate.get().id(), "probe failed; retiring connection");
            self.retire(candidate.take()).await;
        }
    }

    /// Mark a connection borrowed and wrap it in the RAII guard.
    fn hand_out(
        self: &Arc<Self>,
        mut conn: PoolConnection,
        permit: OwnedSemaphorePermit,
    ) -> PooledConnection {
        conn.mark_in_use();
        self.checked_out.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(id = %conn.id(), "connection checked out");
        PooledConnection {
            conn: Some(conn),
            inner: Arc::clone(self),
            permit: Some(permit),
        }
    }

    /// Return a borrowed connection to the pool.
    ///
    /// Transient session state is reset first; a failed or timed-out
    /// reset retires the connection instead of requeueing it. A closed
    /// pool never re-admits a connection.
    async fn release(&self, mut conn: PoolConnection, permit: Option<OwnedSemaphorePermit>) {
        self.checked_out.fetch_sub(1, Ordering::SeqCst);

        if self.closed.load(Ordering::SeqCst) {
            self.retire(conn).await;
            drop(permit);
            return;
        }

        if conn.raw().is_closed() {
            conn.mark_unhealthy();
        } else {
            match tokio::time::timeout(self.config.operation_timeout(), conn.reset()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::debug!(id = %conn.id(), error = %e, "reset failed; retiring connection");
                }
                Err(_) => {
                    tracing::debug!(id = %conn.id(), "reset timed out; retiring connection");
                    conn.mark_unhealthy();
                }
            }
        }

        if conn.is_healthy() {
            conn.mark_idle();
            self.idle.lock().push_back(conn);
            self.idle_notify.notify_waiters();
            // close() may have latched and drained the queue while the
            // reset above was in flight; reclaim the entry so a closed
            // pool never keeps an idle connection.
            if self.closed.load(Ordering::SeqCst) {
                let reclaimed = { self.idle.lock().pop_back() };
                if let Some(conn) = reclaimed {
                    self.retire(conn).await;
                }
            }
        } else {
            self.retire(conn).await;
        }

        // The permit is returned only after the connection is requeued or
        // retired, so a woken waiter always finds it.
        drop(permit);
    }

    /// Permanently remove a connection from the pool and close its
    /// physical handle.
    ///
    /// The registry bookkeeping runs before the first await so a caller
    /// cancelled mid-close cannot strand the slot.
    async fn retire(&self, mut conn: PoolConnection) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        self.idle_notify.notify_waiters();
        if tokio::time::timeout(self.config.operation_timeout(), conn.close())
            .await
            .is_err()
        {
            tracing::warn!(id = %conn.id(), "connection close timed out; abandoning");
        }
    }

    /// Reserve a registry slot for a new connection, keeping `live`
    /// within `max_size`.
    fn try_reserve_slot(&self) -> bool {
        self.try_reserve_slot_below(self.config.max_size())
    }

    fn try_reserve_slot_below(&self, cap: usize) -> bool {
        self.live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < cap).then_some(n + 1)
            })
            .is_ok()
    }

    fn release_slot(&self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        self.idle_notify.notify_waiters();
    }

    /// Create a new connection via the factory, each step bounded by
    /// `operation_timeout`. The caller must hold a reserved slot.
    async fn create_connection(&self) -> PoolResult<PoolConnection> {
        let op = self.config.operation_timeout();

        let raw = match tokio::time::timeout(op, self.factory.connect()).await {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(PoolError::ConnectionCreate(format!(
                    "factory timed out after {:?}",
                    op
                )));
            }
        };

        let hook = tokio::time::timeout(op, self.factory.on_create(raw.as_ref()))
            .await
            .unwrap_or_else(|_| {
                Err(PoolError::ConnectionCreate(
                    "post-create hook timed out".into(),
                ))
            });
        if let Err(e) = hook {
            let _ = tokio::time::timeout(op, raw.close()).await;
            return Err(e);
        }

        let conn = PoolConnection::new(raw);
        tracing::debug!(id = %conn.id(), driver = conn.raw().driver_name(), "connection created");
        Ok(conn)
    }

    /// Fallback when a guard is dropped outside a tokio runtime: the
    /// counters are corrected but the physical close cannot run.
    fn discard_without_runtime(&self, conn: PoolConnection) {
        self.checked_out.fetch_sub(1, Ordering::SeqCst);
        self.live.fetch_sub(1, Ordering::SeqCst);
        tracing::warn!(
            id = %conn.id(),
            "pooled connection dropped outside an async runtime; physical close skipped"
        );
    }
}

/// Holds a connection popped from the idle queue while it is probed.
///
/// Dropping the guard with the connection still inside (the owning
/// `acquire` was cancelled) pushes it back to the front of the queue.
struct CandidateGuard<'a> {
    conn: Option<PoolConnection>,
    inner: &'a PoolInner,
}

impl<'a> CandidateGuard<'a> {
    fn new(inner: &'a PoolInner, conn: PoolConnection) -> Self {
        Self {
            conn: Some(conn),
            inner,
        }
    }

    fn get(&self) -> &PoolConnection {
        self.conn.as_ref().expect("candidate taken")
    }

    fn get_mut(&mut self) -> &mut PoolConnection {
        self.conn.as_mut().expect("candidate taken")
    }

    fn take(&mut self) -> PoolConnection {
        self.conn.take().expect("candidate taken")
    }
}

impl Drop for CandidateGuard<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.inner.idle.lock().push_front(conn);
            self.inner.idle_notify.notify_waiters();
        }
    }
}

/// Covers a reserved registry slot during connection creation.
///
/// The slot is released on drop unless the creation completed and the
/// guard was disarmed, so a cancelled or failed create cannot shrink
/// the pool's capacity.
struct SlotGuard<'a> {
    inner: &'a PoolInner,
    armed: bool,
}

impl<'a> SlotGuard<'a> {
    fn new(inner: &'a PoolInner) -> Self {
        Self { inner, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.release_slot();
        }
    }
}

/// Decrements the waiter counter on every exit path out of `acquire`,
/// including cancellation.
struct WaitingGuard<'a>(&'a AtomicUsize);

impl<'a> WaitingGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A connection borrowed from the pool
///
/// Releasing is explicit via `release()` (graceful, awaits the session
/// reset) or implicit on drop, which spawns the same release so the
/// connection is never lost to a forgotten or panicked caller.
pub struct PooledConnection {
    conn: Option<PoolConnection>,
    inner: Arc<PoolInner>,
    permit: Option<OwnedSemaphorePermit>,
}

impl PooledConnection {
    /// Unique identifier of the borrowed connection
    pub fn id(&self) -> Uuid {
        self.conn.as_ref().expect("connection taken").id()
    }

    /// The underlying raw connection
    pub fn raw(&self) -> &Arc<dyn RawConnection> {
        self.conn.as_ref().expect("connection taken").raw()
    }

    /// Return the connection to the pool, awaiting the session reset
    pub async fn release(mut self) {
        if let Some(conn) = self.conn.take() {
            let permit = self.permit.take();
            self.inner.release(conn, permit).await;
        }
    }
}

impl Deref for PooledConnection {
    type Target = dyn RawConnection;

    fn deref(&self) -> &Self::Target {
        self.conn
            .as_ref()
            .expect("connection taken")
            .raw()
            .as_ref()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let inner = Arc::clone(&self.inner);
            let permit = self.permit.take();
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        inner.release(conn, permit).await;
                    });
                }
                Err(_) => {
                    inner.discard_without_runtime(conn);
                    drop(permit);
                }
            }
        }
    }
}
