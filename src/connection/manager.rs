//! Connection Pool Manager Implementation

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::inbound::{ConnectionId, InboundConnection, InboundGuard, InboundSet};
use super::pool::{HostPools, PooledConnection};
use crate::config::PoolConfig;
use crate::error::TransportError;
use crate::layer::{Connection, ConnectionHandler, StreamLayer};
use crate::Result;

/// Period between idle-connection sweeps unless overridden.
pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(30);

/// Pause after a failed accept before asking the layer again.
const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(100);

/// Bounds on the reaper period actually scheduled.
const MIN_REAP_INTERVAL: Duration = Duration::from_millis(1);
const MAX_REAP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

type Handler<C> = Arc<dyn ConnectionHandler<C>>;

/// Owns inbound connections, per-host outbound pools, and their background tasks.
///
/// Call [`ConnectionPoolManager::shutdown`] before dropping: the accept and
/// reaper tasks hold a reference to the manager until they are cancelled.
pub struct ConnectionPoolManager<L: StreamLayer> {
    layer: Arc<L>,
    handler: Handler<L::Conn>,
    dial_timeout: Duration,
    max_idle: Duration,
    reap_interval: Duration,
    inbound: InboundSet,
    outbound: Mutex<HostPools<L::Conn>>,
    next_connection_id: AtomicU64,
    shutdown_flag: AtomicBool,
    listening: AtomicBool,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    counters: Counters,
}

#[derive(Debug, Default)]
struct Counters {
    accepted: AtomicUsize,
    dialed: AtomicUsize,
    pool_hits: AtomicUsize,
    pool_misses: AtomicUsize,
    reaped: AtomicUsize,
}

/// Snapshot of connection counts and lifetime totals.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub inbound_connections: usize,
    pub pooled_connections: usize,
    pub pooled_hosts: usize,
    pub total_accepted: usize,
    pub total_dialed: usize,
    pub pool_hits: usize,
    pub pool_misses: usize,
    pub total_reaped: usize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

async fn close_quietly<C: Connection>(conn: PooledConnection<C>) {
    if let Err(e) = conn.into_inner().close().await {
        debug!("Error closing outbound connection: {}", e);
    }
}

impl<L: StreamLayer> ConnectionPoolManager<L> {
    /// Create a manager over `layer`. Nothing runs until [`listen`](Self::listen).
    pub fn new<H>(layer: Arc<L>, handler: H, dial_timeout: Duration, max_idle: Duration) -> Self
    where
        H: ConnectionHandler<L::Conn>,
    {
        Self {
            layer,
            handler: Arc::new(handler),
            dial_timeout,
            max_idle,
            reap_interval: DEFAULT_REAP_INTERVAL,
            inbound: Arc::new(RwLock::new(HashMap::new())),
            outbound: Mutex::new(HostPools::new()),
            next_connection_id: AtomicU64::new(1),
            shutdown_flag: AtomicBool::new(false),
            listening: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            counters: Counters::default(),
        }
    }

    /// Create a manager from pool configuration
    pub fn from_config<H>(layer: Arc<L>, handler: H, config: &PoolConfig) -> Self
    where
        H: ConnectionHandler<L::Conn>,
    {
        Self::new(layer, handler, config.dial_timeout, config.max_idle)
            .with_reap_interval(config.reap_interval)
    }

    pub fn with_reap_interval(mut self, reap_interval: Duration) -> Self {
        self.reap_interval = reap_interval;
        self
    }

    /// Start the accept loop and the idle reaper. Returns immediately.
    pub fn listen(self: &Arc<Self>) {
        if self.is_shutting_down() {
            warn!("Transport is shut down, not starting listener");
            return;
        }
        if self.listening.swap(true, Ordering::SeqCst) {
            debug!("Listener already running");
            return;
        }

        let accept_task = {
            let manager = Arc::clone(self);
            tokio::spawn(async move { manager.accept_loop().await })
        };
        let reaper_task = {
            let manager = Arc::clone(self);
            tokio::spawn(async move { manager.reaper_loop().await })
        };
        lock(&self.tasks).extend([accept_task, reaper_task]);

        info!(
            "Transport listening (dial timeout {:?}, max idle {:?}, reap every {:?})",
            self.dial_timeout, self.max_idle, self.reap_interval
        );
    }

    async fn accept_loop(&self) {
        info!("Starting connection acceptance loop");

        loop {
            if self.is_shutting_down() {
                break;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = self.layer.accept() => match accepted {
                    Ok(conn) => self.register_inbound(conn),
                    Err(e) => {
                        if self.is_shutting_down() {
                            debug!("Accept failed during shutdown: {}", e);
                            break;
                        }
                        error!("Error accepting connection: {}", e);
                        tokio::select! {
                            _ = self.cancel.cancelled() => break,
                            _ = tokio::time::sleep(ACCEPT_ERROR_PAUSE) => {}
                        }
                    }
                }
            }
        }

        info!("Connection acceptance loop stopped");
    }

    fn register_inbound(&self, conn: L::Conn) {
        let remote_addr = conn.remote_addr().ok();
        if self.is_shutting_down() {
            debug!("Dropping connection from {:?} accepted during shutdown", remote_addr);
            return;
        }

        let id = ConnectionId(self.next_connection_id.fetch_add(1, Ordering::Relaxed));
        let closer = self.cancel.child_token();
        self.inbound
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, InboundConnection::new(id, remote_addr, closer.clone()));
        self.counters.accepted.fetch_add(1, Ordering::Relaxed);

        debug!("Registered inbound connection {} from {:?}", id, remote_addr);

        let guard = InboundGuard::new(id, Arc::clone(&self.inbound));
        let handler = Arc::clone(&self.handler);
        tokio::spawn(Self::handle_connection(id, conn, handler, closer, guard));
    }

    /// Run the handler for one connection until it returns or is force-closed.
    #[instrument(skip(conn, handler, closer, _guard), fields(connection_id = %id))]
    async fn handle_connection(
        id: ConnectionId,
        conn: L::Conn,
        handler: Handler<L::Conn>,
        closer: CancellationToken,
        _guard: InboundGuard,
    ) {
        let mut task = tokio::spawn(async move { handler.handle(conn).await });

        tokio::select! {
            joined = &mut task => match joined {
                Ok(Ok(())) => debug!("Connection {} handler completed", id),
                Ok(Err(e)) => warn!("Connection {} handler failed: {:#}", id, e),
                Err(e) if e.is_panic() => error!("Connection {} handler panicked", id),
                Err(e) => debug!("Connection {} handler cancelled: {}", id, e),
            },
            _ = closer.cancelled() => {
                task.abort();
                debug!("Connection {} force-closed", id);
            }
        }
    }

    async fn reaper_loop(&self) {
        // interval_at panics on a zero period or a deadline past Instant's range.
        let period = self.reap_interval.clamp(MIN_REAP_INTERVAL, MAX_REAP_INTERVAL);
        if period != self.reap_interval {
            warn!(
                "Reap interval {:?} out of range, reaping every {:?}",
                self.reap_interval, period
            );
        }
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => {
                    if self.is_shutting_down() {
                        break;
                    }
                    self.reap_idle().await;
                }
            }
        }

        debug!("Idle connection reaper stopped");
    }

    /// Close and evict every pooled connection idle longer than the max-idle
    /// duration. Returns how many were reaped.
    pub async fn reap_idle(&self) -> usize {
        let expired = lock(&self.outbound).drain_idle(self.max_idle);
        let reaped = expired.len();

        for conn in expired {
            close_quietly(conn).await;
        }

        if reaped > 0 {
            self.counters.reaped.fetch_add(reaped, Ordering::Relaxed);
            info!("Reaped {} idle outbound connections", reaped);
        }
        reaped
    }

    /// Check out a connection to `host`, reusing the most recently returned one
    /// if any, otherwise dialing.
    ///
    /// A failed dial is not retried. The layer's error is kept as the
    /// [`TransportError::Dial`] source; [`TransportError::into_io`] recovers it.
    pub async fn get_conn(
        &self,
        host: &str,
    ) -> std::result::Result<PooledConnection<L::Conn>, TransportError> {
        let pooled = {
            let mut pools = lock(&self.outbound);
            if self.is_shutting_down() {
                return Err(TransportError::Shutdown);
            }
            pools.pop(host)
        };

        if let Some(conn) = pooled {
            self.counters.pool_hits.fetch_add(1, Ordering::Relaxed);
            debug!("Reusing pooled connection to {} (idle {:?})", host, conn.idle_time());
            return Ok(conn);
        }

        self.counters.pool_misses.fetch_add(1, Ordering::Relaxed);
        debug!("No pooled connection to {}, dialing", host);

        let conn = self
            .layer
            .dial(host, self.dial_timeout)
            .await
            .map_err(|source| TransportError::Dial {
                host: host.to_string(),
                source,
            })?;
        self.counters.dialed.fetch_add(1, Ordering::Relaxed);

        Ok(PooledConnection::new(conn))
    }

    /// Put a connection back in its host's pool, or close it if the transport
    /// is shutting down.
    pub async fn return_conn(&self, mut conn: PooledConnection<L::Conn>) {
        conn.touch();

        let host = match conn.remote_addr() {
            Ok(addr) => addr.to_string(),
            Err(e) => {
                debug!("Discarding returned connection with no remote address: {}", e);
                close_quietly(conn).await;
                return;
            }
        };

        let rejected = {
            let mut pools = lock(&self.outbound);
            if self.is_shutting_down() {
                Some(conn)
            } else {
                pools.push(host.clone(), conn);
                None
            }
        };

        match rejected {
            Some(conn) => {
                debug!("Transport shut down, closing returned connection to {}", host);
                close_quietly(conn).await;
            }
            None => debug!("Returned connection to pool for {}", host),
        }
    }

    /// Stop accepting, force-close every tracked connection, and stop the
    /// background tasks.
    ///
    /// Handler tasks of already-accepted connections are signalled but not
    /// awaited; they deregister themselves as they finish.
    pub async fn shutdown(&self) -> Result<()> {
        if self.shutdown_flag.swap(true, Ordering::SeqCst) {
            debug!("Transport shutdown already initiated");
        } else {
            info!("Initiating transport shutdown");
        }

        self.cancel.cancel();
        if let Err(e) = self.layer.close() {
            debug!("Error closing listener: {}", e);
        }

        let closed_inbound = {
            let inbound = read_lock(&self.inbound);
            for conn in inbound.values() {
                conn.close();
            }
            inbound.len()
        };

        let pooled = lock(&self.outbound).drain_all();
        let closed_outbound = pooled.len();
        for conn in pooled {
            close_quietly(conn).await;
        }

        let tasks = std::mem::take(&mut *lock(&self.tasks));
        for task in tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!("Background task failed during shutdown: {}", e);
                }
            }
        }

        info!(
            "Transport shut down: closed {} inbound and {} pooled outbound connections",
            closed_inbound, closed_outbound
        );
        Ok(())
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_flag.load(Ordering::SeqCst)
    }

    /// Number of accepted connections whose handlers are still running.
    pub fn inbound_count(&self) -> usize {
        read_lock(&self.inbound).len()
    }

    /// Snapshot of the tracked inbound connections.
    pub fn inbound_connections(&self) -> Vec<InboundConnection> {
        let mut conns: Vec<_> = read_lock(&self.inbound).values().cloned().collect();
        conns.sort_by_key(|conn| conn.id);
        conns
    }

    /// Number of idle connections pooled for `host`.
    pub fn pooled_count(&self, host: &str) -> usize {
        lock(&self.outbound).len_for(host)
    }

    pub fn stats(&self) -> ConnectionStats {
        let (pooled_connections, pooled_hosts) = {
            let pools = lock(&self.outbound);
            (pools.len(), pools.host_count())
        };

        ConnectionStats {
            inbound_connections: self.inbound_count(),
            pooled_connections,
            pooled_hosts,
            total_accepted: self.counters.accepted.load(Ordering::Relaxed),
            total_dialed: self.counters.dialed.load(Ordering::Relaxed),
            pool_hits: self.counters.pool_hits.load(Ordering::Relaxed),
            pool_misses: self.counters.pool_misses.load(Ordering::Relaxed),
            total_reaped: self.counters.reaped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::{ConnProbe, MemoryConn, MemoryLayer};
    use async_trait::async_trait;
    use std::io;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc;
    use tokio_test::{assert_err, assert_ok};

    const HOST: &str = "127.0.0.1:9000";

    fn layer() -> Arc<MemoryLayer> {
        Arc::new(MemoryLayer::new(HOST.parse::<SocketAddr>().unwrap()))
    }

    async fn idle_handler(_conn: MemoryConn) -> Result<()> {
        Ok(())
    }

    fn manager(layer: Arc<MemoryLayer>) -> Arc<ConnectionPoolManager<MemoryLayer>> {
        Arc::new(ConnectionPoolManager::new(
            layer,
            idle_handler,
            Duration::from_secs(5),
            Duration::from_secs(100),
        ))
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cond()
    }

    /// Handler that reports each accepted connection and holds it open.
    fn holding_handler(
    ) -> (impl ConnectionHandler<MemoryConn>, mpsc::UnboundedReceiver<ConnProbe>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = move |conn: MemoryConn| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(conn.probe());
                let _conn = conn;
                std::future::pending::<()>().await;
                Ok::<(), anyhow::Error>(())
            }
        };
        (handler, rx)
    }

    #[tokio::test]
    async fn test_pool_is_used_before_dialing() {
        let layer = layer();
        let manager = manager(Arc::clone(&layer));

        let conn = assert_ok!(manager.get_conn(HOST).await);
        assert_eq!(layer.dial_attempts(), 1);
        let probe = conn.probe();

        manager.return_conn(conn).await;
        assert_eq!(manager.pooled_count(HOST), 1);

        let again = assert_ok!(manager.get_conn(HOST).await);
        assert_eq!(layer.dial_attempts(), 1);
        assert_eq!(manager.pooled_count(HOST), 0);
        assert!(!probe.is_closed());
        assert_eq!(again.remote_addr().unwrap().to_string(), HOST);

        let stats = manager.stats();
        assert_eq!(stats.pool_hits, 1);
        assert_eq!(stats.pool_misses, 1);
        assert_eq!(stats.total_dialed, 1);
    }

    #[tokio::test]
    async fn test_pool_hands_out_most_recent_first() {
        let layer = layer();
        let manager = manager(Arc::clone(&layer));

        let first = manager.get_conn(HOST).await.unwrap();
        let second = manager.get_conn(HOST).await.unwrap();
        assert_eq!(layer.dial_attempts(), 2);

        let first_probe = first.probe();
        let second_probe = second.probe();
        manager.return_conn(first).await;
        manager.return_conn(second).await;

        let reused = manager.get_conn(HOST).await.unwrap();
        assert!(reused.probe().same_connection(&second_probe));
        let reused_again = manager.get_conn(HOST).await.unwrap();
        assert!(reused_again.probe().same_connection(&first_probe));

        assert_eq!(layer.dial_attempts(), 2);
        assert!(!first_probe.is_closed());
        assert!(!second_probe.is_closed());
    }

    #[tokio::test]
    async fn test_dial_errors_reach_the_caller() {
        let manager = manager(layer());

        let err = assert_err!(manager.get_conn("127.0.0.1:9999").await);
        match err {
            TransportError::Dial { host, source } => {
                assert_eq!(host, "127.0.0.1:9999");
                assert_eq!(source.kind(), std::io::ErrorKind::ConnectionRefused);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(manager.stats().total_dialed, 0);
    }

    #[tokio::test]
    async fn test_get_conn_after_shutdown_fails_without_dialing() {
        let layer = layer();
        let manager = manager(Arc::clone(&layer));

        let conn = manager.get_conn(HOST).await.unwrap();
        manager.return_conn(conn).await;

        manager.shutdown().await.unwrap();

        let err = assert_err!(manager.get_conn(HOST).await);
        assert!(err.is_shutdown());
        assert_eq!(layer.dial_attempts(), 1);
    }

    #[tokio::test]
    async fn test_return_after_shutdown_closes_connection() {
        let manager = manager(layer());

        let conn = manager.get_conn(HOST).await.unwrap();
        let probe = conn.probe();

        manager.shutdown().await.unwrap();
        manager.return_conn(conn).await;

        assert!(probe.is_closed());
        assert_eq!(manager.pooled_count(HOST), 0);
        assert_eq!(manager.stats().pooled_connections, 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_pooled_connections() {
        let manager = manager(layer());

        let a = manager.get_conn(HOST).await.unwrap();
        let b = manager.get_conn(HOST).await.unwrap();
        let probes = [a.probe(), b.probe()];
        manager.return_conn(a).await;
        manager.return_conn(b).await;
        assert_eq!(manager.pooled_count(HOST), 2);

        manager.shutdown().await.unwrap();

        assert!(probes.iter().all(ConnProbe::is_closed));
        assert_eq!(manager.stats().pooled_connections, 0);

        // A second shutdown is harmless.
        assert_ok!(manager.shutdown().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reap_idle_evicts_stale_connections() {
        let layer = layer();
        let manager = Arc::new(ConnectionPoolManager::new(
            Arc::clone(&layer),
            idle_handler,
            Duration::from_secs(5),
            Duration::from_secs(1),
        ));

        let conn = manager.get_conn(HOST).await.unwrap();
        let probe = conn.probe();
        manager.return_conn(conn).await;

        assert_eq!(manager.reap_idle().await, 0);
        assert_eq!(manager.pooled_count(HOST), 1);

        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(manager.reap_idle().await, 1);
        assert_eq!(manager.pooled_count(HOST), 0);
        assert!(probe.is_closed());
        assert_eq!(manager.stats().total_reaped, 1);

        let _fresh = manager.get_conn(HOST).await.unwrap();
        assert_eq!(layer.dial_attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_runs_on_its_interval() {
        let manager = Arc::new(
            ConnectionPoolManager::new(
                layer(),
                idle_handler,
                Duration::from_secs(5),
                Duration::from_secs(1),
            )
            .with_reap_interval(Duration::from_secs(1)),
        );
        manager.listen();

        let conn = manager.get_conn(HOST).await.unwrap();
        let probe = conn.probe();
        manager.return_conn(conn).await;

        tokio::time::sleep(Duration::from_secs(3)).await;

        assert!(probe.is_closed());
        assert_eq!(manager.pooled_count(HOST), 0);

        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_inbound_connections_are_tracked_until_handler_returns() {
        let layer = layer();
        let handler = |mut conn: MemoryConn| async move {
            let mut buf = [0u8; 8];
            let _ = conn.read(&mut buf).await?;
            Ok::<(), anyhow::Error>(())
        };
        let manager = Arc::new(ConnectionPoolManager::new(
            Arc::clone(&layer),
            handler,
            Duration::from_secs(5),
            Duration::from_secs(100),
        ));
        manager.listen();

        let mut conn = manager.get_conn(HOST).await.unwrap();
        assert!(wait_until(|| manager.inbound_count() == 1).await);

        let tracked = manager.inbound_connections();
        assert_eq!(tracked.len(), 1);
        assert_eq!(tracked[0].id.to_string(), "conn-1");

        conn.write_all(b"foo").await.unwrap();
        assert!(wait_until(|| manager.inbound_count() == 0).await);
        assert_eq!(manager.stats().total_accepted, 1);

        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_handler_panic_still_deregisters() {
        let layer = layer();
        let handler = |_conn: MemoryConn| async move {
            if true {
                panic!("handler blew up");
            }
            Ok::<(), anyhow::Error>(())
        };
        let manager = Arc::new(ConnectionPoolManager::new(
            Arc::clone(&layer),
            handler,
            Duration::from_secs(5),
            Duration::from_secs(100),
        ));
        manager.listen();

        let _conn = manager.get_conn(HOST).await.unwrap();
        assert!(wait_until(|| manager.stats().total_accepted == 1).await);
        assert!(wait_until(|| manager.inbound_count() == 0).await);

        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_force_closes_inbound_connections() {
        let layer = layer();
        let (handler, mut accepted) = holding_handler();
        let manager = Arc::new(ConnectionPoolManager::new(
            Arc::clone(&layer),
            handler,
            Duration::from_secs(5),
            Duration::from_secs(100),
        ));
        manager.listen();

        let _a = manager.get_conn(HOST).await.unwrap();
        let _b = manager.get_conn(HOST).await.unwrap();
        let probes = [accepted.recv().await.unwrap(), accepted.recv().await.unwrap()];
        assert_eq!(manager.inbound_count(), 2);

        manager.shutdown().await.unwrap();

        assert!(layer.is_closed());
        assert!(wait_until(|| probes.iter().all(ConnProbe::is_closed)).await);
        assert!(wait_until(|| manager.inbound_count() == 0).await);
    }

    #[tokio::test]
    async fn test_listen_is_idempotent_and_inert_after_shutdown() {
        let manager = manager(layer());
        manager.listen();
        manager.listen();
        assert_eq!(lock(&manager.tasks).len(), 2);

        manager.shutdown().await.unwrap();
        assert!(lock(&manager.tasks).is_empty());

        manager.listen();
        assert!(lock(&manager.tasks).is_empty());
    }

    /// Fails the first `failures` accepts, then behaves like the wrapped layer.
    struct FlakyAcceptLayer {
        inner: MemoryLayer,
        failures_left: AtomicUsize,
    }

    #[async_trait]
    impl StreamLayer for FlakyAcceptLayer {
        type Conn = MemoryConn;

        async fn accept(&self) -> io::Result<MemoryConn> {
            let failed = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failed {
                return Err(io::Error::new(io::ErrorKind::Other, "too many open files"));
            }
            self.inner.accept().await
        }

        async fn dial(&self, host: &str, timeout: Duration) -> io::Result<MemoryConn> {
            self.inner.dial(host, timeout).await
        }

        fn close(&self) -> io::Result<()> {
            self.inner.close()
        }
    }

    #[tokio::test]
    async fn test_accept_errors_do_not_stop_the_listener() {
        let layer = Arc::new(FlakyAcceptLayer {
            inner: MemoryLayer::new(HOST.parse().unwrap()),
            failures_left: AtomicUsize::new(3),
        });
        let (handler, mut accepted) = holding_handler();
        let manager = Arc::new(ConnectionPoolManager::new(
            Arc::clone(&layer),
            handler,
            Duration::from_secs(5),
            Duration::from_secs(100),
        ));
        manager.listen();

        let _conn = manager.get_conn(HOST).await.unwrap();
        let probe = tokio::time::timeout(Duration::from_secs(2), accepted.recv())
            .await
            .expect("connection should be accepted after the failures")
            .unwrap();

        assert_eq!(layer.failures_left.load(Ordering::SeqCst), 0);
        assert_eq!(manager.inbound_count(), 1);
        assert_eq!(manager.stats().total_accepted, 1);
        assert!(!probe.is_closed());

        manager.shutdown().await.unwrap();
        assert!(wait_until(|| probe.is_closed()).await);
    }

    #[tokio::test]
    async fn test_connection_accepted_during_shutdown_is_dropped() {
        let layer = layer();
        let (handler, mut accepted) = holding_handler();
        let manager = Arc::new(ConnectionPoolManager::new(
            Arc::clone(&layer),
            handler,
            Duration::from_secs(5),
            Duration::from_secs(100),
        ));

        let _client = layer.dial(HOST, Duration::from_secs(1)).await.unwrap();
        let late = layer.accept().await.unwrap();
        let probe = late.probe();

        manager.shutdown().await.unwrap();
        manager.register_inbound(late);

        assert!(probe.is_closed());
        assert_eq!(manager.inbound_count(), 0);
        assert_eq!(manager.stats().total_accepted, 0);
        tokio::task::yield_now().await;
        assert!(accepted.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dial_uses_configured_timeout() {
        let layer = layer();
        let config = PoolConfig {
            dial_timeout: Duration::from_millis(1500),
            ..PoolConfig::default()
        };
        let manager = ConnectionPoolManager::from_config(Arc::clone(&layer), idle_handler, &config);

        let _conn = assert_ok!(manager.get_conn(HOST).await);
        assert_eq!(layer.last_dial_timeout(), Some(Duration::from_millis(1500)));
    }

    #[tokio::test]
    async fn test_reaper_survives_out_of_range_interval() {
        let manager = Arc::new(
            ConnectionPoolManager::new(
                layer(),
                idle_handler,
                Duration::from_secs(5),
                Duration::from_secs(1),
            )
            .with_reap_interval(Duration::MAX),
        );
        manager.listen();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(lock(&manager.tasks).iter().all(|task| !task.is_finished()));

        manager.shutdown().await.unwrap();
    }
}
