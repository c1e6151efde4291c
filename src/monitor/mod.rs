/// Connection monitoring: terminates sessions whose certificate expired,
/// whose identity got locked, or which stayed idle for too long
use crate::audit::Audit;
use crate::auth::{LockSubscription, LockWatcher};
use crate::core::Identity;
use crate::utils::{from_unix_millis, unix_millis, Clock};
use futures::task::AtomicWaker;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::CancellationToken;
use tracing::{info, Instrument};

/// Default interval between monitor checks
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Why a monitored connection was closed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    CertExpired { expires: SystemTime },
    Locked { lock: String, message: String },
    Idle { idle_for: Duration },
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::CertExpired { .. } => write!(f, "client certificate expired"),
            DisconnectReason::Locked { lock, message } if message.is_empty() => {
                write!(f, "lock {} in force", lock)
            }
            DisconnectReason::Locked { lock, message } => {
                write!(f, "lock {} in force: {}", lock, message)
            }
            DisconnectReason::Idle { idle_for } => write!(
                f,
                "client is idle for {}",
                crate::utils::format_duration(*idle_for)
            ),
        }
    }
}

pub struct MonitorConfig {
    pub identity: Identity,
    pub session_id: String,
    pub lock_watcher: Arc<dyn LockWatcher>,
    pub clock: Arc<dyn Clock>,
    /// Zero disables idle detection
    pub idle_timeout: Duration,
    pub check_interval: Duration,
    /// Receives a client disconnect event when the monitor closes the connection
    pub audit: Option<Audit>,
    pub span: tracing::Span,
}

struct MonitorShared {
    closed: AtomicBool,
    reason: Mutex<Option<DisconnectReason>>,
    last_active_ms: AtomicU64,
    read_waker: AtomicWaker,
    write_waker: AtomicWaker,
    /// Cancelled when the wrapped connection is dropped
    dropped: CancellationToken,
}

impl MonitorShared {
    fn abort_error(&self) -> io::Error {
        let reason = self
            .reason
            .lock()
            .ok()
            .and_then(|r| r.as_ref().map(ToString::to_string))
            .unwrap_or_else(|| "connection closed by monitor".to_string());
        io::Error::new(io::ErrorKind::ConnectionAborted, reason)
    }

    fn trigger(&self, reason: DisconnectReason) {
        if let Ok(mut slot) = self.reason.lock() {
            *slot = Some(reason);
        }
        self.closed.store(true, Ordering::SeqCst);
        self.read_waker.wake();
        self.write_waker.wake();
    }
}

/// Read-only view of a monitored connection's state
#[derive(Clone)]
pub struct MonitorHandle {
    shared: Arc<MonitorShared>,
}

impl MonitorHandle {
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        self.shared.reason.lock().ok().and_then(|r| r.clone())
    }

    pub fn last_active(&self) -> SystemTime {
        from_unix_millis(self.shared.last_active_ms.load(Ordering::SeqCst))
    }
}

/// Connection slot shared with the watcher, emptied when the connection is
/// force-closed
type Slot<S> = Arc<Mutex<Option<S>>>;

fn lock<S>(slot: &Mutex<Option<S>>) -> MutexGuard<'_, Option<S>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Connection wrapper that tracks activity. Once the monitor decides to
/// close the session the wrapped connection is dropped and all I/O fails.
pub struct MonitoredConn<S> {
    inner: Slot<S>,
    shared: Arc<MonitorShared>,
    clock: Arc<dyn Clock>,
}

impl<S> MonitoredConn<S> {
    pub fn handle(&self) -> MonitorHandle {
        MonitorHandle {
            shared: self.shared.clone(),
        }
    }

    fn touch(&self) {
        self.shared
            .last_active_ms
            .store(unix_millis(self.clock.now()), Ordering::SeqCst);
    }
}

impl<S> Drop for MonitoredConn<S> {
    fn drop(&mut self) {
        drop(lock(&self.inner).take());
        self.shared.dropped.cancel();
    }
}

/// Wrap `conn` and start watching it
pub fn monitor_conn<S>(conn: S, cfg: MonitorConfig) -> MonitoredConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let shared = Arc::new(MonitorShared {
        closed: AtomicBool::new(false),
        reason: Mutex::new(None),
        last_active_ms: AtomicU64::new(unix_millis(cfg.clock.now())),
        read_waker: AtomicWaker::new(),
        write_waker: AtomicWaker::new(),
        dropped: CancellationToken::new(),
    });
    let clock = cfg.clock.clone();
    let subscription = cfg.lock_watcher.subscribe(&cfg.identity);
    let span = cfg.span.clone();
    let inner = Arc::new(Mutex::new(Some(conn)));
    tokio::spawn(watch(shared.clone(), cfg, subscription, inner.clone()).instrument(span));

    MonitoredConn {
        inner,
        shared,
        clock,
    }
}

async fn watch<S: Send>(
    shared: Arc<MonitorShared>,
    cfg: MonitorConfig,
    mut locks: LockSubscription,
    conn: Slot<S>,
) {
    let mut ticker = tokio::time::interval(cfg.check_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut lock_updates = true;

    loop {
        tokio::select! {
            _ = shared.dropped.cancelled() => return,
            _ = ticker.tick() => {}
            changed = locks.changed(), if lock_updates => {
                if !changed {
                    lock_updates = false;
                    continue;
                }
            }
        }

        if let Some(reason) = evaluate(&shared, &cfg, &locks) {
            info!(user = %cfg.identity.username, reason = %reason, "Closing monitored connection.");
            // Record before the engine can observe the close.
            if let Some(audit) = &cfg.audit {
                audit
                    .on_client_disconnect(&cfg.session_id, &cfg.identity.username, &reason.to_string())
                    .await;
            }
            shared.trigger(reason);
            drop(lock(&conn).take());
            return;
        }
    }
}

fn evaluate(
    shared: &MonitorShared,
    cfg: &MonitorConfig,
    locks: &LockSubscription,
) -> Option<DisconnectReason> {
    let now = cfg.clock.now();
    if now >= cfg.identity.expires {
        return Some(DisconnectReason::CertExpired {
            expires: cfg.identity.expires,
        });
    }
    if let Some(lock) = locks.check(now) {
        return Some(DisconnectReason::Locked {
            lock: lock.name,
            message: lock.message,
        });
    }
    if !cfg.idle_timeout.is_zero() {
        let last_active = from_unix_millis(shared.last_active_ms.load(Ordering::SeqCst));
        let idle_for = now.duration_since(last_active).unwrap_or_default();
        if idle_for >= cfg.idle_timeout {
            return Some(DisconnectReason::Idle { idle_for });
        }
    }
    None
}

impl<S: AsyncRead + Unpin> AsyncRead for MonitoredConn<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.shared.read_waker.register(cx.waker());
        let mut inner = lock(&this.inner);
        let conn = match inner.as_mut() {
            Some(conn) if !this.shared.closed.load(Ordering::SeqCst) => conn,
            _ => return Poll::Ready(Err(this.shared.abort_error())),
        };
        let before = buf.filled().len();
        let result = Pin::new(conn).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = result {
            if buf.filled().len() > before {
                this.touch();
            }
        }
        result
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for MonitoredConn<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.shared.write_waker.register(cx.waker());
        let mut inner = lock(&this.inner);
        let conn = match inner.as_mut() {
            Some(conn) if !this.shared.closed.load(Ordering::SeqCst) => conn,
            _ => return Poll::Ready(Err(this.shared.abort_error())),
        };
        let result = Pin::new(conn).poll_write(cx, data);
        if let Poll::Ready(Ok(n)) = result {
            if n > 0 {
                this.touch();
            }
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let mut inner = lock(&this.inner);
        match inner.as_mut() {
            Some(conn) if !this.shared.closed.load(Ordering::SeqCst) => Pin::new(conn).poll_flush(cx),
            _ => Poll::Ready(Err(this.shared.abort_error())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match lock(&self.get_mut().inner).as_mut() {
            Some(conn) => Pin::new(conn).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::memory::MemoryStream;
    use crate::audit::{AuditEvent, FileStreamEmitter, StreamEmitter, StreamWriter};
    use crate::auth::{LocalLockWatcher, Lock};
    use crate::utils::FakeClock;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct Fixture {
        clock: Arc<FakeClock>,
        locks: Arc<LocalLockWatcher>,
        stream: Arc<MemoryStream>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                clock: Arc::new(FakeClock::new(SystemTime::now())),
                locks: Arc::new(LocalLockWatcher::new(Vec::new())),
                stream: Arc::new(MemoryStream::default()),
            }
        }

        fn config(&self, expires_in: Duration, idle_timeout: Duration) -> MonitorConfig {
            let audit = Audit::new(self.stream.clone(), self.clock.clone());
            self.config_with_audit(expires_in, idle_timeout, audit)
        }

        fn config_with_audit(
            &self,
            expires_in: Duration,
            idle_timeout: Duration,
            audit: Audit,
        ) -> MonitorConfig {
            let identity = Identity::new(
                "alice",
                vec!["dev".to_string()],
                self.clock.now() + expires_in,
            );
            MonitorConfig {
                identity,
                session_id: "s1".to_string(),
                lock_watcher: self.locks.clone(),
                clock: self.clock.clone(),
                idle_timeout,
                check_interval: Duration::from_millis(10),
                audit: Some(audit),
                span: tracing::Span::none(),
            }
        }

        fn disconnect_events(&self) -> Vec<String> {
            self.stream
                .events
                .lock()
                .unwrap()
                .iter()
                .filter_map(|e| match e {
                    AuditEvent::ClientDisconnect { reason, .. } => Some(reason.clone()),
                    _ => None,
                })
                .collect()
        }
    }

    async fn wait_closed(handle: &MonitorHandle) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !handle.is_closed() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("connection was not closed");
    }

    #[tokio::test]
    async fn test_io_passes_through_and_tracks_activity() {
        let fx = Fixture::new();
        let (client, server) = tokio::io::duplex(1024);
        let mut conn = monitor_conn(server, fx.config(Duration::from_secs(3600), Duration::ZERO));
        let mut client = client;

        fx.clock.advance(Duration::from_secs(5));
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        assert_eq!(unix_millis(conn.handle().last_active()), unix_millis(fx.clock.now()));

        conn.write_all(b"pong").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
        assert!(!conn.handle().is_closed());
    }

    #[tokio::test]
    async fn test_scripted_exchange_through_monitor() {
        let fx = Fixture::new();
        let mock = tokio_test::io::Builder::new()
            .read(b"Q\0SELECT 1")
            .write(b"ok")
            .build();
        let mut conn = monitor_conn(mock, fx.config(Duration::from_secs(3600), Duration::ZERO));

        let mut buf = [0u8; 10];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"Q\0SELECT 1");
        conn.write_all(b"ok").await.unwrap();
        assert!(!conn.handle().is_closed());
        assert!(fx.disconnect_events().is_empty());
    }

    #[tokio::test]
    async fn test_expired_certificate_closes_connection() {
        let fx = Fixture::new();
        let (_client, server) = tokio::io::duplex(1024);
        let mut conn = monitor_conn(server, fx.config(Duration::from_secs(60), Duration::ZERO));
        let handle = conn.handle();

        fx.clock.advance(Duration::from_secs(61));
        wait_closed(&handle).await;

        let mut buf = [0u8; 1];
        let err = conn.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
        assert!(matches!(
            handle.disconnect_reason(),
            Some(DisconnectReason::CertExpired { .. })
        ));
        assert_eq!(fx.disconnect_events(), vec!["client certificate expired".to_string()]);
    }

    #[tokio::test]
    async fn test_expiry_closes_busy_connection() {
        let fx = Fixture::new();
        let (mut client, server) = tokio::io::duplex(1024);
        let mut conn = monitor_conn(
            server,
            fx.config(Duration::from_secs(60), Duration::from_secs(30)),
        );
        let handle = conn.handle();

        let writer = tokio::spawn(async move {
            loop {
                if let Err(e) = conn.write_all(b"row").await {
                    return e;
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        });
        tokio::spawn(async move {
            let mut buf = [0u8; 256];
            while let Ok(n) = client.read(&mut buf).await {
                if n == 0 {
                    break;
                }
            }
        });

        for _ in 0..11 {
            fx.clock.advance(Duration::from_secs(5));
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!handle.is_closed());

        fx.clock.advance(Duration::from_secs(10));
        wait_closed(&handle).await;
        assert!(matches!(
            handle.disconnect_reason(),
            Some(DisconnectReason::CertExpired { .. })
        ));

        let err = tokio::time::timeout(Duration::from_secs(5), writer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
    }

    #[tokio::test]
    async fn test_peer_sees_eof_when_monitor_closes() {
        let fx = Fixture::new();
        let (mut client, server) = tokio::io::duplex(1024);
        let conn = monitor_conn(server, fx.config(Duration::from_secs(60), Duration::ZERO));
        let handle = conn.handle();

        fx.clock.advance(Duration::from_secs(61));
        wait_closed(&handle).await;

        // The wrapped connection is never polled again, yet the peer is released
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
        drop(conn);
    }

    #[tokio::test]
    async fn test_disconnect_recorded_before_stream_closes() {
        let fx = Fixture::new();
        let dir = tempfile::tempdir().unwrap();
        let emitter = FileStreamEmitter::new(dir.path());
        let writer = emitter.create_audit_stream("s1").await.unwrap();
        let audit = Audit::new(writer.clone(), fx.clock.clone());

        let (_client, server) = tokio::io::duplex(1024);
        let mut conn = monitor_conn(
            server,
            fx.config_with_audit(Duration::from_secs(60), Duration::ZERO, audit),
        );

        // Serve until the monitor aborts the connection, then finish the session
        let session = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            loop {
                match conn.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            drop(conn);
            writer.close(&CancellationToken::new()).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        fx.clock.advance(Duration::from_secs(61));
        tokio::time::timeout(Duration::from_secs(5), session)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        let contents = std::fs::read_to_string(dir.path().join("s1.jsonl")).unwrap();
        assert!(contents.contains("\"event\":\"client_disconnect\""));
        assert!(contents.contains("client certificate expired"));
    }

    #[tokio::test]
    async fn test_pending_read_is_woken_on_close() {
        let fx = Fixture::new();
        let (_client, server) = tokio::io::duplex(1024);
        let mut conn = monitor_conn(server, fx.config(Duration::from_secs(3600), Duration::ZERO));

        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 1];
            conn.read(&mut buf).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        fx.locks
            .upsert_lock(Lock::for_user("lock-1", "alice", "offboarded"));

        let result = tokio::time::timeout(Duration::from_secs(5), reader)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::ConnectionAborted);
        assert_eq!(
            fx.disconnect_events(),
            vec!["lock lock-1 in force: offboarded".to_string()]
        );
    }

    #[tokio::test]
    async fn test_idle_connection_closed() {
        let fx = Fixture::new();
        let (_client, server) = tokio::io::duplex(1024);
        let conn = monitor_conn(
            server,
            fx.config(Duration::from_secs(3600), Duration::from_secs(30)),
        );
        let handle = conn.handle();

        fx.clock.advance(Duration::from_secs(10));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_closed());

        fx.clock.advance(Duration::from_secs(25));
        wait_closed(&handle).await;
        assert!(matches!(
            handle.disconnect_reason(),
            Some(DisconnectReason::Idle { .. })
        ));
    }

    #[tokio::test]
    async fn test_watcher_stops_when_connection_dropped() {
        let fx = Fixture::new();
        let (_client, server) = tokio::io::duplex(1024);
        let conn = monitor_conn(server, fx.config(Duration::from_secs(60), Duration::ZERO));
        let handle = conn.handle();
        drop(conn);

        tokio::time::sleep(Duration::from_millis(30)).await;
        fx.clock.advance(Duration::from_secs(120));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_closed());
        assert!(fx.disconnect_events().is_empty());
    }
}
