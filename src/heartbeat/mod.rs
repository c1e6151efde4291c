/// Periodic announcement of proxied databases to the control plane
///
/// One heartbeat runs per database. Each tick builds a fresh snapshot, then
/// either announces it (first time, content changed, or announce period
/// elapsed) or sends a cheap keep-alive extending the last announcement.
pub mod file;

pub use file::{FileAnnouncer, FileRotationGetter};

use crate::core::{DatabaseServer, KeepAlive, Rotation};
use crate::error::{GatewayError, GatewayResult};
use crate::utils::Clock;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default time-to-live of an announcement
pub const DEFAULT_SERVER_TTL: Duration = Duration::from_secs(600);
/// Default interval between keep-alives
pub const DEFAULT_KEEP_ALIVE_PERIOD: Duration = Duration::from_secs(60);
/// Default heartbeat tick interval
pub const DEFAULT_CHECK_PERIOD: Duration = Duration::from_secs(5);
/// How long `close` waits for the heartbeat task
const CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Receiver of announcements
#[async_trait]
pub trait Announcer: Send + Sync {
    async fn upsert_database_server(&self, server: &DatabaseServer) -> GatewayResult<()>;

    async fn keep_alive(&self, keep_alive: &KeepAlive) -> GatewayResult<()>;
}

/// Source of the certificate authority rotation state
pub trait RotationGetter: Send + Sync {
    fn get_rotation(&self, role: &str) -> GatewayResult<Rotation>;
}

/// Builds a fresh snapshot for the announced database
pub type GetServerInfo = Arc<dyn Fn() -> GatewayResult<DatabaseServer> + Send + Sync>;

/// Jittered announce period: half the TTL plus up to a tenth of it
pub fn announce_period(server_ttl: Duration) -> Duration {
    server_ttl / 2 + crate::utils::random_duration(server_ttl / 10)
}

/// What the heartbeat task is doing right now
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeartbeatPhase {
    #[default]
    Init,
    Idle,
    BuildingSnapshot,
    Announcing,
    KeepingAlive,
    Stopped,
}

/// Observable heartbeat state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeartbeatStatus {
    pub phase: HeartbeatPhase,
    pub ticks: u64,
    pub announces: u64,
    pub keep_alives: u64,
    pub failures: u64,
    pub consecutive_failures: u64,
    pub last_error: Option<String>,
}

pub struct HeartbeatConfig {
    /// Name of the announced database
    pub name: String,
    pub announcer: Arc<dyn Announcer>,
    pub get_server_info: GetServerInfo,
    pub announce_period: Duration,
    pub keep_alive_period: Duration,
    pub check_period: Duration,
    pub server_ttl: Duration,
    pub clock: Arc<dyn Clock>,
    /// Shared close context; cancelling it stops the heartbeat
    pub context: CancellationToken,
}

impl HeartbeatConfig {
    fn check(&self) -> GatewayResult<()> {
        if self.name.is_empty() {
            return Err(GatewayError::bad_parameter("missing heartbeat name"));
        }
        for (field, value) in [
            ("announce_period", self.announce_period),
            ("keep_alive_period", self.keep_alive_period),
            ("check_period", self.check_period),
            ("server_ttl", self.server_ttl),
        ] {
            if value.is_zero() {
                return Err(GatewayError::bad_parameter(format!(
                    "heartbeat {} must be positive",
                    field
                )));
            }
        }
        Ok(())
    }
}

pub struct Heartbeat {
    name: String,
    cancel: CancellationToken,
    status: watch::Sender<HeartbeatStatus>,
    state: Mutex<Option<HeartbeatLoop>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Heartbeat {
    pub fn new(cfg: HeartbeatConfig) -> GatewayResult<Self> {
        cfg.check()?;
        let cancel = cfg.context.child_token();
        let (status, _) = watch::channel(HeartbeatStatus::default());
        Ok(Self {
            name: cfg.name.clone(),
            cancel,
            state: Mutex::new(Some(HeartbeatLoop {
                cfg,
                status: status.clone(),
                current: HeartbeatStatus::default(),
                last_announced: None,
                next_announce: SystemTime::UNIX_EPOCH,
                next_keep_alive: SystemTime::UNIX_EPOCH,
            })),
            status,
            task: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawn the heartbeat task. Calling it again is a no-op.
    pub fn start(&self) {
        let state = match self.state.lock() {
            Ok(mut state) => state.take(),
            Err(e) => e.into_inner().take(),
        };
        let Some(state) = state else {
            return;
        };
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(state.run(cancel));
        match self.task.lock() {
            Ok(mut task) => *task = Some(handle),
            Err(e) => *e.into_inner() = Some(handle),
        }
    }

    pub fn status(&self) -> HeartbeatStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<HeartbeatStatus> {
        self.status.subscribe()
    }

    pub fn is_running(&self) -> bool {
        match self.task.lock() {
            Ok(task) => task.as_ref().map_or(false, |t| !t.is_finished()),
            Err(e) => e.into_inner().as_ref().map_or(false, |t| !t.is_finished()),
        }
    }

    /// Stop the heartbeat and wait for its task to exit
    pub async fn close(&self) -> GatewayResult<()> {
        self.cancel.cancel();
        let handle = match self.task.lock() {
            Ok(mut task) => task.take(),
            Err(e) => e.into_inner().take(),
        };
        let Some(mut handle) = handle else {
            return Ok(());
        };
        match tokio::time::timeout(CLOSE_TIMEOUT, &mut handle).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(GatewayError::internal(format!(
                "heartbeat {} failed: {}",
                self.name, e
            ))),
            Err(_) => {
                handle.abort();
                Err(GatewayError::timeout(format!("closing heartbeat {}", self.name)))
            }
        }
    }
}

/// State owned by the running heartbeat task
struct HeartbeatLoop {
    cfg: HeartbeatConfig,
    status: watch::Sender<HeartbeatStatus>,
    current: HeartbeatStatus,
    last_announced: Option<DatabaseServer>,
    next_announce: SystemTime,
    next_keep_alive: SystemTime,
}

impl HeartbeatLoop {
    async fn run(mut self, cancel: CancellationToken) {
        info!(database = %self.cfg.name, "Heartbeat started.");
        let mut ticker = tokio::time::interval(self.cfg.check_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = self.tick() => {}
            }
        }

        self.set_phase(HeartbeatPhase::Stopped);
        info!(database = %self.cfg.name, "Heartbeat stopped.");
    }

    async fn tick(&mut self) {
        self.current.ticks += 1;
        self.set_phase(HeartbeatPhase::BuildingSnapshot);

        let snapshot = match (self.cfg.get_server_info)() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.report(Err(e));
                self.set_phase(HeartbeatPhase::Idle);
                return;
            }
        };
        let now = self.cfg.clock.now();

        if self.announce_due(&snapshot, now) {
            self.set_phase(HeartbeatPhase::Announcing);
            let result = self.cfg.announcer.upsert_database_server(&snapshot).await;
            if result.is_ok() {
                debug!(database = %self.cfg.name, "Announced database server.");
                self.current.announces += 1;
                self.last_announced = Some(snapshot);
                self.next_announce = now + self.cfg.announce_period;
                self.next_keep_alive = now + self.cfg.keep_alive_period;
            }
            self.report(result);
        } else if now >= self.next_keep_alive {
            self.set_phase(HeartbeatPhase::KeepingAlive);
            let keep_alive = KeepAlive {
                name: snapshot.name().to_string(),
                host_id: snapshot.host_id.clone(),
                expires: now + self.cfg.server_ttl,
            };
            let result = self.cfg.announcer.keep_alive(&keep_alive).await;
            if result.is_ok() {
                self.current.keep_alives += 1;
                self.next_keep_alive = now + self.cfg.keep_alive_period;
            } else {
                // Announce again on the next tick
                self.last_announced = None;
            }
            self.report(result);
        }

        self.set_phase(HeartbeatPhase::Idle);
    }

    fn announce_due(&self, snapshot: &DatabaseServer, now: SystemTime) -> bool {
        match &self.last_announced {
            None => true,
            Some(last) => !last.same_content(snapshot) || now >= self.next_announce,
        }
    }

    fn report(&mut self, result: GatewayResult<()>) {
        match result {
            Ok(()) => {
                self.current.consecutive_failures = 0;
                self.current.last_error = None;
            }
            Err(e) => {
                self.current.failures += 1;
                self.current.consecutive_failures += 1;
                self.current.last_error = Some(e.to_string());
                warn!(database = %self.cfg.name, error = %e, "Heartbeat failed.");
            }
        }
        self.status.send_replace(self.current.clone());
    }

    fn set_phase(&mut self, phase: HeartbeatPhase) {
        self.current.phase = phase;
        self.status.send_replace(self.current.clone());
    }
}
