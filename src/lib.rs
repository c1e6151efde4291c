pub mod audit;
pub mod auth;
pub mod config;
/// Pasarela - Access-control-aware database gateway
///
/// Pasarela terminates mutually authenticated TLS connections, extracts the
/// caller identity from the client certificate, authorizes the caller
/// against one of the proxied databases and hands the connection to the
/// protocol engine registered for that database.
///
/// Around the accept path it keeps every proxied database announced to the
/// control plane (heartbeats), refreshes command-backed labels and monitors
/// live connections for certificate expiry, locks and idleness.
pub mod core;
pub mod engines;
pub mod error;
pub mod heartbeat;
pub mod labels;
pub mod monitor;
pub mod net;
pub mod utils;

pub use error::{GatewayError, GatewayResult};

use crate::audit::{Audit, StreamEmitter, StreamWriter};
use crate::auth::{
    Authorizer, CachedDbAuth, CertIdentityMiddleware, ClusterAuthorities, DbAuth,
    IdentityMiddleware, LockWatcher,
};
use crate::core::{Database, DatabaseServer, IdentityContext, Session, StatementsCache, UserKind};
use crate::engines::{Engine, EngineConfig, EngineRegistry};
use crate::heartbeat::{
    announce_period, Announcer, GetServerInfo, Heartbeat, HeartbeatConfig, HeartbeatStatus,
    RotationGetter,
};
use crate::labels::DynamicLabels;
use crate::monitor::{monitor_conn, MonitorConfig};
use crate::net::{CaDownloader, HttpCaDownloader, TlsMaterial};
use crate::utils::{Clock, SystemClock};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Version reported in heartbeats
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Role whose CA rotation state is embedded in heartbeats
const ROTATION_ROLE: &str = "Db";

/// Heartbeat timings
#[derive(Debug, Clone)]
pub struct HeartbeatSettings {
    pub server_ttl: Duration,
    pub keep_alive_period: Duration,
    pub check_period: Duration,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            server_ttl: heartbeat::DEFAULT_SERVER_TTL,
            keep_alive_period: heartbeat::DEFAULT_KEEP_ALIVE_PERIOD,
            check_period: heartbeat::DEFAULT_CHECK_PERIOD,
        }
    }
}

/// Connection monitoring settings
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub check_interval: Duration,
    /// Zero disables idle detection unless a role sets one
    pub client_idle_timeout: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            check_interval: monitor::DEFAULT_CHECK_INTERVAL,
            client_idle_timeout: Duration::ZERO,
        }
    }
}

/// Why the server's close context was cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// `Server::close` was called
    Closed,
    /// The parent context passed to `ServerBuilder::build` was cancelled
    ParentCancelled,
}

/// Builds point-in-time snapshots of proxied databases
pub struct SnapshotBuilder {
    host_id: String,
    hostname: String,
    databases: Arc<RwLock<Vec<Database>>>,
    dynamic_labels: HashMap<String, Arc<DynamicLabels>>,
    rotation: Arc<dyn RotationGetter>,
    clock: Arc<dyn Clock>,
    server_ttl: Duration,
}

impl SnapshotBuilder {
    /// Fresh snapshot of database `name`, expiring one TTL from now
    pub fn build(&self, name: &str) -> GatewayResult<DatabaseServer> {
        let mut database = {
            let databases = match self.databases.read() {
                Ok(databases) => databases,
                Err(e) => e.into_inner(),
            };
            databases
                .iter()
                .find(|db| db.name == name)
                .cloned()
                .ok_or_else(|| GatewayError::not_found(format!("database {:?} not found", name)))?
        };
        if let Some(labels) = self.dynamic_labels.get(name) {
            database.set_dynamic_labels(labels.get());
        }

        let rotation = match self.rotation.get_rotation(ROTATION_ROLE) {
            Ok(rotation) => Some(rotation),
            Err(e) if e.is_not_found() => {
                debug!(database = %name, "No rotation state, announcing without it.");
                None
            }
            Err(e) => {
                warn!(database = %name, error = %e, "Failed to get rotation state.");
                None
            }
        };

        Ok(DatabaseServer {
            host_id: self.host_id.clone(),
            hostname: self.hostname.clone(),
            version: VERSION.to_string(),
            database,
            rotation,
            expiry: self.clock.now() + self.server_ttl,
        })
    }
}

/// Builder for [`Server`]
#[derive(Default)]
pub struct ServerBuilder {
    data_dir: Option<PathBuf>,
    host_id: Option<String>,
    hostname: Option<String>,
    cluster_name: Option<String>,
    databases: Vec<Database>,
    tls: Option<TlsMaterial>,
    middleware: Option<Arc<dyn IdentityMiddleware>>,
    authorizer: Option<Arc<dyn Authorizer>>,
    announcer: Option<Arc<dyn Announcer>>,
    rotation: Option<Arc<dyn RotationGetter>>,
    lock_watcher: Option<Arc<dyn LockWatcher>>,
    emitter: Option<Arc<dyn StreamEmitter>>,
    auth: Option<Arc<dyn DbAuth>>,
    ca_downloader: Option<Arc<dyn CaDownloader>>,
    clock: Option<Arc<dyn Clock>>,
    engines: Option<EngineRegistry>,
    heartbeat: HeartbeatSettings,
    monitor: MonitorSettings,
}

fn missing(field: &str) -> GatewayError {
    GatewayError::bad_parameter(format!("missing {}", field))
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn data_dir<P: Into<PathBuf>>(mut self, data_dir: P) -> Self {
        self.data_dir = Some(data_dir.into());
        self
    }

    pub fn host_id<S: Into<String>>(mut self, host_id: S) -> Self {
        self.host_id = Some(host_id.into());
        self
    }

    pub fn hostname<S: Into<String>>(mut self, hostname: S) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn cluster_name<S: Into<String>>(mut self, cluster_name: S) -> Self {
        self.cluster_name = Some(cluster_name.into());
        self
    }

    pub fn database(mut self, database: Database) -> Self {
        self.databases.push(database);
        self
    }

    pub fn databases(mut self, databases: Vec<Database>) -> Self {
        self.databases.extend(databases);
        self
    }

    pub fn tls(mut self, tls: TlsMaterial) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn identity_middleware(mut self, middleware: Arc<dyn IdentityMiddleware>) -> Self {
        self.middleware = Some(middleware);
        self
    }

    pub fn authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    pub fn announcer(mut self, announcer: Arc<dyn Announcer>) -> Self {
        self.announcer = Some(announcer);
        self
    }

    pub fn rotation_getter(mut self, rotation: Arc<dyn RotationGetter>) -> Self {
        self.rotation = Some(rotation);
        self
    }

    pub fn lock_watcher(mut self, lock_watcher: Arc<dyn LockWatcher>) -> Self {
        self.lock_watcher = Some(lock_watcher);
        self
    }

    pub fn stream_emitter(mut self, emitter: Arc<dyn StreamEmitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }

    pub fn db_auth(mut self, auth: Arc<dyn DbAuth>) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn ca_downloader(mut self, downloader: Arc<dyn CaDownloader>) -> Self {
        self.ca_downloader = Some(downloader);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn engines(mut self, engines: EngineRegistry) -> Self {
        self.engines = Some(engines);
        self
    }

    pub fn heartbeat_settings(mut self, settings: HeartbeatSettings) -> Self {
        self.heartbeat = settings;
        self
    }

    pub fn monitor_settings(mut self, settings: MonitorSettings) -> Self {
        self.monitor = settings;
        self
    }

    /// Validate the configuration, initialize every database and create the
    /// server. Nothing runs until [`Server::start`].
    pub async fn build(self, parent: &CancellationToken) -> GatewayResult<Server> {
        let data_dir = self.data_dir.ok_or_else(|| missing("data_dir"))?;
        let host_id = self.host_id.ok_or_else(|| missing("host_id"))?;
        let hostname = self.hostname.ok_or_else(|| missing("hostname"))?;
        let cluster_name = self.cluster_name.ok_or_else(|| missing("cluster_name"))?;
        let tls = self.tls.ok_or_else(|| missing("tls"))?;
        let authorizer = self.authorizer.ok_or_else(|| missing("authorizer"))?;
        let announcer = self.announcer.ok_or_else(|| missing("announcer"))?;
        let rotation = self.rotation.ok_or_else(|| missing("rotation_getter"))?;
        let lock_watcher = self.lock_watcher.ok_or_else(|| missing("lock_watcher"))?;
        let emitter = self.emitter.ok_or_else(|| missing("stream_emitter"))?;
        if self.databases.is_empty() {
            return Err(missing("databases"));
        }

        let mut names = HashSet::new();
        for db in &self.databases {
            if !names.insert(db.name.clone()) {
                return Err(GatewayError::bad_parameter(format!(
                    "duplicate database name {:?}",
                    db.name
                )));
            }
        }

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let auth = self.auth.unwrap_or_else(|| Arc::new(CachedDbAuth::new()));
        let engines = self.engines.unwrap_or_else(EngineRegistry::with_defaults);
        let middleware: Arc<dyn IdentityMiddleware> = match self.middleware {
            Some(middleware) => middleware,
            None => Arc::new(CertIdentityMiddleware::new(
                cluster_name.clone(),
                ClusterAuthorities::from_material(&cluster_name, &tls)?,
            )),
        };
        let acceptor = TlsAcceptor::from(tls.server_config()?);
        let close_ctx = parent.child_token();

        let mut ca_downloader = self.ca_downloader;
        let mut databases = self.databases;
        let mut dynamic_labels = HashMap::new();
        for db in databases.iter_mut() {
            if !db.dynamic_labels.is_empty() {
                let labels =
                    DynamicLabels::new(db.name.clone(), db.dynamic_labels.clone(), &close_ctx)?;
                labels.sync().await;
                db.set_dynamic_labels(labels.get());
                dynamic_labels.insert(db.name.clone(), Arc::new(labels));
            }
            if db.needs_cloud_ca() {
                let downloader = match &ca_downloader {
                    Some(downloader) => downloader.clone(),
                    None => {
                        let downloader: Arc<dyn CaDownloader> = Arc::new(HttpCaDownloader::new()?);
                        ca_downloader = Some(downloader.clone());
                        downloader
                    }
                };
                let ca_cert = net::init_ca_cert(&data_dir, db, downloader.as_ref()).await?;
                db.ca_cert = ca_cert;
            }
            info!(database = %db.name, protocol = %db.protocol, "Initialized database.");
        }

        let databases = Arc::new(RwLock::new(databases));
        let snapshots = Arc::new(SnapshotBuilder {
            host_id: host_id.clone(),
            hostname,
            databases: databases.clone(),
            dynamic_labels: dynamic_labels.clone(),
            rotation,
            clock: clock.clone(),
            server_ttl: self.heartbeat.server_ttl,
        });

        let mut heartbeats = HashMap::new();
        for name in names {
            let builder = snapshots.clone();
            let get_server_info: GetServerInfo = {
                let name = name.clone();
                Arc::new(move || builder.build(&name))
            };
            let heartbeat = Heartbeat::new(HeartbeatConfig {
                name: name.clone(),
                announcer: announcer.clone(),
                get_server_info,
                announce_period: announce_period(self.heartbeat.server_ttl),
                keep_alive_period: self.heartbeat.keep_alive_period,
                check_period: self.heartbeat.check_period,
                server_ttl: self.heartbeat.server_ttl,
                clock: clock.clone(),
                context: close_ctx.clone(),
            })?;
            heartbeats.insert(name, heartbeat);
        }

        Ok(Server {
            inner: Arc::new(ServerInner {
                host_id,
                cluster_name,
                databases,
                snapshots,
                dynamic_labels,
                heartbeats,
                acceptor,
                middleware,
                authorizer,
                lock_watcher,
                emitter,
                auth,
                engines,
                clock,
                monitor: self.monitor,
                close_ctx,
                closed: AtomicBool::new(false),
                connections: TaskTracker::new(),
            }),
        })
    }
}

/// Database access server
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    host_id: String,
    cluster_name: String,
    databases: Arc<RwLock<Vec<Database>>>,
    snapshots: Arc<SnapshotBuilder>,
    dynamic_labels: HashMap<String, Arc<DynamicLabels>>,
    heartbeats: HashMap<String, Heartbeat>,
    acceptor: TlsAcceptor,
    middleware: Arc<dyn IdentityMiddleware>,
    authorizer: Arc<dyn Authorizer>,
    lock_watcher: Arc<dyn LockWatcher>,
    emitter: Arc<dyn StreamEmitter>,
    auth: Arc<dyn DbAuth>,
    engines: EngineRegistry,
    clock: Arc<dyn Clock>,
    monitor: MonitorSettings,
    /// Shared close context; cancelled by `close` or by the parent
    close_ctx: CancellationToken,
    closed: AtomicBool,
    /// In-flight connections and audit flushes
    connections: TaskTracker,
}

impl Server {
    /// Launch every dynamic label refresher and heartbeat
    pub fn start(&self) {
        for labels in self.inner.dynamic_labels.values() {
            labels.start();
        }
        for heartbeat in self.inner.heartbeats.values() {
            heartbeat.start();
        }
        info!(
            host_id = %self.inner.host_id,
            databases = self.inner.heartbeats.len(),
            "Database service started."
        );
    }

    /// Accept connections from `listener` until the server is closed
    pub async fn serve(&self, listener: TcpListener) -> GatewayResult<()> {
        info!(addr = %listener.local_addr()?, "Accepting database connections.");
        loop {
            tokio::select! {
                _ = self.inner.close_ctx.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        net::configure_client_socket(&stream);
                        let server = self.clone();
                        self.inner.connections.spawn(async move {
                            server.handle_connection(stream, Some(peer)).await;
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection.");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                }
            }
        }
        info!("Stopped accepting database connections.");
        Ok(())
    }

    /// Handle one accepted connection. Errors are logged, never returned.
    pub async fn handle_connection<S>(&self, conn: S, peer: Option<SocketAddr>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let peer = peer.map_or_else(|| "unknown".to_string(), |addr| addr.to_string());
        let span = info_span!("conn", peer = %peer);
        self.serve_connection(conn).instrument(span).await
    }

    async fn serve_connection<S>(&self, conn: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        debug!("Accepted connection.");
        let tls = match self.inner.acceptor.accept(conn).await {
            Ok(tls) => tls,
            Err(e) => {
                warn!(error = %e, "TLS handshake failed.");
                return;
            }
        };

        let identity = match tls.get_ref().1.peer_certificates() {
            Some(chain) => self.inner.middleware.identity_from_chain(chain),
            None => Err(GatewayError::access_denied("client certificate required")),
        };
        let identity = match identity {
            Ok(identity) => identity,
            Err(e) => {
                log_connection_error(&e);
                return;
            }
        };

        if let Err(e) = self.handle_identified(identity, tls).await {
            log_connection_error(&e);
        }
    }

    async fn handle_identified<S>(
        &self,
        identity: IdentityContext,
        conn: tokio_rustls::server::TlsStream<S>,
    ) -> GatewayResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut session = self.authorize(&identity).await?;

        let stream = self.inner.emitter.create_audit_stream(&session.id).await?;
        let _closer = StreamCloser {
            writer: Some(stream.clone()),
            ctx: self.inner.close_ctx.clone(),
            tracker: self.inner.connections.clone(),
            span: session.span.clone(),
        };
        let audit = Audit::new(stream, self.inner.clock.clone());

        let conn = monitor_conn(
            conn,
            MonitorConfig {
                identity: session.identity.clone(),
                session_id: session.id.clone(),
                lock_watcher: self.inner.lock_watcher.clone(),
                clock: self.inner.clock.clone(),
                idle_timeout: session
                    .checker
                    .adjust_client_idle_timeout(self.inner.monitor.client_idle_timeout),
                check_interval: self.inner.monitor.check_interval,
                audit: Some(audit.clone()),
                span: session.span.clone(),
            },
        );

        let engine = self.dispatch(&session, audit)?;
        let span = session.span.clone();
        engine
            .handle_connection(&mut session, Box::new(conn))
            .instrument(span)
            .await
    }

    /// Create the engine for the session's database protocol
    fn dispatch(&self, session: &Session, audit: Audit) -> GatewayResult<Box<dyn Engine>> {
        self.inner.engines.dispatch(
            &session.database.protocol,
            EngineConfig {
                auth: self.inner.auth.clone(),
                audit,
                context: self.inner.close_ctx.clone(),
                clock: self.inner.clock.clone(),
                span: session.span.clone(),
            },
        )
    }

    /// Authorize the caller and build its session
    pub async fn authorize(&self, ctx: &IdentityContext) -> GatewayResult<Session> {
        match &ctx.kind {
            UserKind::Local | UserKind::Remote { .. } => {}
            other => {
                return Err(GatewayError::bad_parameter(format!(
                    "invalid identity kind: {}",
                    other
                )))
            }
        }

        let auth_ctx = self.inner.authorizer.authorize(ctx).await?;
        let identity = auth_ctx.identity;
        let route = identity.route_to_database.clone();
        debug!(user = %identity.username, fingerprint = %identity.fingerprint, "Client identity.");

        // Names are unique; the first match wins.
        let mut database = {
            let databases = match self.inner.databases.read() {
                Ok(databases) => databases,
                Err(e) => e.into_inner(),
            };
            match databases.iter().find(|db| db.name == route.service_name) {
                Some(db) => db.clone(),
                None => {
                    let names: Vec<&str> = databases.iter().map(|db| db.name.as_str()).collect();
                    return Err(GatewayError::not_found(format!(
                        "{:?} not found among registered databases: {:?}",
                        route.service_name, names
                    )));
                }
            }
        };
        if let Some(labels) = self.inner.dynamic_labels.get(&database.name) {
            database.set_dynamic_labels(labels.get());
        }

        let cluster_name = if identity.route_to_cluster.is_empty() {
            self.inner.cluster_name.clone()
        } else {
            identity.route_to_cluster.clone()
        };
        let id = Uuid::new_v4().to_string();
        let span = info_span!("session", id = %id, db = %database.name);
        Ok(Session {
            id,
            cluster_name,
            host_id: self.inner.host_id.clone(),
            database,
            identity,
            database_user: route.username,
            database_name: route.database,
            checker: auth_ctx.checker,
            startup_parameters: HashMap::new(),
            statements: StatementsCache::new(),
            started_at: self.inner.clock.now(),
            span,
        })
    }

    /// Stop background work and release shared resources.
    ///
    /// Connections being served are left to finish; use [`Server::drain`]
    /// to wait for them.
    pub async fn close(&self) -> GatewayResult<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        for labels in self.inner.dynamic_labels.values() {
            labels.close();
        }
        self.inner.close_ctx.cancel();

        let mut results = Vec::with_capacity(self.inner.heartbeats.len() + 1);
        for heartbeat in self.inner.heartbeats.values() {
            results.push(heartbeat.close().await);
        }
        results.push(self.inner.auth.close());

        let result = GatewayError::aggregate(results);
        match &result {
            Ok(()) => info!("Database service closed."),
            Err(e) => error!(error = %e, "Database service closed with errors."),
        }
        result
    }

    /// Wait until the close context is cancelled
    pub async fn wait(&self) -> ShutdownReason {
        self.inner.close_ctx.cancelled().await;
        if self.inner.closed.load(Ordering::SeqCst) {
            ShutdownReason::Closed
        } else {
            ShutdownReason::ParentCancelled
        }
    }

    /// Wait for in-flight connections and audit flushes without cancelling them
    pub async fn drain(&self) {
        self.inner.connections.close();
        self.inner.connections.wait().await;
    }

    /// Snapshot of database `name` as a heartbeat would announce it
    pub fn server_info(&self, name: &str) -> GatewayResult<DatabaseServer> {
        self.inner.snapshots.build(name)
    }

    pub fn database_names(&self) -> Vec<String> {
        match self.inner.databases.read() {
            Ok(databases) => databases.iter().map(|db| db.name.clone()).collect(),
            Err(e) => e.into_inner().iter().map(|db| db.name.clone()).collect(),
        }
    }

    pub fn heartbeat_count(&self) -> usize {
        self.inner.heartbeats.len()
    }

    pub fn running_heartbeats(&self) -> usize {
        self.inner
            .heartbeats
            .values()
            .filter(|hb| hb.is_running())
            .count()
    }

    pub fn heartbeat_status(&self, name: &str) -> Option<HeartbeatStatus> {
        self.inner.heartbeats.get(name).map(Heartbeat::status)
    }

    pub fn dynamic_label_count(&self) -> usize {
        self.inner.dynamic_labels.len()
    }

    /// Number of label refresh tasks still running across all databases
    pub fn running_label_tasks(&self) -> usize {
        self.inner
            .dynamic_labels
            .values()
            .map(|labels| labels.running_tasks())
            .sum()
    }

    /// Connections and audit flushes not yet finished
    pub fn in_flight(&self) -> usize {
        self.inner.connections.len()
    }

    pub fn close_context(&self) -> CancellationToken {
        self.inner.close_ctx.clone()
    }
}

fn log_connection_error(err: &GatewayError) {
    if err.is_ok_network_error() || err.is_access_denied() {
        debug!(error = %err, "Connection closed.");
    } else if err.is_not_found() {
        info!(error = %err, "Connection rejected.");
    } else {
        error!(error = %err, "Failed to handle connection.");
    }
}

/// Closes a session's audit stream once the connection handler returns,
/// on every exit path
struct StreamCloser {
    writer: Option<Arc<dyn StreamWriter>>,
    ctx: CancellationToken,
    tracker: TaskTracker,
    span: tracing::Span,
}

impl Drop for StreamCloser {
    fn drop(&mut self) {
        let Some(writer) = self.writer.take() else {
            return;
        };
        let ctx = self.ctx.clone();
        let close = async move {
            match writer.close(&ctx).await {
                Ok(()) => debug!("Closed session recording."),
                Err(e) => warn!(error = %e, "Failed to close stream writer."),
            }
        }
        .instrument(self.span.clone());

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(self.tracker.track_future(close));
            }
            Err(_) => warn!("No runtime to close session recording."),
        }
    }
}
