/// Transparent relay engine: checks access, connects to the backend
/// (over TLS when the database has a CA) and forwards bytes both ways
use super::{ClientConn, Engine, EngineConfig};
use crate::core::{Session, PROTOCOL_MONGODB, PROTOCOL_MYSQL, PROTOCOL_POSTGRES};
use crate::error::{GatewayError, GatewayResult};
use async_trait::async_trait;
use rustls::pki_types::ServerName;
use std::io;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, Instrument};
use url::Url;

/// Default timeout for backend connections
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Bytes moved during one relayed session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub client_to_backend: u64,
    pub backend_to_client: u64,
    pub duration: Duration,
}

pub struct RelayEngine {
    protocol: String,
    cfg: EngineConfig,
    connect_timeout: Duration,
}

impl RelayEngine {
    pub fn new<S: Into<String>>(protocol: S, cfg: EngineConfig) -> Self {
        Self {
            protocol: protocol.into(),
            cfg,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    async fn connect(&self, host: &str, port: u16) -> GatewayResult<TcpStream> {
        debug!(host = %host, port, "Connecting to database.");
        let stream = timeout(self.connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| GatewayError::timeout(format!("connecting to {}:{}", host, port)))??;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY on backend stream.");
        }
        Ok(stream)
    }

    async fn serve(&self, session: &mut Session, mut client: ClientConn) -> GatewayResult<()> {
        let audit = &self.cfg.audit;

        if let Err(e) = session.checker.check_access_to_database(
            &session.database,
            &session.database_user,
            &session.database_name,
        ) {
            audit.on_session_start(session, Some(&e)).await;
            return Err(e);
        }

        let (host, port) = match backend_address(&self.protocol, &session.database.uri) {
            Ok(addr) => addr,
            Err(e) => {
                audit.on_session_start(session, Some(&e)).await;
                return Err(e);
            }
        };
        let backend = match self.connect(&host, port).await {
            Ok(stream) => stream,
            Err(e) => {
                audit.on_session_start(session, Some(&e)).await;
                return Err(e);
            }
        };

        session
            .startup_parameters
            .insert("user".to_string(), session.database_user.clone());
        session
            .startup_parameters
            .insert("database".to_string(), session.database_name.clone());

        let result = if session.database.ca_cert.is_some() {
            let tls = match self.upgrade(session, &host, backend).await {
                Ok(tls) => tls,
                Err(e) => {
                    audit.on_session_start(session, Some(&e)).await;
                    return Err(e);
                }
            };
            audit.on_session_start(session, None).await;
            relay(&mut client, tls).await
        } else {
            audit.on_session_start(session, None).await;
            relay(&mut client, backend).await
        };
        audit.on_session_end(session).await;

        let stats = result?;
        info!(
            duration_ms = stats.duration.as_millis() as u64,
            client_to_backend = stats.client_to_backend,
            backend_to_client = stats.backend_to_client,
            "Session ended."
        );
        Ok(())
    }

    async fn upgrade(
        &self,
        session: &Session,
        host: &str,
        backend: TcpStream,
    ) -> GatewayResult<tokio_rustls::client::TlsStream<TcpStream>> {
        let config = self.cfg.auth.client_tls_config(&session.database)?;
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| GatewayError::tls(format!("invalid server name {:?}: {}", host, e)))?;
        let stream = TlsConnector::from(config)
            .connect(server_name, backend)
            .await
            .map_err(|e| GatewayError::tls(format!("TLS handshake with {} failed: {}", host, e)))?;
        Ok(stream)
    }
}

#[async_trait]
impl Engine for RelayEngine {
    async fn handle_connection(&self, session: &mut Session, conn: ClientConn) -> GatewayResult<()> {
        let span = self.cfg.span.clone();
        self.serve(session, conn).instrument(span).await
    }
}

async fn relay<B>(client: &mut ClientConn, mut backend: B) -> io::Result<RelayStats>
where
    B: AsyncRead + AsyncWrite + Unpin,
{
    let started = Instant::now();
    let (client_to_backend, backend_to_client) =
        tokio::io::copy_bidirectional(client, &mut backend).await?;
    Ok(RelayStats {
        client_to_backend,
        backend_to_client,
        duration: started.elapsed(),
    })
}

fn default_port(protocol: &str) -> Option<u16> {
    match protocol {
        PROTOCOL_POSTGRES => Some(5432),
        PROTOCOL_MYSQL => Some(3306),
        PROTOCOL_MONGODB => Some(27017),
        _ => None,
    }
}

/// Host and port of a backend given either as `host:port` or as a URL
pub fn backend_address(protocol: &str, uri: &str) -> GatewayResult<(String, u16)> {
    let url = if uri.contains("://") {
        Url::parse(uri)
    } else {
        Url::parse(&format!("tcp://{}", uri))
    }
    .map_err(|e| GatewayError::bad_parameter(format!("invalid database URI {:?}: {}", uri, e)))?;

    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| GatewayError::bad_parameter(format!("database URI {:?} has no host", uri)))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    let port = url
        .port()
        .or_else(|| default_port(protocol))
        .ok_or_else(|| GatewayError::bad_parameter(format!("database URI {:?} has no port", uri)))?;
    Ok((host, port))
}
