/// Protocol engines
///
/// An engine owns one client connection after authorization and speaks the
/// database wire protocol on both sides. Engines are created per connection
/// by factories registered for a protocol name.
pub mod relay;

pub use relay::RelayEngine;

use crate::audit::Audit;
use crate::auth::DbAuth;
use crate::core::{Session, PROTOCOL_MONGODB, PROTOCOL_MYSQL, PROTOCOL_POSTGRES};
use crate::error::{GatewayError, GatewayResult};
use crate::utils::Clock;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

/// Bidirectional byte stream handed to engines
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type ClientConn = Box<dyn AsyncStream>;

#[async_trait]
pub trait Engine: Send + Sync {
    /// Serve the client until either side disconnects
    async fn handle_connection(&self, session: &mut Session, conn: ClientConn) -> GatewayResult<()>;
}

/// Everything an engine needs besides the session and the connection
#[derive(Clone)]
pub struct EngineConfig {
    pub auth: Arc<dyn DbAuth>,
    pub audit: Audit,
    /// Server close context
    pub context: CancellationToken,
    pub clock: Arc<dyn Clock>,
    /// Session logging span
    pub span: tracing::Span,
}

pub type EngineFactory = Arc<dyn Fn(EngineConfig) -> Box<dyn Engine> + Send + Sync>;

/// Protocol name to engine factory mapping
#[derive(Clone, Default)]
pub struct EngineRegistry {
    factories: HashMap<String, EngineFactory>,
}

impl EngineRegistry {
    /// Registry without any protocol
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry relaying every built-in protocol
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for protocol in [PROTOCOL_POSTGRES, PROTOCOL_MYSQL, PROTOCOL_MONGODB] {
            registry.register(protocol, move |cfg| {
                Box::new(RelayEngine::new(protocol, cfg)) as Box<dyn Engine>
            });
        }
        registry
    }

    /// Register `factory` for `protocol`, replacing any previous one
    pub fn register<F>(&mut self, protocol: &str, factory: F)
    where
        F: Fn(EngineConfig) -> Box<dyn Engine> + Send + Sync + 'static,
    {
        self.factories.insert(protocol.to_string(), Arc::new(factory));
    }

    pub fn protocols(&self) -> Vec<String> {
        let mut protocols: Vec<String> = self.factories.keys().cloned().collect();
        protocols.sort();
        protocols
    }

    pub fn supports(&self, protocol: &str) -> bool {
        self.factories.contains_key(protocol)
    }

    /// Create a fresh engine for `protocol`
    pub fn dispatch(&self, protocol: &str, cfg: EngineConfig) -> GatewayResult<Box<dyn Engine>> {
        let factory = self.factories.get(protocol).ok_or_else(|| {
            GatewayError::bad_parameter(format!("unsupported database protocol {:?}", protocol))
        })?;
        Ok(factory(cfg))
    }
}
