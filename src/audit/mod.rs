/// Session audit trail
///
/// Every authorized connection gets its own audit stream. Engines record
/// events through the [`Audit`] facade; the stream is flushed and closed
/// exactly once when the connection ends.
use crate::core::Session;
use crate::error::{GatewayError, GatewayResult};
use crate::utils::Clock;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    SessionStart {
        session_id: String,
        user: String,
        database_service: String,
        database_protocol: String,
        database_uri: String,
        database_user: String,
        database_name: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        time: SystemTime,
    },
    SessionEnd {
        session_id: String,
        user: String,
        database_service: String,
        database_user: String,
        database_name: String,
        time: SystemTime,
    },
    Query {
        session_id: String,
        user: String,
        database_service: String,
        database_name: String,
        query: String,
        time: SystemTime,
    },
    ClientDisconnect {
        session_id: String,
        user: String,
        reason: String,
        time: SystemTime,
    },
}

impl AuditEvent {
    pub fn session_id(&self) -> &str {
        match self {
            AuditEvent::SessionStart { session_id, .. }
            | AuditEvent::SessionEnd { session_id, .. }
            | AuditEvent::Query { session_id, .. }
            | AuditEvent::ClientDisconnect { session_id, .. } => session_id,
        }
    }
}

/// Per-session event sink
#[async_trait]
pub trait StreamWriter: Send + Sync {
    async fn emit(&self, event: AuditEvent) -> GatewayResult<()>;

    /// Flush and complete the stream. `ctx` bounds how long the flush may
    /// take; once it is cancelled the recording is abandoned.
    async fn close(&self, ctx: &CancellationToken) -> GatewayResult<()>;
}

/// Factory of per-session streams
#[async_trait]
pub trait StreamEmitter: Send + Sync {
    async fn create_audit_stream(&self, session_id: &str) -> GatewayResult<Arc<dyn StreamWriter>>;
}

/// Session-aware event recorder handed to engines
#[derive(Clone)]
pub struct Audit {
    writer: Arc<dyn StreamWriter>,
    clock: Arc<dyn Clock>,
}

impl Audit {
    pub fn new(writer: Arc<dyn StreamWriter>, clock: Arc<dyn Clock>) -> Self {
        Self { writer, clock }
    }

    async fn emit(&self, event: AuditEvent) {
        if let Err(e) = self.writer.emit(event).await {
            warn!(error = %e, "Failed to emit audit event.");
        }
    }

    pub async fn on_session_start(&self, session: &Session, error: Option<&GatewayError>) {
        self.emit(AuditEvent::SessionStart {
            session_id: session.id.clone(),
            user: session.identity.username.clone(),
            database_service: session.database.name.clone(),
            database_protocol: session.database.protocol.clone(),
            database_uri: session.database.uri.clone(),
            database_user: session.database_user.clone(),
            database_name: session.database_name.clone(),
            success: error.is_none(),
            error: error.map(|e| e.to_string()),
            time: self.clock.now(),
        })
        .await
    }

    pub async fn on_session_end(&self, session: &Session) {
        self.emit(AuditEvent::SessionEnd {
            session_id: session.id.clone(),
            user: session.identity.username.clone(),
            database_service: session.database.name.clone(),
            database_user: session.database_user.clone(),
            database_name: session.database_name.clone(),
            time: self.clock.now(),
        })
        .await
    }

    pub async fn on_query(&self, session: &Session, query: &str) {
        self.emit(AuditEvent::Query {
            session_id: session.id.clone(),
            user: session.identity.username.clone(),
            database_service: session.database.name.clone(),
            database_name: session.database_name.clone(),
            query: query.to_string(),
            time: self.clock.now(),
        })
        .await
    }

    pub async fn on_client_disconnect(&self, session_id: &str, user: &str, reason: &str) {
        self.emit(AuditEvent::ClientDisconnect {
            session_id: session_id.to_string(),
            user: user.to_string(),
            reason: reason.to_string(),
            time: self.clock.now(),
        })
        .await
    }
}

/// Writes each session's events to `<dir>/<session-id>.jsonl` when the
/// stream is closed
#[derive(Debug, Clone)]
pub struct FileStreamEmitter {
    dir: PathBuf,
}

impl FileStreamEmitter {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl StreamEmitter for FileStreamEmitter {
    async fn create_audit_stream(&self, session_id: &str) -> GatewayResult<Arc<dyn StreamWriter>> {
        tokio::fs::create_dir_all(&self.dir).await?;
        Ok(Arc::new(FileStreamWriter {
            path: self.dir.join(format!("{}.jsonl", session_id)),
            events: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }))
    }
}

pub struct FileStreamWriter {
    path: PathBuf,
    events: Mutex<Vec<AuditEvent>>,
    closed: AtomicBool,
}

impl FileStreamWriter {
    async fn flush(&self) -> GatewayResult<()> {
        let events = std::mem::take(&mut *self.events.lock().await);
        let mut out = Vec::new();
        for event in &events {
            serde_json::to_writer(&mut out, event)
                .map_err(|e| GatewayError::internal(format!("failed to encode audit event: {}", e)))?;
            out.push(b'\n');
        }
        tokio::fs::write(&self.path, out).await?;
        debug!(path = %self.path.display(), events = events.len(), "Session recording written.");
        Ok(())
    }
}

#[async_trait]
impl StreamWriter for FileStreamWriter {
    async fn emit(&self, event: AuditEvent) -> GatewayResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(GatewayError::bad_parameter("audit stream is closed"));
        }
        self.events.lock().await.push(event);
        Ok(())
    }

    async fn close(&self, ctx: &CancellationToken) -> GatewayResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(GatewayError::bad_parameter("audit stream is already closed"));
        }
        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(GatewayError::canceled("flushing session recording")),
            result = self.flush() => result,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::RoleSet;
    use crate::core::session::testing::session;
    use crate::core::Database;
    use crate::utils::SystemClock;
    use tempfile::tempdir;

    fn disconnect(id: &str) -> AuditEvent {
        AuditEvent::ClientDisconnect {
            session_id: id.to_string(),
            user: "alice".to_string(),
            reason: "idle".to_string(),
            time: SystemTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn test_event_serialization_tag() {
        let json = serde_json::to_string(&disconnect("s1")).unwrap();
        assert!(json.contains("\"event\":\"client_disconnect\""));
        let parsed: AuditEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.session_id(), "s1");
    }

    #[tokio::test]
    async fn test_file_stream_written_on_close() {
        let dir = tempdir().unwrap();
        let emitter = FileStreamEmitter::new(dir.path().join("sessions"));
        let stream = emitter.create_audit_stream("s1").await.unwrap();

        let audit = Audit::new(stream.clone(), Arc::new(SystemClock));
        audit.on_client_disconnect("s1", "alice", "idle").await;
        stream.emit(disconnect("s1")).await.unwrap();

        stream.close(&CancellationToken::new()).await.unwrap();
        let contents =
            std::fs::read_to_string(dir.path().join("sessions").join("s1.jsonl")).unwrap();
        assert_eq!(contents.lines().count(), 2);

        assert!(stream.emit(disconnect("s1")).await.is_err());
        assert!(stream.close(&CancellationToken::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_session_events_recorded_in_order() {
        let dir = tempdir().unwrap();
        let emitter = FileStreamEmitter::new(dir.path());
        let stream = emitter.create_audit_stream("session-1").await.unwrap();
        let audit = Audit::new(stream.clone(), Arc::new(SystemClock));
        let session = session(
            Database::new("pg1", "postgres", "localhost:5432"),
            Arc::new(RoleSet::new(Vec::new())),
        );

        audit.on_session_start(&session, None).await;
        audit.on_query(&session, "SELECT * FROM users").await;
        audit.on_session_end(&session).await;
        stream.close(&CancellationToken::new()).await.unwrap();

        let contents =
            std::fs::read_to_string(dir.path().join("session-1.jsonl")).unwrap();
        let events: Vec<AuditEvent> = contents
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(events.len(), 3);
        match &events[1] {
            AuditEvent::Query {
                session_id,
                user,
                database_service,
                database_name,
                query,
                ..
            } => {
                assert_eq!(session_id, "session-1");
                assert_eq!(user, "alice");
                assert_eq!(database_service, "pg1");
                assert_eq!(database_name, "app");
                assert_eq!(query, "SELECT * FROM users");
            }
            other => panic!("expected query event, got {:?}", other),
        }
        assert!(matches!(events[0], AuditEvent::SessionStart { success: true, .. }));
        assert!(matches!(events[2], AuditEvent::SessionEnd { .. }));
    }

    #[tokio::test]
    async fn test_close_with_cancelled_context_abandons_recording() {
        let dir = tempdir().unwrap();
        let emitter = FileStreamEmitter::new(dir.path());
        let stream = emitter.create_audit_stream("s2").await.unwrap();
        stream.emit(disconnect("s2")).await.unwrap();

        let ctx = CancellationToken::new();
        ctx.cancel();
        let err = stream.close(&ctx).await.unwrap_err();
        assert!(matches!(err, GatewayError::Canceled { .. }));
        assert!(!dir.path().join("s2.jsonl").exists());
    }
}
