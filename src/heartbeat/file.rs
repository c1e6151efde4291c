/// File-backed announcer and rotation state, used when the gateway runs
/// without a control plane connection
use super::{Announcer, RotationGetter};
use crate::core::{DatabaseServer, KeepAlive, Rotation};
use crate::error::{GatewayError, GatewayResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// Writes each announced server to `<dir>/<name>.json`
pub struct FileAnnouncer {
    dir: PathBuf,
    announced: Mutex<HashMap<String, DatabaseServer>>,
}

impl FileAnnouncer {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self {
            dir: dir.into(),
            announced: Mutex::new(HashMap::new()),
        }
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", name))
    }

    async fn write(&self, server: &DatabaseServer) -> GatewayResult<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let json = serde_json::to_vec_pretty(server).map_err(|e| {
            GatewayError::announce(format!("failed to encode {}: {}", server.name(), e))
        })?;
        let path = self.path_for(server.name());
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[async_trait]
impl Announcer for FileAnnouncer {
    async fn upsert_database_server(&self, server: &DatabaseServer) -> GatewayResult<()> {
        self.write(server).await?;
        self.announced
            .lock()
            .await
            .insert(server.name().to_string(), server.clone());
        Ok(())
    }

    async fn keep_alive(&self, keep_alive: &KeepAlive) -> GatewayResult<()> {
        let mut announced = self.announced.lock().await;
        let server = announced.get_mut(&keep_alive.name).ok_or_else(|| {
            GatewayError::not_found(format!("server {:?} was never announced", keep_alive.name))
        })?;
        server.expiry = keep_alive.expires;
        let server = server.clone();
        drop(announced);
        self.write(&server).await
    }
}

/// Reads rotation state from a JSON file
#[derive(Debug, Clone)]
pub struct FileRotationGetter {
    path: PathBuf,
}

impl FileRotationGetter {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl RotationGetter for FileRotationGetter {
    fn get_rotation(&self, role: &str) -> GatewayResult<Rotation> {
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(GatewayError::not_found(format!(
                    "no rotation state for {} at {}",
                    role,
                    self.path.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&data).map_err(|e| {
            GatewayError::bad_parameter(format!(
                "invalid rotation state in {}: {}",
                self.path.display(),
                e
            ))
        })
    }
}
