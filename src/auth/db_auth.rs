/// Backend connection material: TLS client configuration used by engines to
/// reach the proxied databases
use crate::core::Database;
use crate::error::{GatewayError, GatewayResult};
use rustls::ClientConfig;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

pub trait DbAuth: Send + Sync {
    /// TLS client configuration trusting the database's CA
    fn client_tls_config(&self, database: &Database) -> GatewayResult<Arc<ClientConfig>>;

    /// Release cached material. Called once on server close.
    fn close(&self) -> GatewayResult<()>;
}

/// Builds client configurations from each database's PEM CA and caches them
/// per database and CA contents
#[derive(Debug, Default)]
pub struct CachedDbAuth {
    cache: Mutex<HashMap<(String, String), Arc<ClientConfig>>>,
    closed: AtomicBool,
}

impl CachedDbAuth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cached_configs(&self) -> usize {
        self.cache.lock().map(|c| c.len()).unwrap_or(0)
    }

    fn build(ca_pem: &str) -> GatewayResult<Arc<ClientConfig>> {
        let mut roots = rustls::RootCertStore::empty();
        let mut reader = Cursor::new(ca_pem.as_bytes());
        for cert in rustls_pemfile::certs(&mut reader) {
            let cert = cert.map_err(|e| {
                GatewayError::bad_parameter(format!("invalid database CA certificate: {}", e))
            })?;
            roots.add(cert)?;
        }
        if roots.is_empty() {
            return Err(GatewayError::bad_parameter(
                "database CA bundle contains no certificates",
            ));
        }

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(Arc::new(config))
    }
}

impl DbAuth for CachedDbAuth {
    fn client_tls_config(&self, database: &Database) -> GatewayResult<Arc<ClientConfig>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(GatewayError::internal("database auth provider is closed"));
        }
        let ca_pem = database.ca_cert.as_deref().ok_or_else(|| {
            GatewayError::bad_parameter(format!("database {:?} has no CA certificate", database.name))
        })?;

        let key = (database.name.clone(), ca_pem.to_string());
        let mut cache = self
            .cache
            .lock()
            .map_err(|_| GatewayError::internal("database auth cache poisoned"))?;
        if let Some(config) = cache.get(&key) {
            return Ok(config.clone());
        }
        let config = Self::build(ca_pem)?;
        cache.insert(key, config.clone());
        Ok(config)
    }

    fn close(&self) -> GatewayResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        if let Ok(mut cache) = self.cache.lock() {
            cache.clear();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, KeyPair};

    fn ca_pem() -> String {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec!["db.internal".to_string()]).unwrap();
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        params.self_signed(&key).unwrap().pem()
    }

    #[test]
    fn test_client_config_is_cached() {
        let auth = CachedDbAuth::new();
        let mut db = Database::new("pg1", "postgres", "db.internal:5432");
        db.ca_cert = Some(ca_pem());

        let first = auth.client_tls_config(&db).unwrap();
        let second = auth.client_tls_config(&db).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(auth.cached_configs(), 1);
    }

    #[test]
    fn test_missing_or_invalid_ca() {
        let auth = CachedDbAuth::new();
        let mut db = Database::new("pg1", "postgres", "db.internal:5432");
        assert!(auth.client_tls_config(&db).unwrap_err().is_bad_parameter());

        db.ca_cert = Some("not a pem".to_string());
        assert!(auth.client_tls_config(&db).unwrap_err().is_bad_parameter());
    }

    #[test]
    fn test_closed_provider_refuses() {
        let auth = CachedDbAuth::new();
        let mut db = Database::new("pg1", "postgres", "db.internal:5432");
        db.ca_cert = Some(ca_pem());
        auth.client_tls_config(&db).unwrap();

        auth.close().unwrap();
        assert_eq!(auth.cached_configs(), 0);
        assert!(auth.client_tls_config(&db).is_err());
    }
}
