/// TLS termination material for the client-facing listener
use crate::error::{GatewayError, GatewayResult};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;

/// Server certificate, key and the CAs client certificates must chain to
pub struct TlsMaterial {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
    /// CAs of the local cluster
    pub client_cas: Vec<CertificateDer<'static>>,
    /// CAs of trusted remote clusters, by cluster name
    pub trusted_cas: BTreeMap<String, Vec<CertificateDer<'static>>>,
}

impl TlsMaterial {
    pub fn from_files<P: AsRef<Path>>(cert: P, key: P, client_ca: P) -> GatewayResult<Self> {
        Ok(Self {
            cert_chain: load_certificates(cert.as_ref())?,
            key: load_private_key(key.as_ref())?,
            client_cas: load_certificates(client_ca.as_ref())?,
            trusted_cas: BTreeMap::new(),
        })
    }

    /// Also accept client certificates issued by `cluster`'s CAs
    pub fn with_trusted_cluster<S: Into<String>>(
        mut self,
        cluster: S,
        cas: Vec<CertificateDer<'static>>,
    ) -> Self {
        self.trusted_cas.entry(cluster.into()).or_default().extend(cas);
        self
    }

    /// Server configuration that requires and verifies client certificates
    pub fn server_config(&self) -> GatewayResult<Arc<ServerConfig>> {
        let mut roots = RootCertStore::empty();
        for ca in &self.client_cas {
            roots.add(ca.clone())?;
        }
        if roots.is_empty() {
            return Err(GatewayError::tls("no client CA certificates configured"));
        }
        for ca in self.trusted_cas.values().flatten() {
            roots.add(ca.clone())?;
        }

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
            .build()
            .map_err(|e| GatewayError::tls(format!("failed to build client verifier: {}", e)))?;

        let config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_client_cert_verifier(verifier)
            .with_single_cert(self.cert_chain.clone(), self.key.clone_key())?;
        Ok(Arc::new(config))
    }
}

fn open(path: &Path) -> GatewayResult<BufReader<File>> {
    let file = File::open(path)
        .map_err(|e| GatewayError::tls(format!("failed to open {}: {}", path.display(), e)))?;
    Ok(BufReader::new(file))
}

/// Load PEM certificates from a file
pub fn load_certificates(path: &Path) -> GatewayResult<Vec<CertificateDer<'static>>> {
    let certs = read_certificates(&mut open(path)?)
        .map_err(|e| GatewayError::tls(format!("{}: {}", path.display(), e)))?;
    Ok(certs)
}

/// Parse PEM certificates from a reader
pub fn read_certificates(reader: &mut dyn BufRead) -> GatewayResult<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| GatewayError::tls(format!("invalid certificate: {}", e)))?;
    if certs.is_empty() {
        return Err(GatewayError::tls("no certificates found"));
    }
    Ok(certs)
}

/// Load the first PKCS#8, PKCS#1 or SEC1 private key from a PEM file
pub fn load_private_key(path: &Path) -> GatewayResult<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut open(path)?)
        .map_err(|e| {
            GatewayError::tls(format!("failed to parse key file {}: {}", path.display(), e))
        })?
        .ok_or_else(|| GatewayError::tls(format!("no private key found in {}", path.display())))
}
