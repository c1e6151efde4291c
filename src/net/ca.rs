/// Root certificates of cloud-hosted databases
use crate::core::{AwsDatabaseKind, Database};
use crate::error::{GatewayError, GatewayResult};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

const REDSHIFT_CA_URL: &str =
    "https://s3.amazonaws.com/redshift-downloads/amazon-trust-ca-bundle.crt";
const REDSHIFT_CA_FILE: &str = "amazon-trust-ca-bundle.crt";

/// Fetches the CA bundle a cloud database's server certificate chains to
#[async_trait]
pub trait CaDownloader: Send + Sync {
    async fn download(&self, database: &Database) -> GatewayResult<Vec<u8>>;
}

/// Source of the bundle for `database`: (download URL, cache file name)
pub fn ca_source(database: &Database) -> GatewayResult<(String, String)> {
    let aws = database.aws.as_ref().ok_or_else(|| {
        GatewayError::bad_parameter(format!("{:?} is not a cloud hosted database", database.name))
    })?;
    match aws.kind {
        AwsDatabaseKind::Rds => {
            if aws.region.is_empty() {
                return Err(GatewayError::bad_parameter(format!(
                    "missing AWS region for {:?}",
                    database.name
                )));
            }
            Ok((
                format!(
                    "https://truststore.pki.rds.amazonaws.com/{0}/{0}-bundle.pem",
                    aws.region
                ),
                format!("{}-bundle.pem", aws.region),
            ))
        }
        AwsDatabaseKind::Redshift => {
            Ok((REDSHIFT_CA_URL.to_string(), REDSHIFT_CA_FILE.to_string()))
        }
    }
}

/// Downloads bundles over HTTPS
pub struct HttpCaDownloader {
    client: reqwest::Client,
}

impl HttpCaDownloader {
    pub fn new() -> GatewayResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| GatewayError::internal(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl CaDownloader for HttpCaDownloader {
    async fn download(&self, database: &Database) -> GatewayResult<Vec<u8>> {
        let (url, _) = ca_source(database)?;
        info!(database = %database.name, url = %url, "Downloading root certificate.");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| GatewayError::internal(format!("failed to download {}: {}", url, e)))?;
        if !response.status().is_success() {
            return Err(GatewayError::internal(format!(
                "failed to download {}: status {}",
                url,
                response.status()
            )));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| GatewayError::internal(format!("failed to read {}: {}", url, e)))?;
        Ok(body.to_vec())
    }
}

/// Resolve the CA of a cloud hosted database, downloading it into
/// `data_dir` on first use. Returns `None` for databases that either have a
/// CA configured or are not cloud hosted.
pub async fn init_ca_cert(
    data_dir: &Path,
    database: &Database,
    downloader: &dyn CaDownloader,
) -> GatewayResult<Option<String>> {
    if !database.needs_cloud_ca() {
        return Ok(None);
    }
    let (_, file_name) = ca_source(database)?;
    let path: PathBuf = data_dir.join(file_name);

    match tokio::fs::read(&path).await {
        Ok(bytes) => {
            debug!(database = %database.name, path = %path.display(), "Loaded cached root certificate.");
            return pem_string(bytes).map(Some);
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let bytes = downloader.download(database).await?;
    tokio::fs::create_dir_all(data_dir).await?;
    tokio::fs::write(&path, &bytes).await?;
    info!(database = %database.name, path = %path.display(), "Saved root certificate.");
    pem_string(bytes).map(Some)
}

fn pem_string(bytes: Vec<u8>) -> GatewayResult<String> {
    String::from_utf8(bytes)
        .map_err(|_| GatewayError::bad_parameter("root certificate bundle is not PEM text"))
}
