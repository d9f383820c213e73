pub(crate) mod http_download;
pub(crate) mod s3_download;

use std::fmt;
use std::path::{Path, PathBuf};

use tracing::{debug, info};
use url::Url;

use crate::config::FetchSettings;
use crate::errors::PipelineError;

/// Where a backup artifact lives. One variant per supported scheme.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceLocator {
    File(PathBuf),
    Http(Url),
    ObjectStore {
        bucket: String,
        key: String,
        region: Option<String>,
    },
}

impl ResourceLocator {
    /// Parses `file://`, `http(s)://` and `s3://bucket/key?region=...` locators.
    /// A bare path without a scheme is taken as a local file.
    pub fn parse(raw: &str) -> Result<Self, PipelineError> {
        let raw = raw.trim();
        match Url::parse(raw) {
            Ok(url) => match url.scheme() {
                "file" => url.to_file_path().map(Self::File).map_err(|_| {
                    PipelineError::fetch(raw, "file URI does not name a local path", false)
                }),
                "http" | "https" => Ok(Self::Http(url)),
                "s3" => parse_object_store(&url),
                other => Err(PipelineError::UnsupportedScheme(other.to_string())),
            },
            Err(url::ParseError::RelativeUrlWithoutBase) => Ok(Self::File(PathBuf::from(raw))),
            Err(e) => Err(PipelineError::fetch(
                raw,
                format!("invalid resource locator: {}", e),
                false,
            )),
        }
    }

    /// File name the artifact will carry once it is local.
    pub fn file_name(&self) -> String {
        let name = match self {
            Self::File(path) => path
                .file_name()
                .map(|n| n.to_string_lossy().to_string()),
            Self::Http(url) => url
                .path_segments()
                .and_then(|mut segments| segments.next_back())
                .map(str::to_string),
            Self::ObjectStore { key, .. } => key.rsplit('/').next().map(str::to_string),
        };
        name.filter(|n| !n.is_empty())
            .unwrap_or_else(|| format!("download_{}", chrono::Utc::now().timestamp()))
    }
}

impl fmt::Display for ResourceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => write!(f, "{}", path.display()),
            Self::Http(url) => write!(f, "{}", url),
            Self::ObjectStore { bucket, key, .. } => write!(f, "s3://{}/{}", bucket, key),
        }
    }
}

fn parse_object_store(url: &Url) -> Result<ResourceLocator, PipelineError> {
    let bucket = url
        .host_str()
        .filter(|b| !b.is_empty())
        .ok_or_else(|| PipelineError::fetch(url.as_str(), "S3 URI missing bucket name", false))?
        .to_string();
    let key = url.path().trim_start_matches('/').to_string();
    if key.is_empty() {
        return Err(PipelineError::fetch(
            url.as_str(),
            "S3 URI missing key (object path)",
            false,
        ));
    }
    let region = url
        .query_pairs()
        .find(|(name, _)| name == "region")
        .map(|(_, value)| value.to_string())
        .filter(|r| !r.is_empty());
    Ok(ResourceLocator::ObjectStore { bucket, key, region })
}

/// Resolves locators to files on local disk. Remote resources are downloaded
/// into the caller's scratch directory; local files are returned untouched.
pub struct ResourceFetcher {
    http: reqwest::Client,
    settings: FetchSettings,
}

impl ResourceFetcher {
    pub fn new(settings: FetchSettings) -> Result<Self, PipelineError> {
        let http = reqwest::Client::builder()
            .timeout(settings.http_timeout)
            .build()
            .map_err(|e| PipelineError::Configuration(format!("HTTP client: {}", e)))?;
        Ok(Self { http, settings })
    }

    pub async fn fetch(
        &self,
        locator: &ResourceLocator,
        scratch_dir: &Path,
    ) -> Result<PathBuf, PipelineError> {
        match locator {
            ResourceLocator::File(path) => {
                if !path.is_file() {
                    return Err(PipelineError::fetch(
                        locator.to_string(),
                        format!("File not found: {}", path.display()),
                        false,
                    ));
                }
                debug!("Using local file {}", path.display());
                Ok(path.clone())
            }
            ResourceLocator::Http(url) => {
                let destination = download_destination(locator, scratch_dir).await?;
                let bytes = http_download::download_http(
                    &self.http,
                    url,
                    &destination,
                    self.settings.max_download_bytes,
                )
                .await?;
                info!("Downloaded {} bytes from {}", bytes, url);
                Ok(destination)
            }
            ResourceLocator::ObjectStore {
                bucket,
                key,
                region,
            } => {
                let destination = download_destination(locator, scratch_dir).await?;
                let bytes = s3_download::download_object(
                    &self.settings.object_store,
                    bucket,
                    key,
                    region.as_deref(),
                    &destination,
                    self.settings.max_download_bytes,
                )
                .await?;
                info!("Downloaded {} bytes from {}", bytes, locator);
                Ok(destination)
            }
        }
    }
}

async fn download_destination(
    locator: &ResourceLocator,
    scratch_dir: &Path,
) -> Result<PathBuf, PipelineError> {
    let dir = scratch_dir.join("download");
    tokio::fs::create_dir_all(&dir).await.map_err(|e| {
        PipelineError::fetch(
            locator.to_string(),
            format!("cannot create scratch directory {}: {}", dir.display(), e),
            false,
        )
    })?;
    Ok(dir.join(locator.file_name()))
}
