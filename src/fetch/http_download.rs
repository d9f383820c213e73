// backup-ingest/src/fetch/http_download.rs
use std::path::Path;

use futures_util::TryStreamExt;
use reqwest::StatusCode;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::io::StreamReader;
use tracing::debug;
use url::Url;

use crate::errors::PipelineError;

/// Streams `url` into `destination`, refusing bodies larger than `max_bytes`.
///
/// Returns the number of bytes written. Connection problems, timeouts and
/// server-side statuses are reported as transient so the caller may retry.
pub async fn download_http(
    client: &reqwest::Client,
    url: &Url,
    destination: &Path,
    max_bytes: u64,
) -> Result<u64, PipelineError> {
    debug!("Downloading {} to {}", url, destination.display());

    let response = client
        .get(url.clone())
        .send()
        .await
        .map_err(|e| request_error(url, e))?;

    let status = response.status();
    if !status.is_success() {
        return Err(PipelineError::fetch(
            url.as_str(),
            format!("server responded with {}", status),
            is_retryable_status(status),
        ));
    }

    if let Some(length) = response.content_length() {
        if length > max_bytes {
            return Err(PipelineError::fetch(
                url.as_str(),
                format!("resource is {} bytes, limit is {}", length, max_bytes),
                false,
            ));
        }
    }

    let body = response.bytes_stream().map_err(std::io::Error::other);
    let mut reader = StreamReader::new(Box::pin(body)).take(max_bytes + 1);

    let mut output_file = File::create(destination).await.map_err(|e| {
        PipelineError::fetch(
            url.as_str(),
            format!("cannot create {}: {}", destination.display(), e),
            false,
        )
    })?;

    let written = tokio::io::copy(&mut reader, &mut output_file)
        .await
        .map_err(|e| PipelineError::fetch(url.as_str(), format!("download interrupted: {}", e), true))?;

    if written > max_bytes {
        drop(output_file);
        let _ = tokio::fs::remove_file(destination).await;
        return Err(PipelineError::fetch(
            url.as_str(),
            format!("download exceeded the {} byte limit", max_bytes),
            false,
        ));
    }

    output_file
        .flush()
        .await
        .map_err(|e| PipelineError::fetch(url.as_str(), e.to_string(), false))?;

    Ok(written)
}

fn request_error(url: &Url, error: reqwest::Error) -> PipelineError {
    let transient = error.is_timeout() || error.is_connect() || error.is_request() || error.is_body();
    PipelineError::fetch(url.as_str(), error.to_string(), transient)
}

fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}
