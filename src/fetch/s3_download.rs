// backup-ingest/src/fetch/s3_download.rs
use aws_config::retry::RetryConfig;
use aws_sdk_s3 as s3;
use s3::config::Region;
use s3::error::{DisplayErrorContext, SdkError};
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::config::ObjectStoreSettings;
use crate::errors::PipelineError;

/// Downloads `s3://bucket/key` into `destination_path`.
///
/// # Arguments
/// * `settings` - Optional endpoint and static credential overrides.
/// * `region` - Region from the locator's query string; wins over the configured one.
/// * `max_bytes` - Objects larger than this are refused.
///
/// # Returns
/// Number of bytes written.
pub async fn download_object(
    settings: &ObjectStoreSettings,
    bucket: &str,
    key: &str,
    region: Option<&str>,
    destination_path: &Path,
    max_bytes: u64,
) -> Result<u64, PipelineError> {
    let resource = format!("s3://{}/{}", bucket, key);
    debug!("Downloading {} to {}", resource, destination_path.display());

    let mut loader = aws_config::defaults(s3::config::BehaviorVersion::latest());
    if let Some(region) = region.or(settings.region.as_deref()) {
        loader = loader.region(Region::new(region.to_string()));
    }
    if let Some(endpoint) = &settings.endpoint_url {
        loader = loader.endpoint_url(endpoint);
    }
    if let (Some(key_id), Some(secret)) = (&settings.access_key_id, &settings.secret_access_key) {
        loader = loader.credentials_provider(s3::config::Credentials::new(
            key_id, secret, None, None, "Static",
        ));
    }
    // Retries are driven by the job runner, which knows the configured attempt budget.
    loader = loader.retry_config(RetryConfig::disabled());
    let sdk_config = loader.load().await;
    let mut client_config = s3::config::Builder::from(&sdk_config);
    if settings.endpoint_url.is_some() {
        // Self-hosted S3-compatible stores rarely resolve bucket subdomains.
        client_config = client_config.force_path_style(true);
    }
    let client = s3::Client::from_conf(client_config.build());

    let mut object = client
        .get_object()
        .bucket(bucket)
        .key(key)
        .send()
        .await
        .map_err(|e| {
            let transient = matches!(
                e,
                SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_)
            ) || e
                .raw_response()
                .is_some_and(|r| r.status().is_server_error());
            PipelineError::fetch(&resource, DisplayErrorContext(&e).to_string(), transient)
        })?;

    if let Some(length) = object.content_length() {
        if length as u64 > max_bytes {
            return Err(PipelineError::fetch(
                &resource,
                format!("object is {} bytes, limit is {}", length, max_bytes),
                false,
            ));
        }
    }

    let mut output_file = File::create(destination_path).await.map_err(|e| {
        PipelineError::fetch(
            &resource,
            format!("cannot create {}: {}", destination_path.display(), e),
            false,
        )
    })?;

    let mut total_bytes_downloaded: u64 = 0;
    while let Some(bytes_chunk) = object
        .body
        .try_next()
        .await
        .map_err(|e| PipelineError::fetch(&resource, format!("download interrupted: {}", e), true))?
    {
        total_bytes_downloaded += bytes_chunk.len() as u64;
        if total_bytes_downloaded > max_bytes {
            return Err(PipelineError::fetch(
                &resource,
                format!("download exceeded the {} byte limit", max_bytes),
                false,
            ));
        }
        output_file
            .write_all(&bytes_chunk)
            .await
            .map_err(|e| PipelineError::fetch(&resource, e.to_string(), false))?;
    }
    output_file
        .flush()
        .await
        .map_err(|e| PipelineError::fetch(&resource, e.to_string(), false))?;

    Ok(total_bytes_downloaded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::http_download::tests::{response, serve};

    async fn endpoint(responses: Vec<String>) -> ObjectStoreSettings {
        let url = serve(responses).await;
        ObjectStoreSettings {
            endpoint_url: Some(format!(
                "http://{}:{}",
                url.host_str().unwrap_or("127.0.0.1"),
                url.port().unwrap_or(80)
            )),
            region: Some("us-east-1".into()),
            access_key_id: Some("test".into()),
            secret_access_key: Some("test".into()),
        }
    }

    fn s3_error(status: &str, code: &str) -> String {
        let body = format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?><Error><Code>{}</Code><Message>{}</Message></Error>",
            code, code
        );
        format!(
            "HTTP/1.1 {}\r\nContent-Type: application/xml\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        )
    }

    #[tokio::test]
    async fn test_object_is_written_to_destination() -> anyhow::Result<()> {
        let settings = endpoint(vec![response("200 OK", "SELECT 1;\n")]).await;
        let dir = tempfile::tempdir()?;
        let dest = dir.path().join("db.sql");

        let written =
            download_object(&settings, "backups", "2024/db.sql", None, &dest, 1024).await?;

        assert_eq!(written, 10);
        assert_eq!(std::fs::read_to_string(&dest)?, "SELECT 1;\n");
        Ok(())
    }

    #[tokio::test]
    async fn test_oversized_object_is_refused() {
        let settings = endpoint(vec![response("200 OK", &"x".repeat(2048))]).await;
        let dir = tempfile::tempdir().unwrap();

        let err = download_object(
            &settings,
            "backups",
            "big.dump",
            None,
            &dir.path().join("big.dump"),
            1024,
        )
        .await
        .unwrap_err();

        assert_eq!(err.code(), "FetchError");
        assert!(!err.is_transient());
        assert!(err.to_string().contains("limit is 1024"));
    }

    #[tokio::test]
    async fn test_missing_key_is_permanent_and_unavailable_is_transient() {
        let missing = endpoint(vec![s3_error("404 Not Found", "NoSuchKey")]).await;
        let unavailable = endpoint(vec![s3_error("503 Service Unavailable", "SlowDown")]).await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("db.sql");

        let err = download_object(&missing, "backups", "db.sql", None, &dest, 1024)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "FetchError");
        assert!(!err.is_transient());
        assert!(err.to_string().contains("s3://backups/db.sql"));

        let err = download_object(&unavailable, "backups", "db.sql", None, &dest, 1024)
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
