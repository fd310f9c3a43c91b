use crate::services::storage::{BlobStore, MemoryBlobStore, S3BlobStore};
use aws_sdk_s3::config::Region;
use std::env;
use std::sync::Arc;
use tracing::info;

fn required(key: &str) -> anyhow::Result<String> {
    env::var(key).map_err(|_| anyhow::anyhow!("{} must be set", key))
}

/// Blob store selected by `STORAGE_BACKEND` (`s3` by default, `memory` for local runs)
pub async fn setup_storage(upload_bucket: &str) -> anyhow::Result<Arc<dyn BlobStore>> {
    let backend = env::var("STORAGE_BACKEND").unwrap_or_else(|_| "s3".to_string());

    if backend.eq_ignore_ascii_case("memory") {
        tracing::warn!("⚠️  Using in-memory blob storage, objects are lost on restart");
        return Ok(Arc::new(MemoryBlobStore::new()));
    }

    let endpoint_url = required("MINIO_ENDPOINT")?;
    let access_key = required("MINIO_ACCESS_KEY")?;
    let secret_key = required("MINIO_SECRET_KEY")?;

    info!("☁️  S3 Storage: {} (Bucket: {})", endpoint_url, upload_bucket);

    let aws_config = aws_config::from_env()
        .endpoint_url(&endpoint_url)
        .region(Region::new("us-east-1"))
        .credentials_provider(aws_sdk_s3::config::Credentials::new(
            access_key, secret_key, None, None, "static",
        ))
        .load()
        .await;

    let s3_config = aws_sdk_s3::config::Builder::from(&aws_config)
        .force_path_style(true)
        .build();

    let s3_client = aws_sdk_s3::Client::from_conf(s3_config);

    match s3_client.head_bucket().bucket(upload_bucket).send().await {
        Ok(_) => info!("🪣 Bucket '{}' found", upload_bucket),
        Err(_) => {
            info!("🪣 Creating bucket '{}'", upload_bucket);
            s3_client
                .create_bucket()
                .bucket(upload_bucket)
                .send()
                .await
                .map_err(|e| anyhow::anyhow!("Failed to create bucket {}: {:?}", upload_bucket, e))?;
        }
    }

    Ok(Arc::new(S3BlobStore::new(s3_client)))
}
