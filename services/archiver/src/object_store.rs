use crate::config::ObjectStoreConfig;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Builder as S3ConfigBuilder, Credentials};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{BucketLocationConstraint, CreateBucketConfiguration};
use aws_sdk_s3::Client as S3Client;
use aws_types::region::Region;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Content type of every archived object
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Errors raised by the object store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to check bucket {bucket}: {message}")]
    BucketCheck { bucket: String, message: String },

    #[error("Failed to create bucket {bucket}: {message}")]
    BucketCreate { bucket: String, message: String },

    #[error("Failed to put object {bucket}/{key}: {message}")]
    Put {
        bucket: String,
        key: String,
        message: String,
    },
}

/// Durable blob store the archiver writes into
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Whether the bucket exists
    async fn bucket_exists(&self, bucket: &str) -> Result<bool, StoreError>;

    /// Create the bucket
    async fn create_bucket(&self, bucket: &str) -> Result<(), StoreError>;

    /// Write `body` at `key`; the length is sent explicitly
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StoreError>;
}

/// Create the bucket unless it already exists.
///
/// Returns `true` when a creation call was made.
#[instrument(skip(store))]
pub async fn ensure_bucket(store: &dyn ObjectStore, bucket: &str) -> Result<bool, StoreError> {
    if store.bucket_exists(bucket).await? {
        debug!(bucket = %bucket, "Bucket already present");
        return Ok(false);
    }

    store.create_bucket(bucket).await?;
    info!(bucket = %bucket, "Created bucket");
    Ok(true)
}

/// S3-compatible object store (MinIO, AWS S3, LocalStack)
pub struct S3ObjectStore {
    client: S3Client,
    region: String,
}

impl S3ObjectStore {
    /// Create a new S3 client from the object store configuration
    pub async fn new(config: &ObjectStoreConfig) -> Self {
        let credentials = Credentials::new(
            config.access_key.clone(),
            config.secret_key.clone(),
            None,
            None,
            "archiver-config",
        );

        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .credentials_provider(credentials)
            .load()
            .await;

        let endpoint_url = config.endpoint_url();
        let s3_config = S3ConfigBuilder::from(&aws_config)
            .endpoint_url(&endpoint_url)
            .force_path_style(config.force_path_style)
            .build();

        info!(
            endpoint = %endpoint_url,
            region = %config.region,
            "S3 client initialized"
        );

        Self {
            client: S3Client::from_conf(s3_config),
            region: config.region.clone(),
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool, StoreError> {
        match self.client.head_bucket().bucket(bucket).send().await {
            Ok(_) => Ok(true),
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false)
                {
                    Ok(false)
                } else {
                    Err(StoreError::BucketCheck {
                        bucket: bucket.to_string(),
                        message: DisplayErrorContext(&e).to_string(),
                    })
                }
            }
        }
    }

    async fn create_bucket(&self, bucket: &str) -> Result<(), StoreError> {
        let mut request = self.client.create_bucket().bucket(bucket);

        // us-east-1 is the implicit location and must not be sent
        if self.region != "us-east-1" {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(self.region.as_str()))
                    .build(),
            );
        }

        request
            .send()
            .await
            .map_err(|e| StoreError::BucketCreate {
                bucket: bucket.to_string(),
                message: DisplayErrorContext(&e).to_string(),
            })?;

        Ok(())
    }

    #[instrument(skip(self, body), fields(size_bytes = body.len()))]
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StoreError> {
        let content_length = body.len() as i64;

        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_length(content_length)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| StoreError::Put {
                bucket: bucket.to_string(),
                key: key.to_string(),
                message: DisplayErrorContext(&e).to_string(),
            })?;

        debug!(bucket = %bucket, key = %key, "Object written");
        Ok(())
    }
}
