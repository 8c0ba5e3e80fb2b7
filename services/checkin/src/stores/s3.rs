use super::{BlobStore, StoreError};
use crate::config::S3Config;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::ObjectCannedAcl;
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use tracing::{debug, info, instrument};

/// S3-backed blob store for post media, one object per post id
pub struct S3BlobStore {
    client: S3Client,
    bucket: String,
    public_base: String,
}

impl S3BlobStore {
    /// Create the client and confirm the bucket is reachable
    pub async fn new(config: &S3Config) -> Result<Self, StoreError> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        client
            .head_bucket()
            .bucket(&config.bucket)
            .send()
            .await
            .map_err(|e| {
                StoreError::Unavailable(format!(
                    "bucket {} is not reachable: {}",
                    config.bucket,
                    DisplayErrorContext(&e)
                ))
            })?;

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "S3 blob store initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            public_base: public_base_url(config),
        })
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    #[instrument(skip(self, body), fields(bucket = %self.bucket, size_bytes = body.len()))]
    async fn put(&self, key: &str, body: Bytes, content_type: &str) -> Result<(), StoreError> {
        let size_bytes = body.len();
        let key = sanitize_key(key);

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(body))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| {
                StoreError::Unavailable(format!(
                    "failed to upload {key}: {}",
                    DisplayErrorContext(&e)
                ))
            })?;

        debug!(key = %key, size_bytes, "Object uploaded to S3");
        Ok(())
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn set_public_readable(&self, key: &str) -> Result<(), StoreError> {
        let key = sanitize_key(key);

        self.client
            .put_object_acl()
            .bucket(&self.bucket)
            .key(&key)
            .acl(ObjectCannedAcl::PublicRead)
            .send()
            .await
            .map_err(|e| {
                StoreError::Rejected(format!(
                    "failed to make {key} public: {}",
                    DisplayErrorContext(&e)
                ))
            })?;

        Ok(())
    }

    fn public_url(&self, key: &str) -> String {
        format!("{}/{}", self.public_base, sanitize_key(key))
    }
}

/// Where public object links point.
///
/// An explicit base wins; a custom path-style endpoint gets `{endpoint}/{bucket}`;
/// otherwise the AWS virtual-hosted form is used.
fn public_base_url(config: &S3Config) -> String {
    if let Some(ref base) = config.public_base_url {
        return base.trim_end_matches('/').to_string();
    }

    match config.endpoint_url {
        Some(ref endpoint) if config.force_path_style => {
            format!("{}/{}", endpoint.trim_end_matches('/'), config.bucket)
        }
        Some(ref endpoint) => {
            let endpoint = endpoint.trim_end_matches('/');
            match endpoint.split_once("://") {
                Some((scheme, host)) => format!("{scheme}://{}.{host}", config.bucket),
                None => format!("{}.{endpoint}", config.bucket),
            }
        }
        None => format!(
            "https://{}.s3.{}.amazonaws.com",
            config.bucket, config.region
        ),
    }
}

/// Keep keys URL-safe without percent-encoding
fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect()
}
