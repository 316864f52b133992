use crate::config::StorageSettings;
use crate::error::TransferError;
use crate::prelude::*;
use async_trait::async_trait;
use aws_config::retry::RetryConfig;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::{ByteStream, DateTime as S3DateTime};
use aws_sdk_s3::types::{
    BucketLocationConstraint, CompletedMultipartUpload, CompletedPart, CreateBucketConfiguration,
};
use aws_sdk_s3::Client;
use chrono::{DateTime, Utc};
use std::path::Path;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use super::{ObjectPage, ObjectStore, RemoteObject};

const CONTENT_TYPE: &str = "application/octet-stream";
const PART_SIZE: u64 = 16 * 1024 * 1024;
const MAX_PARTS: u64 = 10_000;
const CREDENTIALS_PROVIDER: &str = "blob-backup";
// Buckets in the default region must be created without a location constraint.
const DEFAULT_REGION: &str = "us-east-1";

pub struct S3Store {
    client: Client,
    bucket: String,
    region: String,
    multipart_threshold: u64,
}

impl S3Store {
    pub async fn new(settings: &StorageSettings) -> Result<Self> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(settings.region.clone()))
            .retry_config(RetryConfig::standard().with_max_attempts(settings.max_attempts));

        if let Some(endpoint) = &settings.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        if let Some(credentials) = &settings.credentials {
            loader = loader.credentials_provider(Credentials::new(
                &credentials.access_key_id,
                &credentials.secret_access_key,
                None,
                None,
                CREDENTIALS_PROVIDER,
            ));
        }

        let sdk_config = loader.load().await;
        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(settings.force_path_style)
            .build();

        info!(
            "S3 client ready for bucket {} in {} (endpoint: {})",
            settings.container,
            settings.region,
            settings.endpoint_url.as_deref().unwrap_or("default")
        );

        Ok(Self {
            client: Client::from_conf(s3_config),
            bucket: settings.container.clone(),
            region: settings.region.clone(),
            multipart_threshold: settings.multipart_threshold,
        })
    }

    async fn create_bucket(&self) -> Result<()> {
        let mut request = self.client.create_bucket().bucket(&self.bucket);
        if self.region != DEFAULT_REGION {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(self.region.as_str()))
                    .build(),
            );
        }

        match request.send().await {
            Ok(_) => {
                info!("Container {} created", self.bucket);
                Ok(())
            }
            Err(err)
                if err
                    .as_service_error()
                    .is_some_and(|e| e.is_bucket_already_owned_by_you()) =>
            {
                debug!("Container {} was created concurrently", self.bucket);
                Ok(())
            }
            Err(err) => Err(self.container_error(&err)),
        }
    }

    async fn put_single(&self, key: &str, path: &Path) -> Result<()> {
        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| upload_error(key, &e))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(CONTENT_TYPE)
            .body(body)
            .send()
            .await
            .map_err(|e| upload_error(key, &e))?;
        Ok(())
    }

    /// Large archives go up in parts. The object only appears once the upload
    /// is completed; on any failure the upload is aborted so the parts are
    /// discarded.
    async fn put_multipart(&self, key: &str, path: &Path, size: u64) -> Result<()> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(CONTENT_TYPE)
            .send()
            .await
            .map_err(|e| upload_error(key, &e))?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| TransferError::Upload {
                key: key.to_string(),
                message: "multipart upload returned no upload id".into(),
            })?
            .to_string();

        let result = match self.upload_parts(key, &upload_id, path, size).await {
            Ok(parts) => self
                .client
                .complete_multipart_upload()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(&upload_id)
                .multipart_upload(
                    CompletedMultipartUpload::builder()
                        .set_parts(Some(parts))
                        .build(),
                )
                .send()
                .await
                .map(|_| ())
                .map_err(|e| upload_error(key, &e)),
            Err(e) => Err(e),
        };

        if result.is_err() {
            if let Err(abort) = self
                .client
                .abort_multipart_upload()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(&upload_id)
                .send()
                .await
            {
                warn!(
                    "Failed to abort multipart upload {} for {}: {}",
                    upload_id,
                    key,
                    DisplayErrorContext(&abort)
                );
            }
        }
        result
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        path: &Path,
        size: u64,
    ) -> Result<Vec<CompletedPart>> {
        let part_size = PART_SIZE.max(size.div_ceil(MAX_PARTS));
        let read_error = |e: std::io::Error| TransferError::Read {
            path: path.to_path_buf(),
            source: e,
        };
        let mut file = tokio::fs::File::open(path).await.map_err(read_error)?;
        let mut parts = Vec::new();

        for part_number in 1.. {
            let mut chunk = Vec::with_capacity(part_size as usize);
            (&mut file)
                .take(part_size)
                .read_to_end(&mut chunk)
                .await
                .map_err(read_error)?;
            if chunk.is_empty() {
                break;
            }

            let output = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk))
                .send()
                .await
                .map_err(|e| upload_error(key, &e))?;
            debug!("Uploaded part {} of {}", part_number, key);

            parts.push(
                CompletedPart::builder()
                    .set_e_tag(output.e_tag().map(str::to_string))
                    .part_number(part_number)
                    .build(),
            );
        }

        Ok(parts)
    }

    fn container_error(&self, err: &impl std::error::Error) -> Error {
        TransferError::Container {
            container: self.bucket.clone(),
            message: DisplayErrorContext(err).to_string(),
        }
        .into()
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    fn container(&self) -> &str {
        &self.bucket
    }

    async fn ensure_container(&self) -> Result<()> {
        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => {
                debug!("Container {} already exists", self.bucket);
                Ok(())
            }
            Err(err) if err.as_service_error().is_some_and(|e| e.is_not_found()) => {
                info!("Container {} does not exist, creating it", self.bucket);
                self.create_bucket().await
            }
            Err(err) => Err(self.container_error(&err)),
        }
    }

    async fn list_page(&self, continuation: Option<String>) -> Result<ObjectPage> {
        let output = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .set_continuation_token(continuation)
            .send()
            .await
            .map_err(|e| TransferError::List {
                container: self.bucket.clone(),
                message: DisplayErrorContext(&e).to_string(),
            })?;

        let objects = output
            .contents()
            .iter()
            .filter_map(|object| {
                Some(RemoteObject {
                    key: object.key()?.to_string(),
                    last_modified: object.last_modified().and_then(to_utc),
                    size: object.size().unwrap_or(0).max(0) as u64,
                })
            })
            .collect();
        let next = if output.is_truncated().unwrap_or(false) {
            output.next_continuation_token().map(str::to_string)
        } else {
            None
        };

        Ok(ObjectPage { objects, next })
    }

    async fn upload(&self, key: &str, path: &Path) -> Result<u64> {
        let size = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::not_found("Backup archive", path))
            }
            Err(e) => {
                return Err(TransferError::Read {
                    path: path.to_path_buf(),
                    source: e,
                }
                .into())
            }
        };

        if size >= self.multipart_threshold {
            self.put_multipart(key, path, size).await?;
        } else {
            self.put_single(key, path).await?;
        }

        info!("Uploaded {} to S3 bucket {} ({} bytes)", key, self.bucket, size);
        Ok(size)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| TransferError::Delete {
                key: key.to_string(),
                message: DisplayErrorContext(&e).to_string(),
            })?;
        Ok(())
    }
}

fn upload_error(key: &str, err: &impl std::error::Error) -> Error {
    TransferError::Upload {
        key: key.to_string(),
        message: DisplayErrorContext(err).to_string(),
    }
    .into()
}

fn to_utc(timestamp: &S3DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(timestamp.secs(), timestamp.subsec_nanos())
}
