//! S3 / OBS implementation of the object store contract.

use std::path::Path;

use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use aws_smithy_types::byte_stream::Length;
use tracing::info;

use crate::config::ObjectStorageSettings;

use super::{CompletedUploadPart, ObjectStore, ObjectStoreError};

/// S3-compatible object store client bound to one bucket.
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
    endpoint: String,
}

impl S3ObjectStore {
    /// Build the client and probe the bucket; refuses construction when
    /// the bucket is unreachable.
    pub async fn connect(settings: &ObjectStorageSettings) -> Result<Self, ObjectStoreError> {
        let credentials = Credentials::new(
            settings.access_key.clone(),
            settings.secret_key.clone(),
            None,
            None,
            "omni-repository",
        );

        let config = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(settings.region.clone()))
            .endpoint_url(format!("https://{}", settings.endpoint))
            .credentials_provider(credentials)
            .build();

        let client = Client::from_conf(config);

        client
            .head_bucket()
            .bucket(&settings.bucket)
            .send()
            .await
            .map_err(|e| ObjectStoreError::BucketUnreachable {
                bucket: settings.bucket.clone(),
                detail: format!("{}", DisplayErrorContext(e)),
            })?;

        info!(bucket = %settings.bucket, endpoint = %settings.endpoint, "object store bucket reachable");

        Ok(Self {
            client,
            bucket: settings.bucket.clone(),
            endpoint: settings.endpoint.clone(),
        })
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn object_exists(&self, key: &str) -> Result<bool, ObjectStoreError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                let not_found = e
                    .as_service_error()
                    .map(|se| se.is_not_found())
                    .unwrap_or(false);
                let detail = format!("{}", DisplayErrorContext(e));
                if not_found || detail.contains("404") {
                    Ok(false)
                } else {
                    Err(ObjectStoreError::Request(detail))
                }
            }
        }
    }

    async fn delete_object(&self, key: &str) -> Result<(), ObjectStoreError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| ObjectStoreError::Request(format!("{}", DisplayErrorContext(e))))?;
        Ok(())
    }

    async fn put_empty_object(&self, key: &str) -> Result<(), ObjectStoreError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from_static(&[]))
            .send()
            .await
            .map_err(|e| ObjectStoreError::Request(format!("{}", DisplayErrorContext(e))))?;
        Ok(())
    }

    async fn create_multipart_upload(&self, key: &str) -> Result<String, ObjectStoreError> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| ObjectStoreError::Request(format!("{}", DisplayErrorContext(e))))?;

        output
            .upload_id()
            .map(ToString::to_string)
            .ok_or_else(|| ObjectStoreError::Request("multipart upload id missing".to_string()))
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        source: &Path,
        offset: u64,
        length: u64,
    ) -> Result<String, ObjectStoreError> {
        let body = ByteStream::read_from()
            .path(source)
            .offset(offset)
            .length(Length::Exact(length))
            .build()
            .await
            .map_err(|e| ObjectStoreError::Request(e.to_string()))?;

        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(body)
            .send()
            .await
            .map_err(|e| ObjectStoreError::Request(format!("{}", DisplayErrorContext(e))))?;

        Ok(output.e_tag().unwrap_or_default().to_string())
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedUploadPart>,
    ) -> Result<(), ObjectStoreError> {
        let completed = parts
            .iter()
            .map(|p| {
                CompletedPart::builder()
                    .part_number(p.part_number)
                    .e_tag(&p.etag)
                    .build()
            })
            .collect::<Vec<_>>();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| ObjectStoreError::Request(format!("{}", DisplayErrorContext(e))))?;
        Ok(())
    }

    async fn abort_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
    ) -> Result<(), ObjectStoreError> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| ObjectStoreError::Request(format!("{}", DisplayErrorContext(e))))?;
        Ok(())
    }

    fn external_url(&self, key: &str) -> String {
        format!("https://{}.{}/{}", self.bucket, self.endpoint, key)
    }
}
