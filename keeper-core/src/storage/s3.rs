/*!
Amazon S3 object store adapter.

This module provides S3 (and S3-compatible) storage using the official AWS SDK.
Calls block on an adapter-owned Tokio runtime, so the adapter must not be used
from inside another async runtime.
*/

use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Credentials as AwsCredentials, Region};
use aws_sdk_s3::error::ProvideErrorMetadata;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{BucketLocationConstraint, CreateBucketConfiguration, ObjectCannedAcl};
use aws_sdk_s3::Client as S3Client;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::runtime::Runtime;
use tracing::{debug, error, info};

use super::{content_type_for, ListPage, ListRequest, ObjectStore, Visibility};
use crate::config::BackupConfig;
use crate::{KeeperError, Result};

const US_EAST_1: &str = "us-east-1";

/// Amazon S3 object store
///
/// # Authentication
/// Static credentials from the backup configuration are used when present.
/// Otherwise the standard AWS credential provider chain applies:
/// 1. Environment variables (AWS_ACCESS_KEY_ID, AWS_SECRET_ACCESS_KEY, AWS_SESSION_TOKEN)
/// 2. AWS credentials file (~/.aws/credentials)
/// 3. IAM roles for EC2 instances and ECS tasks
///
/// # Example
/// ```rust,no_run
/// use keeper_core::config::BackupConfig;
/// use keeper_core::storage::S3ObjectStore;
///
/// let config = BackupConfig::new("my-backups", "apptranslator/", "/var/lib/app");
/// let store = S3ObjectStore::from_config(&config)?;
/// # Ok::<(), keeper_core::KeeperError>(())
/// ```
#[derive(Debug)]
pub struct S3ObjectStore {
    client: S3Client,
    bucket: String,
    region: String,
    runtime: Runtime,
    bucket_ready: AtomicBool,
}

impl S3ObjectStore {
    /// Create an adapter for the bucket, region, endpoint and credentials of a backup configuration
    ///
    /// # Errors
    /// Returns an error if:
    /// - The Tokio runtime cannot be created
    /// - No credentials are configured and none are found in the environment
    pub fn from_config(config: &BackupConfig) -> Result<Self> {
        let runtime = Runtime::new().map_err(|e| {
            KeeperError::storage(format!("Failed to create async runtime for S3 client: {e}"))
        })?;

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()));
        if let Some(creds) = &config.credentials {
            loader = loader.credentials_provider(AwsCredentials::new(
                creds.access_key.clone(),
                creds.secret_key.clone(),
                None,
                None,
                "keeper-config",
            ));
        }
        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint.clone());
        }
        let sdk_config = runtime.block_on(loader.load());

        if sdk_config.credentials_provider().is_none() {
            return Err(KeeperError::storage(
                "AWS credentials not found. Configure [credentials] or set AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY",
            ));
        }

        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if config.endpoint.is_some() {
            // S3-compatible services rarely support virtual-hosted buckets
            builder = builder.force_path_style(true);
        }
        let client = S3Client::from_conf(builder.build());

        info!(bucket = %config.bucket, region = %config.region, "Initialized S3 object store");

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            region: config.region.clone(),
            runtime,
            bucket_ready: AtomicBool::new(false),
        })
    }

    /// Get the bucket name
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Make sure the bucket exists, creating it on first use
    ///
    /// The bucket itself is created without a public-read ACL; only objects get one.
    fn ensure_bucket(&self) -> Result<()> {
        if self.bucket_ready.load(Ordering::Acquire) {
            return Ok(());
        }

        let head = self
            .runtime
            .block_on(self.client.head_bucket().bucket(&self.bucket).send());
        match head {
            Ok(_) => {}
            Err(e) if e.as_service_error().map(|se| se.is_not_found()).unwrap_or(false) => {
                info!(bucket = %self.bucket, "Bucket does not exist, creating it");
                self.create_bucket()?;
            }
            Err(e) => return Err(map_s3_error("head_bucket", e, &self.bucket)),
        }

        self.bucket_ready.store(true, Ordering::Release);
        Ok(())
    }

    fn create_bucket(&self) -> Result<()> {
        let mut request = self.client.create_bucket().bucket(&self.bucket);
        if self.region != US_EAST_1 {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(self.region.as_str()))
                    .build(),
            );
        }

        match self.runtime.block_on(request.send()) {
            Ok(_) => Ok(()),
            Err(e)
                if e
                    .as_service_error()
                    .map(|se| se.is_bucket_already_owned_by_you())
                    .unwrap_or(false) =>
            {
                Ok(())
            }
            Err(e) => Err(map_s3_error("create_bucket", e, &self.bucket)),
        }
    }
}

impl ObjectStore for S3ObjectStore {
    fn list(&self, request: &ListRequest) -> Result<ListPage> {
        debug!(
            bucket = %self.bucket,
            prefix = %request.prefix,
            marker = %request.marker,
            max_keys = request.max_keys,
            "Starting S3 list_objects operation"
        );

        let max_keys = i32::try_from(request.max_keys).unwrap_or(i32::MAX);
        let mut call = self
            .client
            .list_objects()
            .bucket(&self.bucket)
            .prefix(&request.prefix)
            .max_keys(max_keys);
        if !request.delimiter.is_empty() {
            call = call.delimiter(&request.delimiter);
        }
        if !request.marker.is_empty() {
            call = call.marker(&request.marker);
        }

        let output = self
            .runtime
            .block_on(call.send())
            .map_err(|e| map_s3_error("list_objects", e, &request.prefix))?;

        let keys = output
            .contents()
            .iter()
            .filter_map(|object| object.key().map(str::to_string))
            .collect();
        let common_prefixes = output
            .common_prefixes()
            .iter()
            .filter_map(|p| p.prefix().map(str::to_string))
            .collect();

        Ok(ListPage {
            keys,
            common_prefixes,
            is_truncated: output.is_truncated().unwrap_or(false),
            next_marker: output.next_marker().map(str::to_string),
        })
    }

    fn put(&self, local_path: &Path, key: &str, visibility: Visibility) -> Result<()> {
        self.ensure_bucket()?;

        let content_type = content_type_for(local_path);
        let acl = match visibility {
            Visibility::Private => ObjectCannedAcl::Private,
            Visibility::PublicRead => ObjectCannedAcl::PublicRead,
        };

        debug!(
            bucket = %self.bucket,
            key = %key,
            content_type = %content_type,
            "Starting S3 put_object operation"
        );

        let body = self
            .runtime
            .block_on(ByteStream::from_path(local_path))
            .map_err(|e| {
                KeeperError::storage(format!("Failed to open {}: {e}", local_path.display()))
            })?;

        let result = self.runtime.block_on(
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(key)
                .body(body)
                .content_type(content_type)
                .acl(acl)
                .send(),
        );

        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                let mapped_error = map_s3_error("put_object", e, key);
                error!(bucket = %self.bucket, key = %key, error = %mapped_error, "Failed to upload object to S3");
                Err(mapped_error)
            }
        }
    }

    fn delete(&self, key: &str) -> Result<()> {
        let result = self.runtime.block_on(
            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(key)
                .send(),
        );

        match result {
            Ok(_) => {
                debug!(bucket = %self.bucket, key = %key, "Deleted object from S3");
                Ok(())
            }
            Err(e) => Err(map_s3_error("delete_object", e, key)),
        }
    }
}

/// Map AWS SDK errors to KeeperError with appropriate context
fn map_s3_error<E: ProvideErrorMetadata + std::fmt::Debug>(
    op: &str,
    error: aws_sdk_s3::error::SdkError<E>,
    key: &str,
) -> KeeperError {
    use aws_sdk_s3::error::SdkError;

    match &error {
        SdkError::DispatchFailure(dispatch_err) => {
            KeeperError::storage(format!("S3 {op} request failed to dispatch: {dispatch_err:?}"))
        }
        SdkError::TimeoutError(_) => {
            KeeperError::storage(format!("S3 {op} request timed out (key: {key})"))
        }
        SdkError::ResponseError(response_err) => {
            KeeperError::storage(format!("S3 {op} response error: {response_err:?}"))
        }
        SdkError::ServiceError(service_err) => match service_err.err().code() {
            Some("NoSuchBucket") => KeeperError::storage("S3 bucket not found"),
            Some("NoSuchKey") => KeeperError::storage(format!("S3 object '{key}' not found")),
            Some("AccessDenied") | Some("Forbidden") => KeeperError::storage(
                "Access denied to S3 (check credentials and permissions)",
            ),
            Some("InvalidAccessKeyId") | Some("SignatureDoesNotMatch") => {
                KeeperError::storage("S3 rejected the configured credentials")
            }
            Some(code) => KeeperError::storage(format!(
                "S3 {op} service error ({code}): {}",
                service_err.err().message().unwrap_or("Unknown error")
            )),
            None => KeeperError::storage(format!("S3 {op} service error: {service_err:?}")),
        },
        _ => KeeperError::storage(format!("S3 {op} error: {error}")),
    }
}
