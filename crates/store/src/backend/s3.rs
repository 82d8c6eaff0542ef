//! S3-compatible object store backend.
//!
//! Works against AWS S3 and S3-compatible services (MinIO, Backblaze B2,
//! localstack, etc.). Credentials are provided explicitly via configuration;
//! a plain-`http` endpoint URL is how TLS-less local deployments are
//! expressed, since the SDK derives the transport from the endpoint scheme.
//!
//! TODO: Support the SDK credential provider chain (instance profiles,
//! ~/.aws/credentials) for real AWS deployments instead of requiring
//! explicit keys.

use crate::backend::ObjectInfoStream;
use crate::error::{ErrorKind, Result};
use crate::{ObjectInfo, ObjectStore, validate_key};
use async_stream::stream;
use async_trait::async_trait;
use aws_sdk_s3::{
    Client,
    config::{BehaviorVersion, Credentials, Region, retry::RetryConfig},
    primitives::DateTime,
    types::Object,
};
use exn::{OptionExt, ResultExt};
use std::sync::Arc;
use time::UtcDateTime;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Cap on concurrent S3 requests, shared by listing and fetches.
const DEFAULT_CONCURRENT_REQUESTS: usize = 32;

/// S3-compatible object store.
///
/// The bucket is treated as a flat namespace of artifact names; keys that
/// contain path separators are reported per-item during listing and never
/// fetched.
#[derive(Debug, Clone)]
pub struct S3Store {
    name: String,
    client: Client,
    bucket: String,
    /// Rate limiter for concurrent S3 requests.
    rate_limiter: Arc<Semaphore>,
}

impl S3Store {
    /// Create a new S3-compatible object store.
    ///
    /// # Arguments
    /// * `name` - A name for this store (used in display/logging)
    /// * `bucket` - S3 bucket name
    /// * `region` - AWS region or provider-specific region
    /// * `endpoint` - Custom endpoint URL for S3-compatible services
    /// * `key_id` - AWS/provider access key ID
    /// * `key_secret` - AWS/provider secret access key
    /// * `force_path_style` - Path-style addressing, required by most
    ///   non-AWS services
    pub fn new(
        name: impl Into<String>,
        bucket: impl Into<String>,
        region: impl Into<String>,
        endpoint: Option<impl Into<String>>,
        key_id: impl Into<String>,
        key_secret: impl Into<String>,
        force_path_style: bool,
    ) -> Self {
        let credentials = Credentials::new(key_id, key_secret, None, None, "quarry-config");
        let mut config_builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(Region::new(region.into()))
            // Retry policy with exponential backoff (1 initial + 3 retries)
            .retry_config(RetryConfig::standard().with_max_attempts(4))
            .force_path_style(force_path_style);
        if let Some(endpoint_url) = endpoint {
            config_builder = config_builder.endpoint_url(endpoint_url);
        }
        let client = Client::from_conf(config_builder.build());
        Self {
            name: name.into(),
            client,
            bucket: bucket.into(),
            rate_limiter: Arc::new(Semaphore::new(DEFAULT_CONCURRENT_REQUESTS)),
        }
    }

    /// Acquire a rate limiter permit before making an S3 API call.
    async fn acquire_permit(&self) -> OwnedSemaphorePermit {
        // unwrap is safe: semaphore is never closed
        self.rate_limiter.clone().acquire_owned().await.unwrap()
    }

    /// Convert a listed object into our metadata model.
    fn object_info(object: &Object) -> Result<ObjectInfo> {
        let key = object
            .key()
            .ok_or_raise(|| ErrorKind::Backend("listing entry without a key".to_string()))?;
        validate_key(key)?;
        let size = u64::try_from(object.size().unwrap_or_default()).unwrap_or_default();
        let last_modified = object.last_modified().map(Self::parse_datetime).transpose()?;
        Ok(ObjectInfo::new(key, size, last_modified))
    }

    /// Convert AWS DateTime to UtcDateTime.
    fn parse_datetime(dt: &DateTime) -> Result<UtcDateTime> {
        UtcDateTime::from_unix_timestamp_nanos(dt.as_nanos())
            .or_raise(|| ErrorKind::Backend("S3 datetime out of range".to_string()))
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    fn name(&self) -> &str {
        &self.name
    }

    fn list_stream<'a>(&'a self) -> ObjectInfoStream<'a> {
        Box::pin(stream! {
            // One permit covers the whole paginated listing; the page
            // fetches happen sequentially inside the paginator.
            let _permit = self.acquire_permit().await;
            let mut pages = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .into_paginator()
                .send();
            while let Some(page) = pages.next().await {
                let page = match page {
                    Ok(page) => page,
                    Err(err) => {
                        yield Err(exn::Exn::from(ErrorKind::Network(err.to_string())));
                        break;
                    },
                };
                for object in page.contents() {
                    yield Self::object_info(object);
                }
            }
        })
    }

    async fn fetch(&self, key: &str) -> Result<Vec<u8>> {
        validate_key(key)?;
        let _permit = self.acquire_permit().await;
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| {
                let service = err.into_service_error();
                if service.is_no_such_key() {
                    exn::Exn::from(ErrorKind::NotFound(key.to_string()))
                } else {
                    exn::Exn::from(ErrorKind::Network(service.to_string()))
                }
            })?;
        let data = response
            .body
            .collect()
            .await
            .or_raise(|| ErrorKind::Network(format!("truncated body for {key}")))?;
        let data = data.into_bytes().to_vec();
        debug!(store = %self.name, key, size = data.len(), "fetched object");
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_info_from_listing_entry() {
        let object = Object::builder()
            .key("sample.bin")
            .size(1024)
            .last_modified(DateTime::from_secs(1_700_000_000))
            .build();
        let info = S3Store::object_info(&object).unwrap();
        assert_eq!(info.key, "sample.bin");
        assert_eq!(info.size, 1024);
        assert_eq!(info.last_modified.unwrap().unix_timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_object_info_rejects_nested_key() {
        let object = Object::builder().key("dir/sample.bin").size(1).build();
        let err = S3Store::object_info(&object).unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidKey(_)));
    }

    #[test]
    fn test_object_info_without_key() {
        let object = Object::builder().size(1).build();
        let err = S3Store::object_info(&object).unwrap_err();
        assert!(matches!(&*err, ErrorKind::Backend(_)));
    }

    #[test]
    fn test_object_info_negative_size_clamps_to_zero() {
        let object = Object::builder().key("odd.bin").size(-5).build();
        let info = S3Store::object_info(&object).unwrap();
        assert_eq!(info.size, 0);
    }
}
