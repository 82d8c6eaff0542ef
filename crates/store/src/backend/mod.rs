//! Object store trait and implementations.
//!
//! This module defines the `ObjectStore` trait, a unified read-only interface
//! over remote object stores (S3-compatible services in production, an
//! in-memory double in tests).

#[cfg(feature = "mock")]
mod mock;
#[cfg(feature = "s3")]
mod s3;

#[cfg(feature = "mock")]
pub use self::mock::MockStore;
#[cfg(feature = "s3")]
pub use self::s3::S3Store;
use crate::error::Result;
use crate::models::ObjectInfo;
use async_trait::async_trait;
use futures::{Stream, TryStreamExt};
use std::pin::Pin;

pub type ObjectInfoStream<'a> = Pin<Box<dyn Stream<Item = Result<ObjectInfo>> + Send + 'a>>;

/// Unified interface for remote object stores.
///
/// The sync pipeline only ever needs two capabilities from the remote side:
/// enumerate what exists, and fetch one object. Both are asynchronous and
/// treated as latency-bearing, fallible network operations.
///
/// # Examples
///
/// ```
/// use quarry_store::{ObjectStore, error::Result};
///
/// async fn size_of(store: &dyn ObjectStore, key: &str) -> Result<u64> {
///     let data = store.fetch(key).await?;
///     Ok(data.len() as u64)
/// }
/// ```
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Name of the configured store (taken from configuration; used for
    /// logging only).
    fn name(&self) -> &str;

    /// List all objects in the bucket.
    ///
    /// Default implementation collects [`list_stream()`](Self::list_stream)
    /// into a [`Vec`] before returning.
    async fn list(&self) -> Result<Vec<ObjectInfo>> {
        self.list_stream().try_collect().await
    }

    /// Stream object metadata for the whole bucket.
    ///
    /// Yields results incrementally; a paginated backend starts yielding
    /// after the first page rather than after the last. Per-object failures
    /// (e.g. a key that cannot become a local file name) are yielded as
    /// `Err` items so one bad entry never hides the rest of the listing.
    fn list_stream<'a>(&'a self) -> ObjectInfoStream<'a>;

    /// Fetch the complete contents of one object.
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if the key
    /// does not exist.
    async fn fetch(&self, key: &str) -> Result<Vec<u8>>;
}
