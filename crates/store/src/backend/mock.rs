//! In-memory object store for testing.

use super::ObjectInfoStream;
use crate::error::{ErrorKind, Result};
use crate::models::ObjectInfo;
use crate::{ObjectStore, validate_key};
use async_stream::stream;
use async_trait::async_trait;
use std::collections::BTreeMap;
use time::UtcDateTime;
use tokio::sync::RwLock;

/// In-memory object store for testing.
///
/// Objects live in a `BTreeMap` behind a [`RwLock`], so all trait methods
/// operate on `&self` and listings come out in stable key order. Ideal for
/// tests that need an [`ObjectStore`] without network dependencies, and for
/// simulating objects appearing in the bucket mid-test via
/// [`insert`](Self::insert).
pub struct MockStore {
    name: String,
    objects: RwLock<BTreeMap<String, (UtcDateTime, Vec<u8>)>>,
}

impl MockStore {
    /// Create a mock store pre-populated with objects.
    ///
    /// Panics if any key fails validation. If test setup is wrong, then the
    /// test should not pass.
    ///
    /// # Example
    ///
    /// ```
    /// use quarry_store::backend::MockStore;
    ///
    /// let store = MockStore::with_objects([
    ///     ("sample.bin", b"EICAR".to_vec()),
    ///     ("clean.bin", b"nothing to see".to_vec()),
    /// ]);
    /// ```
    pub fn with_objects(objects: impl IntoIterator<Item = (impl Into<String>, impl Into<Vec<u8>>)>) -> Self {
        let mut map = BTreeMap::new();
        let now = UtcDateTime::now();
        for (key, data) in objects {
            let key = key.into();
            if validate_key(&key).is_err() {
                // The panic here is DELIBERATE. MockStore is intended to be
                // used in tests; panics are expected. There is no error result.
                panic!("MockStore::with_objects: invalid key {key}");
            }
            map.insert(key, (now, data.into()));
        }
        Self {
            name: "mock".to_string(),
            objects: RwLock::new(map),
        }
    }

    /// Change the name of the mock store.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Add (or replace) an object after construction.
    ///
    /// Lets a test simulate an upload landing in the bucket while the sync
    /// pipeline is already running.
    pub async fn insert(&self, key: impl Into<String>, data: impl Into<Vec<u8>>) {
        let key = key.into();
        if validate_key(&key).is_err() {
            panic!("MockStore::insert: invalid key {key}");
        }
        self.objects.write().await.insert(key, (UtcDateTime::now(), data.into()));
    }
}
impl Default for MockStore {
    fn default() -> Self {
        let objects: [(&str, &[u8]); 0] = [];
        Self::with_objects(objects)
    }
}

#[async_trait]
impl ObjectStore for MockStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn list_stream<'a>(&'a self) -> ObjectInfoStream<'a> {
        Box::pin(stream! {
            // Snapshot entries under the read lock, then drop it before
            // yielding to avoid holding the lock across yield points.
            let entries: Vec<ObjectInfo> = {
                let guard = self.objects.read().await;
                guard
                    .iter()
                    .map(|(key, (inserted, data))| {
                        ObjectInfo::new(key.clone(), data.len() as u64, Some(*inserted))
                    })
                    .collect()
            };
            for info in entries {
                yield Ok(info);
            }
        })
    }

    async fn fetch(&self, key: &str) -> Result<Vec<u8>> {
        validate_key(key)?;
        let guard = self.objects.read().await;
        let (_inserted, data) = guard
            .get(key)
            .ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(key.to_string())))?;
        Ok(data.clone())
    }
}
