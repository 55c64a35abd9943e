//! In-memory store for tests.
//!
//! This provides an [`ObjectStore`] backed by nested `BTreeMap`s, removing the need for a live
//! S3 endpoint in tests. The store is [`Clone`] so tests can hold a handle for direct inspection
//! while the session owns a boxed copy. Individual operations can be made to fail with
//! [`InMemoryStore::fail_after`] to exercise the canary's abort and cleanup paths.

use std::collections::BTreeMap;
use std::io;
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use super::{ObjectStore, StoreError, StoreResult};

type Buckets = BTreeMap<String, BTreeMap<String, Bytes>>;

/// Store operations that can be made to fail.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Operation {
    ListBuckets,
    CreateBucket,
    DeleteBucket,
    ListKeys,
    PutObject,
    GetObject,
    DeleteObject,
}

#[derive(Debug, Default)]
struct Inner {
    buckets: Buckets,
    /// Pending injected failures: the operation fails once its countdown reaches zero.
    failures: Vec<(Operation, usize)>,
    closed: usize,
}

impl Inner {
    fn check(&mut self, op: Operation) -> StoreResult<()> {
        let Some(pos) = self.failures.iter().position(|(o, _)| *o == op) else {
            return Ok(());
        };

        let (_, remaining) = &mut self.failures[pos];
        if *remaining > 0 {
            *remaining -= 1;
            return Ok(());
        }

        self.failures.remove(pos);
        Err(StoreError::generic(
            format!("injected {op:?} failure"),
            io::Error::other("connection reset by peer"),
        ))
    }

    fn bucket_mut(&mut self, bucket: &str) -> StoreResult<&mut BTreeMap<String, Bytes>> {
        self.buckets
            .get_mut(bucket)
            .ok_or_else(|| StoreError::NoSuchBucket(bucket.to_owned()))
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `op` succeed `successes` more times and then fail exactly once.
    pub fn fail_after(&self, op: Operation, successes: usize) {
        self.inner.lock().unwrap().failures.push((op, successes));
    }

    /// Creates a bucket directly, bypassing the `ObjectStore` trait.
    pub fn insert_bucket(&self, bucket: &str) {
        self.inner
            .lock()
            .unwrap()
            .buckets
            .entry(bucket.to_owned())
            .or_default();
    }

    /// Stores an object directly, creating the bucket if needed.
    pub fn insert_object(&self, bucket: &str, key: &str, contents: impl Into<Bytes>) {
        self.inner
            .lock()
            .unwrap()
            .buckets
            .entry(bucket.to_owned())
            .or_default()
            .insert(key.to_owned(), contents.into());
    }

    /// Returns `true` if the bucket exists.
    pub fn contains_bucket(&self, bucket: &str) -> bool {
        self.inner.lock().unwrap().buckets.contains_key(bucket)
    }

    /// Returns the sorted keys in the bucket, or `None` if the bucket does not exist.
    pub fn keys(&self, bucket: &str) -> Option<Vec<String>> {
        let inner = self.inner.lock().unwrap();
        inner
            .buckets
            .get(bucket)
            .map(|objects| objects.keys().cloned().collect())
    }

    /// Returns a clone of the stored contents, if present.
    pub fn get_stored(&self, bucket: &str, key: &str) -> Option<Bytes> {
        let inner = self.inner.lock().unwrap();
        inner.buckets.get(bucket)?.get(key).cloned()
    }

    /// Returns `true` if the store holds no buckets at all.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().buckets.is_empty()
    }

    /// Number of times [`ObjectStore::close`] was called.
    pub fn close_count(&self) -> usize {
        self.inner.lock().unwrap().closed
    }
}

#[async_trait::async_trait]
impl ObjectStore for InMemoryStore {
    fn name(&self) -> &'static str {
        "in-memory"
    }

    async fn list_buckets(&self) -> StoreResult<Vec<String>> {
        let mut inner = self.inner.lock().unwrap();
        inner.check(Operation::ListBuckets)?;
        Ok(inner.buckets.keys().cloned().collect())
    }

    async fn create_bucket(&self, bucket: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.check(Operation::CreateBucket)?;
        if inner.buckets.contains_key(bucket) {
            return Err(StoreError::BucketExists(bucket.to_owned()));
        }
        inner.buckets.insert(bucket.to_owned(), BTreeMap::new());
        Ok(())
    }

    async fn delete_bucket(&self, bucket: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.check(Operation::DeleteBucket)?;
        if !inner.bucket_mut(bucket)?.is_empty() {
            return Err(StoreError::generic(
                format!("failed to delete bucket `{bucket}`"),
                "BucketNotEmpty",
            ));
        }
        inner.buckets.remove(bucket);
        Ok(())
    }

    async fn list_keys(&self, bucket: &str) -> StoreResult<Vec<String>> {
        let mut inner = self.inner.lock().unwrap();
        inner.check(Operation::ListKeys)?;
        Ok(inner.bucket_mut(bucket)?.keys().cloned().collect())
    }

    async fn put_object(&self, bucket: &str, key: &str, contents: Bytes) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.check(Operation::PutObject)?;
        inner.bucket_mut(bucket)?.insert(key.to_owned(), contents);
        Ok(())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> StoreResult<Bytes> {
        let mut inner = self.inner.lock().unwrap();
        inner.check(Operation::GetObject)?;
        inner
            .bucket_mut(bucket)?
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NoSuchKey {
                bucket: bucket.to_owned(),
                key: key.to_owned(),
            })
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.check(Operation::DeleteObject)?;
        inner.bucket_mut(bucket)?.remove(key);
        Ok(())
    }

    async fn close(&self) -> StoreResult<()> {
        self.inner.lock().unwrap().closed += 1;
        Ok(())
    }
}
