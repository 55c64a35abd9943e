//! The object-store client adapter consumed by the canary.
//!
//! The canary only needs a small slice of the S3 API: bucket listing and creation, object
//! writes, reads and deletes, and key listing for cleanup. [`ObjectStore`] captures exactly that
//! surface so the state machine can run against a real endpoint ([`s3::S3Store`]) or an
//! in-process map ([`in_memory::InMemoryStore`]).

use std::fmt::Debug;

use bytes::Bytes;
use thiserror::Error;

pub mod in_memory;
pub mod s3;

/// A type-erased [`ObjectStore`] instance.
pub type BoxedStore = Box<dyn ObjectStore>;

#[async_trait::async_trait]
pub trait ObjectStore: Debug + Send + Sync + 'static {
    /// The adapter name, used for diagnostics.
    fn name(&self) -> &'static str;

    /// Lists the names of all buckets visible to the configured credentials.
    async fn list_buckets(&self) -> StoreResult<Vec<String>>;

    /// Creates a bucket.
    ///
    /// Fails with [`StoreError::BucketExists`] if the bucket is already present.
    async fn create_bucket(&self, bucket: &str) -> StoreResult<()>;

    /// Deletes an empty bucket.
    async fn delete_bucket(&self, bucket: &str) -> StoreResult<()>;

    /// Lists all keys stored in the bucket.
    async fn list_keys(&self, bucket: &str) -> StoreResult<Vec<String>>;

    /// Stores `contents` under `key`, replacing any previous object.
    async fn put_object(&self, bucket: &str, key: &str, contents: Bytes) -> StoreResult<()>;

    /// Fetches the full contents of the object at `key`.
    async fn get_object(&self, bucket: &str, key: &str) -> StoreResult<Bytes>;

    /// Deletes the object at `key`. Deleting a missing key succeeds, as it does in S3.
    async fn delete_object(&self, bucket: &str, key: &str) -> StoreResult<()>;

    /// Releases connection resources held for previously used buckets.
    async fn close(&self) -> StoreResult<()>;
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// The bucket to create is already present.
    #[error("bucket `{0}` already exists")]
    BucketExists(String),

    /// The bucket does not exist.
    #[error("bucket `{0}` does not exist")]
    NoSuchBucket(String),

    /// The object does not exist.
    #[error("object `{key}` does not exist in bucket `{bucket}`")]
    NoSuchKey { bucket: String, key: String },

    /// Any other error stemming from the store, such as network or authentication failures.
    #[error("object store error: {context}")]
    Generic {
        context: String,
        #[source]
        cause: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl StoreError {
    /// Wraps an adapter-specific error with a description of the failed call.
    pub fn generic<E>(context: impl Into<String>, cause: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::Generic {
            context: context.into(),
            cause: cause.into(),
        }
    }
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
