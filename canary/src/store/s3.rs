use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use s3::creds::Credentials;
use s3::error::S3Error;
use s3::{Bucket, BucketConfiguration, Region};

use super::{ObjectStore, StoreError, StoreResult};

/// Connection parameters for [`S3Store`].
pub struct S3StoreConfig<'a> {
    /// Endpoint URL including the scheme, such as `http://rgw.local:8080`.
    pub endpoint: String,
    /// Signing region. Ceph RGW accepts any region for the default zonegroup.
    pub region: String,
    pub access_key: &'a str,
    pub secret_key: &'a str,
    pub request_timeout: Option<Duration>,
}

/// S3-compatible object store using path-style addressing.
///
/// Bucket handles are created lazily and cached per bucket name, so consecutive requests for the
/// canary bucket reuse the same HTTP client. [`ObjectStore::close`] drops all cached handles.
pub struct S3Store {
    region: Region,
    credentials: Credentials,
    request_timeout: Option<Duration>,
    handles: Mutex<BTreeMap<String, Box<Bucket>>>,
}

impl S3Store {
    /// Creates a store for the given endpoint. No request is sent until the first operation.
    pub fn connect(config: S3StoreConfig<'_>) -> StoreResult<Self> {
        let credentials = Credentials::new(
            Some(config.access_key),
            Some(config.secret_key),
            None,
            None,
            None,
        )
        .map_err(|e| StoreError::generic("invalid credentials", e))?;

        let region = Region::Custom {
            region: config.region,
            endpoint: config.endpoint,
        };

        Ok(Self {
            region,
            credentials,
            request_timeout: config.request_timeout,
            handles: Mutex::new(BTreeMap::new()),
        })
    }

    fn configure(&self, mut bucket: Box<Bucket>) -> StoreResult<Box<Bucket>> {
        if let Some(request_timeout) = self.request_timeout {
            bucket = bucket
                .with_request_timeout(request_timeout)
                .map_err(|e| StoreError::generic("failed to configure request timeout", e))?;
        }
        Ok(bucket)
    }

    fn bucket(&self, name: &str) -> StoreResult<Box<Bucket>> {
        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(bucket) = handles.get(name) {
            return Ok(bucket.clone());
        }

        let bucket = Bucket::new(name, self.region.clone(), self.credentials.clone())
            .map_err(|e| StoreError::generic(format!("invalid bucket `{name}`"), e))?
            .with_path_style();
        let bucket = self.configure(bucket)?;

        handles.insert(name.to_owned(), bucket.clone());
        Ok(bucket)
    }

    fn forget(&self, name: &str) {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
    }
}

impl fmt::Debug for S3Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Store")
            .field("endpoint", &self.region.endpoint())
            .finish_non_exhaustive()
    }
}

/// Maps an S3 error response onto the typed conditions the canary distinguishes.
fn classify(status: u16, body: &str, bucket: &str, key: Option<&str>) -> Option<StoreError> {
    match status {
        409 if body.contains("BucketAlreadyExists") || body.contains("BucketAlreadyOwnedByYou") => {
            Some(StoreError::BucketExists(bucket.to_owned()))
        }
        404 if body.contains("NoSuchBucket") => Some(StoreError::NoSuchBucket(bucket.to_owned())),
        404 => key.map(|key| StoreError::NoSuchKey {
            bucket: bucket.to_owned(),
            key: key.to_owned(),
        }),
        _ => None,
    }
}

fn map_err(err: S3Error, context: String, bucket: &str, key: Option<&str>) -> StoreError {
    if let S3Error::HttpFailWithBody(status, body) = &err
        && let Some(mapped) = classify(*status, body, bucket, key)
    {
        return mapped;
    }
    StoreError::generic(context, err)
}

#[async_trait::async_trait]
impl ObjectStore for S3Store {
    fn name(&self) -> &'static str {
        "s3-compatible"
    }

    #[tracing::instrument(level = "trace", skip_all)]
    async fn list_buckets(&self) -> StoreResult<Vec<String>> {
        let response = Bucket::list_buckets(self.region.clone(), self.credentials.clone())
            .await
            .map_err(|e| StoreError::generic("failed to list buckets", e))?;

        Ok(response.bucket_names().collect())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn create_bucket(&self, bucket: &str) -> StoreResult<()> {
        let response = Bucket::create_with_path_style(
            bucket,
            self.region.clone(),
            self.credentials.clone(),
            BucketConfiguration::default(),
        )
        .await
        .map_err(|e| map_err(e, format!("failed to create bucket `{bucket}`"), bucket, None))?;

        if !response.success() {
            return Err(
                classify(response.response_code, &response.response_text, bucket, None)
                    .unwrap_or_else(|| {
                        StoreError::generic(
                            format!("failed to create bucket `{bucket}`"),
                            format!("HTTP {}", response.response_code),
                        )
                    }),
            );
        }

        let handle = self.configure(response.bucket)?;
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(bucket.to_owned(), handle);

        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn delete_bucket(&self, bucket: &str) -> StoreResult<()> {
        let handle = self.bucket(bucket)?;
        handle
            .delete()
            .await
            .map_err(|e| map_err(e, format!("failed to delete bucket `{bucket}`"), bucket, None))?;

        self.forget(bucket);
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn list_keys(&self, bucket: &str) -> StoreResult<Vec<String>> {
        let handle = self.bucket(bucket)?;
        let pages = handle
            .list(String::new(), None)
            .await
            .map_err(|e| map_err(e, format!("failed to list bucket `{bucket}`"), bucket, None))?;

        Ok(pages
            .into_iter()
            .flat_map(|page| page.contents)
            .map(|object| object.key)
            .collect())
    }

    #[tracing::instrument(level = "trace", skip(self, contents))]
    async fn put_object(&self, bucket: &str, key: &str, contents: Bytes) -> StoreResult<()> {
        let handle = self.bucket(bucket)?;
        handle
            .put_object(key, &contents)
            .await
            .map_err(|e| map_err(e, format!("failed to write `{key}`"), bucket, Some(key)))?;

        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn get_object(&self, bucket: &str, key: &str) -> StoreResult<Bytes> {
        let handle = self.bucket(bucket)?;
        let response = handle
            .get_object(key)
            .await
            .map_err(|e| map_err(e, format!("failed to read `{key}`"), bucket, Some(key)))?;

        if response.status_code() == 404 {
            return Err(StoreError::NoSuchKey {
                bucket: bucket.to_owned(),
                key: key.to_owned(),
            });
        }

        Ok(Bytes::from(response.to_vec()))
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn delete_object(&self, bucket: &str, key: &str) -> StoreResult<()> {
        let handle = self.bucket(bucket)?;
        handle
            .delete_object(key)
            .await
            .map_err(|e| map_err(e, format!("failed to delete `{key}`"), bucket, Some(key)))?;

        Ok(())
    }

    async fn close(&self) -> StoreResult<()> {
        tracing::trace!("releasing bucket handles");
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        Ok(())
    }
}
