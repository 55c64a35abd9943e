//! The canary state machine.
//!
//! A [`CanarySession`] owns the store connection, the seed payload and the registry of objects
//! it has written. Each cycle walks the states forward:
//!
//! ```text
//! Idle -> BucketCreated -> ObjectsWritten -> ObjectsRead -> ObjectsDeleted -> Idle
//! ```
//!
//! Any store failure aborts the cycle and is returned to the caller. The registry only ever
//! contains names that were successfully written and not yet deleted, so it mirrors the store
//! between steps even after a failure. [`CanarySession::clean_up`] brings the store and the session
//! back to `Idle` from any state.

use std::collections::VecDeque;
use std::time::Instant;

use bytes::Bytes;
use rand::SeedableRng;
use rand::rngs::SmallRng;

use crate::error::{CanaryError, CanaryResult};
use crate::metrics::{RunMetrics, Step, Timing};
use crate::seed;
use crate::store::{BoxedStore, StoreError};

/// Bucket used when none is configured.
pub const DEFAULT_BUCKET: &str = "canary";

/// Parameters of a canary session.
#[derive(Clone, Debug, PartialEq)]
pub struct CanaryOptions {
    /// Name of the bucket created and deleted every cycle.
    pub bucket: String,
    /// Size of each object in bytes. Odd sizes are truncated by one byte.
    pub object_size: usize,
    /// Number of objects written per cycle.
    pub object_count: usize,
}

impl Default for CanaryOptions {
    fn default() -> Self {
        Self {
            bucket: DEFAULT_BUCKET.to_owned(),
            object_size: 65536,
            object_count: 1,
        }
    }
}

/// Progress of the current cycle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum State {
    Idle,
    BucketCreated,
    ObjectsWritten,
    ObjectsRead,
    ObjectsDeleted,
}

#[derive(Debug)]
pub struct CanarySession {
    store: BoxedStore,
    options: CanaryOptions,
    seed: Bytes,
    objects: VecDeque<String>,
    state: State,
    rng: SmallRng,
    metrics: RunMetrics,
}

impl CanarySession {
    /// Creates a session and removes anything left behind by a previous run.
    pub async fn open(store: BoxedStore, options: CanaryOptions) -> CanaryResult<Self> {
        Self::open_with_seed(store, options, rand::random()).await
    }

    /// Like [`open`](Self::open), with deterministic payload and object names.
    pub async fn open_with_seed(
        store: BoxedStore,
        options: CanaryOptions,
        seed: u64,
    ) -> CanaryResult<Self> {
        tracing::debug!(store = store.name(), bucket = %options.bucket, "opening canary session");
        let mut rng = SmallRng::seed_from_u64(seed);
        let payload = seed::seed_payload(&mut rng, options.object_size);

        let mut session = Self {
            store,
            options,
            seed: payload,
            objects: VecDeque::new(),
            state: State::Idle,
            rng,
            metrics: RunMetrics::default(),
        };
        session.clean_up().await?;

        Ok(session)
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Names of the objects currently believed to exist, in creation order.
    pub fn objects(&self) -> &VecDeque<String> {
        &self.objects
    }

    /// The payload written to every object.
    pub fn seed(&self) -> &Bytes {
        &self.seed
    }

    pub fn metrics(&self) -> &RunMetrics {
        &self.metrics
    }

    fn bucket_error(&self, step: Step, source: StoreError) -> CanaryError {
        CanaryError::Bucket {
            step,
            bucket: self.options.bucket.clone(),
            source,
        }
    }

    fn expect_state(&self, step: Step, expected: State) -> CanaryResult<()> {
        if self.state != expected {
            return Err(CanaryError::OutOfOrder {
                step,
                state: self.state,
            });
        }
        Ok(())
    }

    fn finish(&mut self, timing: Timing) -> Timing {
        timing.emit();
        self.metrics.record(&timing);
        timing
    }

    fn total_bytes(&self, count: usize) -> u64 {
        (count * self.options.object_size) as u64
    }

    /// Deletes the canary bucket and all of its objects, if the bucket exists.
    ///
    /// This is idempotent: a missing bucket is not an error, including when it disappears between
    /// listing and deletion. Afterwards the session is `Idle` with an empty registry.
    pub async fn clean_up(&mut self) -> CanaryResult<()> {
        let bucket = self.options.bucket.clone();

        let buckets = self
            .store
            .list_buckets()
            .await
            .map_err(|e| self.bucket_error(Step::CleanUp, e))?;

        if buckets.iter().any(|name| *name == bucket) {
            tracing::debug!("clearing old bucket contents");

            let keys = match self.store.list_keys(&bucket).await {
                Ok(keys) => keys,
                Err(StoreError::NoSuchBucket(_)) => Vec::new(),
                Err(e) => return Err(self.bucket_error(Step::CleanUp, e)),
            };

            for key in &keys {
                tracing::debug!("deleting {key}");
                self.store
                    .delete_object(&bucket, key)
                    .await
                    .map_err(|source| CanaryError::Object {
                        step: Step::CleanUp,
                        key: key.clone(),
                        source,
                    })?;
            }

            match self.store.delete_bucket(&bucket).await {
                Ok(()) | Err(StoreError::NoSuchBucket(_)) => {}
                Err(e) => return Err(self.bucket_error(Step::CleanUp, e)),
            }

            tracing::debug!(objects = keys.len(), "removed bucket {bucket}");
        }

        self.objects.clear();
        self.state = State::Idle;
        Ok(())
    }

    /// Creates the canary bucket.
    pub async fn create_bucket(&mut self) -> CanaryResult<Timing> {
        self.expect_state(Step::CreateBucket, State::Idle)?;
        tracing::debug!("create bucket starting");
        let start = Instant::now();

        self.store
            .create_bucket(&self.options.bucket)
            .await
            .map_err(|e| self.bucket_error(Step::CreateBucket, e))?;

        let timing = Timing::new(Step::CreateBucket, start.elapsed());
        self.state = State::BucketCreated;
        tracing::debug!("create bucket complete");

        Ok(self.finish(timing))
    }

    /// Writes `count` objects with random names, each containing the seed payload.
    pub async fn create_object(&mut self, count: usize) -> CanaryResult<Timing> {
        self.expect_state(Step::CreateObject, State::BucketCreated)?;
        tracing::debug!("create objects starting - for {count} objects");
        let start = Instant::now();

        for _ in 0..count {
            let key = seed::object_name(&mut self.rng);
            tracing::debug!("creating {key}");

            self.store
                .put_object(&self.options.bucket, &key, self.seed.clone())
                .await
                .map_err(|source| CanaryError::Object {
                    step: Step::CreateObject,
                    key: key.clone(),
                    source,
                })?;

            self.objects.push_back(key);
        }

        let timing = Timing::new(Step::CreateObject, start.elapsed())
            .with_count(count)
            .with_bytes(self.total_bytes(count));
        self.state = State::ObjectsWritten;
        tracing::debug!("create object(s) complete");

        Ok(self.finish(timing))
    }

    /// Fetches every registered object in full. The contents are discarded.
    pub async fn read_object(&mut self) -> CanaryResult<Timing> {
        self.expect_state(Step::ReadObject, State::ObjectsWritten)?;
        let count = self.objects.len();
        tracing::debug!("read object starting - {count} object(s)");
        let start = Instant::now();

        for key in &self.objects {
            tracing::debug!("reading object {key}");
            self.store
                .get_object(&self.options.bucket, key)
                .await
                .map_err(|source| CanaryError::Object {
                    step: Step::ReadObject,
                    key: key.clone(),
                    source,
                })?;
        }

        let timing = Timing::new(Step::ReadObject, start.elapsed())
            .with_count(count)
            .with_bytes(self.total_bytes(count));
        self.state = State::ObjectsRead;
        tracing::debug!("read object(s) complete");

        Ok(self.finish(timing))
    }

    /// Deletes every registered object, unregistering each one once its deletion succeeded.
    pub async fn delete_object(&mut self) -> CanaryResult<Timing> {
        self.expect_state(Step::DeleteObject, State::ObjectsRead)?;
        let count = self.objects.len();
        tracing::debug!("deleting objects from bucket");
        let start = Instant::now();

        while let Some(key) = self.objects.front() {
            tracing::debug!("deleting {key}");
            self.store
                .delete_object(&self.options.bucket, key)
                .await
                .map_err(|source| CanaryError::Object {
                    step: Step::DeleteObject,
                    key: key.clone(),
                    source,
                })?;
            self.objects.pop_front();
        }

        let timing = Timing::new(Step::DeleteObject, start.elapsed()).with_count(count);
        self.state = State::ObjectsDeleted;
        tracing::debug!("delete object(s) complete");

        Ok(self.finish(timing))
    }

    /// Deletes the now empty bucket and releases the connection's per-cycle resources.
    pub async fn delete_bucket(&mut self) -> CanaryResult<Timing> {
        self.expect_state(Step::DeleteBucket, State::ObjectsDeleted)?;
        tracing::debug!("delete bucket starting");
        let start = Instant::now();

        self.store
            .delete_bucket(&self.options.bucket)
            .await
            .map_err(|e| self.bucket_error(Step::DeleteBucket, e))?;
        self.store
            .close()
            .await
            .map_err(|e| self.bucket_error(Step::DeleteBucket, e))?;
        tracing::debug!("{} bucket deleted", self.options.bucket);

        let timing = Timing::new(Step::DeleteBucket, start.elapsed());
        self.state = State::Idle;
        tracing::debug!("delete bucket complete");

        Ok(self.finish(timing))
    }

    /// Runs one full cycle, stopping at the first failing step.
    pub async fn test_sequence(&mut self) -> CanaryResult<Vec<Timing>> {
        let timings = vec![
            self.create_bucket().await?,
            self.create_object(self.options.object_count).await?,
            self.read_object().await?,
            self.delete_object().await?,
            self.delete_bucket().await?,
        ];
        self.metrics.cycle_completed();

        Ok(timings)
    }

    /// Releases the store connection.
    pub async fn close(&mut self) -> CanaryResult<()> {
        self.store
            .close()
            .await
            .map_err(|e| self.bucket_error(Step::CleanUp, e))
    }
}
