//! Lifecycle manager: creates buckets on demand, routes calls to them and
//! supervises their termination.
//!
//! # Lifecycle
//!
//! - **Creation**: `ensure`/`create` build a bucket, then race to register it. Only
//!   the winner's bucket is spawned; a loser's bucket is dropped unstarted, so no
//!   orphan is ever left running.
//! - **Normal termination** (idle timeout, explicit stop): the bucket removes its
//!   directory entry, answers the calls already queued, and exits. No restart.
//! - **Abnormal termination** (internal fault or panic): the directory entry is
//!   removed while the task unwinds and the fault is logged. The bucket is not
//!   recreated; the next call for the key starts from a fresh, empty state.
//!
//! Faults never cross keys: each bucket runs in its own task and the supervision
//! boundary catches its panics.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::{debug, error, info};

use crate::adaptive::DynamicConfig;
use crate::bucket::{Bucket, BucketHandle, Data, Decision, Usage};
use crate::clock::{Clock, MonotonicClock};
use crate::config::BucketConfig;
use crate::directory::{Directory, InMemoryDirectory, Registration};
use crate::error::QuotaError;
use crate::telemetry::{emit_best_effort, NullSink, QuotaEvent, TelemetrySink, TerminationReason};

/// Calls a bucket queues before senders wait for room.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 64;

/// Creates, routes to and supervises one bucket per key.
///
/// Clones share the same directory, default config and sink.
///
/// # Examples
/// ```
/// use quotabox::{BucketConfig, BucketManager, Data};
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() {
/// let manager = BucketManager::new();
/// let cfg = BucketConfig::new(2, Duration::from_secs(30), Duration::from_secs(60)).unwrap();
/// manager.create("user-42", &cfg).unwrap();
///
/// assert!(manager.put("user-42", Data::new()).await.unwrap().is_allowed());
/// assert!(manager.put("user-42", Data::new()).await.unwrap().is_allowed());
/// assert!(!manager.put("user-42", Data::new()).await.unwrap().is_allowed());
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct BucketManager<S = NullSink> {
    directory: Arc<dyn Directory>,
    defaults: DynamicConfig<BucketConfig>,
    clock: Arc<dyn Clock>,
    sink: S,
    mailbox_capacity: usize,
}

impl BucketManager<NullSink> {
    /// Manager with an in-memory directory, default bucket config and no telemetry.
    pub fn new() -> Self {
        Self::with_sink(NullSink)
    }
}

impl Default for BucketManager<NullSink> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: TelemetrySink> BucketManager<S> {
    /// Manager that emits [`QuotaEvent`]s into `sink`.
    pub fn with_sink(sink: S) -> Self {
        Self {
            directory: Arc::new(InMemoryDirectory::new()),
            defaults: DynamicConfig::new(BucketConfig::default()),
            clock: Arc::new(MonotonicClock::default()),
            sink,
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
        }
    }

    /// Use a custom directory implementation.
    pub fn with_directory(mut self, directory: Arc<dyn Directory>) -> Self {
        self.directory = directory;
        self
    }

    /// Override the clock buckets use to age their windows.
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Config used by [`ensure_default`](Self::ensure_default).
    pub fn with_default_config(self, config: BucketConfig) -> Self {
        self.defaults.set(config);
        self
    }

    /// Calls each bucket queues before callers wait; at least 1.
    pub fn with_mailbox_capacity(mut self, capacity: usize) -> Self {
        self.mailbox_capacity = capacity.max(1);
        self
    }

    /// Current config for lazily created buckets.
    pub fn default_config(&self) -> BucketConfig {
        *self.defaults.get()
    }

    /// Replace the config for buckets created from now on. Live buckets keep theirs.
    pub fn set_default_config(&self, config: BucketConfig) {
        self.defaults.set(config);
    }

    /// Handle for `key` if a live bucket is registered.
    pub fn lookup(&self, key: &str) -> Option<BucketHandle> {
        self.directory.lookup(key).filter(BucketHandle::is_alive)
    }

    /// Handle for `key`, creating the bucket with `config` on a miss.
    ///
    /// Concurrent callers for the same new key all receive the same handle.
    /// Must be called from within a tokio runtime, which hosts the bucket task.
    pub fn ensure(&self, key: &str, config: &BucketConfig) -> BucketHandle {
        match self.start(key, config) {
            Ok(handle) | Err(handle) => handle,
        }
    }

    /// [`ensure`](Self::ensure) with the current default config.
    pub fn ensure_default(&self, key: &str) -> BucketHandle {
        let config = self.default_config();
        self.ensure(key, &config)
    }

    /// Create the bucket for `key`, reporting [`QuotaError::AlreadyExists`] if a
    /// live bucket already owns it. No state is touched in that case.
    pub fn create(&self, key: &str, config: &BucketConfig) -> Result<BucketHandle, QuotaError> {
        self.start(key, config).map_err(|_| QuotaError::AlreadyExists { key: key.to_string() })
    }

    /// Quota snapshot for `key` without consuming a request.
    pub async fn check(&self, key: &str) -> Result<Decision<Usage>, QuotaError> {
        self.route(key)?.check().await
    }

    /// Consume one request for `key` and merge `data` into its store.
    pub async fn put(&self, key: &str, data: Data) -> Result<Decision<()>, QuotaError> {
        self.route(key)?.put(data).await
    }

    /// Consume one request for `key` and read its store, projected onto `fields`
    /// unless empty.
    pub async fn get(&self, key: &str, fields: Vec<String>) -> Result<Decision<Data>, QuotaError> {
        self.route(key)?.get(fields).await
    }

    /// Terminate the bucket for `key` normally. It is not restarted.
    pub async fn stop(&self, key: &str) -> Result<(), QuotaError> {
        self.route(key)?.stop().await
    }

    /// Stop every live bucket.
    pub async fn shutdown(&self) {
        for key in self.directory.keys() {
            if let Some(handle) = self.lookup(&key) {
                let _ = handle.stop().await;
            }
        }
    }

    /// Keys with a registered bucket, sorted.
    pub fn keys(&self) -> Vec<String> {
        self.directory.keys()
    }

    pub fn len(&self) -> usize {
        self.directory.len()
    }

    pub fn is_empty(&self) -> bool {
        self.directory.is_empty()
    }

    fn route(&self, key: &str) -> Result<BucketHandle, QuotaError> {
        self.lookup(key).ok_or_else(|| QuotaError::invalid_key(key))
    }

    /// Returns `Ok` with the new handle if this call created the bucket, or `Err`
    /// with the live bucket's handle otherwise.
    fn start(&self, key: &str, config: &BucketConfig) -> Result<BucketHandle, BucketHandle> {
        if let Some(existing) = self.lookup(key) {
            return Err(existing);
        }

        let (bucket, handle) = Bucket::new(
            key,
            *config,
            self.clock.clone(),
            self.sink.clone(),
            self.mailbox_capacity,
        );
        match self.directory.register_if_absent(key, handle.clone()) {
            Registration::Registered => {
                debug!(target: "quotabox::manager", key = %key, id = %handle.id(), "bucket created");
                self.supervise(bucket, config);
                Ok(handle)
            }
            // The losing bucket was never spawned; dropping it closes its mailbox.
            Registration::AlreadyPresent(winner) => Err(winner),
        }
    }

    fn supervise(&self, bucket: Bucket<S>, config: &BucketConfig) {
        let directory = self.directory.clone();
        let sink = self.sink.clone();
        let key = bucket.key().to_string();
        let created = QuotaEvent::Created {
            key: key.clone(),
            max_requests: config.max_requests(),
            window: config.window(),
        };

        tokio::spawn(async move {
            emit_best_effort(sink.clone(), created).await;

            let reason = match AssertUnwindSafe(bucket.run(directory)).catch_unwind().await {
                Ok(exit) => exit.into_reason(),
                Err(panic) => TerminationReason::Fault(panic_message(panic.as_ref())),
            };
            match &reason {
                TerminationReason::Fault(msg) => {
                    error!(target: "quotabox::manager", key = %key, fault = %msg, "bucket terminated abnormally");
                }
                other => {
                    info!(target: "quotabox::manager", key = %key, reason = %other, "bucket terminated");
                }
            }
            emit_best_effort(sink, QuotaEvent::Terminated { key, reason }).await;
        });
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::MemorySink;
    use std::sync::Mutex;
    use std::time::Duration;
    use tracing_subscriber::fmt::writer::BoxMakeWriter;
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone)]
    struct SharedWriter(Arc<Mutex<Vec<u8>>>);

    impl<'a> MakeWriter<'a> for SharedWriter {
        type Writer = SharedGuard;
        fn make_writer(&'a self) -> Self::Writer {
            SharedGuard(self.0.clone())
        }
    }

    struct SharedGuard(Arc<Mutex<Vec<u8>>>);
    impl std::io::Write for SharedGuard {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn crash_removes_entry_and_next_create_is_fresh() {
        let sink = MemorySink::new();
        let manager = BucketManager::with_sink(sink.clone());
        let cfg = BucketConfig::default().with_max_requests(3).unwrap();

        let handle = manager.create("k", &cfg).unwrap();
        manager.put("k", Data::from([("a".to_string(), serde_json::json!(1))])).await.unwrap();
        handle.crash().await;
        settle().await;

        assert!(manager.lookup("k").is_none());
        assert_eq!(manager.check("k").await.unwrap_err(), QuotaError::invalid_key("k"));
        let terminated = sink
            .events()
            .into_iter()
            .find(|e| matches!(e, QuotaEvent::Terminated { .. }))
            .expect("termination event");
        match terminated {
            QuotaEvent::Terminated { reason: TerminationReason::Fault(msg), .. } => {
                assert!(msg.contains("injected bucket crash"))
            }
            other => panic!("expected fault termination, got {other:?}"),
        }

        let fresh = manager.create("k", &cfg).unwrap();
        assert!(!fresh.same_bucket(&handle));
        let usage = fresh.check().await.unwrap().allowed().unwrap();
        assert_eq!(usage.used, 0);
        let data = fresh.get(vec![]).await.unwrap().allowed().unwrap();
        assert!(data.is_empty());
    }

    #[tokio::test]
    async fn quota_overrun_fault_removes_entry_and_reports_fault() {
        let sink = MemorySink::new();
        let manager = BucketManager::with_sink(sink.clone());
        let handle = manager.ensure_default("k");
        manager.ensure_default("other");

        let (_, pending) = tokio::join!(handle.overrun(), handle.check());
        settle().await;

        assert!(pending.unwrap_err().is_invalid_key());
        assert!(manager.lookup("k").is_none());
        assert_eq!(manager.keys(), vec!["other"]);
        let reason = sink.events().into_iter().find_map(|e| match e {
            QuotaEvent::Terminated { key, reason } if key == "k" => Some(reason),
            _ => None,
        });
        assert_eq!(
            reason,
            Some(TerminationReason::Fault("quota overrun: used 6 exceeds max 5".to_string()))
        );
    }

    #[tokio::test]
    async fn crash_is_isolated_to_one_key() {
        let manager = BucketManager::new();
        let cfg = BucketConfig::default();
        let doomed = manager.create("doomed", &cfg).unwrap();
        manager.create("healthy", &cfg).unwrap();
        manager.put("healthy", Data::new()).await.unwrap();

        doomed.crash().await;
        settle().await;

        assert_eq!(manager.keys(), vec!["healthy"]);
        let usage = manager.check("healthy").await.unwrap().allowed().unwrap();
        assert_eq!(usage.used, 1);
    }

    #[tokio::test]
    async fn crash_is_logged_as_error() {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::fmt()
            .with_writer(BoxMakeWriter::new(SharedWriter(buffer.clone())))
            .with_target(true)
            .without_time()
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let manager = BucketManager::new();
        let handle = manager.ensure_default("k");
        handle.crash().await;
        settle().await;

        let logs = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        assert!(logs.contains("bucket terminated abnormally"));
        assert!(logs.contains("quotabox::manager"));
    }

    #[tokio::test]
    async fn calls_queued_behind_a_crash_see_invalid_key() {
        let manager = BucketManager::new();
        let handle = manager.ensure_default("k");
        let (_, pending) = tokio::join!(handle.crash(), handle.check());
        assert!(pending.unwrap_err().is_invalid_key());
    }

    #[tokio::test]
    async fn default_config_is_live() {
        let manager = BucketManager::new();
        manager.ensure_default("before");
        manager.set_default_config(BucketConfig::default().with_max_requests(1).unwrap());
        manager.ensure_default("after");

        assert_eq!(manager.check("before").await.unwrap().allowed().unwrap().max_requests, 5);
        assert_eq!(manager.check("after").await.unwrap().allowed().unwrap().max_requests, 1);
        assert_eq!(manager.default_config().max_requests(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_every_bucket() {
        let sink = MemorySink::new();
        let manager = BucketManager::with_sink(sink.clone());
        for key in ["a", "b", "c"] {
            manager.ensure_default(key);
        }
        assert_eq!(manager.len(), 3);

        manager.shutdown().await;
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert!(manager.is_empty());
        let stopped = sink
            .events()
            .into_iter()
            .filter(|e| {
                matches!(e, QuotaEvent::Terminated { reason: TerminationReason::Stopped, .. })
            })
            .count();
        assert_eq!(stopped, 3);
    }
}
