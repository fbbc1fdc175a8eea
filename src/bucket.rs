//! Per-key bucket: a fixed-window quota plus a small key-value store, run as a
//! sequential actor.
//!
//! Every call is a message on the bucket's mailbox. The actor processes one
//! message at a time, so the window refresh, the quota check and the mutation of
//! a call are never interleaved with another call for the same key. Different
//! keys run in independent tasks and share no mutable state.
//!
//! Window expiry is evaluated lazily as the first step of every call; there is no
//! refresh timer. The only timer is the idle deadline, re-armed after each handled
//! call.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::clock::Clock;
use crate::config::BucketConfig;
use crate::directory::Directory;
use crate::error::{BucketFault, QuotaError};
use crate::telemetry::{emit_best_effort, QuotaEvent, TelemetrySink, TerminationReason};

/// Caller-supplied data stored in a bucket.
pub type Data = HashMap<String, serde_json::Value>;

/// Outcome of an admission-controlled call.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision<T> {
    /// The call was admitted.
    Allowed(T),
    /// The window's quota is spent.
    Denied {
        /// Time until the current window ends. Never negative.
        /// Useful for `Retry-After` headers.
        retry_after: Duration,
    },
}

impl<T> Decision<T> {
    /// Helper to check if allowed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed(_))
    }

    /// Backoff hint if denied.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Decision::Denied { retry_after } => Some(*retry_after),
            Decision::Allowed(_) => None,
        }
    }

    /// The admitted value, if any.
    pub fn allowed(self) -> Option<T> {
        match self {
            Decision::Allowed(value) => Some(value),
            Decision::Denied { .. } => None,
        }
    }
}

/// Quota snapshot returned by `check`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Usage {
    /// Requests admitted per window.
    pub max_requests: u32,
    /// Requests consumed in the current window.
    pub used: u32,
    /// Time until the current window ends.
    pub time_until_refresh: Duration,
}

impl Usage {
    /// Requests still available in the current window.
    pub fn remaining(&self) -> u32 {
        self.max_requests.saturating_sub(self.used)
    }
}

/// Quota counters and stored data for one key.
///
/// Only the owning actor mutates this. All methods take the current clock reading
/// so the window logic is testable without a runtime.
#[derive(Debug, Clone)]
pub(crate) struct BucketState {
    max_requests: u32,
    window_millis: u64,
    used: u32,
    data: Data,
    window_started_at: u64,
}

impl BucketState {
    pub(crate) fn new(config: &BucketConfig, now: u64) -> Self {
        Self {
            max_requests: config.max_requests(),
            window_millis: config.window_millis(),
            used: 0,
            data: Data::new(),
            window_started_at: now,
        }
    }

    /// Resets the counter if the window has expired. Returns `true` on reset.
    fn refresh(&mut self, now: u64) -> bool {
        if self.time_until_refresh(now) == 0 {
            self.used = 0;
            self.window_started_at = now;
            true
        } else {
            false
        }
    }

    fn time_until_refresh(&self, now: u64) -> u64 {
        let elapsed = now.saturating_sub(self.window_started_at);
        self.window_millis.saturating_sub(elapsed)
    }

    fn ensure_within_quota(&self) -> Result<(), BucketFault> {
        if self.used > self.max_requests {
            return Err(BucketFault::QuotaOverrun { used: self.used, max: self.max_requests });
        }
        Ok(())
    }

    fn retry_after(&self, now: u64) -> Duration {
        Duration::from_millis(self.time_until_refresh(now))
    }

    /// Consumes one request if the window has room, otherwise returns the
    /// retry-after hint.
    fn consume(&mut self, now: u64) -> Result<Option<Duration>, BucketFault> {
        if self.used >= self.max_requests {
            return Ok(Some(self.retry_after(now)));
        }
        self.used += 1;
        self.ensure_within_quota()?;
        Ok(None)
    }

    pub(crate) fn check(&mut self, now: u64) -> Result<Step<Usage>, BucketFault> {
        self.ensure_within_quota()?;
        let refreshed = self.refresh(now);
        let decision = if self.used < self.max_requests {
            Decision::Allowed(Usage {
                max_requests: self.max_requests,
                used: self.used,
                time_until_refresh: Duration::from_millis(self.time_until_refresh(now)),
            })
        } else {
            Decision::Denied { retry_after: self.retry_after(now) }
        };
        Ok(Step { decision, refreshed })
    }

    pub(crate) fn put(&mut self, data: Data, now: u64) -> Result<Step<()>, BucketFault> {
        self.ensure_within_quota()?;
        let refreshed = self.refresh(now);
        if let Some(retry_after) = self.consume(now)? {
            return Ok(Step { decision: Decision::Denied { retry_after }, refreshed });
        }
        self.data.extend(data);
        Ok(Step { decision: Decision::Allowed(()), refreshed })
    }

    pub(crate) fn get(&mut self, fields: &[String], now: u64) -> Result<Step<Data>, BucketFault> {
        self.ensure_within_quota()?;
        let refreshed = self.refresh(now);
        if let Some(retry_after) = self.consume(now)? {
            return Ok(Step { decision: Decision::Denied { retry_after }, refreshed });
        }
        let value = if fields.is_empty() {
            self.data.clone()
        } else {
            fields
                .iter()
                .filter_map(|f| self.data.get(f).map(|v| (f.clone(), v.clone())))
                .collect()
        };
        Ok(Step { decision: Decision::Allowed(value), refreshed })
    }
}

/// Result of one processing step, plus whether the window was reset first.
#[derive(Debug)]
pub(crate) struct Step<T> {
    pub(crate) decision: Decision<T>,
    pub(crate) refreshed: bool,
}

pub(crate) enum Command {
    Check { reply: oneshot::Sender<Decision<Usage>> },
    Put { data: Data, reply: oneshot::Sender<Decision<()>> },
    Get { fields: Vec<String>, reply: oneshot::Sender<Decision<Data>> },
    Stop,
    #[cfg(test)]
    Crash,
    #[cfg(test)]
    Overrun,
}

static NEXT_BUCKET_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one bucket instance. A key that is recreated gets a new id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BucketId(u64);

impl BucketId {
    fn next() -> Self {
        Self(NEXT_BUCKET_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for BucketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Routing handle to a live bucket.
///
/// Cheap to clone. Calls are answered in mailbox order; a call against a bucket
/// that has terminated returns [`QuotaError::InvalidKey`].
#[derive(Clone)]
pub struct BucketHandle {
    key: Arc<str>,
    id: BucketId,
    tx: mpsc::Sender<Command>,
}

impl fmt::Debug for BucketHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BucketHandle")
            .field("key", &self.key)
            .field("id", &self.id)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl BucketHandle {
    /// Key this handle routes to.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Identity of the bucket instance behind this handle.
    pub fn id(&self) -> BucketId {
        self.id
    }

    /// `false` once the bucket has stopped accepting calls.
    pub fn is_alive(&self) -> bool {
        !self.tx.is_closed()
    }

    /// `true` if both handles route to the same bucket instance.
    pub fn same_bucket(&self, other: &BucketHandle) -> bool {
        self.id == other.id
    }

    /// Quota snapshot; refreshes an expired window but consumes nothing.
    pub async fn check(&self) -> Result<Decision<Usage>, QuotaError> {
        self.call(|reply| Command::Check { reply }).await
    }

    /// Consumes one request and merges `data` into the stored data.
    pub async fn put(&self, data: Data) -> Result<Decision<()>, QuotaError> {
        self.call(|reply| Command::Put { data, reply }).await
    }

    /// Consumes one request and returns the stored data, projected onto `fields`
    /// unless it is empty. Unknown fields are omitted.
    pub async fn get(&self, fields: Vec<String>) -> Result<Decision<Data>, QuotaError> {
        self.call(|reply| Command::Get { fields, reply }).await
    }

    /// Asks the bucket to terminate normally once the calls queued ahead of the
    /// stop have been answered.
    pub async fn stop(&self) -> Result<(), QuotaError> {
        self.tx.send(Command::Stop).await.map_err(|_| QuotaError::invalid_key(&self.key))
    }

    #[cfg(test)]
    pub(crate) async fn crash(&self) {
        let _ = self.tx.send(Command::Crash).await;
    }

    #[cfg(test)]
    pub(crate) async fn overrun(&self) {
        let _ = self.tx.send(Command::Overrun).await;
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, QuotaError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx.send(make(reply_tx)).await.map_err(|_| QuotaError::invalid_key(&self.key))?;
        reply_rx.await.map_err(|_| QuotaError::invalid_key(&self.key))
    }
}

/// How the actor loop ended.
#[derive(Debug)]
pub(crate) enum Exit {
    Idle,
    Stopped,
    Orphaned,
    Fault(BucketFault),
}

impl Exit {
    pub(crate) fn into_reason(self) -> TerminationReason {
        match self {
            Exit::Idle => TerminationReason::Idle,
            Exit::Stopped => TerminationReason::Stopped,
            Exit::Orphaned => TerminationReason::Orphaned,
            Exit::Fault(fault) => TerminationReason::Fault(fault.to_string()),
        }
    }
}

/// Removes the bucket's own directory entry when dropped, including during
/// unwinding, so a faulted bucket never leaves a stale handle behind.
struct Deregister {
    directory: Arc<dyn Directory>,
    key: Arc<str>,
    id: BucketId,
}

impl Deregister {
    fn release(&self) {
        self.directory.remove_instance(&self.key, self.id);
    }
}

impl Drop for Deregister {
    fn drop(&mut self) {
        self.release();
    }
}

/// The actor half of a bucket. Built before registration and only spawned by the
/// registration winner.
pub(crate) struct Bucket<S> {
    key: Arc<str>,
    id: BucketId,
    config: BucketConfig,
    state: BucketState,
    clock: Arc<dyn Clock>,
    sink: S,
    rx: mpsc::Receiver<Command>,
}

impl<S: TelemetrySink> Bucket<S> {
    /// Builds the actor and its routing handle. Nothing runs until [`Bucket::run`].
    pub(crate) fn new(
        key: &str,
        config: BucketConfig,
        clock: Arc<dyn Clock>,
        sink: S,
        mailbox_capacity: usize,
    ) -> (Self, BucketHandle) {
        let (tx, rx) = mpsc::channel(mailbox_capacity.max(1));
        let key: Arc<str> = Arc::from(key);
        let id = BucketId::next();
        let state = BucketState::new(&config, clock.now_millis());
        let handle = BucketHandle { key: key.clone(), id, tx };
        (Self { key, id, config, state, clock, sink, rx }, handle)
    }

    pub(crate) fn key(&self) -> &str {
        &self.key
    }

    /// Processes calls until the bucket idles out, is stopped, loses all handles
    /// or faults. This bucket's directory entry is gone by the time this returns
    /// or unwinds.
    pub(crate) async fn run(mut self, directory: Arc<dyn Directory>) -> Exit {
        let deregister = Deregister { directory, key: self.key.clone(), id: self.id };

        let idle_timeout = self.config.idle_timeout();
        let idle = tokio::time::sleep(idle_timeout);
        tokio::pin!(idle);

        let exit = loop {
            tokio::select! {
                biased;
                msg = self.rx.recv() => match msg {
                    Some(Command::Stop) => break Exit::Stopped,
                    Some(cmd) => {
                        if let Err(fault) = self.process(cmd).await {
                            return Exit::Fault(fault);
                        }
                        idle.as_mut().reset(Instant::now() + idle_timeout);
                    }
                    None => break Exit::Orphaned,
                },
                () = &mut idle => break Exit::Idle,
            }
        };

        // Unregister first so no new caller can find us, then answer whatever was
        // already queued.
        deregister.release();
        self.rx.close();
        while let Some(cmd) = self.rx.recv().await {
            if matches!(cmd, Command::Stop) {
                continue;
            }
            if let Err(fault) = self.process(cmd).await {
                return Exit::Fault(fault);
            }
        }
        exit
    }

    async fn process(&mut self, cmd: Command) -> Result<(), BucketFault> {
        let now = self.clock.now_millis();
        match cmd {
            Command::Check { reply } => {
                let step = self.state.check(now)?;
                report(&self.key, &self.sink, &step).await;
                let _ = reply.send(step.decision);
            }
            Command::Put { data, reply } => {
                let step = self.state.put(data, now)?;
                report(&self.key, &self.sink, &step).await;
                let _ = reply.send(step.decision);
            }
            Command::Get { fields, reply } => {
                let step = self.state.get(&fields, now)?;
                report(&self.key, &self.sink, &step).await;
                let _ = reply.send(step.decision);
            }
            Command::Stop => {}
            #[cfg(test)]
            Command::Crash => panic!("injected bucket crash"),
            #[cfg(test)]
            Command::Overrun => {
                self.state.used = self.state.max_requests + 1;
                self.state.ensure_within_quota()?;
            }
        }
        Ok(())
    }
}

async fn report<S: TelemetrySink, T>(key: &str, sink: &S, step: &Step<T>) {
    if step.refreshed {
        tracing::debug!(target: "quotabox::bucket", key = %key, "window refreshed");
        emit_best_effort(sink.clone(), QuotaEvent::Refreshed { key: key.to_string() }).await;
    }
    if let Decision::Denied { retry_after } = step.decision {
        tracing::debug!(target: "quotabox::bucket", key = %key, ?retry_after, "request denied");
        emit_best_effort(sink.clone(), QuotaEvent::Denied { key: key.to_string(), retry_after })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state(max: u32, window_ms: u64) -> BucketState {
        let cfg = BucketConfig::new(max, Duration::from_millis(window_ms), Duration::from_secs(60))
            .unwrap();
        BucketState::new(&cfg, 0)
    }

    fn data(pairs: &[(&str, serde_json::Value)]) -> Data {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn admits_up_to_limit_then_denies() {
        let mut s = state(2, 30_000);
        assert!(s.put(Data::new(), 0).unwrap().decision.is_allowed());
        assert!(s.put(Data::new(), 10).unwrap().decision.is_allowed());
        let step = s.put(Data::new(), 20).unwrap();
        assert_eq!(step.decision, Decision::Denied { retry_after: Duration::from_millis(29_980) });
        assert_eq!(s.used, 2);
    }

    #[test]
    fn check_does_not_consume() {
        let mut s = state(1, 1_000);
        for _ in 0..3 {
            let usage = s.check(0).unwrap().decision.allowed().unwrap();
            assert_eq!(usage.used, 0);
            assert_eq!(usage.remaining(), 1);
            assert_eq!(usage.time_until_refresh, Duration::from_secs(1));
        }
        s.put(Data::new(), 0).unwrap();
        assert_eq!(s.check(500).unwrap().decision.retry_after(), Some(Duration::from_millis(500)));
    }

    #[test]
    fn window_expiry_resets_counter_lazily() {
        let mut s = state(1, 1_000);
        s.put(Data::new(), 0).unwrap();
        assert!(!s.put(Data::new(), 999).unwrap().decision.is_allowed());

        let step = s.check(1_000).unwrap();
        assert!(step.refreshed);
        assert_eq!(step.decision.allowed().unwrap().used, 0);
        assert_eq!(s.window_started_at, 1_000);

        let step = s.put(Data::new(), 1_200).unwrap();
        assert!(!step.refreshed);
        assert!(step.decision.is_allowed());
    }

    #[test]
    fn denied_put_does_not_store_data() {
        let mut s = state(1, 1_000);
        s.put(data(&[("a", json!(1))]), 0).unwrap();
        s.put(data(&[("b", json!(2))]), 1).unwrap();
        assert!(!s.data.contains_key("b"));
    }

    #[test]
    fn put_merges_with_later_values_winning() {
        let mut s = state(5, 1_000);
        s.put(data(&[("a", json!(1)), ("b", json!(2))]), 0).unwrap();
        s.put(data(&[("b", json!("two"))]), 0).unwrap();
        let all = s.get(&[], 0).unwrap().decision.allowed().unwrap();
        assert_eq!(all, data(&[("a", json!(1)), ("b", json!("two"))]));
    }

    #[test]
    fn get_projects_fields_and_consumes() {
        let mut s = state(3, 1_000);
        s.put(data(&[("a", json!(1)), ("b", json!(2))]), 0).unwrap();
        let fields = vec!["a".to_string(), "c".to_string()];
        let got = s.get(&fields, 0).unwrap().decision.allowed().unwrap();
        assert_eq!(got, data(&[("a", json!(1))]));
        assert_eq!(s.used, 2);
    }

    #[test]
    fn denied_get_reports_retry_after() {
        let mut s = state(1, 1_000);
        s.get(&[], 0).unwrap();
        let step = s.get(&[], 400).unwrap();
        assert_eq!(step.decision, Decision::Denied { retry_after: Duration::from_millis(600) });
    }

    #[test]
    fn overrun_is_reported_as_fault() {
        let mut s = state(1, 1_000);
        s.used = 2;
        let err = s.check(0).unwrap_err();
        assert_eq!(err, BucketFault::QuotaOverrun { used: 2, max: 1 });
    }

    #[test]
    fn time_until_refresh_never_underflows() {
        let s = state(1, 1_000);
        assert_eq!(s.time_until_refresh(5_000), 0);
    }
}
