// Copyright 2025 coScene
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Bounded per-pipeline queue and the worker task that drives its store

use chrono::{DateTime, TimeZone, Utc};
use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, timeout_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::QueueConfig;
use crate::counters::{self, Counters};
use crate::error::{QueueError, StoreError};
use crate::protocol::LogEntry;
use crate::store::Store;
use crate::throttle::QueueGauge;

/// Process-wide collaborators every queue reports to
#[derive(Clone)]
pub struct QueueContext {
    pub gauge: Arc<QueueGauge>,
    pub counters: Arc<Counters>,
    /// How often each store's `periodic_check` runs
    pub check_interval: Duration,
}

impl QueueContext {
    pub fn new(check_interval: Duration) -> Self {
        Self {
            gauge: Arc::new(QueueGauge::new()),
            counters: Arc::new(Counters::new()),
            check_interval,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Deliver what is queued within the drain budget, then close
    Graceful,
    /// Discard what is queued and close
    Immediate,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub enqueued: u64,
    pub delivered: u64,
    pub lost: u64,
    pub retries: u64,
}

/// Exponential backoff between retries of a failed batch
#[derive(Debug)]
pub(crate) struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    current: Option<Duration>,
}

impl Backoff {
    pub(crate) fn new(settings: &QueueConfig) -> Self {
        Self {
            initial: settings.initial_backoff(),
            max: settings.max_backoff(),
            multiplier: settings.retry_backoff_multiplier.max(1.0),
            current: None,
        }
    }

    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = match self.current {
            None => self.initial,
            Some(current) => {
                let nanos = (current.as_nanos() as f64 * self.multiplier).round();
                Duration::from_nanos(nanos.min(u64::MAX as f64) as u64).min(self.max)
            }
        };
        self.current = Some(delay);
        delay
    }

    pub(crate) fn reset(&mut self) {
        self.current = None;
    }
}

struct QueueShared {
    category: String,
    store_type: &'static str,
    settings: QueueConfig,
    entries: ArrayQueue<LogEntry>,
    queued_bytes: AtomicU64,
    accepting: AtomicBool,
    /// Enqueue calls between their `accepting` check and their push
    enqueuers: AtomicUsize,
    wake: Notify,
    enqueued: AtomicU64,
    delivered: AtomicU64,
    lost: AtomicU64,
    retries: AtomicU64,
    last_delivery_ms: AtomicI64,
    status: Mutex<Option<String>>,
    ctx: QueueContext,
}

impl QueueShared {
    fn set_status(&self, status: Option<String>) {
        *self.status.lock() = status;
    }

    fn record_delivered(&self, count: usize, bytes: u64) {
        self.delivered.fetch_add(count as u64, Ordering::Relaxed);
        self.last_delivery_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        self.ctx.gauge.sub(count as u64, bytes);
        self.ctx
            .counters
            .inc_category(&self.category, counters::SENT, count as i64);
    }

    fn record_lost(&self, count: usize, bytes: u64) {
        if count == 0 {
            return;
        }
        self.lost.fetch_add(count as u64, Ordering::Relaxed);
        self.ctx.gauge.sub(count as u64, bytes);
        self.ctx
            .counters
            .inc_category(&self.category, counters::LOST, count as i64);
    }

    /// Remove up to `max` entries from the head of the queue
    fn pop_batch(&self, max: usize, into: &mut Vec<LogEntry>) {
        while into.len() < max {
            match self.entries.pop() {
                Some(entry) => {
                    self.queued_bytes
                        .fetch_sub(entry.size() as u64, Ordering::Relaxed);
                    into.push(entry);
                }
                None => break,
            }
        }
    }

    /// Drop everything still queued, counting it as lost
    fn discard_queued(&self) -> usize {
        let mut count = 0usize;
        let mut bytes = 0u64;
        while let Some(entry) = self.entries.pop() {
            let size = entry.size() as u64;
            self.queued_bytes.fetch_sub(size, Ordering::Relaxed);
            count += 1;
            bytes += size;
        }
        self.record_lost(count, bytes);
        count
    }
}

/// A bounded queue in front of exactly one store, drained by one worker task.
pub struct StoreQueue {
    shared: Arc<QueueShared>,
    stop_tx: watch::Sender<Option<StopMode>>,
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl StoreQueue {
    /// Open `store` and launch the worker.
    ///
    /// A fatal open error fails the start. Other open errors leave the queue
    /// running degraded; the worker keeps reopening the store with backoff.
    pub async fn start(
        category: &str,
        mut store: Box<dyn Store>,
        settings: QueueConfig,
        ctx: QueueContext,
    ) -> Result<Arc<StoreQueue>, StoreError> {
        let initial_status = match store.open().await {
            Ok(()) => None,
            Err(e) if e.is_fatal() => {
                store.close().await;
                return Err(e);
            }
            Err(e) => {
                warn!(
                    "Store {} for category '{}' is unavailable, starting degraded: {}",
                    store.store_type(),
                    category,
                    e
                );
                Some(e.to_string())
            }
        };

        let shared = Arc::new(QueueShared {
            category: category.to_string(),
            store_type: store.store_type(),
            entries: ArrayQueue::new(settings.max_queue_length.max(1)),
            settings,
            queued_bytes: AtomicU64::new(0),
            accepting: AtomicBool::new(true),
            enqueuers: AtomicUsize::new(0),
            wake: Notify::new(),
            enqueued: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            lost: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            last_delivery_ms: AtomicI64::new(0),
            status: Mutex::new(initial_status.clone()),
            ctx,
        });

        let (stop_tx, stop_rx) = watch::channel(None);
        let mut worker = Worker::new(shared.clone(), store);
        if initial_status.is_some() {
            worker.schedule_retry();
        }
        let handle = tokio::spawn(worker.run(stop_rx));

        info!(
            "Started {} queue for category '{}' (capacity {})",
            shared.store_type,
            shared.category,
            shared.entries.capacity()
        );

        Ok(Arc::new(StoreQueue {
            shared,
            stop_tx,
            worker: tokio::sync::Mutex::new(Some(handle)),
        }))
    }

    /// Append an entry without blocking
    pub fn enqueue(&self, entry: LogEntry) -> Result<(), QueueError> {
        let shared = &self.shared;
        shared.enqueuers.fetch_add(1, Ordering::SeqCst);
        if !shared.accepting.load(Ordering::SeqCst) {
            shared.enqueuers.fetch_sub(1, Ordering::SeqCst);
            return Err(QueueError::Stopped {
                category: shared.category.clone(),
            });
        }

        // Account before the push: once pushed, the worker may pop and subtract
        let size = entry.size() as u64;
        let queued = shared
            .queued_bytes
            .fetch_add(size, Ordering::Relaxed)
            .saturating_add(size);
        shared.ctx.gauge.add(1, size);

        let pushed = shared.entries.push(entry);
        shared.enqueuers.fetch_sub(1, Ordering::SeqCst);
        if pushed.is_err() {
            shared.queued_bytes.fetch_sub(size, Ordering::Relaxed);
            shared.ctx.gauge.sub(1, size);
            return Err(QueueError::Full {
                category: shared.category.clone(),
                capacity: shared.entries.capacity(),
            });
        }
        shared.enqueued.fetch_add(1, Ordering::Relaxed);

        if queued >= shared.settings.target_write_size as u64
            || shared.entries.len() >= shared.settings.max_batch_size
        {
            shared.wake.notify_one();
        }
        Ok(())
    }

    /// Stop accepting entries, let the worker finish, then close the store.
    ///
    /// Calling it again after the first stop completed is a no-op.
    pub async fn stop(&self, mode: StopMode) {
        let shared = &self.shared;
        shared.accepting.store(false, Ordering::SeqCst);
        // Wait out enqueue calls that passed the accepting check
        while shared.enqueuers.load(Ordering::SeqCst) > 0 {
            tokio::task::yield_now().await;
        }

        let _ = self.stop_tx.send(Some(mode));
        let handle = self.worker.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(
                    "Worker for category '{}' ended abnormally: {}",
                    shared.category, e
                );
            }
            let stragglers = shared.discard_queued();
            if stragglers > 0 {
                warn!(
                    "Dropped {} entries left in queue for category '{}'",
                    stragglers, shared.category
                );
            }
        }
    }

    pub fn category(&self) -> &str {
        &self.shared.category
    }

    pub fn store_type(&self) -> &'static str {
        self.shared.store_type
    }

    pub fn len(&self) -> usize {
        self.shared.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.shared.entries.capacity()
    }

    pub fn queued_bytes(&self) -> u64 {
        self.shared.queued_bytes.load(Ordering::Relaxed)
    }

    pub fn is_accepting(&self) -> bool {
        self.shared.accepting.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            enqueued: self.shared.enqueued.load(Ordering::Relaxed),
            delivered: self.shared.delivered.load(Ordering::Relaxed),
            lost: self.shared.lost.load(Ordering::Relaxed),
            retries: self.shared.retries.load(Ordering::Relaxed),
        }
    }

    /// Time of the last successful delivery, if any
    pub fn last_delivery(&self) -> Option<DateTime<Utc>> {
        match self.shared.last_delivery_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Utc.timestamp_millis_opt(ms).single(),
        }
    }

    /// Current health problem of the store, if any
    pub fn status(&self) -> Option<String> {
        self.shared.status.lock().clone()
    }
}

impl std::fmt::Debug for StoreQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreQueue")
            .field("category", &self.shared.category)
            .field("store_type", &self.shared.store_type)
            .field("len", &self.len())
            .finish()
    }
}

struct Worker {
    shared: Arc<QueueShared>,
    store: Box<dyn Store>,
    /// Batch being delivered; retried before anything newer
    slot: Vec<LogEntry>,
    backoff: Backoff,
    next_attempt: Option<Instant>,
}

impl Worker {
    fn new(shared: Arc<QueueShared>, store: Box<dyn Store>) -> Self {
        let backoff = Backoff::new(&shared.settings);
        Self {
            shared,
            store,
            slot: Vec::new(),
            backoff,
            next_attempt: None,
        }
    }

    fn schedule_retry(&mut self) -> Duration {
        let delay = self.backoff.next_delay();
        self.next_attempt = Some(Instant::now() + delay);
        delay
    }

    fn has_pending(&self) -> bool {
        !self.slot.is_empty() || !self.shared.entries.is_empty()
    }

    fn slot_bytes(&self) -> u64 {
        self.slot.iter().map(|e| e.size() as u64).sum()
    }

    async fn run(mut self, mut stop_rx: watch::Receiver<Option<StopMode>>) {
        let write_interval = self
            .shared
            .settings
            .max_write_interval()
            .max(Duration::from_millis(1));
        let check_interval = self.shared.ctx.check_interval.max(Duration::from_millis(1));
        let mut flush_tick = interval_at(Instant::now() + write_interval, write_interval);
        flush_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut check_tick = interval_at(Instant::now() + check_interval, check_interval);
        check_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let shared = self.shared.clone();

        let mode = loop {
            let retry_at = self.next_attempt;
            tokio::select! {
                changed = stop_rx.changed() => {
                    break match changed {
                        Ok(()) => (*stop_rx.borrow()).unwrap_or(StopMode::Immediate),
                        // Owner dropped without stopping
                        Err(_) => StopMode::Immediate,
                    };
                }
                _ = shared.wake.notified(), if retry_at.is_none() => self.pump().await,
                _ = sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    self.pump().await
                }
                _ = flush_tick.tick() => {
                    if self.has_pending() {
                        self.pump().await;
                    }
                }
                _ = check_tick.tick() => self.check().await,
            }
        };

        self.finish(mode).await;
    }

    async fn ensure_open(&mut self) -> bool {
        if self.store.is_open() {
            return true;
        }
        match self.store.open().await {
            Ok(()) => {
                info!(
                    "Reopened {} store for category '{}'",
                    self.shared.store_type, self.shared.category
                );
                self.backoff.reset();
                self.shared.set_status(self.store.status());
                true
            }
            Err(e) => {
                let delay = self.schedule_retry();
                warn!(
                    "Store for category '{}' still unavailable, retrying in {:?}: {}",
                    self.shared.category, delay, e
                );
                self.shared.set_status(Some(e.to_string()));
                false
            }
        }
    }

    /// Move the next batch into the slot unless a retry is already there
    fn fill_slot(&mut self) -> bool {
        if self.slot.is_empty() {
            let max = self.shared.settings.max_batch_size.max(1);
            self.shared.pop_batch(max, &mut self.slot);
        }
        !self.slot.is_empty()
    }

    /// Deliver the slot; returns false when the worker should back off
    async fn deliver_slot(&mut self) -> bool {
        match self.store.deliver(&self.slot).await {
            Ok(()) => {
                let bytes = self.slot_bytes();
                debug!(
                    "Delivered {} messages for category '{}'",
                    self.slot.len(),
                    self.shared.category
                );
                self.shared.record_delivered(self.slot.len(), bytes);
                self.slot.clear();
                self.backoff.reset();
                self.shared.set_status(self.store.status());
                true
            }
            Err(e) if e.is_fatal() => {
                error!(
                    "Dropping {} messages for category '{}': {}",
                    self.slot.len(),
                    self.shared.category,
                    e
                );
                let bytes = self.slot_bytes();
                self.shared.record_lost(self.slot.len(), bytes);
                self.slot.clear();
                self.backoff.reset();
                self.shared.set_status(Some(e.to_string()));
                true
            }
            Err(e) => {
                let delay = self.schedule_retry();
                warn!(
                    "Delivery of {} messages for category '{}' failed, retrying in {:?}: {}",
                    self.slot.len(),
                    self.shared.category,
                    delay,
                    e
                );
                self.shared.retries.fetch_add(1, Ordering::Relaxed);
                self.shared
                    .ctx
                    .counters
                    .inc_category(&self.shared.category, counters::RETRIES, 1);
                self.shared.set_status(Some(e.to_string()));
                false
            }
        }
    }

    /// Deliver what is currently queued, stopping at the first retryable failure
    async fn pump(&mut self) {
        if let Some(at) = self.next_attempt {
            if Instant::now() < at {
                return;
            }
            self.next_attempt = None;
        }
        if !self.ensure_open().await {
            return;
        }

        // Bounded so a steady stream cannot keep the worker from seeing stop
        let max = self.shared.settings.max_batch_size.max(1);
        let mut batches = self.shared.entries.len().div_ceil(max) + 1;
        while batches > 0 && self.shared.accepting.load(Ordering::SeqCst) && self.fill_slot() {
            batches -= 1;
            if !self.deliver_slot().await {
                break;
            }
        }
    }

    async fn check(&mut self) {
        if self.store.is_open() {
            self.store.periodic_check().await;
        }
        if self.next_attempt.is_none() {
            self.shared.set_status(self.store.status());
        }
    }

    /// Deliver everything, waiting out backoff between attempts
    async fn drain(&mut self) {
        loop {
            if let Some(at) = self.next_attempt.take() {
                sleep_until(at).await;
            }
            if !self.ensure_open().await {
                continue;
            }
            if !self.fill_slot() {
                return;
            }
            self.deliver_slot().await;
        }
    }

    async fn finish(mut self, mode: StopMode) {
        if mode == StopMode::Graceful && self.has_pending() {
            let deadline = Instant::now() + self.shared.settings.drain_timeout();
            if timeout_at(deadline, self.drain()).await.is_err() {
                warn!(
                    "Drain budget for category '{}' exhausted",
                    self.shared.category
                );
            }
        }

        let bytes = self.slot_bytes();
        let mut lost = self.slot.len();
        self.shared.record_lost(self.slot.len(), bytes);
        self.slot.clear();
        lost += self.shared.discard_queued();
        if lost > 0 {
            warn!(
                "Discarded {} undelivered messages for category '{}'",
                lost, self.shared.category
            );
        }

        if self.store.is_open() {
            if let Err(e) = self.store.flush().await {
                warn!(
                    "Flush failed while stopping category '{}': {}",
                    self.shared.category, e
                );
            }
        }
        self.store.close().await;
        info!(
            "Stopped {} queue for category '{}'",
            self.shared.store_type, self.shared.category
        );
    }
}
