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

// Admission control for the ingestion path

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

use crate::counters::{self, Counters};

/// Source of wall-clock seconds for the throttle window
pub trait Clock: Send + Sync {
    fn now_secs(&self) -> u64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_secs(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

/// Clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_secs: u64) -> Self {
        Self {
            now: AtomicU64::new(start_secs),
        }
    }

    pub fn advance(&self, secs: u64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_secs(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Bytes and entries currently held by all queues, shared by every StoreQueue
#[derive(Debug, Default)]
pub struct QueueGauge {
    bytes: AtomicU64,
    messages: AtomicU64,
}

impl QueueGauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, messages: u64, bytes: u64) {
        self.messages.fetch_add(messages, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn sub(&self, messages: u64, bytes: u64) {
        self.messages.fetch_sub(messages, Ordering::Relaxed);
        self.bytes.fetch_sub(bytes, Ordering::Relaxed);
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn messages(&self) -> u64 {
        self.messages.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// Per-second message ceiling reached
    RateLimited,
    /// Outstanding queued bytes ceiling reached
    QueueLimited,
}

impl Admission {
    pub fn is_admitted(self) -> bool {
        self == Admission::Admitted
    }
}

#[derive(Debug, Default)]
struct Window {
    second: u64,
    accepted: u64,
}

/// Per-second message ceiling plus outstanding queue-size ceiling.
///
/// A zero ceiling disables that check. Limits can be changed on reload
/// without resetting the current window.
pub struct Throttle {
    max_msg_per_second: AtomicU64,
    max_queue_size: AtomicU64,
    window: Mutex<Window>,
    gauge: Arc<QueueGauge>,
    counters: Arc<Counters>,
    clock: Arc<dyn Clock>,
}

impl Throttle {
    pub fn new(
        max_msg_per_second: u64,
        max_queue_size: u64,
        gauge: Arc<QueueGauge>,
        counters: Arc<Counters>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            max_msg_per_second: AtomicU64::new(max_msg_per_second),
            max_queue_size: AtomicU64::new(max_queue_size),
            window: Mutex::new(Window::default()),
            gauge,
            counters,
            clock,
        }
    }

    pub fn set_limits(&self, max_msg_per_second: u64, max_queue_size: u64) {
        self.max_msg_per_second
            .store(max_msg_per_second, Ordering::Relaxed);
        self.max_queue_size.store(max_queue_size, Ordering::Relaxed);
    }

    /// Decide whether a batch of `message_count` entries totalling `byte_size` bytes is accepted
    pub fn admit(&self, message_count: u64, byte_size: u64) -> Admission {
        let max_queue = self.max_queue_size.load(Ordering::Relaxed);
        if max_queue > 0 && self.gauge.bytes().saturating_add(byte_size) > max_queue {
            debug!(
                "Rejecting {} messages: {} bytes outstanding, ceiling {}",
                message_count,
                self.gauge.bytes(),
                max_queue
            );
            self.counters.inc(counters::DENIED_FOR_QUEUE_SIZE, 1);
            return Admission::QueueLimited;
        }

        let max_rate = self.max_msg_per_second.load(Ordering::Relaxed);
        let now = self.clock.now_secs();
        let mut window = self.window.lock();
        if window.second != now {
            window.second = now;
            window.accepted = 0;
        }

        if max_rate > 0 && window.accepted.saturating_add(message_count) > max_rate {
            drop(window);
            self.counters.inc(counters::DENIED_FOR_RATE, 1);
            return Admission::RateLimited;
        }

        window.accepted += message_count;
        Admission::Admitted
    }

    /// Messages accepted in the current window
    pub fn accepted_in_window(&self) -> u64 {
        let window = self.window.lock();
        if window.second == self.clock.now_secs() {
            window.accepted
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn throttle(max_rate: u64, max_queue: u64) -> (Throttle, Arc<ManualClock>, Arc<QueueGauge>) {
        let clock = Arc::new(ManualClock::new(1_000));
        let gauge = Arc::new(QueueGauge::new());
        let throttle = Throttle::new(
            max_rate,
            max_queue,
            gauge.clone(),
            Arc::new(Counters::new()),
            clock.clone(),
        );
        (throttle, clock, gauge)
    }

    #[test]
    fn test_admits_exactly_up_to_ceiling() {
        let (throttle, _clock, _gauge) = throttle(10, 0);
        for _ in 0..10 {
            assert!(throttle.admit(1, 100).is_admitted());
        }
        assert_eq!(throttle.admit(1, 100), Admission::RateLimited);
        assert_eq!(throttle.accepted_in_window(), 10);
        assert_eq!(throttle.counters.get(counters::DENIED_FOR_RATE), 1);
    }

    #[test]
    fn test_new_window_resets_admission() {
        let (throttle, clock, _gauge) = throttle(5, 0);
        assert!(throttle.admit(5, 10).is_admitted());
        assert_eq!(throttle.admit(1, 10), Admission::RateLimited);

        clock.advance(1);
        assert!(throttle.admit(5, 10).is_admitted());
    }

    #[test]
    fn test_batch_larger_than_remaining_is_rejected() {
        let (throttle, _clock, _gauge) = throttle(10, 0);
        assert!(throttle.admit(8, 10).is_admitted());
        assert_eq!(throttle.admit(3, 10), Admission::RateLimited);
        // Rejected requests do not consume budget
        assert!(throttle.admit(2, 10).is_admitted());
    }

    #[test]
    fn test_queue_size_ceiling() {
        let (throttle, _clock, gauge) = throttle(0, 1_000);
        gauge.add(10, 900);
        assert!(throttle.admit(1, 100).is_admitted());
        assert_eq!(throttle.admit(1, 101), Admission::QueueLimited);
        assert_eq!(throttle.counters.get(counters::DENIED_FOR_QUEUE_SIZE), 1);

        gauge.sub(10, 900);
        assert!(throttle.admit(1, 101).is_admitted());
    }

    #[test]
    fn test_huge_requests_are_rejected_without_overflow() {
        let (by_size, _clock, gauge) = throttle(10, 1_000);
        gauge.add(1, 500);
        assert_eq!(by_size.admit(1, u64::MAX), Admission::QueueLimited);

        let (by_rate, _clock, _gauge) = throttle(10, 0);
        assert!(by_rate.admit(5, 1).is_admitted());
        assert_eq!(by_rate.admit(u64::MAX, 1), Admission::RateLimited);
        assert_eq!(by_rate.accepted_in_window(), 5);
    }

    #[test]
    fn test_zero_ceilings_are_unlimited() {
        let (throttle, _clock, gauge) = throttle(0, 0);
        gauge.add(1, u32::MAX as u64);
        for _ in 0..1_000 {
            assert!(throttle.admit(100, 1_000).is_admitted());
        }
    }
}
