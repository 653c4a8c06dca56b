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

// Shared helpers for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use log_aggregator::error::{FailureKind, StoreError};
use log_aggregator::protocol::LogEntry;
use log_aggregator::store::Store;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Default)]
struct MockState {
    delivered: Vec<LogEntry>,
    batch_sizes: Vec<usize>,
    deliver_calls: usize,
    opens: usize,
    closes: usize,
    checks: usize,
    fail_deliver: Option<FailureKind>,
    fail_open: Option<FailureKind>,
    delay: Option<Duration>,
}

/// Handle to a [`MockStore`]'s recorded calls and failure switches.
///
/// Clones share state, so a test keeps one after moving the store into a queue.
#[derive(Clone, Default)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self) -> MockStore {
        MockStore {
            handle: self.clone(),
            open: false,
        }
    }

    pub fn boxed(&self) -> Box<dyn Store> {
        Box::new(self.store())
    }

    pub fn fail_deliveries(&self, kind: Option<FailureKind>) {
        self.state.lock().fail_deliver = kind;
    }

    pub fn fail_opens(&self, kind: Option<FailureKind>) {
        self.state.lock().fail_open = kind;
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        self.state.lock().delay = delay;
    }

    /// Delivered payloads as strings, in delivery order
    pub fn messages(&self) -> Vec<String> {
        self.state
            .lock()
            .delivered
            .iter()
            .map(|e| String::from_utf8_lossy(&e.message).into_owned())
            .collect()
    }

    pub fn delivered(&self) -> Vec<LogEntry> {
        self.state.lock().delivered.clone()
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.state.lock().batch_sizes.clone()
    }

    pub fn deliver_calls(&self) -> usize {
        self.state.lock().deliver_calls
    }

    pub fn opens(&self) -> usize {
        self.state.lock().opens
    }

    pub fn closes(&self) -> usize {
        self.state.lock().closes
    }

    pub fn checks(&self) -> usize {
        self.state.lock().checks
    }
}

fn failure(kind: FailureKind, what: &str) -> StoreError {
    match kind {
        FailureKind::Retryable => StoreError::Retryable(format!("scripted {} failure", what)),
        FailureKind::Fatal => StoreError::Fatal(format!("scripted {} failure", what)),
    }
}

/// Store whose behavior is scripted through a [`MockHandle`]
pub struct MockStore {
    handle: MockHandle,
    open: bool,
}

#[async_trait]
impl Store for MockStore {
    async fn open(&mut self) -> Result<(), StoreError> {
        let fail = {
            let mut state = self.handle.state.lock();
            state.opens += 1;
            state.fail_open
        };
        match fail {
            Some(FailureKind::Retryable) => Err(StoreError::Unavailable("scripted open failure".to_string())),
            Some(FailureKind::Fatal) => Err(failure(FailureKind::Fatal, "open")),
            None => {
                self.open = true;
                Ok(())
            }
        }
    }

    fn is_open(&self) -> bool {
        self.open
    }

    async fn deliver(&mut self, batch: &[LogEntry]) -> Result<(), StoreError> {
        let delay = self.handle.state.lock().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.handle.state.lock();
        state.deliver_calls += 1;
        if let Some(kind) = state.fail_deliver {
            return Err(failure(kind, "delivery"));
        }
        state.delivered.extend_from_slice(batch);
        state.batch_sizes.push(batch.len());
        Ok(())
    }

    async fn periodic_check(&mut self) {
        self.handle.state.lock().checks += 1;
    }

    async fn close(&mut self) {
        self.handle.state.lock().closes += 1;
        self.open = false;
    }

    fn store_type(&self) -> &'static str {
        "mock"
    }

    fn status(&self) -> Option<String> {
        self.handle
            .state
            .lock()
            .fail_deliver
            .map(|kind| format!("mock store failing ({:?})", kind))
    }
}

pub fn entries(category: &str, payloads: &[&str]) -> Vec<LogEntry> {
    payloads
        .iter()
        .map(|p| LogEntry::new(category, p.as_bytes().to_vec()))
        .collect()
}

/// Poll `condition` until it holds or `timeout` passes
pub async fn wait_for<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
