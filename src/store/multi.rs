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

// Fan-out store: replicates every batch to all children

use async_trait::async_trait;
use fnv::{FnvHashSet, FnvHasher};
use std::hash::Hasher;
use tracing::{debug, warn};

use super::backend::Store;
use crate::config::ReportSuccess;
use crate::error::{ChildFailure, StoreError};
use crate::protocol::LogEntry;

/// Remembers which children already accepted a batch that failed elsewhere,
/// so that a retry of the same batch only goes to the children that failed.
#[derive(Debug, Default)]
pub(crate) struct RetryMask {
    pending: Option<(u64, FnvHashSet<usize>)>,
}

impl RetryMask {
    /// Children to skip for `batch`; clears state left by a different batch
    pub(crate) fn take_completed(&mut self, batch: &[LogEntry]) -> FnvHashSet<usize> {
        match self.pending.take() {
            Some((fingerprint, done)) if fingerprint == fingerprint_of(batch) => done,
            _ => FnvHashSet::default(),
        }
    }

    pub(crate) fn remember(&mut self, batch: &[LogEntry], completed: FnvHashSet<usize>) {
        if completed.is_empty() {
            self.pending = None;
        } else {
            self.pending = Some((fingerprint_of(batch), completed));
        }
    }

    pub(crate) fn clear(&mut self) {
        self.pending = None;
    }
}

fn fingerprint_of(batch: &[LogEntry]) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write_usize(batch.len());
    for entry in batch {
        hasher.write(entry.category.as_bytes());
        hasher.write_u8(0);
        hasher.write(&entry.message);
        hasher.write_u8(0xff);
    }
    hasher.finish()
}

pub struct MultiStore {
    children: Vec<Box<dyn Store>>,
    report_success: ReportSuccess,
    retry: RetryMask,
}

impl MultiStore {
    pub fn new(children: Vec<Box<dyn Store>>, report_success: ReportSuccess) -> Self {
        Self {
            children,
            report_success,
            retry: RetryMask::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }
}

#[async_trait]
impl Store for MultiStore {
    async fn open(&mut self) -> Result<(), StoreError> {
        let total = self.children.len();
        let mut failures = Vec::new();
        for (index, child) in self.children.iter_mut().enumerate() {
            if let Err(error) = child.open().await {
                warn!("Fan-out child #{} ({}) failed to open: {}", index, child.store_type(), error);
                failures.push(ChildFailure {
                    index,
                    store_type: child.store_type(),
                    error,
                });
            }
        }

        let any_fatal = failures.iter().any(|f| f.error.is_fatal());
        if failures.is_empty() {
            Ok(())
        } else if failures.len() == total || any_fatal {
            Err(StoreError::Partial { failures, total })
        } else {
            // Closed children are reopened lazily on delivery
            Ok(())
        }
    }

    fn is_open(&self) -> bool {
        self.children.iter().any(|c| c.is_open())
    }

    async fn deliver(&mut self, batch: &[LogEntry]) -> Result<(), StoreError> {
        let total = self.children.len();
        let mut completed = self.retry.take_completed(batch);
        let mut failures = Vec::new();

        for (index, child) in self.children.iter_mut().enumerate() {
            if completed.contains(&index) {
                continue;
            }
            let result = if child.is_open() {
                child.deliver(batch).await
            } else {
                match child.open().await {
                    Ok(()) => child.deliver(batch).await,
                    Err(e) => Err(e),
                }
            };
            match result {
                Ok(()) => {
                    completed.insert(index);
                }
                Err(error) => failures.push(ChildFailure {
                    index,
                    store_type: child.store_type(),
                    error,
                }),
            }
        }

        if failures.is_empty() {
            self.retry.clear();
            return Ok(());
        }

        if self.report_success == ReportSuccess::Any && failures.len() < total {
            debug!(
                "{} of {} fan-out children failed, reporting success",
                failures.len(),
                total
            );
            self.retry.clear();
            return Ok(());
        }

        let error = StoreError::Partial { failures, total };
        if error.is_fatal() {
            self.retry.clear();
        } else {
            self.retry.remember(batch, completed);
        }
        Err(error)
    }

    async fn periodic_check(&mut self) {
        for child in self.children.iter_mut() {
            if child.is_open() {
                child.periodic_check().await;
            }
        }
    }

    async fn flush(&mut self) -> Result<(), StoreError> {
        let total = self.children.len();
        let mut failures = Vec::new();
        for (index, child) in self.children.iter_mut().enumerate() {
            if !child.is_open() {
                continue;
            }
            if let Err(error) = child.flush().await {
                failures.push(ChildFailure {
                    index,
                    store_type: child.store_type(),
                    error,
                });
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(StoreError::Partial { failures, total })
        }
    }

    async fn close(&mut self) {
        for child in self.children.iter_mut() {
            child.close().await;
        }
        self.retry.clear();
    }

    fn store_type(&self) -> &'static str {
        "multi"
    }

    fn status(&self) -> Option<String> {
        let problems: Vec<String> = self
            .children
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.status().map(|s| format!("#{} {}", i, s)))
            .collect();
        if problems.is_empty() {
            None
        } else {
            Some(problems.join("; "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(category: &str, message: &str) -> LogEntry {
        LogEntry::new(category, message.as_bytes().to_vec())
    }

    #[test]
    fn test_retry_mask_matches_same_batch_only() {
        let batch = vec![entry("a", "one"), entry("a", "two")];
        let other = vec![entry("a", "one"), entry("a", "three")];

        let mut mask = RetryMask::default();
        let done: FnvHashSet<usize> = [0, 2].into_iter().collect();
        mask.remember(&batch, done.clone());
        assert_eq!(mask.take_completed(&batch), done);

        mask.remember(&batch, done);
        assert!(mask.take_completed(&other).is_empty());
        // A mismatch forgets the stale entry
        assert!(mask.take_completed(&batch).is_empty());
    }
}
