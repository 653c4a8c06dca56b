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

// Store trait shared by every delivery unit

use async_trait::async_trait;

use crate::error::StoreError;
use crate::protocol::LogEntry;

/// A composable delivery unit.
///
/// A store is driven by exactly one [`crate::store_queue::StoreQueue`] worker,
/// so methods take `&mut self` and never run concurrently on one instance.
/// Composite stores (buffer, multi, bucket) own their children outright.
///
/// Failures are classified by [`StoreError::kind`]: retryable failures are
/// retried by the queue with backoff, fatal ones drop the batch.
#[async_trait]
pub trait Store: Send {
    /// Allocate resources. Calling it on an open store is a no-op.
    async fn open(&mut self) -> Result<(), StoreError>;

    fn is_open(&self) -> bool;

    /// Persist or transmit a batch.
    ///
    /// After a retryable failure the same batch may be passed again; the store
    /// must not keep partial state that would duplicate part of it.
    async fn deliver(&mut self, batch: &[LogEntry]) -> Result<(), StoreError>;

    /// Called on a fixed interval regardless of traffic
    async fn periodic_check(&mut self) {}

    async fn flush(&mut self) -> Result<(), StoreError> {
        Ok(())
    }

    /// Release resources. Safe after a failed or partial open.
    async fn close(&mut self);

    fn store_type(&self) -> &'static str;

    /// Health problem to surface through the status interface, if any
    fn status(&self) -> Option<String> {
        None
    }

    /// Whether this store can act as a buffer store's staging area
    fn supports_staging(&self) -> bool {
        false
    }

    /// Read the oldest staged chunk without removing it
    async fn read_oldest(&mut self) -> Result<Option<Vec<LogEntry>>, StoreError> {
        Err(StoreError::Fatal(format!(
            "{} store does not support staging",
            self.store_type()
        )))
    }

    /// Remove the chunk last returned by `read_oldest`
    async fn delete_oldest(&mut self) -> Result<(), StoreError> {
        Err(StoreError::Fatal(format!(
            "{} store does not support staging",
            self.store_type()
        )))
    }

    /// True when nothing is staged
    async fn is_empty(&mut self) -> Result<bool, StoreError> {
        Ok(true)
    }
}
