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

use async_trait::async_trait;
use tracing::{debug, trace};

use super::backend::Store;
use crate::error::StoreError;
use crate::protocol::LogEntry;

/// Accepts and drops everything; used to disable a category
#[derive(Debug, Default)]
pub struct NullStore {
    opened: bool,
    discarded: u64,
}

impl NullStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn discarded(&self) -> u64 {
        self.discarded
    }
}

#[async_trait]
impl Store for NullStore {
    async fn open(&mut self) -> Result<(), StoreError> {
        self.opened = true;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.opened
    }

    async fn deliver(&mut self, batch: &[LogEntry]) -> Result<(), StoreError> {
        self.discarded += batch.len() as u64;
        trace!("Discarded {} messages", batch.len());
        Ok(())
    }

    async fn close(&mut self) {
        if self.opened {
            debug!("Null store closed after discarding {} messages", self.discarded);
        }
        self.opened = false;
    }

    fn store_type(&self) -> &'static str {
        "null"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counts_discarded_messages() {
        let mut store = NullStore::new();
        store.open().await.unwrap();
        let batch = vec![LogEntry::new("a", "x"), LogEntry::new("a", "y")];
        store.deliver(&batch).await.unwrap();
        store.deliver(&batch[..1]).await.unwrap();
        assert_eq!(store.discarded(), 3);
        store.close().await;
        assert!(!store.is_open());
    }
}
