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

// Bucket store: shards entries across children by a stable hash

use async_trait::async_trait;
use fnv::FnvHasher;
use std::hash::Hasher;
use tracing::{debug, warn};

use super::backend::Store;
use super::multi::RetryMask;
use crate::config::BucketType;
use crate::error::{ChildFailure, StoreError};
use crate::protocol::LogEntry;

/// Sends each entry to one child chosen from its key.
///
/// FNV-1a is used for hashing because its output depends only on the input
/// bytes, so a key maps to the same bucket across restarts. Entries without a
/// usable key go to bucket 0.
pub struct BucketStore {
    bucket_type: BucketType,
    delimiter: Vec<u8>,
    remove_key: bool,
    children: Vec<Box<dyn Store>>,
    retry: RetryMask,
}

impl BucketStore {
    pub fn new(
        bucket_type: BucketType,
        delimiter: &str,
        remove_key: bool,
        children: Vec<Box<dyn Store>>,
    ) -> Self {
        Self {
            bucket_type,
            delimiter: delimiter.as_bytes().to_vec(),
            remove_key,
            children,
            retry: RetryMask::default(),
        }
    }

    pub fn num_buckets(&self) -> usize {
        self.children.len()
    }

    /// Split a payload into key and remainder at the first delimiter
    fn split_key<'a>(&self, message: &'a [u8]) -> Option<(&'a [u8], usize)> {
        if self.delimiter.is_empty() || message.len() < self.delimiter.len() {
            return None;
        }
        message
            .windows(self.delimiter.len())
            .position(|w| w == self.delimiter.as_slice())
            .map(|pos| (&message[..pos], pos + self.delimiter.len()))
    }

    /// Bucket index for an entry and the entry as it should be delivered.
    ///
    /// Keyed entries spread over all N buckets, 0 included, and unkeyed
    /// entries join bucket 0. No bucket is held back for unkeyed traffic, so
    /// a configuration with N children uses all N for sharding.
    pub fn assign(&self, entry: &LogEntry) -> (usize, LogEntry) {
        let n = self.children.len().max(1);
        match self.bucket_type {
            BucketType::Category => (stable_hash(entry.category.as_bytes()) as usize % n, entry.clone()),
            BucketType::KeyHash | BucketType::KeyModulo => {
                let Some((key, body_start)) = self.split_key(&entry.message) else {
                    return (0, entry.clone());
                };
                let index = match self.bucket_type {
                    BucketType::KeyModulo => match std::str::from_utf8(key)
                        .ok()
                        .and_then(|k| k.trim().parse::<u64>().ok())
                    {
                        Some(value) => (value % n as u64) as usize,
                        None => return (0, entry.clone()),
                    },
                    _ => stable_hash(key) as usize % n,
                };
                let delivered = if self.remove_key {
                    LogEntry::new(entry.category.clone(), entry.message.slice(body_start..))
                } else {
                    entry.clone()
                };
                (index, delivered)
            }
        }
    }
}

fn stable_hash(bytes: &[u8]) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(bytes);
    hasher.finish()
}

#[async_trait]
impl Store for BucketStore {
    async fn open(&mut self) -> Result<(), StoreError> {
        let total = self.children.len();
        let mut failures = Vec::new();
        for (index, child) in self.children.iter_mut().enumerate() {
            if let Err(error) = child.open().await {
                warn!("Bucket {} ({}) failed to open: {}", index, child.store_type(), error);
                failures.push(ChildFailure {
                    index,
                    store_type: child.store_type(),
                    error,
                });
            }
        }

        if failures.is_empty() {
            Ok(())
        } else if failures.len() == total || failures.iter().any(|f| f.error.is_fatal()) {
            Err(StoreError::Partial { failures, total })
        } else {
            Ok(())
        }
    }

    fn is_open(&self) -> bool {
        self.children.iter().any(|c| c.is_open())
    }

    async fn deliver(&mut self, batch: &[LogEntry]) -> Result<(), StoreError> {
        let total = self.children.len();
        let mut partitions: Vec<Vec<LogEntry>> = vec![Vec::new(); total];
        for entry in batch {
            let (index, delivered) = self.assign(entry);
            partitions[index].push(delivered);
        }

        let mut completed = self.retry.take_completed(batch);
        let mut failures = Vec::new();
        for (index, (child, part)) in self.children.iter_mut().zip(partitions.iter()).enumerate() {
            if part.is_empty() || completed.contains(&index) {
                continue;
            }
            let result = if child.is_open() {
                child.deliver(part).await
            } else {
                match child.open().await {
                    Ok(()) => child.deliver(part).await,
                    Err(e) => Err(e),
                }
            };
            match result {
                Ok(()) => {
                    debug!("Bucket {} accepted {} messages", index, part.len());
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
        "bucket"
    }

    fn status(&self) -> Option<String> {
        let problems: Vec<String> = self
            .children
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.status().map(|s| format!("bucket {} {}", i, s)))
            .collect();
        if problems.is_empty() {
            None
        } else {
            Some(problems.join("; "))
        }
    }
}
