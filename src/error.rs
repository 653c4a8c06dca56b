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

//! Error types for stores, queues and configuration.

use thiserror::Error;

/// How a delivery failure should be treated by the owning queue.
///
/// Ordered so that the worst outcome of several sub-results is the maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FailureKind {
    /// Destination temporarily unavailable; retry with backoff
    Retryable,
    /// Misconfiguration or permanent rejection; drop the batch
    Fatal,
}

/// One failed child of a composite store
#[derive(Debug)]
pub struct ChildFailure {
    pub index: usize,
    pub store_type: &'static str,
    pub error: StoreError,
}

/// Errors returned by [`crate::store::Store`] implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The destination could not be reached or created during open
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("retryable delivery failure: {0}")]
    Retryable(String),

    #[error("fatal delivery failure: {0}")]
    Fatal(String),

    /// Some children of a fan-out or bucket store failed
    #[error("{} of {total} child stores failed ({})", .failures.len(), describe_children(.failures))]
    Partial {
        failures: Vec<ChildFailure>,
        total: usize,
    },
}

fn describe_children(failures: &[ChildFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("#{} {}: {}", f.index, f.store_type, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

impl StoreError {
    pub fn kind(&self) -> FailureKind {
        match self {
            StoreError::Unavailable(_) | StoreError::Retryable(_) => FailureKind::Retryable,
            StoreError::Fatal(_) => FailureKind::Fatal,
            StoreError::Partial { failures, .. } => failures
                .iter()
                .map(|f| f.error.kind())
                .max()
                .unwrap_or(FailureKind::Retryable),
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind() == FailureKind::Fatal
    }

    /// Indices of failed children, empty for leaf failures
    pub fn failed_children(&self) -> Vec<usize> {
        match self {
            StoreError::Partial { failures, .. } => failures.iter().map(|f| f.index).collect(),
            _ => Vec::new(),
        }
    }

    /// Classify a filesystem error: permission and naming problems will not go away on retry.
    pub fn from_io(context: &str, err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        let message = format!("{}: {}", context, err);
        match err.kind() {
            ErrorKind::PermissionDenied | ErrorKind::InvalidInput | ErrorKind::Unsupported => {
                StoreError::Fatal(message)
            }
            _ => StoreError::Retryable(message),
        }
    }
}

/// Synchronous enqueue failures, surfaced to the ingestion caller as `TRY_LATER`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue for category '{category}' is full ({capacity} entries)")]
    Full { category: String, capacity: usize },

    #[error("queue for category '{category}' is stopped")]
    Stopped { category: String },
}

/// Reconfiguration failures. The previously active table stays authoritative.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("store for category '{category}' failed to start: {source}")]
    StoreStart {
        category: String,
        #[source]
        source: StoreError,
    },

    #[error("a reconfiguration is already in progress")]
    Busy,
}

impl ConfigError {
    pub fn invalid(message: impl Into<String>) -> Self {
        ConfigError::Invalid(message.into())
    }
}
