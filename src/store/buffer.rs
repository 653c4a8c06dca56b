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

// Buffer store: primary/secondary failover with staged replay
//
// State machine:
//   Streaming      -> primary fails              -> Disconnected
//   Disconnected   -> primary reopens after wait -> SendingBuffer (or Streaming without replay)
//   SendingBuffer  -> secondary drained          -> Streaming
//   SendingBuffer  -> primary fails during drain -> Disconnected
//
// While not Streaming, new traffic goes to the secondary so that staged
// entries reach the primary before anything newer.

use async_trait::async_trait;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use super::backend::Store;
use crate::config::BufferStoreConfig;
use crate::error::{FailureKind, StoreError};
use crate::protocol::LogEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BufferState {
    Streaming,
    Disconnected { since: Instant },
    SendingBuffer,
}

pub struct BufferStore {
    primary: Box<dyn Store>,
    secondary: Box<dyn Store>,
    state: BufferState,
    retry_interval: Duration,
    drain_files_per_check: usize,
    replay_buffer: bool,
    last_error: Option<String>,
}

impl BufferStore {
    pub fn new(
        primary: Box<dyn Store>,
        secondary: Box<dyn Store>,
        config: &BufferStoreConfig,
    ) -> Self {
        Self {
            primary,
            secondary,
            state: BufferState::Streaming,
            retry_interval: config.retry_interval(),
            drain_files_per_check: config.drain_files_per_check.max(1),
            replay_buffer: config.replay_buffer,
            last_error: None,
        }
    }

    pub fn state_name(&self) -> &'static str {
        match self.state {
            BufferState::Streaming => "streaming",
            BufferState::Disconnected { .. } => "disconnected",
            BufferState::SendingBuffer => "sending_buffer",
        }
    }

    fn disconnect(&mut self, reason: &StoreError) {
        if !matches!(self.state, BufferState::Disconnected { .. }) {
            warn!(
                "Primary {} store failed, buffering to secondary: {}",
                self.primary.store_type(),
                reason
            );
        }
        self.last_error = Some(format!("primary unavailable: {}", reason));
        self.state = BufferState::Disconnected {
            since: Instant::now(),
        };
    }

    async fn stage(&mut self, batch: &[LogEntry]) -> Result<(), StoreError> {
        if !self.secondary.is_open() {
            self.secondary.open().await?;
        }
        self.secondary.deliver(batch).await
    }

    /// State to enter once the primary is reachable again
    async fn resume(&mut self) {
        if !self.replay_buffer {
            self.discard_staged().await;
            self.state = BufferState::Streaming;
            return;
        }
        match self.secondary.is_empty().await {
            Ok(true) => self.state = BufferState::Streaming,
            Ok(false) => {
                info!("Primary recovered, replaying buffered messages");
                self.state = BufferState::SendingBuffer;
            }
            Err(e) => {
                warn!("Cannot inspect secondary store, replaying anyway: {}", e);
                self.state = BufferState::SendingBuffer;
            }
        }
    }

    async fn discard_staged(&mut self) {
        let mut dropped = 0usize;
        loop {
            match self.secondary.read_oldest().await {
                Ok(Some(entries)) => {
                    dropped += entries.len();
                    if let Err(e) = self.secondary.delete_oldest().await {
                        warn!("Failed to discard buffered file: {}", e);
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Failed to read buffered file for discard: {}", e);
                    break;
                }
            }
        }
        if dropped > 0 {
            info!("Discarded {} buffered messages (replay disabled)", dropped);
        }
    }

    /// Replay up to `drain_files_per_check` staged chunks into the primary, oldest first
    async fn drain(&mut self) {
        for _ in 0..self.drain_files_per_check {
            let entries = match self.secondary.read_oldest().await {
                Ok(Some(entries)) => entries,
                Ok(None) => {
                    info!("Buffered messages replayed, resuming streaming");
                    self.state = BufferState::Streaming;
                    self.last_error = None;
                    return;
                }
                Err(e) if e.is_fatal() => {
                    error!("Unreadable buffered file dropped: {}", e);
                    if let Err(e) = self.secondary.delete_oldest().await {
                        warn!("Failed to remove unreadable buffered file: {}", e);
                        return;
                    }
                    continue;
                }
                Err(e) => {
                    warn!("Failed to read buffered file, will retry: {}", e);
                    return;
                }
            };

            if !entries.is_empty() {
                match self.primary.deliver(&entries).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == FailureKind::Fatal => {
                        error!(
                            "Primary rejected {} buffered messages, dropping them: {}",
                            entries.len(),
                            e
                        );
                    }
                    Err(e) => {
                        self.disconnect(&e);
                        return;
                    }
                }
            }

            if let Err(e) = self.secondary.delete_oldest().await {
                // Leaving the file would replay it twice
                error!("Failed to remove replayed buffered file: {}", e);
                return;
            }
        }

        if let Ok(true) = self.secondary.is_empty().await {
            info!("Buffered messages replayed, resuming streaming");
            self.state = BufferState::Streaming;
            self.last_error = None;
        }
    }
}

#[async_trait]
impl Store for BufferStore {
    async fn open(&mut self) -> Result<(), StoreError> {
        let secondary = self.secondary.open().await;
        if let Err(e) = &secondary {
            warn!(
                "Secondary {} store failed to open: {}",
                self.secondary.store_type(),
                e
            );
        }

        match self.primary.open().await {
            Ok(()) => {
                if secondary.is_ok() {
                    self.resume().await;
                } else {
                    self.state = BufferState::Streaming;
                }
                Ok(())
            }
            Err(e) => match secondary {
                Ok(()) => {
                    self.disconnect(&e);
                    Ok(())
                }
                Err(secondary_err) => {
                    // Neither leg usable; report the worse of the two
                    if e.is_fatal() && secondary_err.is_fatal() {
                        Err(StoreError::Fatal(format!(
                            "primary: {}; secondary: {}",
                            e, secondary_err
                        )))
                    } else {
                        Err(StoreError::Unavailable(format!(
                            "primary: {}; secondary: {}",
                            e, secondary_err
                        )))
                    }
                }
            },
        }
    }

    fn is_open(&self) -> bool {
        self.primary.is_open() || self.secondary.is_open()
    }

    async fn deliver(&mut self, batch: &[LogEntry]) -> Result<(), StoreError> {
        if self.state == BufferState::Streaming {
            let primary_result = if self.primary.is_open() {
                self.primary.deliver(batch).await
            } else {
                match self.primary.open().await {
                    Ok(()) => self.primary.deliver(batch).await,
                    Err(e) => Err(e),
                }
            };

            let primary_err = match primary_result {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            self.disconnect(&primary_err);

            return match self.stage(batch).await {
                Ok(()) => Ok(()),
                Err(secondary_err) => {
                    let message = format!("primary: {}; secondary: {}", primary_err, secondary_err);
                    if primary_err.is_fatal() && secondary_err.is_fatal() {
                        Err(StoreError::Fatal(message))
                    } else {
                        Err(StoreError::Retryable(message))
                    }
                }
            };
        }

        self.stage(batch).await.map_err(|e| {
            warn!("Secondary store failed while primary is unavailable: {}", e);
            e
        })
    }

    async fn periodic_check(&mut self) {
        if self.primary.is_open() {
            self.primary.periodic_check().await;
        }
        if self.secondary.is_open() {
            self.secondary.periodic_check().await;
        }

        match self.state {
            BufferState::Streaming => {}
            BufferState::Disconnected { since } => {
                if since.elapsed() < self.retry_interval {
                    return;
                }
                if self.primary.is_open() {
                    self.primary.close().await;
                }
                match self.primary.open().await {
                    Ok(()) => self.resume().await,
                    Err(e) => {
                        warn!("Primary store still unavailable: {}", e);
                        self.disconnect(&e);
                    }
                }
                if self.state == BufferState::SendingBuffer {
                    self.drain().await;
                }
            }
            BufferState::SendingBuffer => self.drain().await,
        }
    }

    async fn flush(&mut self) -> Result<(), StoreError> {
        let primary = if self.primary.is_open() {
            self.primary.flush().await
        } else {
            Ok(())
        };
        let secondary = if self.secondary.is_open() {
            self.secondary.flush().await
        } else {
            Ok(())
        };
        primary.and(secondary)
    }

    async fn close(&mut self) {
        self.primary.close().await;
        self.secondary.close().await;
    }

    fn store_type(&self) -> &'static str {
        "buffer"
    }

    fn status(&self) -> Option<String> {
        match self.state {
            BufferState::Disconnected { .. } => self.last_error.clone(),
            _ => self.primary.status().or_else(|| self.secondary.status()),
        }
    }
}
