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

// Forward store: relays batches to a downstream aggregator

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::backend::Store;
use crate::config::ForwardStoreConfig;
use crate::error::StoreError;
use crate::protocol::{LogEntry, LogRequest, LogResponse, ResultCode, WireEntry};

/// Sends batches to another aggregator's `/log` endpoint.
///
/// Transport failures and `TRY_LATER` replies are retryable; an explicit
/// `ERROR` reply or a 4xx status means the peer will never accept the batch.
pub struct ForwardStore {
    base_url: String,
    timeout: Duration,
    client: Option<Client>,
    last_error: Option<String>,
}

impl ForwardStore {
    pub fn new(config: ForwardStoreConfig) -> Self {
        Self {
            base_url: config.base_url(),
            timeout: config.timeout(),
            client: None,
            last_error: None,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn build_client(&self) -> Result<Client, StoreError> {
        reqwest::ClientBuilder::new()
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .connect_timeout(self.timeout)
            .timeout(self.timeout)
            .build()
            .map_err(|e| StoreError::Fatal(format!("failed to build HTTP client: {}", e)))
    }

    fn classify_status(status: StatusCode, body: &str) -> StoreError {
        let message = format!("downstream replied {}: {}", status, body);
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            StoreError::Retryable(message)
        } else {
            StoreError::Fatal(message)
        }
    }

    async fn send(&self, client: &Client, batch: &[LogEntry]) -> Result<(), StoreError> {
        let request = LogRequest {
            messages: batch.iter().map(WireEntry::from).collect(),
        };
        let url = format!("{}/log", self.base_url);

        let response = client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| StoreError::Retryable(format!("send to {}: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify_status(status, &body));
        }

        let reply: LogResponse = response
            .json()
            .await
            .map_err(|e| StoreError::Fatal(format!("unreadable reply from {}: {}", url, e)))?;

        match reply.result {
            ResultCode::Ok => Ok(()),
            ResultCode::TryLater => Err(StoreError::Retryable(format!(
                "{} asked to try later",
                self.base_url
            ))),
            ResultCode::Error => Err(StoreError::Fatal(format!(
                "{} rejected the batch",
                self.base_url
            ))),
        }
    }
}

#[async_trait]
impl Store for ForwardStore {
    async fn open(&mut self) -> Result<(), StoreError> {
        if self.client.is_some() {
            return Ok(());
        }

        let client = self.build_client()?;
        let url = format!("{}/status", self.base_url);
        match client.get(&url).send().await {
            Ok(response) if response.status().is_success() => {
                info!("Connected to downstream aggregator {}", self.base_url);
                self.client = Some(client);
                self.last_error = None;
                Ok(())
            }
            Ok(response) => {
                let message = format!("{} status probe returned {}", self.base_url, response.status());
                self.last_error = Some(message.clone());
                Err(StoreError::Unavailable(message))
            }
            Err(e) => {
                let message = format!("cannot reach {}: {}", self.base_url, e);
                self.last_error = Some(message.clone());
                Err(StoreError::Unavailable(message))
            }
        }
    }

    fn is_open(&self) -> bool {
        self.client.is_some()
    }

    async fn deliver(&mut self, batch: &[LogEntry]) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        self.open().await?;
        let Some(client) = self.client.clone() else {
            return Err(StoreError::Unavailable(self.base_url.clone()));
        };

        match self.send(&client, batch).await {
            Ok(()) => {
                debug!("Forwarded {} messages to {}", batch.len(), self.base_url);
                self.last_error = None;
                Ok(())
            }
            Err(e) => {
                warn!("Forwarding to {} failed: {}", self.base_url, e);
                self.last_error = Some(e.to_string());
                if !e.is_fatal() {
                    // Reconnect and re-probe before the next attempt
                    self.client = None;
                }
                Err(e)
            }
        }
    }

    async fn close(&mut self) {
        self.client = None;
    }

    fn store_type(&self) -> &'static str {
        "forward"
    }

    fn status(&self) -> Option<String> {
        self.last_error.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(!ForwardStore::classify_status(StatusCode::SERVICE_UNAVAILABLE, "").is_fatal());
        assert!(!ForwardStore::classify_status(StatusCode::TOO_MANY_REQUESTS, "").is_fatal());
        assert!(ForwardStore::classify_status(StatusCode::BAD_REQUEST, "").is_fatal());
        assert!(ForwardStore::classify_status(StatusCode::NOT_FOUND, "").is_fatal());
    }

    #[tokio::test]
    async fn test_open_unreachable_is_unavailable() {
        // Port 1 on loopback is reserved and refuses connections
        let mut store = ForwardStore::new(ForwardStoreConfig {
            remote_host: "127.0.0.1".to_string(),
            remote_port: 1,
            timeout_ms: 500,
        });

        let err = store.open().await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert!(!store.is_open());
        assert!(store.status().is_some());
    }
}
