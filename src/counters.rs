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

// Process-wide counters and the periodic publisher that exports them

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const RECEIVED_GOOD: &str = "received good";
pub const RECEIVED_BAD: &str = "received bad";
pub const RECEIVED_BLANK_CATEGORY: &str = "received blank category";
pub const DENIED_FOR_RATE: &str = "denied for rate";
pub const DENIED_FOR_QUEUE_SIZE: &str = "denied for queue size";
pub const DENIED_FOR_QUEUE_FULL: &str = "denied for queue full";
pub const DENIED_NOT_ALIVE: &str = "denied not alive";
pub const NO_ROUTE: &str = "no route for category";
pub const CATEGORY_CREATE_FAILED: &str = "failed to create category";
pub const SENT: &str = "sent";
pub const RETRIES: &str = "retries";
pub const LOST: &str = "lost";
pub const RECONFIG_FAILED: &str = "reconfiguration failed";

/// Thread-safe counter map keyed by `name` or `category:name`
#[derive(Debug, Default)]
pub struct Counters {
    values: DashMap<String, i64>,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self, name: &str, amount: i64) {
        *self.values.entry(name.to_string()).or_insert(0) += amount;
    }

    pub fn inc_category(&self, category: &str, name: &str, amount: i64) {
        self.inc(&format!("{}:{}", category, name), amount);
    }

    pub fn get(&self, name: &str) -> i64 {
        self.values.get(name).map(|v| *v).unwrap_or(0)
    }

    pub fn get_category(&self, category: &str, name: &str) -> i64 {
        self.get(&format!("{}:{}", category, name))
    }

    /// Point-in-time copy, sorted by name
    pub fn snapshot(&self) -> BTreeMap<String, i64> {
        self.values
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }
}

/// Receiver of periodic counter snapshots
#[async_trait]
pub trait CounterSink: Send + Sync {
    async fn publish(&self, snapshot: &BTreeMap<String, i64>) -> Result<()>;

    fn sink_type(&self) -> &str;
}

/// Writes snapshots to the tracing log
pub struct LogCounterSink;

#[async_trait]
impl CounterSink for LogCounterSink {
    async fn publish(&self, snapshot: &BTreeMap<String, i64>) -> Result<()> {
        for (name, value) in snapshot {
            info!(counter = %name, value, "counter");
        }
        Ok(())
    }

    fn sink_type(&self) -> &str {
        "log"
    }
}

#[derive(Serialize)]
struct CountersPayload<'a> {
    instance_id: &'a str,
    timestamp: String,
    counters: &'a BTreeMap<String, i64>,
}

/// POSTs snapshots to an external aggregation endpoint
pub struct HttpCounterSink {
    client: reqwest::Client,
    url: String,
    instance_id: String,
}

impl HttpCounterSink {
    pub fn new(url: String) -> Result<Self> {
        let client = reqwest::ClientBuilder::new()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            url,
            instance_id: uuid::Uuid::new_v4().to_string(),
        })
    }
}

#[async_trait]
impl CounterSink for HttpCounterSink {
    async fn publish(&self, snapshot: &BTreeMap<String, i64>) -> Result<()> {
        let payload = CountersPayload {
            instance_id: &self.instance_id,
            timestamp: chrono::Utc::now().to_rfc3339(),
            counters: snapshot,
        };

        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .context("Failed to send counters")?;

        if !response.status().is_success() {
            bail!("Counters endpoint returned {}", response.status());
        }
        Ok(())
    }

    fn sink_type(&self) -> &str {
        "http"
    }
}

/// Periodically hands a counters snapshot to a [`CounterSink`]
pub struct CountersPublisher {
    counters: Arc<Counters>,
    sink: Arc<dyn CounterSink>,
    interval: Duration,
}

impl CountersPublisher {
    pub fn new(counters: Arc<Counters>, sink: Arc<dyn CounterSink>, interval: Duration) -> Self {
        Self {
            counters,
            sink,
            interval,
        }
    }

    /// Run until `shutdown` flips to true, then publish one final snapshot
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "Publishing counters to {} sink every {:?}",
                self.sink.sink_type(),
                self.interval
            );
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => self.publish_once().await,
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            self.publish_once().await;
                            debug!("Counters publisher stopped");
                            return;
                        }
                    }
                }
            }
        })
    }

    pub async fn publish_once(&self) {
        let snapshot = self.counters.snapshot();
        if let Err(e) = self.sink.publish(&snapshot).await {
            warn!("Failed to publish counters: {:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct CapturingSink {
        published: Mutex<Vec<BTreeMap<String, i64>>>,
    }

    #[async_trait]
    impl CounterSink for CapturingSink {
        async fn publish(&self, snapshot: &BTreeMap<String, i64>) -> Result<()> {
            self.published.lock().push(snapshot.clone());
            Ok(())
        }

        fn sink_type(&self) -> &str {
            "capture"
        }
    }

    #[test]
    fn test_category_counters() {
        let counters = Counters::new();
        counters.inc_category("web", RECEIVED_GOOD, 3);
        counters.inc_category("web", RECEIVED_GOOD, 2);
        counters.inc(DENIED_FOR_RATE, 1);

        assert_eq!(counters.get_category("web", RECEIVED_GOOD), 5);
        assert_eq!(counters.get(DENIED_FOR_RATE), 1);
        assert_eq!(counters.get("missing"), 0);

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.get("web:received good"), Some(&5));
    }

    #[tokio::test]
    async fn test_publisher_flushes_on_shutdown() {
        let counters = Arc::new(Counters::new());
        counters.inc(SENT, 7);
        let sink = Arc::new(CapturingSink {
            published: Mutex::new(Vec::new()),
        });

        let (tx, rx) = watch::channel(false);
        let handle = CountersPublisher::new(counters, sink.clone(), Duration::from_secs(3600))
            .spawn(rx);

        tx.send(true).unwrap();
        handle.await.unwrap();

        let published = sink.published.lock();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].get(SENT), Some(&7));
    }
}
