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

// Log handler: the facade the transport and the signal handlers talk to

use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::{self, AggregatorConfig};
use crate::counters::{self, Counters};
use crate::error::{ConfigError, QueueError};
use crate::protocol::{LogEntry, ResultCode, ServiceStatus, VERSION};
use crate::reconfig::{ReconfigController, ReconfigPhase, ReconfigReport};
use crate::router::{CategoryTable, Pipeline, QueueList, Route, Router};
use crate::store_queue::QueueContext;
use crate::throttle::{Clock, SystemClock, Throttle};

/// What happened to one entry on the ingestion path
enum Dispatch {
    Queued,
    /// Dropped on purpose (no route, category could not be created)
    Dropped,
    /// Caller should retry later
    Rejected,
}

/// Operator-facing status text and who wrote it
#[derive(Default)]
struct Details {
    text: String,
    /// Written by a failed reconfiguration, cleared by the next successful one
    from_reconfig: bool,
}

pub struct LogHandler {
    config_path: Option<PathBuf>,
    router: Arc<Router>,
    reconfig: ReconfigController,
    throttle: Throttle,
    counters: Arc<Counters>,
    status: RwLock<ServiceStatus>,
    details: Mutex<Details>,
    config: RwLock<Option<AggregatorConfig>>,
}

impl LogHandler {
    pub fn new(config_path: Option<PathBuf>) -> Self {
        Self::with_clock(config_path, Arc::new(SystemClock))
    }

    /// Handler whose throttle window follows `clock`
    pub fn with_clock(config_path: Option<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        let ctx = QueueContext::new(Duration::from_millis(5_000));
        let counters = ctx.counters.clone();
        let throttle = Throttle::new(0, 0, ctx.gauge.clone(), counters.clone(), clock);
        let router = Arc::new(Router::new(ctx));

        Self {
            config_path,
            reconfig: ReconfigController::new(router.clone()),
            router,
            throttle,
            counters,
            status: RwLock::new(ServiceStatus::Starting),
            details: Mutex::new(Details::default()),
            config: RwLock::new(None),
        }
    }

    /// Build the first routing table and start accepting traffic
    pub async fn initialize(&self, config: AggregatorConfig) -> Result<ReconfigReport, ConfigError> {
        self.set_status(ServiceStatus::Starting);
        match self.reconfigure(config).await {
            Ok(report) => {
                self.set_status(ServiceStatus::Alive);
                info!("Log handler initialized, version {}", VERSION);
                Ok(report)
            }
            Err(e) => {
                error!("Initial configuration failed: {}", e);
                Err(e)
            }
        }
    }

    /// Re-read the configuration file and apply it
    pub async fn reinitialize(&self) -> Result<ReconfigReport, ConfigError> {
        let path = self
            .config_path
            .clone()
            .ok_or_else(|| ConfigError::invalid("no configuration file to reload"))?;
        info!("Reloading configuration from {}", path.display());

        let loaded = config::load_config_with_env(&path)
            .map_err(|e| ConfigError::invalid(format!("{:#}", e)));
        match loaded {
            Ok(config) => self.reconfigure(config).await,
            Err(e) => {
                self.record_reconfig_failure(&e);
                Err(e)
            }
        }
    }

    /// Apply `config`; on failure the current table stays live
    pub async fn reconfigure(&self, config: AggregatorConfig) -> Result<ReconfigReport, ConfigError> {
        match self.reconfig.apply(&config).await {
            Ok(report) => {
                self.throttle.set_limits(
                    config.aggregator.max_msg_per_second,
                    config.aggregator.max_queue_size,
                );
                *self.config.write() = Some(config);
                {
                    let mut details = self.details.lock();
                    if details.from_reconfig {
                        *details = Details::default();
                    }
                }
                let mut status = self.status.write();
                if *status == ServiceStatus::Warning {
                    *status = ServiceStatus::Alive;
                }
                Ok(report)
            }
            Err(e) => {
                self.record_reconfig_failure(&e);
                Err(e)
            }
        }
    }

    fn record_reconfig_failure(&self, e: &ConfigError) {
        warn!("Reconfiguration failed, keeping current configuration: {}", e);
        self.counters.inc(counters::RECONFIG_FAILED, 1);
        *self.details.lock() = Details {
            text: format!("reconfiguration failed: {}", e),
            from_reconfig: true,
        };
        let mut status = self.status.write();
        if *status == ServiceStatus::Alive {
            *status = ServiceStatus::Warning;
        }
    }

    /// Ingest an ordered batch of entries
    pub async fn log(&self, entries: Vec<LogEntry>) -> ResultCode {
        if !self.status.read().accepts_traffic() {
            self.counters
                .inc(counters::DENIED_NOT_ALIVE, entries.len() as i64);
            return ResultCode::TryLater;
        }
        if entries.is_empty() {
            return ResultCode::Ok;
        }

        let blank = entries.iter().filter(|e| e.category.is_empty()).count();
        if blank > 0 {
            self.counters
                .inc(counters::RECEIVED_BLANK_CATEGORY, blank as i64);
            self.counters
                .inc(counters::RECEIVED_BAD, entries.len() as i64);
            return ResultCode::Error;
        }

        let bytes: u64 = entries.iter().map(|e| e.size() as u64).sum();
        if !self
            .throttle
            .admit(entries.len() as u64, bytes)
            .is_admitted()
        {
            return ResultCode::TryLater;
        }

        let table = self.router.snapshot();
        for entry in entries {
            let category = entry.category.clone();
            match self.dispatch(&table, entry).await {
                Dispatch::Queued => {
                    self.counters
                        .inc_category(&category, counters::RECEIVED_GOOD, 1);
                }
                Dispatch::Dropped => {}
                Dispatch::Rejected => return ResultCode::TryLater,
            }
        }
        ResultCode::Ok
    }

    async fn dispatch(&self, table: &Arc<CategoryTable>, entry: LogEntry) -> Dispatch {
        let mut table = table.clone();
        // A second pass covers a table swapped in while this request was running
        for _ in 0..2 {
            let queues = match self.resolve(&table, &entry.category).await {
                Ok(Some(queues)) => queues,
                Ok(None) => {
                    table = self.router.snapshot();
                    continue;
                }
                Err(outcome) => return outcome,
            };

            let mut stale = false;
            for queue in queues.iter() {
                match queue.enqueue(entry.clone()) {
                    Ok(()) => {}
                    Err(QueueError::Full { category, capacity }) => {
                        debug!("Queue for '{}' is full ({} entries)", category, capacity);
                        self.counters
                            .inc_category(&entry.category, counters::DENIED_FOR_QUEUE_FULL, 1);
                        return Dispatch::Rejected;
                    }
                    Err(QueueError::Stopped { .. }) => {
                        stale = true;
                        break;
                    }
                }
            }
            if !stale {
                return Dispatch::Queued;
            }
            table = self.router.snapshot();
        }
        Dispatch::Rejected
    }

    /// Queues for a category; `Ok(None)` means the table changed underneath
    async fn resolve(&self, table: &CategoryTable, category: &str) -> Result<Option<QueueList>, Dispatch> {
        let pipeline = match table.route(category) {
            Route::Exact(queues) => return Ok(Some(queues)),
            Route::Prefix { pipeline, .. } | Route::Default(pipeline) => pipeline,
            Route::Unrouted => {
                debug!("No route for category '{}'", category);
                self.counters.inc_category(category, counters::NO_ROUTE, 1);
                return Err(Dispatch::Dropped);
            }
        };

        match pipeline {
            Pipeline::Live(queues) => Ok(Some(queues)),
            Pipeline::Model(models) => {
                match self
                    .router
                    .create_category_from_model(category, &models, table.generation())
                    .await
                {
                    Ok(queues) => Ok(queues),
                    Err(e) => {
                        error!("Failed to create category '{}': {}", category, e);
                        self.counters
                            .inc_category(category, counters::CATEGORY_CREATE_FAILED, 1);
                        Err(Dispatch::Dropped)
                    }
                }
            }
        }
    }

    /// Stop all queues, draining within each queue's budget
    pub async fn shutdown(&self) {
        self.set_status(ServiceStatus::Stopping);
        info!("Shutting down log handler");
        let stopped = self.reconfig.shutdown().await;
        self.set_status(ServiceStatus::Stopped);
        info!("Log handler stopped ({} queues)", stopped);
    }

    /// Current status; an alive daemon reports `Warning` while any store is unhealthy
    pub fn status(&self) -> ServiceStatus {
        let status = *self.status.read();
        if status == ServiceStatus::Alive && !self.store_problems().is_empty() {
            return ServiceStatus::Warning;
        }
        status
    }

    pub fn status_details(&self) -> String {
        let details = self.details.lock().text.clone();
        if !details.is_empty() {
            return details;
        }
        self.store_problems().join("; ")
    }

    pub fn set_status(&self, status: ServiceStatus) {
        let mut current = self.status.write();
        if *current != status {
            info!("Status {} -> {}", current.as_str(), status.as_str());
            *current = status;
        }
    }

    pub fn set_status_details(&self, details: impl Into<String>) {
        *self.details.lock() = Details {
            text: details.into(),
            from_reconfig: false,
        };
    }

    pub fn version(&self) -> &'static str {
        VERSION
    }

    pub fn counters(&self) -> BTreeMap<String, i64> {
        self.counters.snapshot()
    }

    pub fn counters_handle(&self) -> Arc<Counters> {
        self.counters.clone()
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn reconfig_phase(&self) -> ReconfigPhase {
        self.reconfig.phase()
    }

    /// Configuration of the live table
    pub fn current_config(&self) -> Option<AggregatorConfig> {
        self.config.read().clone()
    }

    fn store_problems(&self) -> Vec<String> {
        self.router
            .snapshot()
            .all_queues()
            .iter()
            .filter_map(|q| q.status().map(|s| format!("{}: {}", q.category(), s)))
            .collect()
    }
}
