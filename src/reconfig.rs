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

// Reconfiguration controller
//
//   Idle -> Building -> Validating -> Swapping -> DrainingOld -> Idle
//
// Building and Validating work on a private table; a failure in either
// leaves the live table untouched. Only Swapping takes the router's write
// lock.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use crate::config::{AggregatorConfig, ConfigLoader, StoreConfig};
use crate::error::ConfigError;
use crate::router::{stop_all, QueueModel, Router, TableBuilder};
use crate::store::{Store, StoreFactory};
use crate::store_queue::{StopMode, StoreQueue};

pub const DEFAULT_CATEGORY: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconfigPhase {
    Idle,
    Building,
    Validating,
    Swapping,
    DrainingOld,
}

/// Summary of a completed reconfiguration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconfigReport {
    pub categories: usize,
    pub prefixes: usize,
    pub has_default: bool,
    pub queues_started: usize,
    pub queues_stopped: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum RuleTarget {
    Exact(String),
    Prefix(String),
    Default,
}

impl RuleTarget {
    fn parse(name: &str) -> Self {
        if name == DEFAULT_CATEGORY {
            RuleTarget::Default
        } else if let Some(prefix) = name.strip_suffix('*') {
            RuleTarget::Prefix(prefix.to_string())
        } else {
            RuleTarget::Exact(name.to_string())
        }
    }

    /// Name given to a queue shared by every category the rule matches
    fn queue_name(&self) -> &str {
        match self {
            RuleTarget::Exact(name) | RuleTarget::Prefix(name) => name,
            RuleTarget::Default => DEFAULT_CATEGORY,
        }
    }
}

/// Store trees built during Building, waiting to be started
struct Plan {
    live: Vec<(RuleTarget, QueueModel, Box<dyn Store>)>,
    models: Vec<(RuleTarget, QueueModel)>,
}

struct PhaseGuard<'a>(&'a Mutex<ReconfigPhase>);

impl PhaseGuard<'_> {
    fn enter(&self, phase: ReconfigPhase) {
        *self.0.lock() = phase;
    }
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        *self.0.lock() = ReconfigPhase::Idle;
    }
}

pub struct ReconfigController {
    router: Arc<Router>,
    phase: Mutex<ReconfigPhase>,
    run_lock: tokio::sync::Mutex<()>,
}

impl ReconfigController {
    pub fn new(router: Arc<Router>) -> Self {
        Self {
            router,
            phase: Mutex::new(ReconfigPhase::Idle),
            run_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn phase(&self) -> ReconfigPhase {
        *self.phase.lock()
    }

    /// Replace the live table with one built from `config`.
    ///
    /// Fails with `ConfigError::Busy` if another reconfiguration is running.
    pub async fn apply(&self, config: &AggregatorConfig) -> Result<ReconfigReport, ConfigError> {
        let _running = self.run_lock.try_lock().map_err(|_| ConfigError::Busy)?;
        let phase = PhaseGuard(&self.phase);
        let started_at = Instant::now();

        phase.enter(ReconfigPhase::Building);
        let plan = Self::build_plan(config)?;

        phase.enter(ReconfigPhase::Validating);
        self.router
            .set_check_interval(config.aggregator.check_interval());
        let builder = self.start_plan(plan).await?;
        let queues_started = builder.started_queues().len();
        let table = builder.build(0);
        let report_base = ReconfigReport {
            categories: table.category_names().len(),
            prefixes: table.prefix_names().len(),
            has_default: table.has_default(),
            queues_started,
            queues_stopped: 0,
        };

        phase.enter(ReconfigPhase::Swapping);
        let old = self.router.swap(table).await;

        phase.enter(ReconfigPhase::DrainingOld);
        let old_queues = old.all_queues();
        stop_all(&old_queues, StopMode::Graceful).await;

        info!(
            "Reconfiguration complete in {:?}: {} categories, {} prefixes, default: {}, {} queues started, {} stopped",
            started_at.elapsed(),
            report_base.categories,
            report_base.prefixes,
            report_base.has_default,
            queues_started,
            old_queues.len()
        );

        Ok(ReconfigReport {
            queues_stopped: old_queues.len(),
            ..report_base
        })
    }

    /// Stop every queue of the live table, leaving an empty table behind
    pub async fn shutdown(&self) -> usize {
        let _running = self.run_lock.lock().await;
        let phase = PhaseGuard(&self.phase);
        phase.enter(ReconfigPhase::Swapping);
        let old = self.router.swap(TableBuilder::new().build(0)).await;
        phase.enter(ReconfigPhase::DrainingOld);
        let queues = old.all_queues();
        stop_all(&queues, StopMode::Graceful).await;
        queues.len()
    }

    /// Resolve every rule into store trees without opening anything
    fn build_plan(config: &AggregatorConfig) -> Result<Plan, ConfigError> {
        ConfigLoader::validate(config).map_err(|e| ConfigError::invalid(format!("{:#}", e)))?;

        let per_category = config.aggregator.new_thread_per_category;
        let mut plan = Plan {
            live: Vec::new(),
            models: Vec::new(),
        };

        for rule in &config.categories {
            for name in rule.names() {
                let target = RuleTarget::parse(name);
                let model = QueueModel::new(rule.store.clone(), rule.queue.clone());
                let shared_rule = !matches!(target, RuleTarget::Exact(_));

                if shared_rule && per_category {
                    // Instantiated per category later; build once now to validate
                    Self::check_tree(&rule.store, target.queue_name())?;
                    plan.models.push((target, model));
                } else {
                    let store = StoreFactory::build(&rule.store, target.queue_name())?;
                    plan.live.push((target, model, store));
                }
            }
        }
        Ok(plan)
    }

    fn check_tree(store: &StoreConfig, name: &str) -> Result<(), ConfigError> {
        StoreFactory::build(store, name).map(drop)
    }

    /// Start every planned queue; on failure stop the ones already started
    async fn start_plan(&self, plan: Plan) -> Result<TableBuilder, ConfigError> {
        let ctx = self.router.context();
        let mut builder = TableBuilder::new();

        for (target, model) in plan.models {
            match target {
                RuleTarget::Prefix(prefix) => builder.add_prefix_model(&prefix, model),
                RuleTarget::Default => builder.add_default_model(model),
                RuleTarget::Exact(_) => unreachable!("exact rules are always live"),
            }
        }

        for (target, model, store) in plan.live {
            let name = target.queue_name().to_string();
            let queue = match StoreQueue::start(&name, store, model.queue.clone(), ctx.clone()).await {
                Ok(queue) => queue,
                Err(source) => {
                    error!("Store for '{}' failed to start: {}", name, source);
                    let started = builder.started_queues();
                    if !started.is_empty() {
                        warn!("Stopping {} queues started for the new configuration", started.len());
                    }
                    stop_all(&started, StopMode::Immediate).await;
                    return Err(ConfigError::StoreStart {
                        category: name,
                        source,
                    });
                }
            };

            match target {
                RuleTarget::Exact(category) => builder.add_exact(&category, queue),
                RuleTarget::Prefix(prefix) => builder.add_prefix_queue(&prefix, queue),
                RuleTarget::Default => builder.add_default_queue(queue),
            }
        }
        Ok(builder)
    }
}
