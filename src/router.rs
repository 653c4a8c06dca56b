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

// Category router
//
// The live table is an immutable snapshot behind an ArcSwap. Readers load
// it once per request and never block; writers (reconfiguration, lazy
// category creation) build a replacement and publish it under `write_lock`.

use arc_swap::ArcSwap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::{QueueConfig, StoreConfig};
use crate::error::ConfigError;
use crate::store::StoreFactory;
use crate::store_queue::{QueueContext, StopMode, StoreQueue};

/// Queues a category's entries are copied to
pub type QueueList = Arc<Vec<Arc<StoreQueue>>>;

/// Configuration a per-category pipeline is instantiated from
#[derive(Debug, Clone)]
pub struct QueueModel {
    pub store: StoreConfig,
    pub queue: QueueConfig,
}

impl QueueModel {
    pub fn new(store: StoreConfig, queue: QueueConfig) -> Self {
        Self { store, queue }
    }

    /// Build a fresh store tree from the model and start a queue around it
    pub async fn instantiate(
        &self,
        category: &str,
        ctx: &QueueContext,
    ) -> Result<Arc<StoreQueue>, ConfigError> {
        let store = StoreFactory::build(&self.store, category)?;
        StoreQueue::start(category, store, self.queue.clone(), ctx.clone())
            .await
            .map_err(|source| ConfigError::StoreStart {
                category: category.to_string(),
                source,
            })
    }
}

/// Target of a prefix or default rule
#[derive(Debug, Clone)]
pub enum Pipeline {
    /// Queues shared by every category the rule matches
    Live(QueueList),
    /// Each matching category gets its own queues built from these models
    Model(Arc<Vec<QueueModel>>),
}

#[derive(Debug, Clone)]
pub enum Route {
    Exact(QueueList),
    Prefix { prefix: String, pipeline: Pipeline },
    Default(Pipeline),
    Unrouted,
}

/// One immutable generation of the routing table
#[derive(Debug, Default)]
pub struct CategoryTable {
    generation: u64,
    categories: HashMap<String, QueueList>,
    /// Sorted longest first so the first match is the longest
    prefixes: Vec<(String, Pipeline)>,
    default: Option<Pipeline>,
}

impl CategoryTable {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Exact match, then longest prefix, then default
    pub fn route(&self, category: &str) -> Route {
        if let Some(queues) = self.categories.get(category) {
            return Route::Exact(queues.clone());
        }
        if let Some((prefix, pipeline)) = self
            .prefixes
            .iter()
            .find(|(prefix, _)| category.starts_with(prefix.as_str()))
        {
            return Route::Prefix {
                prefix: prefix.clone(),
                pipeline: pipeline.clone(),
            };
        }
        match &self.default {
            Some(pipeline) => Route::Default(pipeline.clone()),
            None => Route::Unrouted,
        }
    }

    pub fn category_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.categories.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn prefix_names(&self) -> Vec<String> {
        self.prefixes.iter().map(|(p, _)| p.clone()).collect()
    }

    pub fn has_default(&self) -> bool {
        self.default.is_some()
    }

    /// Every running queue owned by this table
    pub fn all_queues(&self) -> Vec<Arc<StoreQueue>> {
        let mut queues: Vec<Arc<StoreQueue>> = self
            .categories
            .values()
            .flat_map(|list| list.iter().cloned())
            .collect();
        let shared = self
            .prefixes
            .iter()
            .map(|(_, pipeline)| pipeline)
            .chain(self.default.iter());
        for pipeline in shared {
            if let Pipeline::Live(list) = pipeline {
                queues.extend(list.iter().cloned());
            }
        }
        queues
    }

    /// Copy of this table with one more exact category
    fn with_category(&self, category: &str, queues: QueueList) -> CategoryTable {
        let mut categories = self.categories.clone();
        categories.insert(category.to_string(), queues);
        CategoryTable {
            generation: self.generation,
            categories,
            prefixes: self.prefixes.clone(),
            default: self.default.clone(),
        }
    }
}

/// Accumulates queues and models while a new table is being built
#[derive(Default)]
pub struct TableBuilder {
    categories: HashMap<String, Vec<Arc<StoreQueue>>>,
    prefixes: HashMap<String, PipelineParts>,
    default: Option<PipelineParts>,
}

enum PipelineParts {
    Live(Vec<Arc<StoreQueue>>),
    Model(Vec<QueueModel>),
}

impl PipelineParts {
    fn push_live(slot: &mut Option<PipelineParts>, queue: Arc<StoreQueue>) {
        match slot {
            Some(PipelineParts::Live(list)) => list.push(queue),
            _ => *slot = Some(PipelineParts::Live(vec![queue])),
        }
    }

    fn push_model(slot: &mut Option<PipelineParts>, model: QueueModel) {
        match slot {
            Some(PipelineParts::Model(list)) => list.push(model),
            _ => *slot = Some(PipelineParts::Model(vec![model])),
        }
    }

    fn finish(self) -> Pipeline {
        match self {
            PipelineParts::Live(list) => Pipeline::Live(Arc::new(list)),
            PipelineParts::Model(list) => Pipeline::Model(Arc::new(list)),
        }
    }
}

impl TableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Repeated names add more pipelines to the same category
    pub fn add_exact(&mut self, category: &str, queue: Arc<StoreQueue>) {
        self.categories
            .entry(category.to_string())
            .or_default()
            .push(queue);
    }

    pub fn add_prefix_queue(&mut self, prefix: &str, queue: Arc<StoreQueue>) {
        let mut slot = self.prefixes.remove(prefix);
        PipelineParts::push_live(&mut slot, queue);
        if let Some(parts) = slot {
            self.prefixes.insert(prefix.to_string(), parts);
        }
    }

    pub fn add_prefix_model(&mut self, prefix: &str, model: QueueModel) {
        let mut slot = self.prefixes.remove(prefix);
        PipelineParts::push_model(&mut slot, model);
        if let Some(parts) = slot {
            self.prefixes.insert(prefix.to_string(), parts);
        }
    }

    pub fn add_default_queue(&mut self, queue: Arc<StoreQueue>) {
        PipelineParts::push_live(&mut self.default, queue);
    }

    pub fn add_default_model(&mut self, model: QueueModel) {
        PipelineParts::push_model(&mut self.default, model);
    }

    /// Queues started so far, for cleanup when a build is abandoned
    pub fn started_queues(&self) -> Vec<Arc<StoreQueue>> {
        let mut queues: Vec<Arc<StoreQueue>> =
            self.categories.values().flatten().cloned().collect();
        for parts in self.prefixes.values().chain(self.default.iter()) {
            if let PipelineParts::Live(list) = parts {
                queues.extend(list.iter().cloned());
            }
        }
        queues
    }

    pub fn build(self, generation: u64) -> CategoryTable {
        let mut prefixes: Vec<(String, Pipeline)> = self
            .prefixes
            .into_iter()
            .map(|(prefix, parts)| (prefix, parts.finish()))
            .collect();
        prefixes.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));

        CategoryTable {
            generation,
            categories: self
                .categories
                .into_iter()
                .map(|(name, list)| (name, Arc::new(list)))
                .collect(),
            prefixes,
            default: self.default.map(PipelineParts::finish),
        }
    }
}

/// Owner of the live table
pub struct Router {
    table: ArcSwap<CategoryTable>,
    write_lock: tokio::sync::Mutex<()>,
    ctx: RwLock<QueueContext>,
}

impl Router {
    pub fn new(ctx: QueueContext) -> Self {
        Self {
            table: ArcSwap::from_pointee(CategoryTable::default()),
            write_lock: tokio::sync::Mutex::new(()),
            ctx: RwLock::new(ctx),
        }
    }

    /// Context handed to queues started from now on
    pub fn context(&self) -> QueueContext {
        self.ctx.read().clone()
    }

    pub fn set_check_interval(&self, interval: Duration) {
        self.ctx.write().check_interval = interval;
    }

    /// Lock-free snapshot of the live table
    pub fn snapshot(&self) -> Arc<CategoryTable> {
        self.table.load_full()
    }

    pub fn route(&self, category: &str) -> Route {
        self.table.load().route(category)
    }

    /// Publish `table` as the live table and return the one it replaced.
    ///
    /// The new table is stamped with the next generation number, which makes
    /// lazy inserts that were built against the old table detectable.
    pub async fn swap(&self, mut table: CategoryTable) -> Arc<CategoryTable> {
        let _guard = self.write_lock.lock().await;
        let current = self.table.load_full();
        table.generation = current.generation + 1;
        self.table.swap(Arc::new(table))
    }

    /// Start per-category queues for an unseen category and insert them.
    ///
    /// Queues are built and started without holding the write lock. Returns
    /// `Ok(None)` when the table was replaced meanwhile; the caller should
    /// route again against the new table.
    pub async fn create_category_from_model(
        &self,
        category: &str,
        models: &[QueueModel],
        seen_generation: u64,
    ) -> Result<Option<QueueList>, ConfigError> {
        let ctx = self.context();
        let mut started = Vec::with_capacity(models.len());
        for model in models {
            match model.instantiate(category, &ctx).await {
                Ok(queue) => started.push(queue),
                Err(e) => {
                    stop_all(&started, StopMode::Immediate).await;
                    return Err(e);
                }
            }
        }

        let guard = self.write_lock.lock().await;
        let current = self.table.load_full();
        if current.generation != seen_generation {
            drop(guard);
            debug!(
                "Table changed while creating category '{}', discarding new queues",
                category
            );
            stop_all(&started, StopMode::Immediate).await;
            return Ok(None);
        }
        if let Some(existing) = current.categories.get(category) {
            // Another request created it first
            let existing = existing.clone();
            drop(guard);
            stop_all(&started, StopMode::Immediate).await;
            return Ok(Some(existing));
        }

        let queues: QueueList = Arc::new(started);
        self.table
            .store(Arc::new(current.with_category(category, queues.clone())));
        drop(guard);

        info!(
            "Created category '{}' from model ({} queues)",
            category,
            queues.len()
        );
        Ok(Some(queues))
    }
}

/// Stop queues concurrently and wait for all of them
pub async fn stop_all(queues: &[Arc<StoreQueue>], mode: StopMode) {
    let mut tasks = tokio::task::JoinSet::new();
    for queue in queues {
        let queue = queue.clone();
        tasks.spawn(async move { queue.stop(mode).await });
    }
    while tasks.join_next().await.is_some() {}
}
