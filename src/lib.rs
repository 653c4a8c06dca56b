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

// Category-routed log aggregation daemon
//
// Clients submit batches of categorized messages. Each category is routed
// (exact, longest prefix, default) to one or more pipelines, each a bounded
// queue in front of a composable store tree:
// - file stores with size/time rotation
// - forwarding to a downstream aggregator
// - buffer stores that stage to disk while the primary is down and replay later
// - fan-out and hash-bucketed stores
// Ingestion is throttled, and the whole routing table is swapped atomically
// on reload while traffic keeps flowing.

pub mod config;
pub mod counters;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod reconfig;
pub mod router;
pub mod server;
pub mod store;
pub mod store_queue;
pub mod throttle;

// Re-export main types
pub use config::{load_config, load_config_with_env, AggregatorConfig};
pub use counters::{CounterSink, Counters, CountersPublisher, HttpCounterSink, LogCounterSink};
pub use error::{ConfigError, FailureKind, QueueError, StoreError};
pub use handler::LogHandler;
pub use protocol::{LogEntry, LogRequest, LogResponse, ResultCode, ServiceStatus, StatusResponse};
pub use reconfig::{ReconfigController, ReconfigPhase, ReconfigReport};
pub use router::{CategoryTable, Pipeline, QueueModel, Route, Router};
pub use store::{Store, StoreFactory};
pub use store_queue::{QueueContext, QueueStats, StopMode, StoreQueue};
pub use throttle::{Admission, Clock, ManualClock, SystemClock, Throttle};
