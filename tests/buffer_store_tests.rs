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

mod common;

use common::{entries, MockHandle};
use log_aggregator::config::{BufferStoreConfig, FileFormat, FileStoreConfig, StoreConfig};
use log_aggregator::error::FailureKind;
use log_aggregator::store::{BufferStore, FileStore, Store};
use std::path::Path;
use tempfile::TempDir;

fn buffer_config(drain_files_per_check: usize, replay_buffer: bool) -> BufferStoreConfig {
    BufferStoreConfig {
        primary: Box::new(StoreConfig::Null),
        secondary: Box::new(StoreConfig::Null),
        retry_interval_ms: 0,
        drain_files_per_check,
        replay_buffer,
    }
}

/// Framed staging store that starts a new file for every batch
fn staging_store(dir: &Path) -> FileStore {
    let config = FileStoreConfig {
        file_path: dir.to_string_lossy().to_string(),
        format: FileFormat::Framed,
        max_size: 1,
        ..FileStoreConfig::default()
    };
    FileStore::new(config, "cat")
}

fn staged_files(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
}

#[tokio::test]
async fn test_primary_failure_stages_and_replays_in_order() {
    let temp_dir = TempDir::new().unwrap();
    let primary = MockHandle::new();
    let mut store = BufferStore::new(
        primary.boxed(),
        Box::new(staging_store(temp_dir.path())),
        &buffer_config(2, true),
    );

    store.open().await.unwrap();
    assert_eq!(store.state_name(), "streaming");
    store.deliver(&entries("cat", &["a"])).await.unwrap();

    // Primary goes down: the failed batch and everything after it is staged
    primary.fail_deliveries(Some(FailureKind::Retryable));
    store.deliver(&entries("cat", &["b"])).await.unwrap();
    assert_eq!(store.state_name(), "disconnected");
    assert!(store.status().is_some());
    store.deliver(&entries("cat", &["c"])).await.unwrap();
    store.deliver(&entries("cat", &["d"])).await.unwrap();
    assert_eq!(primary.deliver_calls(), 2);
    assert_eq!(staged_files(temp_dir.path()), 3);

    // Recovery replays at most two staged files per check
    primary.fail_deliveries(None);
    store.periodic_check().await;
    assert_eq!(store.state_name(), "sending_buffer");
    assert_eq!(primary.messages(), vec!["a", "b", "c"]);

    // New traffic still waits behind the staged backlog
    store.deliver(&entries("cat", &["e"])).await.unwrap();
    assert_eq!(primary.messages(), vec!["a", "b", "c"]);

    store.periodic_check().await;
    assert_eq!(store.state_name(), "streaming");
    assert_eq!(primary.messages(), vec!["a", "b", "c", "d", "e"]);
    assert!(store.status().is_none());

    store.deliver(&entries("cat", &["f"])).await.unwrap();
    assert_eq!(primary.messages(), vec!["a", "b", "c", "d", "e", "f"]);
    assert_eq!(staged_files(temp_dir.path()), 0);

    store.close().await;
    assert_eq!(primary.closes(), 2);
}

#[tokio::test]
async fn test_failure_during_replay_disconnects_again() {
    let temp_dir = TempDir::new().unwrap();
    let primary = MockHandle::new();
    let mut store = BufferStore::new(
        primary.boxed(),
        Box::new(staging_store(temp_dir.path())),
        &buffer_config(10, true),
    );
    store.open().await.unwrap();

    primary.fail_deliveries(Some(FailureKind::Retryable));
    store.deliver(&entries("cat", &["x"])).await.unwrap();
    store.deliver(&entries("cat", &["y"])).await.unwrap();

    // Reopen succeeds but delivery still fails: nothing is lost
    store.periodic_check().await;
    assert_eq!(store.state_name(), "disconnected");
    assert_eq!(staged_files(temp_dir.path()), 2);

    primary.fail_deliveries(None);
    store.periodic_check().await;
    assert_eq!(store.state_name(), "streaming");
    assert_eq!(primary.messages(), vec!["x", "y"]);
}

#[tokio::test]
async fn test_replay_disabled_discards_staged_data() {
    let temp_dir = TempDir::new().unwrap();
    let primary = MockHandle::new();
    let mut store = BufferStore::new(
        primary.boxed(),
        Box::new(staging_store(temp_dir.path())),
        &buffer_config(10, false),
    );
    store.open().await.unwrap();

    primary.fail_deliveries(Some(FailureKind::Retryable));
    store.deliver(&entries("cat", &["stale"])).await.unwrap();
    assert_eq!(staged_files(temp_dir.path()), 1);

    primary.fail_deliveries(None);
    store.periodic_check().await;
    assert_eq!(store.state_name(), "streaming");
    assert_eq!(staged_files(temp_dir.path()), 0);

    store.deliver(&entries("cat", &["fresh"])).await.unwrap();
    assert_eq!(primary.messages(), vec!["fresh"]);
}

#[tokio::test]
async fn test_unreachable_primary_at_open_buffers_from_the_start() {
    let temp_dir = TempDir::new().unwrap();
    let primary = MockHandle::new();
    primary.fail_opens(Some(FailureKind::Retryable));
    let mut store = BufferStore::new(
        primary.boxed(),
        Box::new(staging_store(temp_dir.path())),
        &buffer_config(10, true),
    );

    store.open().await.unwrap();
    assert_eq!(store.state_name(), "disconnected");
    store.deliver(&entries("cat", &["early"])).await.unwrap();
    assert_eq!(primary.deliver_calls(), 0);

    // Still down on the next check
    store.periodic_check().await;
    assert_eq!(store.state_name(), "disconnected");

    primary.fail_opens(None);
    store.periodic_check().await;
    assert_eq!(store.state_name(), "streaming");
    assert_eq!(primary.messages(), vec!["early"]);
}

#[tokio::test]
async fn test_both_legs_down_is_retryable() {
    let primary = MockHandle::new();
    let secondary = MockHandle::new();
    primary.fail_deliveries(Some(FailureKind::Retryable));
    secondary.fail_deliveries(Some(FailureKind::Retryable));
    let mut store = BufferStore::new(primary.boxed(), secondary.boxed(), &buffer_config(10, true));
    store.open().await.unwrap();

    let err = store.deliver(&entries("cat", &["m"])).await.unwrap_err();
    assert_eq!(err.kind(), FailureKind::Retryable);
}
