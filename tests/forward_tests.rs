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

// Forwarding between two aggregators and the HTTP interface

mod common;

use common::wait_for;
use log_aggregator::config::{ConfigLoader, ForwardStoreConfig};
use log_aggregator::counters;
use log_aggregator::error::FailureKind;
use log_aggregator::handler::LogHandler;
use log_aggregator::protocol::{LogEntry, ResultCode, ServiceStatus};
use log_aggregator::server;
use log_aggregator::store::{ForwardStore, Store};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::oneshot;

const WAIT: Duration = Duration::from_secs(5);

/// An aggregator served on an ephemeral loopback port
struct Peer {
    handler: Arc<LogHandler>,
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    server: tokio::task::JoinHandle<std::io::Result<()>>,
}

impl Peer {
    async fn start(yaml: &str) -> Peer {
        let handler = Arc::new(LogHandler::new(None));
        handler
            .initialize(ConfigLoader::from_yaml_str(yaml).unwrap())
            .await
            .unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        let server = tokio::spawn(server::serve(listener, handler.clone(), async move {
            let _ = rx.await;
        }));

        Peer {
            handler,
            addr,
            shutdown: Some(tx),
            server,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    fn forward_config(&self) -> ForwardStoreConfig {
        ForwardStoreConfig {
            remote_host: self.addr.ip().to_string(),
            remote_port: self.addr.port(),
            timeout_ms: 2_000,
        }
    }

    async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.server.await.unwrap().unwrap();
        self.handler.shutdown().await;
    }
}

fn file_sink_yaml(dir: &Path) -> String {
    format!(
        r#"
categories:
  - category: default
    queue:
      max_write_interval_ms: 20
    store:
      type: file
      file_path: "{}"
"#,
        dir.display()
    )
}

fn read_dir_contents(dir: &Path) -> String {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return String::new();
    };
    let mut paths: Vec<_> = entries.map(|e| e.unwrap().path()).collect();
    paths.sort();
    paths
        .iter()
        .map(|p| std::fs::read_to_string(p).unwrap_or_default())
        .collect()
}

fn read_dir_bytes(dir: &Path) -> Vec<u8> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut paths: Vec<_> = entries.map(|e| e.unwrap().path()).collect();
    paths.sort();
    paths
        .iter()
        .flat_map(|p| std::fs::read(p).unwrap_or_default())
        .collect()
}

#[tokio::test]
async fn test_forward_store_delivers_to_peer() {
    let temp_dir = TempDir::new().unwrap();
    let peer = Peer::start(&file_sink_yaml(temp_dir.path())).await;

    let mut store = ForwardStore::new(peer.forward_config());
    store.open().await.unwrap();
    assert!(store.is_open());

    let batch = vec![
        LogEntry::new("clicks", "one"),
        LogEntry::new("clicks", "two"),
    ];
    store.deliver(&batch).await.unwrap();
    assert!(store.status().is_none());

    assert!(wait_for(WAIT, || read_dir_contents(temp_dir.path()) == "one\ntwo\n").await);
    assert_eq!(
        peer.handler
            .counters_handle()
            .get_category("clicks", counters::RECEIVED_GOOD),
        2
    );

    store.close().await;
    peer.stop().await;
}

#[tokio::test]
async fn test_binary_payload_forwarded_unchanged() {
    let temp_dir = TempDir::new().unwrap();
    let peer = Peer::start(&file_sink_yaml(temp_dir.path())).await;

    let mut store = ForwardStore::new(peer.forward_config());
    store.open().await.unwrap();

    let payload = vec![0xff, 0x00, 0xfe, b'a'];
    store
        .deliver(&[LogEntry::new("bin", payload.clone())])
        .await
        .unwrap();

    let mut expected = payload;
    expected.push(b'\n');
    assert!(wait_for(WAIT, || read_dir_bytes(temp_dir.path()) == expected).await);

    store.close().await;
    peer.stop().await;
}

#[tokio::test]
async fn test_peer_replies_map_to_failure_kinds() {
    let peer = Peer::start(
        r#"
categories:
  - category: default
    store:
      type: "null"
"#,
    )
    .await;
    let mut store = ForwardStore::new(peer.forward_config());
    store.open().await.unwrap();

    // A malformed batch is rejected for good
    let err = store
        .deliver(&[LogEntry::new("", "no category")])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), FailureKind::Fatal);
    assert!(store.is_open());

    // A peer that is not alive asks for a retry
    peer.handler.set_status(ServiceStatus::Stopping);
    let err = store
        .deliver(&[LogEntry::new("web", "later")])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), FailureKind::Retryable);
    assert!(!store.is_open());

    peer.handler.set_status(ServiceStatus::Alive);
    store.deliver(&[LogEntry::new("web", "now")]).await.unwrap();

    peer.stop().await;
}

#[tokio::test]
async fn test_aggregator_chain() {
    let temp_dir = TempDir::new().unwrap();
    let downstream = Peer::start(&file_sink_yaml(temp_dir.path())).await;

    let upstream = LogHandler::new(None);
    let yaml = format!(
        r#"
categories:
  - category: "web.*"
    queue:
      max_write_interval_ms: 20
    store:
      type: forward
      remote_host: "{}"
      remote_port: {}
"#,
        downstream.addr.ip(),
        downstream.addr.port()
    );
    upstream
        .initialize(ConfigLoader::from_yaml_str(&yaml).unwrap())
        .await
        .unwrap();

    let batch = vec![
        LogEntry::new("web.front", "hop 1"),
        LogEntry::new("web.front", "hop 2"),
    ];
    assert_eq!(upstream.log(batch).await, ResultCode::Ok);

    assert!(wait_for(WAIT, || read_dir_contents(temp_dir.path()) == "hop 1\nhop 2\n").await);
    assert!(wait_for(WAIT, || {
        upstream
            .counters_handle()
            .get_category("web.front", counters::SENT)
            == 2
    })
    .await);

    upstream.shutdown().await;
    downstream.stop().await;
}

#[tokio::test]
async fn test_http_interface() {
    let peer = Peer::start(
        r#"
categories:
  - category: default
    store:
      type: "null"
"#,
    )
    .await;
    let client = reqwest::Client::new();

    let reply: Value = client
        .post(peer.url("/log"))
        .json(&json!({"messages": [{"category": "api", "message": "aGVsbG8="}]}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(reply["result"], "OK");

    let status: Value = client
        .get(peer.url("/status"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["status"], "alive");
    assert_eq!(status["version"], log_aggregator::protocol::VERSION);

    let counters: Value = client
        .get(peer.url("/counters"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(counters["api:received good"], 1);

    let updated: Value = client
        .put(peer.url("/status"))
        .json(&json!({"status": "warning", "details": "maintenance"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(updated["status"], "warning");
    assert_eq!(updated["details"], "maintenance");

    let version: Value = client
        .get(peer.url("/version"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(version["version"], log_aggregator::protocol::VERSION);

    // No configuration file to reload
    let response = client
        .post(peer.url("/reinitialize"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::UNPROCESSABLE_ENTITY);

    peer.stop().await;
}
