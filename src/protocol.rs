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

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Version reported by the status interface
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// One categorized message. The payload is opaque.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub category: String,
    pub message: Bytes,
}

impl LogEntry {
    pub fn new(category: impl Into<String>, message: impl Into<Bytes>) -> Self {
        Self {
            category: category.into(),
            message: message.into(),
        }
    }

    /// Bytes this entry accounts for in queue and throttle limits
    pub fn size(&self) -> usize {
        self.message.len()
    }
}

// Payloads travel as standard base64 so arbitrary bytes survive JSON
mod serde_base64 {
    use base64::Engine;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let encoded = base64::engine::general_purpose::STANDARD.encode(value);
        serializer.serialize_str(&encoded)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(s.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

/// Wire representation of a log entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireEntry {
    pub category: String,
    #[serde(with = "serde_base64")]
    pub message: Bytes,
}

impl From<&LogEntry> for WireEntry {
    fn from(entry: &LogEntry) -> Self {
        Self {
            category: entry.category.clone(),
            message: entry.message.clone(),
        }
    }
}

impl From<WireEntry> for LogEntry {
    fn from(entry: WireEntry) -> Self {
        LogEntry::new(entry.category, entry.message)
    }
}

/// Ingestion request: an ordered batch of entries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRequest {
    pub messages: Vec<WireEntry>,
}

/// Outcome of an ingestion call
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultCode {
    Ok,
    /// Throttled, queue full or not alive; the caller should back off and retry
    TryLater,
    /// Malformed request; retrying the same request will not help
    Error,
}

impl ResultCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ResultCode::Ok => "OK",
            ResultCode::TryLater => "TRY_LATER",
            ResultCode::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogResponse {
    pub result: ResultCode,
}

/// Daemon health as exposed to the status collaborator
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Starting,
    Alive,
    Warning,
    Stopping,
    Stopped,
}

impl ServiceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceStatus::Starting => "STARTING",
            ServiceStatus::Alive => "ALIVE",
            ServiceStatus::Warning => "WARNING",
            ServiceStatus::Stopping => "STOPPING",
            ServiceStatus::Stopped => "STOPPED",
        }
    }

    /// Whether ingestion is accepted in this state
    pub fn accepts_traffic(self) -> bool {
        matches!(self, ServiceStatus::Alive | ServiceStatus::Warning)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: ServiceStatus,
    pub details: String,
    pub version: String,
}

/// Operational override of status and/or details
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SetStatusRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ServiceStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReinitializeResponse {
    pub success: bool,
    pub message: String,
}

impl ReinitializeResponse {
    pub fn success() -> Self {
        Self {
            success: true,
            message: "Configuration reloaded".to_string(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            message,
        }
    }
}
