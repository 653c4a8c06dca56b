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

// File store: appends batches to rotating local files

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use once_cell::sync::Lazy;
use regex::Regex;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::backend::Store;
use crate::config::{FileFormat, FileStoreConfig, RotatePeriod};
use crate::error::StoreError;
use crate::protocol::LogEntry;

/// Name tail after `<base_filename>-`: period label, then sequence number
static FILE_SUFFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\d{4}-\d{2}-\d{2}(?:-\d{2})?_(\d+)$").expect("static pattern")
});

struct CurrentFile {
    file: fs::File,
    path: PathBuf,
    size: u64,
    period: String,
}

/// Writes batches to `<file_path>/<base_filename>-<period>_<NNNNN>`.
///
/// Sequence numbers increase across periods, so ordering files by sequence is
/// ordering them by age. Framed files can be read back, which is what lets a
/// buffer store use this as its staging area.
pub struct FileStore {
    dir: PathBuf,
    base_filename: String,
    format: FileFormat,
    add_newlines: bool,
    max_size: u64,
    rotate_period: RotatePeriod,
    opened: bool,
    next_seq: u64,
    current: Option<CurrentFile>,
    staged_oldest: Option<PathBuf>,
    last_error: Option<String>,
}

impl FileStore {
    pub fn new(config: FileStoreConfig, category: &str) -> Self {
        let base_filename = config
            .base_filename
            .clone()
            .unwrap_or_else(|| category.to_string());

        Self {
            dir: PathBuf::from(&config.file_path),
            base_filename,
            format: config.format,
            add_newlines: config.add_newlines,
            max_size: config.max_size,
            rotate_period: config.rotate_period,
            opened: false,
            next_seq: 0,
            current: None,
            staged_oldest: None,
            last_error: None,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn period_label(&self) -> String {
        let now = chrono::Local::now();
        match self.rotate_period {
            RotatePeriod::Hourly => now.format("%Y-%m-%d-%H").to_string(),
            RotatePeriod::Daily | RotatePeriod::Never => now.format("%Y-%m-%d").to_string(),
        }
    }

    /// Sequence number of a file written by this store, if the name is ours.
    ///
    /// Stores sharing a directory must not claim each other's files, so
    /// `web` never matches `web-api-2026-10-18_00000`.
    fn parse_seq(&self, file_name: &str) -> Option<u64> {
        let rest = file_name.strip_prefix(&self.base_filename)?.strip_prefix('-')?;
        let caps = FILE_SUFFIX.captures(rest)?;
        caps[1].parse().ok()
    }

    /// Files written by this store, oldest first
    async fn list_files(&self) -> std::io::Result<Vec<(u64, PathBuf)>> {
        let mut files = Vec::new();
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(files),
            Err(e) => return Err(e),
        };

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if let Some(seq) = self.parse_seq(&name.to_string_lossy()) {
                files.push((seq, entry.path()));
            }
        }
        files.sort_by_key(|(seq, _)| *seq);
        Ok(files)
    }

    fn encode(&self, batch: &[LogEntry]) -> BytesMut {
        let capacity: usize = batch
            .iter()
            .map(|e| e.message.len() + e.category.len() + 8)
            .sum();
        let mut buf = BytesMut::with_capacity(capacity);

        for entry in batch {
            match self.format {
                FileFormat::Plain => {
                    buf.put_slice(&entry.message);
                    if self.add_newlines && !entry.message.ends_with(b"\n") {
                        buf.put_u8(b'\n');
                    }
                }
                FileFormat::Framed => {
                    buf.put_u32(entry.category.len() as u32);
                    buf.put_slice(entry.category.as_bytes());
                    buf.put_u32(entry.message.len() as u32);
                    buf.put_slice(&entry.message);
                }
            }
        }
        buf
    }

    fn decode(path: &Path, data: Vec<u8>) -> Vec<LogEntry> {
        let mut buf = Bytes::from(data);
        let mut entries = Vec::new();

        while buf.has_remaining() {
            if buf.remaining() < 4 {
                break;
            }
            let category_len = buf.get_u32() as usize;
            if buf.remaining() < category_len + 4 {
                break;
            }
            let category = String::from_utf8_lossy(&buf.split_to(category_len)).into_owned();
            let message_len = buf.get_u32() as usize;
            if buf.remaining() < message_len {
                break;
            }
            entries.push(LogEntry::new(category, buf.split_to(message_len)));
        }

        if buf.has_remaining() {
            warn!(
                "Truncated record in {}, ignoring {} trailing bytes",
                path.display(),
                buf.remaining()
            );
        }
        entries
    }

    async fn open_new_file(&mut self) -> Result<(), StoreError> {
        let period = self.period_label();
        let path = self.dir.join(format!(
            "{}-{}_{:05}",
            self.base_filename, period, self.next_seq
        ));
        self.next_seq += 1;

        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| StoreError::from_io(&format!("open {}", path.display()), e))?;
        let size = file
            .metadata()
            .await
            .map(|m| m.len())
            .unwrap_or_default();

        debug!("Opened {}", path.display());
        self.current = Some(CurrentFile {
            file,
            path,
            size,
            period,
        });
        Ok(())
    }

    async fn close_current(&mut self) {
        if let Some(mut current) = self.current.take() {
            if let Err(e) = current.file.flush().await {
                warn!("Failed to flush {}: {}", current.path.display(), e);
            }
            if let Err(e) = current.file.sync_all().await {
                warn!("Failed to sync {}: {}", current.path.display(), e);
            }
        }
    }

    fn require_staging(&self) -> Result<(), StoreError> {
        if self.format == FileFormat::Framed {
            Ok(())
        } else {
            Err(StoreError::Fatal(format!(
                "file store {} is not framed and cannot be read back",
                self.dir.display()
            )))
        }
    }

    fn needs_rotation(&self, incoming: u64) -> bool {
        match &self.current {
            None => true,
            Some(current) => {
                let period_changed = self.rotate_period != RotatePeriod::Never
                    && current.period != self.period_label();
                let too_big = current.size > 0 && current.size + incoming > self.max_size;
                period_changed || too_big
            }
        }
    }

    async fn write_batch(&mut self, buf: &[u8]) -> Result<(), StoreError> {
        if self.needs_rotation(buf.len() as u64) {
            self.close_current().await;
            self.open_new_file().await?;
        }

        let Some(current) = self.current.as_mut() else {
            return Err(StoreError::Retryable("no file open".to_string()));
        };

        let before = current.size;
        let result = async {
            current.file.write_all(buf).await?;
            current.file.flush().await
        }
        .await;

        match result {
            Ok(()) => {
                current.size += buf.len() as u64;
                Ok(())
            }
            Err(e) => {
                // Cut the partial batch so a retry does not duplicate it
                if let Err(trunc) = current.file.set_len(before).await {
                    warn!(
                        "Failed to truncate {} after write error: {}",
                        current.path.display(),
                        trunc
                    );
                }
                let err = StoreError::from_io(&format!("write {}", current.path.display()), e);
                self.current = None;
                Err(err)
            }
        }
    }
}

#[async_trait]
impl Store for FileStore {
    async fn open(&mut self) -> Result<(), StoreError> {
        if self.opened {
            return Ok(());
        }

        match fs::metadata(&self.dir).await {
            Ok(meta) if !meta.is_dir() => {
                return Err(StoreError::Fatal(format!(
                    "file_path {} is not a directory",
                    self.dir.display()
                )));
            }
            Ok(_) => {}
            Err(_) => {
                info!("Creating directory: {}", self.dir.display());
                fs::create_dir_all(&self.dir).await.map_err(|e| {
                    if e.kind() == ErrorKind::PermissionDenied {
                        StoreError::Fatal(format!("create {}: {}", self.dir.display(), e))
                    } else {
                        StoreError::Unavailable(format!("create {}: {}", self.dir.display(), e))
                    }
                })?;
            }
        }

        let files = self
            .list_files()
            .await
            .map_err(|e| StoreError::Unavailable(format!("scan {}: {}", self.dir.display(), e)))?;
        self.next_seq = files.last().map(|(seq, _)| seq + 1).unwrap_or(0);
        self.opened = true;
        self.last_error = None;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.opened
    }

    async fn deliver(&mut self, batch: &[LogEntry]) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        self.open().await?;

        let buf = self.encode(batch);
        match self.write_batch(&buf).await {
            Ok(()) => {
                self.last_error = None;
                debug!(
                    "Wrote {} messages ({} bytes) to {}",
                    batch.len(),
                    buf.len(),
                    self.dir.display()
                );
                Ok(())
            }
            Err(e) => {
                self.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    async fn periodic_check(&mut self) {
        if self.needs_rotation(0) && self.current.is_some() {
            self.close_current().await;
        }
    }

    async fn flush(&mut self) -> Result<(), StoreError> {
        if let Some(current) = self.current.as_mut() {
            current
                .file
                .flush()
                .await
                .map_err(|e| StoreError::from_io("flush", e))?;
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.close_current().await;
        self.opened = false;
    }

    fn store_type(&self) -> &'static str {
        "file"
    }

    fn status(&self) -> Option<String> {
        self.last_error
            .as_ref()
            .map(|e| format!("file store {}: {}", self.dir.display(), e))
    }

    fn supports_staging(&self) -> bool {
        self.format == FileFormat::Framed
    }

    async fn read_oldest(&mut self) -> Result<Option<Vec<LogEntry>>, StoreError> {
        self.require_staging()?;
        let files = self
            .list_files()
            .await
            .map_err(|e| StoreError::from_io("list staged files", e))?;
        let Some((_, oldest)) = files.into_iter().next() else {
            self.staged_oldest = None;
            return Ok(None);
        };

        // Never read a file that is still being appended to
        if self.current.as_ref().is_some_and(|c| c.path == oldest) {
            self.close_current().await;
        }

        let data = fs::read(&oldest)
            .await
            .map_err(|e| StoreError::from_io(&format!("read {}", oldest.display()), e))?;
        let entries = Self::decode(&oldest, data);
        self.staged_oldest = Some(oldest);
        Ok(Some(entries))
    }

    async fn delete_oldest(&mut self) -> Result<(), StoreError> {
        self.require_staging()?;
        let target = match self.staged_oldest.take() {
            Some(path) => path,
            None => match self
                .list_files()
                .await
                .map_err(|e| StoreError::from_io("list staged files", e))?
                .into_iter()
                .next()
            {
                Some((_, path)) => path,
                None => return Ok(()),
            },
        };

        if self.current.as_ref().is_some_and(|c| c.path == target) {
            self.close_current().await;
        }

        match fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::from_io(&format!("remove {}", target.display()), e)),
        }
    }

    async fn is_empty(&mut self) -> Result<bool, StoreError> {
        let files = self
            .list_files()
            .await
            .map_err(|e| StoreError::from_io("list staged files", e))?;
        for (_, path) in files {
            let len = fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
            if len > 0 {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
