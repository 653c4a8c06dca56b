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

// Store factory: builds a store tree from its declarative configuration

use super::backend::Store;
use super::bucket::BucketStore;
use super::buffer::BufferStore;
use super::file::FileStore;
use super::forward::ForwardStore;
use super::multi::MultiStore;
use super::null::NullStore;
use crate::config::StoreConfig;
use crate::error::ConfigError;

pub struct StoreFactory;

impl StoreFactory {
    /// Build a fresh, unopened store tree for `category`.
    ///
    /// Every call produces new instances, so two categories built from the
    /// same configuration never share a child store.
    pub fn build(config: &StoreConfig, category: &str) -> Result<Box<dyn Store>, ConfigError> {
        match config {
            StoreConfig::File(file) => {
                if file.file_path.trim().is_empty() {
                    return Err(ConfigError::invalid(format!(
                        "file store for '{}' requires file_path",
                        category
                    )));
                }
                if file.max_size == 0 {
                    return Err(ConfigError::invalid(format!(
                        "file store for '{}' has max_size 0",
                        category
                    )));
                }
                Ok(Box::new(FileStore::new(file.clone(), category)))
            }

            StoreConfig::Forward(forward) => {
                if forward.remote_host.trim().is_empty() {
                    return Err(ConfigError::invalid(format!(
                        "forward store for '{}' requires remote_host",
                        category
                    )));
                }
                if forward.remote_port == 0 {
                    return Err(ConfigError::invalid(format!(
                        "forward store for '{}' requires a non-zero remote_port",
                        category
                    )));
                }
                Ok(Box::new(ForwardStore::new(forward.clone())))
            }

            StoreConfig::Buffer(buffer) => {
                let primary = Self::build(&buffer.primary, category)?;
                let secondary = Self::build(&buffer.secondary, category)?;
                if !secondary.supports_staging() {
                    return Err(ConfigError::invalid(format!(
                        "buffer store for '{}' needs a secondary that can be replayed \
                         (a file store with format: framed), got {}",
                        category,
                        secondary.store_type()
                    )));
                }
                Ok(Box::new(BufferStore::new(primary, secondary, buffer)))
            }

            StoreConfig::Multi(multi) => {
                if multi.stores.is_empty() {
                    return Err(ConfigError::invalid(format!(
                        "multi store for '{}' has no stores",
                        category
                    )));
                }
                let children = multi
                    .stores
                    .iter()
                    .map(|child| Self::build(child, category))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Box::new(MultiStore::new(children, multi.report_success)))
            }

            StoreConfig::Bucket(bucket) => {
                if bucket.num_buckets == 0 {
                    return Err(ConfigError::invalid(format!(
                        "bucket store for '{}' requires num_buckets > 0",
                        category
                    )));
                }
                if bucket.delimiter.is_empty() {
                    return Err(ConfigError::invalid(format!(
                        "bucket store for '{}' has an empty delimiter",
                        category
                    )));
                }

                let children = if !bucket.buckets.is_empty() {
                    if bucket.buckets.len() != bucket.num_buckets {
                        return Err(ConfigError::invalid(format!(
                            "bucket store for '{}' declares {} buckets but lists {}",
                            category,
                            bucket.num_buckets,
                            bucket.buckets.len()
                        )));
                    }
                    bucket
                        .buckets
                        .iter()
                        .map(|child| Self::build(child, category))
                        .collect::<Result<Vec<_>, _>>()?
                } else if let Some(template) = &bucket.bucket {
                    (0..bucket.num_buckets)
                        .map(|i| {
                            Self::build(&template.with_subdirectory(&format!("bucket{:03}", i)), category)
                        })
                        .collect::<Result<Vec<_>, _>>()?
                } else {
                    return Err(ConfigError::invalid(format!(
                        "bucket store for '{}' needs either bucket or buckets",
                        category
                    )));
                };

                Ok(Box::new(BucketStore::new(
                    bucket.bucket_type,
                    &bucket.delimiter,
                    bucket.remove_key,
                    children,
                )))
            }

            StoreConfig::Null => Ok(Box::new(NullStore::new())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        BucketStoreConfig, BucketType, BufferStoreConfig, FileFormat, FileStoreConfig,
        ForwardStoreConfig, MultiStoreConfig, ReportSuccess,
    };

    fn file(path: &str, format: FileFormat) -> StoreConfig {
        StoreConfig::File(FileStoreConfig {
            file_path: path.to_string(),
            format,
            ..Default::default()
        })
    }

    #[test]
    fn test_build_each_leaf() {
        let store = StoreFactory::build(&file("/tmp/x", FileFormat::Plain), "c").unwrap();
        assert_eq!(store.store_type(), "file");

        let forward = StoreConfig::Forward(ForwardStoreConfig {
            remote_host: "localhost".to_string(),
            remote_port: 1463,
            timeout_ms: 1_000,
        });
        assert_eq!(StoreFactory::build(&forward, "c").unwrap().store_type(), "forward");
        assert_eq!(StoreFactory::build(&StoreConfig::Null, "c").unwrap().store_type(), "null");
    }

    #[test]
    fn test_buffer_requires_framed_secondary() {
        let config = |format| {
            StoreConfig::Buffer(BufferStoreConfig {
                primary: Box::new(StoreConfig::Null),
                secondary: Box::new(file("/tmp/buf", format)),
                retry_interval_ms: 1_000,
                drain_files_per_check: 10,
                replay_buffer: true,
            })
        };

        let err = StoreFactory::build(&config(FileFormat::Plain), "c").err().unwrap();
        assert!(matches!(err, ConfigError::Invalid(_)));
        assert_eq!(
            StoreFactory::build(&config(FileFormat::Framed), "c").unwrap().store_type(),
            "buffer"
        );
    }

    #[test]
    fn test_empty_multi_is_invalid() {
        let config = StoreConfig::Multi(MultiStoreConfig {
            stores: vec![],
            report_success: ReportSuccess::All,
        });
        assert!(StoreFactory::build(&config, "c").is_err());
    }

    #[test]
    fn test_bucket_child_count_must_match() {
        let config = StoreConfig::Bucket(BucketStoreConfig {
            bucket_type: BucketType::KeyHash,
            num_buckets: 3,
            delimiter: ":".to_string(),
            remove_key: false,
            bucket: None,
            buckets: vec![StoreConfig::Null, StoreConfig::Null],
        });
        assert!(StoreFactory::build(&config, "c").is_err());
    }

    #[test]
    fn test_bucket_template_expands() {
        let config = StoreConfig::Bucket(BucketStoreConfig {
            bucket_type: BucketType::Category,
            num_buckets: 4,
            delimiter: ":".to_string(),
            remove_key: false,
            bucket: Some(Box::new(file("/tmp/buckets", FileFormat::Plain))),
            buckets: vec![],
        });
        assert_eq!(StoreFactory::build(&config, "c").unwrap().store_type(), "bucket");
    }

    #[test]
    fn test_invalid_leaf_nested_in_multi_fails_whole_tree() {
        let config = StoreConfig::Multi(MultiStoreConfig {
            stores: vec![
                StoreConfig::Null,
                StoreConfig::Forward(ForwardStoreConfig {
                    remote_host: "".to_string(),
                    remote_port: 1463,
                    timeout_ms: 1_000,
                }),
            ],
            report_success: ReportSuccess::All,
        });
        let err = StoreFactory::build(&config, "c").err().unwrap();
        assert!(err.to_string().contains("remote_host"));
    }
}
