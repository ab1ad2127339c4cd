/*
 * Copyright (c) 2024 Yunshan Networks
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::fs;
use std::path::Path;

use ahash::AHashMap;
use log::warn;
use serde::Deserialize;
use thiserror::Error;

use crate::common::l7_protocol_log::L7ProtocolBitmap;

use public::l7_protocol::L7Protocol;
use public::queue::DropPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file {0} read failed: {1}")]
    YamlConfigFileReadFailed(String, String),
    #[error("yaml config file {0} invalid: {1}")]
    YamlConfigInvalid(String, String),
}

// durations are in seconds
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    // 0 selects the number of cpus
    pub workers: usize,

    pub connection_idle_ttl: u64,
    pub request_timeout: u64,
    pub eviction_interval: u64,
    pub shutdown_drain_timeout: u64,

    pub max_connections: usize,
    pub max_pending_per_connection: usize,
    pub max_partial_buffer: usize,
    pub identification_max_retries: usize,

    pub input_queue_size: usize,
    pub output_queue_size: usize,
    pub drop_policy: DropPolicyConfig,

    // overrides the built-in well known server port table
    pub port_protocol_map: AHashMap<u16, Vec<String>>,
    pub l7_protocol_enabled: Vec<String>,

    pub stats_interval: u64,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicyConfig {
    DropOldest,
    DropNewest,
}

impl From<DropPolicyConfig> for DropPolicy {
    fn from(p: DropPolicyConfig) -> Self {
        match p {
            DropPolicyConfig::DropOldest => DropPolicy::DropOldest,
            DropPolicyConfig::DropNewest => DropPolicy::DropNewest,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: 0,
            connection_idle_ttl: 120,
            request_timeout: 60,
            eviction_interval: 5,
            shutdown_drain_timeout: 2,
            max_connections: 100_000,
            max_pending_per_connection: 16,
            max_partial_buffer: 1 << 20,
            identification_max_retries: 5,
            input_queue_size: 8192,
            output_queue_size: 1 << 16,
            drop_policy: DropPolicyConfig::DropOldest,
            port_protocol_map: default_port_protocol_map(),
            l7_protocol_enabled: vec![
                "http".to_owned(),
                "mysql".to_owned(),
                "redis".to_owned(),
                "dns".to_owned(),
                "kafka".to_owned(),
                "dubbo".to_owned(),
                "rocketmq".to_owned(),
            ],
            stats_interval: 10,
        }
    }
}

fn default_port_protocol_map() -> AHashMap<u16, Vec<String>> {
    [
        (80u16, vec!["http".to_owned()]),
        (8080, vec!["http".to_owned()]),
        (3306, vec!["mysql".to_owned()]),
        (6379, vec!["redis".to_owned()]),
        (53, vec!["dns".to_owned()]),
        (9092, vec!["kafka".to_owned()]),
        (20880, vec!["dubbo".to_owned()]),
        (9876, vec!["rocketmq".to_owned()]),
        (10911, vec!["rocketmq".to_owned()]),
    ]
    .into_iter()
    .collect()
}

impl Config {
    pub fn load_from_file<T: AsRef<Path>>(path: T) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(&path).map_err(|e| {
            ConfigError::YamlConfigFileReadFailed(
                path.as_ref().display().to_string(),
                e.to_string(),
            )
        })?;
        Self::load(&contents).map_err(|e| {
            ConfigError::YamlConfigInvalid(path.as_ref().display().to_string(), e)
        })
    }

    pub fn load(contents: &str) -> Result<Self, String> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        let mut config =
            serde_yaml::from_str::<Self>(contents).map_err(|e| e.to_string())?;
        config.adjust();
        Ok(config)
    }

    fn adjust(&mut self) {
        if self.workers == 0 {
            self.workers = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1);
        }
        if self.max_connections == 0 {
            warn!("max_connections must be positive, fallback to default");
            self.max_connections = Self::default().max_connections;
        }
        if self.max_pending_per_connection == 0 {
            self.max_pending_per_connection = Self::default().max_pending_per_connection;
        }
    }

    pub fn effective_workers(&self) -> usize {
        if self.workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            self.workers
        }
    }

    pub fn resolved_port_map(&self) -> AHashMap<u16, Vec<L7Protocol>> {
        let mut map = AHashMap::new();
        for (port, names) in self.port_protocol_map.iter() {
            let protocols = names
                .iter()
                .map(|n| L7Protocol::from(n.as_str()))
                .filter(|p| *p != L7Protocol::Unknown)
                .collect::<Vec<_>>();
            if protocols.is_empty() {
                warn!("port {} maps to no known protocol, ignored", port);
                continue;
            }
            map.insert(*port, protocols);
        }
        map
    }
}

/// Resolved analyzer options in the units the tracker works with.
#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    pub max_connections: usize,
    pub max_pending_per_connection: usize,
    pub max_partial_buffer: usize,
    pub identification_max_retries: usize,
    pub connection_idle_ttl_ns: u64,
    pub request_timeout_ns: u64,
    pub port_map: AHashMap<u16, Vec<L7Protocol>>,
    pub l7_protocol_enabled: L7ProtocolBitmap,
}

impl From<&Config> for AnalyzerConfig {
    fn from(c: &Config) -> Self {
        Self {
            max_connections: c.max_connections,
            max_pending_per_connection: c.max_pending_per_connection,
            max_partial_buffer: c.max_partial_buffer,
            identification_max_retries: c.identification_max_retries,
            connection_idle_ttl_ns: c.connection_idle_ttl * 1_000_000_000,
            request_timeout_ns: c.request_timeout * 1_000_000_000,
            port_map: c.resolved_port_map(),
            l7_protocol_enabled: L7ProtocolBitmap::from(&c.l7_protocol_enabled),
        }
    }
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        (&Config::default()).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::load("").unwrap();
        assert_eq!(config.connection_idle_ttl, 120);
        assert_eq!(config.max_pending_per_connection, 16);
        assert_eq!(
            config.resolved_port_map().get(&3306),
            Some(&vec![L7Protocol::MySQL])
        );
    }

    #[test]
    fn overrides() {
        let yaml = r#"
workers: 4
request_timeout: 30
drop_policy: drop_newest
port_protocol_map:
  15000: [http, dubbo]
"#;
        let config = Config::load(yaml).unwrap();
        assert_eq!(config.workers, 4);
        assert_eq!(config.request_timeout, 30);
        assert_eq!(config.drop_policy, DropPolicyConfig::DropNewest);
        assert_eq!(
            config.resolved_port_map().get(&15000),
            Some(&vec![L7Protocol::Http1, L7Protocol::Dubbo])
        );
        // yaml overrides replace the whole map
        assert!(config.resolved_port_map().get(&3306).is_none());
    }

    #[test]
    fn unknown_protocol_names_ignored() {
        let yaml = "port_protocol_map:\n  9999: [nope]\n";
        let config = Config::load(yaml).unwrap();
        assert!(config.resolved_port_map().get(&9999).is_none());
    }
}
