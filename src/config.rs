// Copyright 2026 Daniel Pelikan
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

//! Configuration module.
//!
//! Handles loading and saving application settings.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::bluetooth::{
    ReconnectPolicy, SessionOptions, WorkerConfig, DEFAULT_MAX_LINE_LEN,
    DEFAULT_MAX_RECONNECT_ATTEMPTS, DEFAULT_READ_CHUNK_SIZE, DEFAULT_RFCOMM_CHANNEL,
};
use crate::storage::{ReadingStore, DEFAULT_MAX_AGE_DAYS, DEFAULT_RETENTION_CAPACITY};

const APP_DIR: &str = "blueteeth";

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for the reading database.
    #[serde(skip)]
    pub data_dir: PathBuf,

    /// Bluetooth settings.
    pub bluetooth: BluetoothConfig,

    /// Reconnect settings.
    pub reconnect: ReconnectConfig,

    /// Storage settings.
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    /// Sensor to connect to when none is given on the command line.
    pub device_address: Option<String>,

    /// RFCOMM channel of the SPP service.
    pub rfcomm_channel: u8,

    /// Bytes requested per socket read.
    pub read_chunk_size: usize,

    /// Longest accepted unterminated line.
    pub max_line_len: usize,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            device_address: None,
            rfcomm_channel: DEFAULT_RFCOMM_CHANNEL,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            max_line_len: DEFAULT_MAX_LINE_LEN,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Reconnect after the link drops.
    pub auto_reconnect: bool,

    /// Reconnects allowed before giving up.
    pub max_attempts: u32,

    /// Delay before each reconnect in milliseconds.
    pub delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            max_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            delay_ms: 3000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Readings kept in memory.
    pub retention_capacity: usize,

    /// Days a reading is kept in the database.
    pub max_age_days: u32,

    /// Minimum seconds between expiry sweeps.
    pub prune_interval_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            retention_capacity: DEFAULT_RETENTION_CAPACITY,
            max_age_days: DEFAULT_MAX_AGE_DAYS,
            prune_interval_secs: 60,
        }
    }
}

impl Config {
    /// Load configuration from file or create default.
    pub fn load() -> Result<Self> {
        let config_dir = config_dir();
        std::fs::create_dir_all(&config_dir)?;

        let mut config = Self::load_from(&config_dir.join("config.toml"))?;

        // Set data directory
        config.data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR);
        std::fs::create_dir_all(&config.data_dir)?;

        Ok(config)
    }

    /// Load from `path`, writing defaults there if it does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Self::from_toml_str(&content)
        } else {
            let config = Self::default();
            std::fs::write(path, toml::to_string_pretty(&config)?)?;
            Ok(config)
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Save configuration to file.
    pub fn save(&self) -> Result<()> {
        let config_path = config_dir().join("config.toml");
        let content = toml::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;

        Ok(())
    }

    /// Session manager options.
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            policy: ReconnectPolicy::new(
                self.reconnect.max_attempts,
                Duration::from_millis(self.reconnect.delay_ms),
            ),
            auto_reconnect: self.reconnect.auto_reconnect,
            worker: WorkerConfig {
                read_chunk_size: self.bluetooth.read_chunk_size.max(1),
                max_line_len: self.bluetooth.max_line_len,
            },
        }
    }

    /// Memory-only reading store with the configured retention and ageing.
    pub fn reading_store(&self) -> ReadingStore {
        ReadingStore::new(self.storage.retention_capacity).with_ageing(
            chrono::Duration::days(i64::from(self.storage.max_age_days)),
            Duration::from_secs(self.storage.prune_interval_secs),
        )
    }
}

fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}
