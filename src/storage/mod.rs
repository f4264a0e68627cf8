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

//! Storage module.
//!
//! Recent readings live in a bounded in-memory buffer; a durable store,
//! when configured, keeps the full history.

mod readings;
mod retention;
mod stats;

pub use readings::ReadingDb;
pub use retention::{RetentionBuffer, DEFAULT_RETENTION_CAPACITY};
pub use stats::ReadingSummary;

use anyhow::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{debug, info, warn};

use crate::bluetooth::Reading;

/// Default age after which durable readings are deleted.
pub const DEFAULT_MAX_AGE_DAYS: u32 = 7;

/// Persistent reading storage.
pub trait DurableStore: Send + Sync {
    /// Persist one reading.
    fn append(&self, reading: &Reading) -> Result<()>;

    /// Readings from the last `days` days, newest first.
    fn query_last_days(&self, days: u32) -> Result<Vec<Reading>>;

    /// Delete readings older than `age`, returning how many were removed.
    fn delete_older_than(&self, age: chrono::Duration) -> Result<usize>;

    /// Delete everything.
    fn clear_all(&self) -> Result<()>;
}

/// Sink for accepted readings.
///
/// Persistence failures are logged and never affect the in-memory buffer.
pub struct ReadingStore {
    retention: Mutex<RetentionBuffer>,
    durable: Option<Arc<dyn DurableStore>>,
    max_age: chrono::Duration,
    prune_interval: StdDuration,
    last_prune: Mutex<Option<Instant>>,
}

impl ReadingStore {
    /// Create a memory-only store.
    pub fn new(capacity: usize) -> Self {
        Self {
            retention: Mutex::new(RetentionBuffer::new(capacity)),
            durable: None,
            max_age: chrono::Duration::days(i64::from(DEFAULT_MAX_AGE_DAYS)),
            prune_interval: StdDuration::from_secs(60),
            last_prune: Mutex::new(None),
        }
    }

    /// Attach a durable store.
    pub fn with_durable(mut self, durable: Arc<dyn DurableStore>) -> Self {
        self.durable = Some(durable);
        self
    }

    /// Set how old durable readings may get and how often to check.
    pub fn with_ageing(mut self, max_age: chrono::Duration, prune_interval: StdDuration) -> Self {
        self.max_age = max_age;
        self.prune_interval = prune_interval;
        self
    }

    /// Store an accepted reading.
    ///
    /// Durable writes are synchronous. On a multi-threaded runtime they run
    /// through `block_in_place` so other tasks keep moving.
    pub fn append(&self, reading: Reading) {
        if let Some(durable) = &self.durable {
            run_blocking(|| {
                if let Err(e) = durable.append(&reading) {
                    warn!("Failed to persist reading: {}", e);
                }
                self.prune_if_due(durable.as_ref());
            });
        }

        if let Some(evicted) = self.retention.lock().push(reading) {
            debug!("Retention buffer full, evicted reading from {}", evicted.timestamp());
        }
    }

    fn prune_if_due(&self, durable: &dyn DurableStore) {
        let due = {
            let mut last = self.last_prune.lock();
            match *last {
                Some(at) if at.elapsed() < self.prune_interval => false,
                _ => {
                    *last = Some(Instant::now());
                    true
                }
            }
        };

        if !due {
            return;
        }

        match durable.delete_older_than(self.max_age) {
            Ok(0) => {}
            Ok(deleted) => info!("Deleted {} expired readings", deleted),
            Err(e) => warn!("Failed to delete expired readings: {}", e),
        }
    }

    /// Copy of the retained readings, oldest first.
    pub fn snapshot(&self) -> Vec<Reading> {
        self.retention.lock().snapshot()
    }

    /// Most recent retained reading.
    pub fn latest(&self) -> Option<Reading> {
        self.retention.lock().latest().cloned()
    }

    pub fn len(&self) -> usize {
        self.retention.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.retention.lock().is_empty()
    }

    /// Empty the in-memory buffer. Durable copies are kept.
    pub fn clear(&self) {
        self.retention.lock().clear();
    }

    pub fn durable(&self) -> Option<&Arc<dyn DurableStore>> {
        self.durable.as_ref()
    }
}

fn run_blocking<T>(f: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

impl Default for ReadingStore {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION_CAPACITY)
    }
}
