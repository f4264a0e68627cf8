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

//! Bounded in-memory retention of recent readings.

use std::collections::VecDeque;

use crate::bluetooth::Reading;

/// Default number of readings kept in memory.
pub const DEFAULT_RETENTION_CAPACITY: usize = 1000;

/// FIFO buffer that evicts the oldest reading once full.
#[derive(Debug, Clone)]
pub struct RetentionBuffer {
    readings: VecDeque<Reading>,
    capacity: usize,
}

impl RetentionBuffer {
    /// Create a buffer holding at most `capacity` readings (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            readings: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a reading, returning the evicted one if the buffer was full.
    pub fn push(&mut self, reading: Reading) -> Option<Reading> {
        let evicted = if self.readings.len() >= self.capacity {
            self.readings.pop_front()
        } else {
            None
        };
        self.readings.push_back(reading);
        evicted
    }

    /// Copy of the buffered readings, oldest first.
    pub fn snapshot(&self) -> Vec<Reading> {
        self.readings.iter().cloned().collect()
    }

    pub fn latest(&self) -> Option<&Reading> {
        self.readings.back()
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.readings.clear();
    }
}

impl Default for RetentionBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION_CAPACITY)
    }
}
