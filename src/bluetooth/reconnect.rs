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

//! Reconnect policy for dropped connections.

use std::time::Duration;

/// Default number of automatic reconnects per explicit connect.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 3;

/// Default wait before each automatic reconnect.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(3000);

/// Bounded, fixed-delay reconnect policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl ReconnectPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// Decide whether a dropped connection should be retried.
    ///
    /// `attempts` counts automatic reconnects already made since the last
    /// explicit connect.
    pub fn should_retry(&self, auto_reconnect: bool, has_address: bool, attempts: u32) -> bool {
        auto_reconnect && has_address && attempts < self.max_attempts
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RECONNECT_ATTEMPTS, DEFAULT_RECONNECT_DELAY)
    }
}
