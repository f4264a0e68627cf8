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

//! Session state management.

use serde::Serialize;
use std::fmt;

use crate::bluetooth::WorkerHandle;

/// Connection state of the sensor session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    ConnectionFailed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting...",
            ConnectionState::Connected => "Connected",
            ConnectionState::ConnectionFailed => "Connection failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable session data, guarded by the session manager's lock.
#[derive(Debug)]
pub(crate) struct Session {
    /// Current connection state.
    pub state: ConnectionState,

    /// Address of the last targeted device.
    pub last_address: Option<String>,

    /// Automatic reconnects since the last explicit connect.
    pub reconnect_attempts: u32,

    /// Whether read failures trigger a reconnect.
    pub auto_reconnect: bool,

    /// A reconnect is waiting for its delay to pass.
    pub reconnect_pending: bool,

    /// Bumped on every connect and disconnect; reports and retries
    /// carrying an older value are stale.
    pub generation: u64,

    /// The live worker, owning the socket.
    pub worker: Option<WorkerHandle>,
}

impl Session {
    pub fn new(auto_reconnect: bool) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            last_address: None,
            reconnect_attempts: 0,
            auto_reconnect,
            reconnect_pending: false,
            generation: 0,
            worker: None,
        }
    }

    /// Cancel the live worker, closing its socket. Returns whether one existed.
    pub fn teardown_worker(&mut self) -> bool {
        match self.worker.take() {
            Some(worker) => {
                worker.cancel();
                true
            }
            None => false,
        }
    }

    /// Start a new generation, invalidating in-flight reports and retries.
    pub fn next_generation(&mut self) -> u64 {
        self.generation = self.generation.wrapping_add(1);
        self.generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_session() {
        let session = Session::new(true);
        assert_eq!(session.state, ConnectionState::Disconnected);
        assert!(session.last_address.is_none());
        assert_eq!(session.reconnect_attempts, 0);
        assert!(!session.reconnect_pending);
        assert!(session.worker.is_none());
    }

    #[test]
    fn test_generation_and_teardown() {
        let mut session = Session::new(false);
        assert_eq!(session.next_generation(), 1);
        assert_eq!(session.next_generation(), 2);
        assert!(!session.teardown_worker());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "Connected");
        assert_eq!(
            ConnectionState::ConnectionFailed.to_string(),
            "Connection failed"
        );
    }
}
