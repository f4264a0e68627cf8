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

//! Session manager: connect, disconnect, failure and reconnect handling.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::connection::{ReportFn, WorkerConfig, WorkerHandle, WorkerReport};
use super::protocol::Reading;
use super::reconnect::ReconnectPolicy;
use super::transport::Transport;
use crate::events::{EventBus, LineProcessor, SessionEvent};
use crate::state::{ConnectionState, Session};
use crate::storage::ReadingStore;

/// Session tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    pub policy: ReconnectPolicy,
    pub auto_reconnect: bool,
    pub worker: WorkerConfig,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            policy: ReconnectPolicy::default(),
            auto_reconnect: true,
            worker: WorkerConfig::default(),
        }
    }
}

/// What started a connection attempt.
#[derive(Debug, Clone, Copy)]
enum ConnectTrigger {
    /// A caller asked for it; resets the reconnect counter.
    Explicit,
    /// A scheduled reconnect, valid only within its generation.
    Retry { generation: u64 },
}

/// Manages the connection to one sensor.
///
/// All methods return immediately; socket I/O runs on a worker task and
/// every outcome is reported through [`SessionEvent`]s. Methods that start
/// a connection must be called from within a Tokio runtime.
pub struct SessionManager {
    core: Arc<SessionCore>,
}

struct SessionCore {
    transport: Arc<dyn Transport>,
    session: Mutex<Session>,
    processor: Arc<LineProcessor>,
    events: Arc<EventBus>,
    policy: ReconnectPolicy,
    worker_config: WorkerConfig,
}

impl SessionManager {
    /// Create a new session manager.
    pub fn new(transport: Arc<dyn Transport>, store: ReadingStore, options: SessionOptions) -> Self {
        let events = Arc::new(EventBus::new());
        let processor = Arc::new(LineProcessor::new(store, events.clone()));

        Self {
            core: Arc::new(SessionCore {
                transport,
                session: Mutex::new(Session::new(options.auto_reconnect)),
                processor,
                events,
                policy: options.policy,
                worker_config: options.worker,
            }),
        }
    }

    /// Register a consumer for state and line events.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SessionEvent> {
        self.core.events.subscribe()
    }

    /// Connect to the device at `address`, replacing any current connection.
    pub fn connect(&self, address: &str) {
        self.core.start_connection(address, ConnectTrigger::Explicit);
    }

    /// Close the connection. Never triggers a reconnect.
    pub fn disconnect(&self) {
        let mut session = self.core.session.lock();
        info!("Disconnect requested");

        session.teardown_worker();
        // Invalidates pending reconnects
        session.next_generation();
        session.reconnect_pending = false;
        self.core.transition(&mut session, ConnectionState::Disconnected);
    }

    pub fn state(&self) -> ConnectionState {
        self.core.session.lock().state
    }

    pub fn last_address(&self) -> Option<String> {
        self.core.session.lock().last_address.clone()
    }

    /// Automatic reconnects made since the last explicit connect.
    pub fn reconnect_attempts(&self) -> u32 {
        self.core.session.lock().reconnect_attempts
    }

    pub fn set_auto_reconnect(&self, enabled: bool) {
        self.core.session.lock().auto_reconnect = enabled;
        info!("Auto-reconnect {}", if enabled { "enabled" } else { "disabled" });
    }

    pub fn auto_reconnect(&self) -> bool {
        self.core.session.lock().auto_reconnect
    }

    /// Whether a reconnect is scheduled but has not started yet.
    pub fn is_reconnect_pending(&self) -> bool {
        self.core.session.lock().reconnect_pending
    }

    /// Whether the session has stopped for good: not connected, no
    /// connection in progress and no reconnect scheduled.
    ///
    /// Reads the live state, so it stays accurate for consumers that
    /// handle events late.
    pub fn is_inactive(&self) -> bool {
        let session = self.core.session.lock();
        matches!(
            session.state,
            ConnectionState::Disconnected | ConnectionState::ConnectionFailed
        ) && !session.reconnect_pending
    }

    /// Whether a worker currently owns a connection attempt or socket.
    pub fn has_active_worker(&self) -> bool {
        self.core
            .session
            .lock()
            .worker
            .as_ref()
            .is_some_and(|worker| !worker.is_finished())
    }

    /// Start parsing and storing readings. Only possible while connected.
    pub fn start_measuring(&self) -> bool {
        let session = self.core.session.lock();
        if session.state != ConnectionState::Connected {
            debug!("Cannot start measuring while {}", session.state);
            return false;
        }
        self.core.processor.set_measuring(true);
        true
    }

    pub fn stop_measuring(&self) {
        self.core.processor.set_measuring(false);
    }

    pub fn is_measuring(&self) -> bool {
        self.core.processor.is_measuring()
    }

    /// Copy of the retained readings, oldest first.
    pub fn readings(&self) -> Vec<Reading> {
        self.core.processor.store().snapshot()
    }

    /// Empty the retention buffer. Durable copies are kept.
    pub fn clear_readings(&self) {
        self.core.processor.store().clear();
    }

    pub fn store(&self) -> &ReadingStore {
        self.core.processor.store()
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        let mut session = self.core.session.lock();
        session.next_generation();
        session.teardown_worker();
    }
}

impl SessionCore {
    fn start_connection(self: &Arc<Self>, address: &str, trigger: ConnectTrigger) {
        let mut session = self.session.lock();

        match trigger {
            ConnectTrigger::Explicit => {
                info!("Connecting to device: {}", address);
                session.reconnect_attempts = 0;
            }
            ConnectTrigger::Retry { generation } => {
                if session.generation != generation {
                    debug!("Skipping stale reconnect to {}", address);
                    return;
                }
                info!(
                    "Reconnecting to {} (attempt {}/{})",
                    address, session.reconnect_attempts, self.policy.max_attempts
                );
            }
        }

        if session.teardown_worker() {
            debug!("Closed previous connection");
        }
        session.reconnect_pending = false;
        let generation = session.next_generation();
        session.last_address = Some(address.to_string());

        let device = match self.transport.resolve(address) {
            Ok(device) => device,
            Err(e) => {
                error!("Cannot resolve device {}: {}", address, e);
                self.transition(&mut session, ConnectionState::ConnectionFailed);
                return;
            }
        };

        let core: Weak<SessionCore> = Arc::downgrade(self);
        let report: ReportFn = Box::new(move |report| {
            if let Some(core) = core.upgrade() {
                core.handle_report(generation, report);
            }
        });

        session.worker = Some(WorkerHandle::spawn(
            self.transport.clone(),
            device,
            self.processor.clone(),
            self.worker_config,
            report,
        ));
        self.transition(&mut session, ConnectionState::Connecting);
    }

    fn handle_report(self: &Arc<Self>, generation: u64, report: WorkerReport) {
        let mut session = self.session.lock();

        if session.generation != generation {
            debug!("Ignoring {:?} from a replaced worker", report);
            return;
        }

        match report {
            WorkerReport::Connected => {
                self.transition(&mut session, ConnectionState::Connected);
            }
            WorkerReport::ConnectFailed(reason) => {
                warn!("Connection failed: {}", reason);
                session.worker = None;
                self.transition(&mut session, ConnectionState::ConnectionFailed);
            }
            WorkerReport::ReadFailed(reason) => {
                warn!("Connection lost: {}", reason);
                session.worker = None;
                self.transition(&mut session, ConnectionState::Disconnected);
                self.schedule_reconnect(&mut session);
            }
            WorkerReport::Cancelled => {
                session.worker = None;
            }
        }
    }

    fn schedule_reconnect(self: &Arc<Self>, session: &mut Session) {
        let Some(address) = session.last_address.clone() else {
            return;
        };

        if !self
            .policy
            .should_retry(session.auto_reconnect, true, session.reconnect_attempts)
        {
            if session.auto_reconnect {
                warn!(
                    "Reached maximum reconnect attempts: {}",
                    self.policy.max_attempts
                );
            }
            return;
        }

        session.reconnect_attempts += 1;
        session.reconnect_pending = true;
        let generation = session.generation;
        let delay = self.policy.delay;
        info!(
            "Reconnecting in {} ms (attempt {}/{})",
            delay.as_millis(),
            session.reconnect_attempts,
            self.policy.max_attempts
        );

        let core = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(core) = core.upgrade() {
                core.start_connection(&address, ConnectTrigger::Retry { generation });
            }
        });
    }

    fn transition(&self, session: &mut Session, next: ConnectionState) {
        let previous = session.state;
        session.state = next;
        info!("Connection state: {} -> {}", previous, next);

        if next == ConnectionState::Disconnected {
            self.processor.set_measuring(false);
        }

        self.events.publish(SessionEvent::StateChanged(next));
    }
}
