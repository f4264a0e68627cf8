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

//! Event processing and dispatch to consumers.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::bluetooth::{parse_line, Reading};
use crate::state::ConnectionState;
use crate::storage::ReadingStore;

/// Events delivered to session consumers.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The session entered a new state.
    StateChanged(ConnectionState),
    /// A complete line arrived from the sensor.
    LineReceived {
        /// Raw line bytes, delimiter stripped.
        line: Vec<u8>,
        /// Parsed reading, present only while measuring and if the line parsed.
        reading: Option<Reading>,
    },
}

/// Registry of event consumers.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<SessionEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a consumer. Dropping the receiver unregisters it.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SessionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Deliver an event to every live consumer.
    pub fn publish(&self, event: SessionEvent) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }
}

/// Turns received lines into readings and events.
pub struct LineProcessor {
    store: ReadingStore,
    events: Arc<EventBus>,
    measuring: AtomicBool,
}

impl LineProcessor {
    /// Create a new line processor.
    pub fn new(store: ReadingStore, events: Arc<EventBus>) -> Self {
        Self {
            store,
            events,
            measuring: AtomicBool::new(false),
        }
    }

    /// Handle one framed line.
    ///
    /// Lines are always published raw; they are parsed and stored only while
    /// measuring. Rejected lines are logged and otherwise ignored.
    pub fn process_line(&self, line: Vec<u8>) {
        let text = String::from_utf8_lossy(&line);
        debug!("Received: {}", text);

        let reading = if self.is_measuring() {
            match parse_line(&text) {
                Ok(reading) => {
                    self.store.append(reading.clone());
                    Some(reading)
                }
                Err(e) => {
                    warn!("Rejected line {:?}: {}", text, e);
                    None
                }
            }
        } else {
            None
        };

        self.events
            .publish(SessionEvent::LineReceived { line, reading });
    }

    pub fn set_measuring(&self, measuring: bool) {
        let was = self.measuring.swap(measuring, Ordering::SeqCst);
        if was != measuring {
            info!("Measuring {}", if measuring { "started" } else { "stopped" });
        }
    }

    pub fn is_measuring(&self) -> bool {
        self.measuring.load(Ordering::SeqCst)
    }

    pub fn store(&self) -> &ReadingStore {
        &self.store
    }
}
