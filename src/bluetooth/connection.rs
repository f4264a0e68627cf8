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

//! Connection worker: one task per connection attempt.

use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::framer::{LineFramer, DEFAULT_MAX_LINE_LEN};
use super::transport::{BoxedStream, DeviceHandle, Transport};
use crate::events::LineProcessor;

/// Default read chunk size.
pub const DEFAULT_READ_CHUNK_SIZE: usize = 1024;

/// Outcome reported by a worker to its session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerReport {
    /// Socket connected; the read loop is starting.
    Connected,
    /// Connect phase failed.
    ConnectFailed(String),
    /// A live connection dropped or was closed by the remote.
    ReadFailed(String),
    /// Stopped through [`WorkerHandle::cancel`].
    Cancelled,
}

/// Callback receiving worker reports, registered at spawn time.
pub type ReportFn = Box<dyn Fn(WorkerReport) + Send + Sync>;

/// Worker tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerConfig {
    pub read_chunk_size: usize,
    pub max_line_len: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            max_line_len: DEFAULT_MAX_LINE_LEN,
        }
    }
}

/// Handle to a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Spawn a worker for `device` on the current Tokio runtime.
    pub fn spawn(
        transport: Arc<dyn Transport>,
        device: DeviceHandle,
        processor: Arc<LineProcessor>,
        config: WorkerConfig,
        report: ReportFn,
    ) -> Self {
        let cancel = CancellationToken::new();
        let worker = ConnectionWorker {
            transport,
            device,
            processor,
            config,
            cancel: cancel.clone(),
            report,
        };

        let task = tokio::spawn(worker.run());
        Self { cancel, task }
    }

    /// Close the socket and stop the worker.
    ///
    /// Interrupts a pending connect or read. The worker then reports
    /// [`WorkerReport::Cancelled`] instead of a failure.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

struct ConnectionWorker {
    transport: Arc<dyn Transport>,
    device: DeviceHandle,
    processor: Arc<LineProcessor>,
    config: WorkerConfig,
    cancel: CancellationToken,
    report: ReportFn,
}

impl ConnectionWorker {
    async fn run(self) {
        info!("Connection worker started for {}", self.device.address);

        let outcome = match self.connect().await {
            Ok(mut stream) => {
                (self.report)(WorkerReport::Connected);
                let outcome = self.read_loop(&mut stream).await;
                // Dropping the stream closes the socket
                drop(stream);
                outcome
            }
            Err(outcome) => outcome,
        };

        debug!("Connection worker for {} finished: {:?}", self.device.address, outcome);
        (self.report)(outcome);
    }

    /// Connect phase.
    async fn connect(&self) -> Result<BoxedStream, WorkerReport> {
        if let Err(e) = self.transport.cancel_discovery().await {
            warn!("Failed to cancel discovery: {}", e);
        }

        info!("Connecting to {}...", self.device.address);

        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(WorkerReport::Cancelled),
            result = self.transport.open(&self.device) => result,
        };

        match result {
            Ok(stream) => {
                info!("Connected to {}", self.device.address);
                Ok(stream)
            }
            Err(_) if self.cancel.is_cancelled() => Err(WorkerReport::Cancelled),
            Err(e) => {
                error!("Connection to {} failed: {}", self.device.address, e);
                Err(WorkerReport::ConnectFailed(e.to_string()))
            }
        }
    }

    /// Read phase. Runs until the stream fails or the worker is cancelled.
    async fn read_loop(&self, stream: &mut BoxedStream) -> WorkerReport {
        let mut framer = LineFramer::with_max_line_len(self.config.max_line_len);
        let mut buf = vec![0u8; self.config.read_chunk_size.max(1)];

        loop {
            let read = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return WorkerReport::Cancelled,
                read = stream.read(&mut buf) => read,
            };

            match read {
                Ok(0) => {
                    if self.cancel.is_cancelled() {
                        return WorkerReport::Cancelled;
                    }
                    info!("Connection closed by remote");
                    return WorkerReport::ReadFailed("connection closed by remote".to_string());
                }
                Ok(_) if self.cancel.is_cancelled() => return WorkerReport::Cancelled,
                Ok(n) => {
                    if let Err(e) = framer.feed(&buf[..n]) {
                        warn!("Malformed stream from {}: {}", self.device.address, e);
                    }
                    for line in framer.lines() {
                        if self.cancel.is_cancelled() {
                            return WorkerReport::Cancelled;
                        }
                        self.processor.process_line(line);
                    }
                }
                Err(_) if self.cancel.is_cancelled() => return WorkerReport::Cancelled,
                Err(e) => {
                    error!("Read error: {}", e);
                    return WorkerReport::ReadFailed(e.to_string());
                }
            }
        }
    }
}
