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

//! Bluetooth communication module.
//!
//! Maintains the SPP connection to the sensor and turns its byte stream
//! into readings.

mod connection;
mod framer;
mod protocol;
mod reconnect;
mod session;
mod transport;

pub use connection::{WorkerConfig, WorkerHandle, WorkerReport, DEFAULT_READ_CHUNK_SIZE};
pub use framer::{FrameError, LineFramer, Lines, DEFAULT_MAX_LINE_LEN, DELIMITER};
pub use protocol::{parse_line, parse_line_at, ParseError, Reading, ReadingKind};
pub use reconnect::{ReconnectPolicy, DEFAULT_MAX_RECONNECT_ATTEMPTS, DEFAULT_RECONNECT_DELAY};
pub use session::{SessionManager, SessionOptions};
pub use transport::{
    BoxedStream, ByteStream, DeviceHandle, RfcommTransport, Transport, TransportError,
    DEFAULT_RFCOMM_CHANNEL, SPP_UUID,
};
