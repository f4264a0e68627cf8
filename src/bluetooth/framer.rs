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

//! Line framing over the raw SPP byte stream.

use std::collections::VecDeque;
use thiserror::Error;
use tracing::{debug, warn};

/// Line delimiter used by the sensor firmware.
pub const DELIMITER: &[u8] = b"\r\n";

/// Default cap on a single unterminated line.
pub const DEFAULT_MAX_LINE_LEN: usize = 4096;

/// Errors raised while framing the byte stream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("line exceeds {limit} bytes without a delimiter ({len} bytes discarded)")]
    LineTooLong { len: usize, limit: usize },
}

/// Accumulates bytes and splits them into `\r\n` terminated lines.
pub struct LineFramer {
    /// Unterminated bytes following the last delimiter.
    partial: Vec<u8>,
    /// Complete lines not yet handed out.
    ready: VecDeque<Vec<u8>>,
    max_line_len: usize,
    /// Set after an overflow until the next delimiter resynchronizes the stream.
    discarding: bool,
}

impl LineFramer {
    /// Create a new framer with the default line cap.
    pub fn new() -> Self {
        Self::with_max_line_len(DEFAULT_MAX_LINE_LEN)
    }

    /// Create a new framer with a custom line cap.
    pub fn with_max_line_len(max_line_len: usize) -> Self {
        Self {
            partial: Vec::with_capacity(1024),
            ready: VecDeque::new(),
            max_line_len: max_line_len.max(1),
            discarding: false,
        }
    }

    /// Append received bytes.
    ///
    /// Complete lines stay queued until drained with [`LineFramer::lines`].
    /// If the unterminated tail grows past the cap it is dropped, along with
    /// everything up to the next delimiter, and an error is returned.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<(), FrameError> {
        self.partial.extend_from_slice(bytes);

        if self.discarding {
            match find_delimiter(&self.partial) {
                Some(pos) => {
                    debug!("Resynchronized after {} discarded bytes", pos);
                    self.partial.drain(..pos + DELIMITER.len());
                    self.discarding = false;
                }
                None => {
                    self.drop_partial();
                    return Ok(());
                }
            }
        }

        let mut start = 0;
        while let Some(pos) = find_delimiter(&self.partial[start..]) {
            let line = &self.partial[start..start + pos];
            if !line.is_empty() {
                self.ready.push_back(line.to_vec());
            }
            start += pos + DELIMITER.len();
        }
        self.partial.drain(..start);

        // A trailing '\r' may be the first half of a split delimiter
        let pending_cr = usize::from(self.partial.last() == Some(&b'\r'));
        if self.partial.len() - pending_cr > self.max_line_len {
            let len = self.partial.len();
            warn!(
                "Unterminated line of {} bytes exceeds limit of {}",
                len, self.max_line_len
            );
            self.drop_partial();
            self.discarding = true;
            return Err(FrameError::LineTooLong {
                len,
                limit: self.max_line_len,
            });
        }

        Ok(())
    }

    /// Drain complete lines.
    ///
    /// The iterator is lazy: each call to `next` hands out exactly one line.
    /// Dropping it early leaves the remaining lines for the next call.
    pub fn lines(&mut self) -> Lines<'_> {
        Lines { framer: self }
    }

    /// Number of unterminated bytes waiting for a delimiter.
    pub fn buffered_len(&self) -> usize {
        self.partial.len()
    }

    /// Drop all buffered data, including complete lines not yet drained.
    pub fn reset(&mut self) {
        self.partial.clear();
        self.ready.clear();
        self.discarding = false;
    }

    fn drop_partial(&mut self) {
        // Keep a dangling '\r' so a delimiter split across reads is still seen
        let keep_cr = self.partial.last() == Some(&b'\r');
        self.partial.clear();
        if keep_cr {
            self.partial.push(b'\r');
        }
    }
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over complete lines held by a [`LineFramer`].
pub struct Lines<'a> {
    framer: &'a mut LineFramer,
}

impl Iterator for Lines<'_> {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Self::Item> {
        self.framer.ready.pop_front()
    }
}

fn find_delimiter(buf: &[u8]) -> Option<usize> {
    buf.windows(DELIMITER.len()).position(|w| w == DELIMITER)
}
