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

//! Telemetry line protocol.
//!
//! The sensor sends one value per line:
//!
//! ```text
//! Data1:<float>      raw ADC sample
//! Data2:<float>%     oxygen concentration
//! Data3:<float>V     supply voltage
//! ```

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Kind of value carried by a telemetry line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadingKind {
    RawAdc,
    OxygenPercent,
    Voltage,
}

impl ReadingKind {
    /// All kinds, in wire order.
    pub const ALL: [ReadingKind; 3] = [Self::RawAdc, Self::OxygenPercent, Self::Voltage];

    /// Line prefix identifying this kind.
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::RawAdc => "Data1:",
            Self::OxygenPercent => "Data2:",
            Self::Voltage => "Data3:",
        }
    }

    /// Character terminating the numeric payload, if any.
    fn terminator(&self) -> Option<char> {
        match self {
            Self::RawAdc => None,
            Self::OxygenPercent => Some('%'),
            Self::Voltage => Some('V'),
        }
    }

    /// Display unit.
    pub fn unit(&self) -> &'static str {
        match self {
            Self::RawAdc => "",
            Self::OxygenPercent => "%",
            Self::Voltage => "V",
        }
    }

    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RawAdc => "raw_adc",
            Self::OxygenPercent => "oxygen_percent",
            Self::Voltage => "voltage",
        }
    }

    /// Stable numeric code used by the reading database.
    pub fn code(&self) -> i64 {
        match self {
            Self::RawAdc => 0,
            Self::OxygenPercent => 1,
            Self::Voltage => 2,
        }
    }

    /// Parse from a database code.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::RawAdc),
            1 => Some(Self::OxygenPercent),
            2 => Some(Self::Voltage),
            _ => None,
        }
    }
}

impl fmt::Display for ReadingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single parsed telemetry value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    timestamp: DateTime<Local>,
    kind: ReadingKind,
    value: f32,
}

impl Reading {
    pub fn new(kind: ReadingKind, value: f32, timestamp: DateTime<Local>) -> Self {
        Self {
            timestamp,
            kind,
            value,
        }
    }

    pub fn timestamp(&self) -> DateTime<Local> {
        self.timestamp
    }

    pub fn kind(&self) -> ReadingKind {
        self.kind
    }

    pub fn value(&self) -> f32 {
        self.value
    }

    /// Value with unit, as shown to users.
    ///
    /// Raw ADC samples are integral counts and are printed without decimals.
    pub fn formatted_value(&self) -> String {
        match self.kind {
            ReadingKind::RawAdc => format!("{:.0}", self.value),
            kind => format!("{:.2}{}", self.value, kind.unit()),
        }
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}: {}",
            self.timestamp.format("%H:%M:%S"),
            self.kind,
            self.formatted_value()
        )
    }
}

/// Reason a line was rejected.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("unrecognized line prefix")]
    UnknownPrefix,

    #[error("{kind} payload is missing its '{terminator}' terminator")]
    MissingTerminator { kind: ReadingKind, terminator: char },

    #[error("invalid number: {0:?}")]
    InvalidNumber(String),
}

/// Parse a line received now.
pub fn parse_line(line: &str) -> Result<Reading, ParseError> {
    parse_line_at(line, Local::now())
}

/// Parse a line with an explicit receive time.
pub fn parse_line_at(line: &str, timestamp: DateTime<Local>) -> Result<Reading, ParseError> {
    let line = line.trim();

    let (kind, rest) = ReadingKind::ALL
        .iter()
        .find_map(|kind| line.strip_prefix(kind.prefix()).map(|rest| (*kind, rest)))
        .ok_or(ParseError::UnknownPrefix)?;

    let payload = match kind.terminator() {
        None => rest,
        Some(terminator) => rest
            .find(terminator)
            .map(|end| &rest[..end])
            .ok_or(ParseError::MissingTerminator { kind, terminator })?,
    };

    let payload = payload.trim();
    let value: f32 = payload
        .parse()
        .map_err(|_| ParseError::InvalidNumber(payload.to_string()))?;

    if !value.is_finite() {
        return Err(ParseError::InvalidNumber(payload.to_string()));
    }

    Ok(Reading::new(kind, value, timestamp))
}
