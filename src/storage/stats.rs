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

//! Per-kind summaries over stored readings.

use serde::Serialize;

use crate::bluetooth::{Reading, ReadingKind};

/// Count, range and mean of one kind of reading.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReadingSummary {
    pub kind: ReadingKind,
    pub count: usize,
    pub min: f32,
    pub max: f32,
    pub mean: f32,
}

impl ReadingSummary {
    /// Summarize readings of `kind`. Returns `None` if there are none.
    pub fn from_readings(kind: ReadingKind, readings: &[Reading]) -> Option<Self> {
        let mut count = 0usize;
        let mut min = f32::INFINITY;
        let mut max = f32::NEG_INFINITY;
        let mut sum = 0f64;

        for reading in readings.iter().filter(|r| r.kind() == kind) {
            let value = reading.value();
            count += 1;
            min = min.min(value);
            max = max.max(value);
            sum += f64::from(value);
        }

        if count == 0 {
            return None;
        }

        Some(Self {
            kind,
            count,
            min,
            max,
            mean: (sum / count as f64) as f32,
        })
    }

    /// Summaries for every kind present in `readings`.
    pub fn for_all_kinds(readings: &[Reading]) -> Vec<Self> {
        ReadingKind::ALL
            .iter()
            .filter_map(|kind| Self::from_readings(*kind, readings))
            .collect()
    }
}
