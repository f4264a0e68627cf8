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

//! Reading database using SQLite.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Local, TimeZone};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use super::DurableStore;
use crate::bluetooth::{Reading, ReadingKind};

/// Durable reading store.
#[derive(Clone)]
pub struct ReadingDb {
    conn: Arc<Mutex<Connection>>,
}

impl ReadingDb {
    /// Create or open the reading database.
    pub fn new(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let db_path = data_dir.join("readings.db");
        info!("Opening reading database: {:?}", db_path);

        let conn = Connection::open(&db_path)?;

        // Create tables
        conn.execute(
            "CREATE TABLE IF NOT EXISTS readings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp_ms INTEGER NOT NULL,
                kind INTEGER NOT NULL,
                value REAL NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_readings_timestamp ON readings(timestamp_ms DESC)",
            [],
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Readings received at or after `since`, newest first.
    pub fn query_since(&self, since: DateTime<Local>) -> Result<Vec<Reading>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT timestamp_ms, kind, value
             FROM readings
             WHERE timestamp_ms >= ?1
             ORDER BY timestamp_ms DESC, id DESC",
        )?;

        let rows = stmt
            .query_map([since.timestamp_millis()], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, f64>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(timestamp_ms, kind, value)| {
                let timestamp = Local
                    .timestamp_millis_opt(timestamp_ms)
                    .single()
                    .ok_or_else(|| anyhow!("Invalid timestamp in database: {}", timestamp_ms))?;
                let kind = ReadingKind::from_code(kind)
                    .ok_or_else(|| anyhow!("Unknown reading kind in database: {}", kind))?;
                Ok(Reading::new(kind, value as f32, timestamp))
            })
            .collect()
    }

    /// Get total reading count.
    pub fn count(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM readings", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Get reading count for one kind.
    pub fn count_by_kind(&self, kind: ReadingKind) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM readings WHERE kind = ?1",
            [kind.code()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

impl DurableStore for ReadingDb {
    fn append(&self, reading: &Reading) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO readings (timestamp_ms, kind, value) VALUES (?1, ?2, ?3)",
            params![
                reading.timestamp().timestamp_millis(),
                reading.kind().code(),
                reading.value() as f64
            ],
        )?;
        Ok(())
    }

    fn query_last_days(&self, days: u32) -> Result<Vec<Reading>> {
        self.query_since(Local::now() - Duration::days(i64::from(days)))
    }

    fn delete_older_than(&self, age: Duration) -> Result<usize> {
        let cutoff = Local::now() - age;
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM readings WHERE timestamp_ms < ?1",
            [cutoff.timestamp_millis()],
        )?;
        if deleted > 0 {
            debug!("Deleted {} readings older than {}", deleted, cutoff);
        }
        Ok(deleted)
    }

    fn clear_all(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM readings", [])?;
        info!("Reading database cleared");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn reading_at(kind: ReadingKind, value: f32, age: Duration) -> Reading {
        Reading::new(kind, value, Local::now() - age)
    }

    #[test]
    fn test_append_and_query() {
        let dir = tempdir().unwrap();
        let db = ReadingDb::new(dir.path()).unwrap();

        db.append(&reading_at(ReadingKind::OxygenPercent, 20.9, Duration::minutes(2)))
            .unwrap();
        db.append(&reading_at(ReadingKind::Voltage, 3.3, Duration::minutes(1)))
            .unwrap();

        let readings = db.query_last_days(7).unwrap();
        assert_eq!(readings.len(), 2);
        assert_eq!(readings[0].kind(), ReadingKind::Voltage);
        assert_eq!(readings[0].value(), 3.3);
        assert_eq!(readings[1].kind(), ReadingKind::OxygenPercent);
        assert_eq!(readings[1].value(), 20.9);
    }

    #[test]
    fn test_query_window() {
        let dir = tempdir().unwrap();
        let db = ReadingDb::new(dir.path()).unwrap();

        db.append(&reading_at(ReadingKind::RawAdc, 1.0, Duration::days(10)))
            .unwrap();
        db.append(&reading_at(ReadingKind::RawAdc, 2.0, Duration::hours(1)))
            .unwrap();

        let readings = db.query_last_days(7).unwrap();
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].value(), 2.0);
        assert_eq!(db.count().unwrap(), 2);
    }

    #[test]
    fn test_delete_older_than() {
        let dir = tempdir().unwrap();
        let db = ReadingDb::new(dir.path()).unwrap();

        db.append(&reading_at(ReadingKind::Voltage, 3.1, Duration::days(8)))
            .unwrap();
        db.append(&reading_at(ReadingKind::Voltage, 3.2, Duration::days(9)))
            .unwrap();
        db.append(&reading_at(ReadingKind::Voltage, 3.3, Duration::days(1)))
            .unwrap();

        assert_eq!(db.delete_older_than(Duration::days(7)).unwrap(), 2);
        assert_eq!(db.count().unwrap(), 1);
        assert_eq!(db.delete_older_than(Duration::days(7)).unwrap(), 0);
    }

    #[test]
    fn test_count_by_kind_and_clear() {
        let dir = tempdir().unwrap();
        let db = ReadingDb::new(dir.path()).unwrap();

        for value in [20.1, 20.2, 20.3] {
            db.append(&reading_at(ReadingKind::OxygenPercent, value, Duration::zero()))
                .unwrap();
        }
        db.append(&reading_at(ReadingKind::RawAdc, 512.0, Duration::zero()))
            .unwrap();

        assert_eq!(db.count_by_kind(ReadingKind::OxygenPercent).unwrap(), 3);
        assert_eq!(db.count_by_kind(ReadingKind::RawAdc).unwrap(), 1);
        assert_eq!(db.count_by_kind(ReadingKind::Voltage).unwrap(), 0);

        db.clear_all().unwrap();
        assert_eq!(db.count().unwrap(), 0);
    }

    #[test]
    fn test_reopen_keeps_data() {
        let dir = tempdir().unwrap();
        {
            let db = ReadingDb::new(dir.path()).unwrap();
            db.append(&reading_at(ReadingKind::RawAdc, 7.0, Duration::zero()))
                .unwrap();
        }

        let db = ReadingDb::new(dir.path()).unwrap();
        assert_eq!(db.count().unwrap(), 1);
    }
}
