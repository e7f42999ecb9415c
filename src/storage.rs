//! Durable storage for crossing events and aggregates.
//!
//! The store is an external collaborator behind the `CrossingStore` trait:
//! the core treats writes as best-effort (retried off the hot path) and only
//! its own snapshot baseline depends on reads. `SqliteCrossingStore` is the
//! production implementation; `InMemoryCrossingStore` backs tests.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Local, NaiveDate, Timelike, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::{CrossingEvent, VehicleClass};

/// A persisted vehicle entry.
#[derive(Clone, Debug)]
pub struct CrossingRow {
    pub id: i64,
    pub timestamp_s: u64,
    pub lane: usize,
    pub class: VehicleClass,
    pub confidence: f32,
    pub session_id: String,
}

/// One (date, hour) aggregate bucket key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HourlyBucket {
    pub day: String,
    pub hour: u32,
}

impl HourlyBucket {
    /// Bucket for an epoch-seconds timestamp, in local time.
    pub fn for_timestamp(timestamp_s: u64) -> Self {
        let (day, hour) = day_and_hour(timestamp_s);
        Self { day, hour }
    }
}

/// Inclusive local-date range for history queries and export.
#[derive(Clone, Copy, Debug)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn single_day(day: NaiveDate) -> Self {
        Self {
            start: day,
            end: day,
        }
    }
}

/// Daily report assembled from persisted aggregates.
#[derive(Clone, Debug, Default, Serialize)]
pub struct DailyReport {
    pub day: String,
    pub total: u64,
    /// (hour, count), ordered by hour.
    pub hourly: Vec<(u32, u64)>,
    pub peak_hour: Option<(u32, u64)>,
    pub avg_per_hour: f32,
    /// (lane, count), ordered by lane.
    pub per_lane: Vec<(usize, u64)>,
    /// (class, count), descending by count.
    pub per_class: Vec<(VehicleClass, u64)>,
}

/// Durable store interface.
///
/// Writes are eventually consistent from the core's point of view; reads
/// used for the snapshot baseline are strongly consistent.
pub trait CrossingStore: Send {
    fn insert_crossing(&mut self, event: &CrossingEvent) -> Result<()>;

    /// Add `count` crossings to an hourly bucket, folding `confidence` into
    /// the bucket's running average.
    fn upsert_hourly(&mut self, bucket: &HourlyBucket, count: u64, confidence: f32) -> Result<()>;

    fn record_session_start(&mut self, session_id: &str, start_s: u64) -> Result<()>;

    fn record_session_end(&mut self, session_id: &str, end_s: u64, total: u64) -> Result<()>;

    /// Count of entries recorded today (local time).
    fn today_count(&mut self) -> Result<u64>;

    fn query_history(&mut self, range: &DateRange) -> Result<Vec<CrossingRow>>;

    fn daily_report(&mut self, day: NaiveDate) -> Result<DailyReport>;

    /// CSV export of vehicle entries in the range, header included.
    fn export_csv(&mut self, range: &DateRange) -> Result<String>;

    /// Delete entries older than `days`. Returns the number removed.
    fn prune_older_than(&mut self, days: u32) -> Result<usize>;
}

/// Local-time (day string, hour) for an epoch timestamp.
fn day_and_hour(timestamp_s: u64) -> (String, u32) {
    let dt = DateTime::<Utc>::from_timestamp(timestamp_s as i64, 0)
        .unwrap_or_default()
        .with_timezone(&Local);
    (dt.format("%Y-%m-%d").to_string(), dt.hour())
}

fn today_string() -> String {
    Local::now().format("%Y-%m-%d").to_string()
}

fn class_from_row(label: &str) -> Result<VehicleClass> {
    VehicleClass::from_label(label)
        .ok_or_else(|| anyhow!("corrupt vehicle_entries row: unknown class '{}'", label))
}

const CSV_HEADER: &str = "id,timestamp,lane,vehicle_type,confidence,session_id";

fn csv_line(row: &CrossingRow) -> String {
    format!(
        "{},{},{},{},{:.3},{}",
        row.id,
        row.timestamp_s,
        row.lane,
        row.class.label(),
        row.confidence,
        row.session_id
    )
}

// ----------------------------------------------------------------------------
// SQLite store
// ----------------------------------------------------------------------------

pub struct SqliteCrossingStore {
    conn: Connection,
}

impl SqliteCrossingStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS vehicle_entries (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              recorded_at INTEGER NOT NULL,
              day TEXT NOT NULL,
              hour INTEGER NOT NULL,
              lane INTEGER NOT NULL,
              vehicle_type TEXT NOT NULL,
              confidence REAL NOT NULL,
              session_id TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS hourly_stats (
              day TEXT NOT NULL,
              hour INTEGER NOT NULL,
              vehicle_count INTEGER NOT NULL,
              avg_confidence REAL NOT NULL,
              PRIMARY KEY (day, hour)
            );

            CREATE TABLE IF NOT EXISTS sessions (
              session_id TEXT PRIMARY KEY,
              start_time INTEGER NOT NULL,
              end_time INTEGER,
              total_vehicles INTEGER,
              status TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_entries_day ON vehicle_entries(day);
            CREATE INDEX IF NOT EXISTS idx_entries_recorded ON vehicle_entries(recorded_at);
            "#,
        )?;
        Ok(())
    }

    fn query_rows(&mut self, sql: &str, day_start: &str, day_end: &str) -> Result<Vec<CrossingRow>> {
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt.query(params![day_start, day_end])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let class: String = row.get(4)?;
            out.push(CrossingRow {
                id: row.get(0)?,
                timestamp_s: row.get::<_, i64>(1)? as u64,
                lane: row.get::<_, i64>(3)? as usize,
                class: class_from_row(&class)?,
                confidence: row.get(5)?,
                session_id: row.get(6)?,
            });
        }
        Ok(out)
    }
}

impl CrossingStore for SqliteCrossingStore {
    fn insert_crossing(&mut self, event: &CrossingEvent) -> Result<()> {
        let (day, hour) = day_and_hour(event.timestamp_s);
        self.conn.execute(
            r#"
            INSERT INTO vehicle_entries(recorded_at, day, hour, lane, vehicle_type, confidence, session_id)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                event.timestamp_s as i64,
                day,
                hour,
                event.lane as i64,
                event.class.label(),
                event.confidence as f64,
                event.session_id,
            ],
        )?;
        Ok(())
    }

    fn upsert_hourly(&mut self, bucket: &HourlyBucket, count: u64, confidence: f32) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO hourly_stats(day, hour, vehicle_count, avg_confidence)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(day, hour) DO UPDATE SET
              avg_confidence = (hourly_stats.avg_confidence * hourly_stats.vehicle_count
                                + excluded.avg_confidence * excluded.vehicle_count)
                               / (hourly_stats.vehicle_count + excluded.vehicle_count),
              vehicle_count = hourly_stats.vehicle_count + excluded.vehicle_count
            "#,
            params![bucket.day, bucket.hour, count as i64, confidence as f64],
        )?;
        Ok(())
    }

    fn record_session_start(&mut self, session_id: &str, start_s: u64) -> Result<()> {
        self.conn.execute(
            "INSERT INTO sessions(session_id, start_time, status) VALUES (?1, ?2, 'active')",
            params![session_id, start_s as i64],
        )?;
        Ok(())
    }

    fn record_session_end(&mut self, session_id: &str, end_s: u64, total: u64) -> Result<()> {
        let updated = self.conn.execute(
            r#"
            UPDATE sessions
            SET end_time = ?1, total_vehicles = ?2, status = 'completed'
            WHERE session_id = ?3
            "#,
            params![end_s as i64, total as i64, session_id],
        )?;
        if updated == 0 {
            return Err(anyhow!("unknown session '{}'", session_id));
        }
        Ok(())
    }

    fn today_count(&mut self) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM vehicle_entries WHERE day = ?1",
            params![today_string()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn query_history(&mut self, range: &DateRange) -> Result<Vec<CrossingRow>> {
        self.query_rows(
            r#"
            SELECT id, recorded_at, hour, lane, vehicle_type, confidence, session_id
            FROM vehicle_entries
            WHERE day >= ?1 AND day <= ?2
            ORDER BY recorded_at ASC, id ASC
            "#,
            &range.start.to_string(),
            &range.end.to_string(),
        )
    }

    fn daily_report(&mut self, day: NaiveDate) -> Result<DailyReport> {
        let day_str = day.to_string();

        let total: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM vehicle_entries WHERE day = ?1",
            params![day_str],
            |row| row.get(0),
        )?;

        let mut hourly = Vec::new();
        {
            let mut stmt = self.conn.prepare(
                "SELECT hour, COUNT(*) FROM vehicle_entries WHERE day = ?1 GROUP BY hour ORDER BY hour",
            )?;
            let mut rows = stmt.query(params![day_str])?;
            while let Some(row) = rows.next()? {
                hourly.push((row.get::<_, i64>(0)? as u32, row.get::<_, i64>(1)? as u64));
            }
        }

        let peak_hour = self
            .conn
            .query_row(
                r#"
                SELECT hour, COUNT(*) AS c FROM vehicle_entries
                WHERE day = ?1 GROUP BY hour ORDER BY c DESC, hour ASC LIMIT 1
                "#,
                params![day_str],
                |row| Ok((row.get::<_, i64>(0)? as u32, row.get::<_, i64>(1)? as u64)),
            )
            .optional()?;

        let mut per_lane = Vec::new();
        {
            let mut stmt = self.conn.prepare(
                "SELECT lane, COUNT(*) FROM vehicle_entries WHERE day = ?1 GROUP BY lane ORDER BY lane",
            )?;
            let mut rows = stmt.query(params![day_str])?;
            while let Some(row) = rows.next()? {
                per_lane.push((row.get::<_, i64>(0)? as usize, row.get::<_, i64>(1)? as u64));
            }
        }

        let mut per_class = Vec::new();
        {
            let mut stmt = self.conn.prepare(
                r#"
                SELECT vehicle_type, COUNT(*) AS c FROM vehicle_entries
                WHERE day = ?1 GROUP BY vehicle_type ORDER BY c DESC
                "#,
            )?;
            let mut rows = stmt.query(params![day_str])?;
            while let Some(row) = rows.next()? {
                let label: String = row.get(0)?;
                per_class.push((class_from_row(&label)?, row.get::<_, i64>(1)? as u64));
            }
        }

        let avg_per_hour = if hourly.is_empty() {
            0.0
        } else {
            total as f32 / hourly.len() as f32
        };

        Ok(DailyReport {
            day: day_str,
            total: total as u64,
            hourly,
            peak_hour,
            avg_per_hour,
            per_lane,
            per_class,
        })
    }

    fn export_csv(&mut self, range: &DateRange) -> Result<String> {
        let rows = self.query_history(range)?;
        let mut out = String::from(CSV_HEADER);
        for row in &rows {
            out.push('\n');
            out.push_str(&csv_line(row));
        }
        out.push('\n');
        Ok(out)
    }

    fn prune_older_than(&mut self, days: u32) -> Result<usize> {
        let cutoff = Local::now()
            .date_naive()
            .checked_sub_days(chrono::Days::new(days as u64))
            .ok_or_else(|| anyhow!("retention window out of range"))?;
        let deleted = self.conn.execute(
            "DELETE FROM vehicle_entries WHERE day < ?1",
            params![cutoff.to_string()],
        )?;
        Ok(deleted)
    }
}

// ----------------------------------------------------------------------------
// In-memory store (tests, ephemeral deployments)
// ----------------------------------------------------------------------------

#[derive(Clone, Debug, Default)]
struct SessionRow {
    start_s: u64,
    end_s: Option<u64>,
    total: Option<u64>,
    status: String,
}

#[derive(Debug, Default)]
pub struct InMemoryCrossingStore {
    entries: Vec<CrossingRow>,
    hourly: BTreeMap<(String, u32), (u64, f32)>,
    sessions: BTreeMap<String, SessionRow>,
    next_id: i64,
}

impl InMemoryCrossingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[CrossingRow] {
        &self.entries
    }

    pub fn hourly_count(&self, bucket: &HourlyBucket) -> u64 {
        self.hourly
            .get(&(bucket.day.clone(), bucket.hour))
            .map(|(count, _)| *count)
            .unwrap_or(0)
    }

    pub fn session_status(&self, session_id: &str) -> Option<&str> {
        self.sessions.get(session_id).map(|s| s.status.as_str())
    }

    pub fn session_total(&self, session_id: &str) -> Option<u64> {
        self.sessions.get(session_id).and_then(|s| s.total)
    }

    fn rows_in_range(&self, range: &DateRange) -> Vec<CrossingRow> {
        let start = range.start.to_string();
        let end = range.end.to_string();
        self.entries
            .iter()
            .filter(|row| {
                let (day, _) = day_and_hour(row.timestamp_s);
                day >= start && day <= end
            })
            .cloned()
            .collect()
    }
}

impl CrossingStore for InMemoryCrossingStore {
    fn insert_crossing(&mut self, event: &CrossingEvent) -> Result<()> {
        self.next_id += 1;
        self.entries.push(CrossingRow {
            id: self.next_id,
            timestamp_s: event.timestamp_s,
            lane: event.lane,
            class: event.class,
            confidence: event.confidence,
            session_id: event.session_id.clone(),
        });
        Ok(())
    }

    fn upsert_hourly(&mut self, bucket: &HourlyBucket, count: u64, confidence: f32) -> Result<()> {
        let slot = self
            .hourly
            .entry((bucket.day.clone(), bucket.hour))
            .or_insert((0, 0.0));
        let merged = slot.0 + count;
        if merged > 0 {
            slot.1 = (slot.1 * slot.0 as f32 + confidence * count as f32) / merged as f32;
        }
        slot.0 = merged;
        Ok(())
    }

    fn record_session_start(&mut self, session_id: &str, start_s: u64) -> Result<()> {
        self.sessions.insert(
            session_id.to_string(),
            SessionRow {
                start_s,
                end_s: None,
                total: None,
                status: "active".to_string(),
            },
        );
        Ok(())
    }

    fn record_session_end(&mut self, session_id: &str, end_s: u64, total: u64) -> Result<()> {
        let session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| anyhow!("unknown session '{}'", session_id))?;
        session.end_s = Some(end_s);
        session.total = Some(total);
        session.status = "completed".to_string();
        Ok(())
    }

    fn today_count(&mut self) -> Result<u64> {
        let today = today_string();
        Ok(self
            .entries
            .iter()
            .filter(|row| day_and_hour(row.timestamp_s).0 == today)
            .count() as u64)
    }

    fn query_history(&mut self, range: &DateRange) -> Result<Vec<CrossingRow>> {
        Ok(self.rows_in_range(range))
    }

    fn daily_report(&mut self, day: NaiveDate) -> Result<DailyReport> {
        let rows = self.rows_in_range(&DateRange::single_day(day));

        let mut by_hour: BTreeMap<u32, u64> = BTreeMap::new();
        let mut by_lane: BTreeMap<usize, u64> = BTreeMap::new();
        let mut by_class: BTreeMap<usize, u64> = BTreeMap::new();
        for row in &rows {
            *by_hour.entry(day_and_hour(row.timestamp_s).1).or_default() += 1;
            *by_lane.entry(row.lane).or_default() += 1;
            *by_class.entry(row.class.index()).or_default() += 1;
        }

        let peak_hour = by_hour
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
            .map(|(h, c)| (*h, *c));
        let total = rows.len() as u64;
        let avg_per_hour = if by_hour.is_empty() {
            0.0
        } else {
            total as f32 / by_hour.len() as f32
        };
        let mut per_class: Vec<(VehicleClass, u64)> = by_class
            .into_iter()
            .map(|(idx, count)| (VehicleClass::ALL[idx], count))
            .collect();
        per_class.sort_by(|a, b| b.1.cmp(&a.1));

        Ok(DailyReport {
            day: day.to_string(),
            total,
            hourly: by_hour.into_iter().collect(),
            peak_hour,
            avg_per_hour,
            per_lane: by_lane.into_iter().collect(),
            per_class,
        })
    }

    fn export_csv(&mut self, range: &DateRange) -> Result<String> {
        let rows = self.rows_in_range(range);
        let mut out = String::from(CSV_HEADER);
        for row in &rows {
            out.push('\n');
            out.push_str(&csv_line(row));
        }
        out.push('\n');
        Ok(out)
    }

    fn prune_older_than(&mut self, days: u32) -> Result<usize> {
        let cutoff = Local::now()
            .date_naive()
            .checked_sub_days(chrono::Days::new(days as u64))
            .ok_or_else(|| anyhow!("retention window out of range"))?
            .to_string();
        let before = self.entries.len();
        self.entries
            .retain(|row| day_and_hour(row.timestamp_s).0 >= cutoff);
        Ok(before - self.entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::now_s;

    fn event(lane: usize, class: VehicleClass, session: &str, ts: u64) -> CrossingEvent {
        CrossingEvent {
            track_id: 1,
            timestamp_s: ts,
            lane,
            class,
            confidence: 0.9,
            session_id: session.to_string(),
        }
    }

    fn open_temp_store() -> (tempfile::TempDir, SqliteCrossingStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("lanewatch.db");
        let store = SqliteCrossingStore::open(path.to_str().expect("utf8 path")).expect("open");
        (dir, store)
    }

    #[test]
    fn sqlite_insert_then_query_round_trip() {
        let (_dir, mut store) = open_temp_store();
        let ts = now_s().expect("clock");
        store
            .insert_crossing(&event(2, VehicleClass::Truck, "s1", ts))
            .expect("insert");
        store
            .insert_crossing(&event(0, VehicleClass::Car, "s1", ts + 1))
            .expect("insert");

        let today = Local::now().date_naive();
        let rows = store
            .query_history(&DateRange::single_day(today))
            .expect("query");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].lane, 2);
        assert_eq!(rows[0].class, VehicleClass::Truck);
        assert_eq!(rows[1].class, VehicleClass::Car);
        assert_eq!(store.today_count().expect("count"), 2);
    }

    #[test]
    fn sqlite_hourly_upsert_accumulates() {
        let (_dir, mut store) = open_temp_store();
        let bucket = HourlyBucket {
            day: "2026-08-30".to_string(),
            hour: 14,
        };
        store.upsert_hourly(&bucket, 1, 0.8).expect("upsert");
        store.upsert_hourly(&bucket, 1, 0.6).expect("upsert");

        let (count, avg): (i64, f64) = store
            .conn
            .query_row(
                "SELECT vehicle_count, avg_confidence FROM hourly_stats WHERE day=?1 AND hour=?2",
                params![bucket.day, bucket.hour],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .expect("row");
        assert_eq!(count, 2);
        assert!((avg - 0.7).abs() < 1e-6);
    }

    #[test]
    fn sqlite_session_lifecycle() {
        let (_dir, mut store) = open_temp_store();
        store.record_session_start("s1", 100).expect("start");
        store.record_session_end("s1", 200, 7).expect("end");

        let (status, total): (String, i64) = store
            .conn
            .query_row(
                "SELECT status, total_vehicles FROM sessions WHERE session_id='s1'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .expect("row");
        assert_eq!(status, "completed");
        assert_eq!(total, 7);

        assert!(store.record_session_end("missing", 1, 1).is_err());
    }

    #[test]
    fn sqlite_daily_report_aggregates() {
        let (_dir, mut store) = open_temp_store();
        let ts = now_s().expect("clock");
        for lane in [0usize, 0, 1] {
            store
                .insert_crossing(&event(lane, VehicleClass::Car, "s1", ts))
                .expect("insert");
        }
        store
            .insert_crossing(&event(1, VehicleClass::Bus, "s1", ts))
            .expect("insert");

        let report = store
            .daily_report(Local::now().date_naive())
            .expect("report");
        assert_eq!(report.total, 4);
        assert_eq!(report.per_lane, vec![(0, 2), (1, 2)]);
        assert_eq!(report.per_class[0], (VehicleClass::Car, 3));
        assert!(report.peak_hour.is_some());
        assert!(report.avg_per_hour > 0.0);
    }

    #[test]
    fn csv_export_includes_header_and_rows() {
        let mut store = InMemoryCrossingStore::new();
        let ts = now_s().expect("clock");
        store
            .insert_crossing(&event(1, VehicleClass::Car, "s1", ts))
            .expect("insert");
        let today = Local::now().date_naive();
        let csv = store
            .export_csv(&DateRange::single_day(today))
            .expect("export");
        let mut lines = csv.lines();
        assert_eq!(lines.next(), Some(CSV_HEADER));
        let row = lines.next().expect("one row");
        assert!(row.contains(",car,"));
        assert!(row.ends_with(",s1"));
    }

    #[test]
    fn in_memory_mirrors_sqlite_behavior() {
        let mut store = InMemoryCrossingStore::new();
        let ts = now_s().expect("clock");
        store
            .insert_crossing(&event(3, VehicleClass::Motorcycle, "s2", ts))
            .expect("insert");
        let bucket = HourlyBucket::for_timestamp(ts);
        store.upsert_hourly(&bucket, 1, 0.9).expect("upsert");

        assert_eq!(store.today_count().expect("count"), 1);
        assert_eq!(store.hourly_count(&bucket), 1);

        store.record_session_start("s2", ts).expect("start");
        store.record_session_end("s2", ts + 10, 1).expect("end");
        assert_eq!(store.session_status("s2"), Some("completed"));
        assert_eq!(store.session_total("s2"), Some(1));
    }

    #[test]
    fn prune_keeps_recent_entries() {
        let mut store = InMemoryCrossingStore::new();
        let ts = now_s().expect("clock");
        let old = ts.saturating_sub(200 * 24 * 3600);
        store
            .insert_crossing(&event(0, VehicleClass::Car, "s", old))
            .expect("insert");
        store
            .insert_crossing(&event(0, VehicleClass::Car, "s", ts))
            .expect("insert");
        let removed = store.prune_older_than(90).expect("prune");
        assert_eq!(removed, 1);
        assert_eq!(store.entries().len(), 1);
    }
}
