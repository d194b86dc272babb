use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::location::Provenance;
use crate::telemetry::GpsFix;
use crate::{open_db_connection, GeoBounds, RepairStatus, Severity};

/// A detection ready to be persisted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewDetection {
    pub timestamp: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    pub severity: Severity,
    pub confidence: f32,
    pub class_name: String,
    pub image_path: Option<String>,
    pub image_base64: Option<String>,
    pub camera_source: String,
    pub gps_quality: u8,
    pub location_source: Provenance,
}

/// A persisted detection row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    pub severity: Severity,
    pub confidence: f32,
    pub class_name: String,
    pub image_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_base64: Option<String>,
    pub camera_source: String,
    pub gps_quality: u8,
    pub location_source: Provenance,
    pub repair_status: RepairStatus,
    pub repair_date: Option<DateTime<Utc>>,
    pub notes: Option<String>,
}

impl DetectionRecord {
    fn from_new(id: i64, new: &NewDetection) -> Self {
        Self {
            id,
            timestamp: new.timestamp,
            latitude: new.latitude,
            longitude: new.longitude,
            severity: new.severity,
            confidence: new.confidence,
            class_name: new.class_name.clone(),
            image_path: new.image_path.clone(),
            image_base64: new.image_base64.clone(),
            camera_source: new.camera_source.clone(),
            gps_quality: new.gps_quality,
            location_source: new.location_source,
            repair_status: RepairStatus::Pending,
            repair_date: None,
            notes: None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct DetectionStatistics {
    pub period_days: u32,
    pub total: u64,
    pub by_severity: BTreeMap<String, u64>,
    pub avg_confidence: f64,
    pub repairs_completed: u64,
    pub pending_repairs: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HeatmapPoint {
    pub lat: f64,
    pub lon: f64,
    pub severity: Severity,
    pub weight: u32,
}

impl HeatmapPoint {
    fn from_record(record: &DetectionRecord) -> Self {
        Self {
            lat: record.latitude,
            lon: record.longitude,
            severity: record.severity,
            weight: record.severity.weight(),
        }
    }
}

/// Append-mostly detection store. Records are never deleted; only the repair
/// fields change after insertion. All queries return newest first.
pub trait DetectionStore: Send {
    fn add_detection(&mut self, record: &NewDetection) -> Result<i64>;

    fn get_detection(&self, id: i64) -> Result<Option<DetectionRecord>>;

    fn query_all(&self, limit: usize) -> Result<Vec<DetectionRecord>>;

    fn query_by_area(&self, bounds: &GeoBounds, limit: usize) -> Result<Vec<DetectionRecord>>;

    fn query_by_severity(&self, severity: Severity, limit: usize) -> Result<Vec<DetectionRecord>>;

    fn query_recent(&self, hours: u32, limit: usize) -> Result<Vec<DetectionRecord>>;

    /// Returns false when no record has `id`.
    fn update_repair_status(
        &mut self,
        id: i64,
        status: RepairStatus,
        notes: Option<&str>,
    ) -> Result<bool>;

    fn get_statistics(&self, days: u32) -> Result<DetectionStatistics>;

    fn get_heatmap(&self, limit: usize) -> Result<Vec<HeatmapPoint>>;

    fn log_gps_fix(&mut self, fix: &GpsFix) -> Result<()>;
}

fn empty_severity_counts() -> BTreeMap<String, u64> {
    [Severity::Low, Severity::Medium, Severity::High]
        .iter()
        .map(|s| (s.as_str().to_string(), 0))
        .collect()
}

fn epoch_ms(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

/// Start of a look-back window ending now. `None` when the window reaches
/// past the representable range, meaning no lower bound.
fn window_start(window: ChronoDuration) -> Option<DateTime<Utc>> {
    Utc::now().checked_sub_signed(window)
}

fn window_start_ms(window: ChronoDuration) -> i64 {
    window_start(window).map(epoch_ms).unwrap_or(i64::MIN)
}

fn from_epoch_ms(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| anyhow!("timestamp {} out of range", ms))
}

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

pub struct SqliteDetectionStore {
    conn: Connection,
}

const SELECT_COLUMNS: &str = "id, timestamp_ms, latitude, longitude, severity, confidence, \
     class_name, image_path, image_base64, camera_source, gps_quality, location_source, \
     repair_status, repair_date_ms, notes";

impl SqliteDetectionStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = open_db_connection(db_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS detections (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              timestamp_ms INTEGER NOT NULL,
              latitude REAL NOT NULL,
              longitude REAL NOT NULL,
              severity TEXT NOT NULL,
              confidence REAL NOT NULL,
              class_name TEXT NOT NULL,
              image_path TEXT,
              image_base64 TEXT,
              camera_source TEXT NOT NULL,
              gps_quality INTEGER NOT NULL DEFAULT 0,
              location_source TEXT NOT NULL,
              repair_status TEXT NOT NULL DEFAULT 'pending',
              repair_date_ms INTEGER,
              notes TEXT
            );

            CREATE TABLE IF NOT EXISTS gps_log (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              timestamp_ms INTEGER NOT NULL,
              latitude REAL NOT NULL,
              longitude REAL NOT NULL,
              quality INTEGER NOT NULL,
              satellites INTEGER NOT NULL,
              hdop REAL
            );

            CREATE INDEX IF NOT EXISTS idx_detections_time ON detections(timestamp_ms);
            CREATE INDEX IF NOT EXISTS idx_detections_location ON detections(latitude, longitude);
            CREATE INDEX IF NOT EXISTS idx_detections_severity ON detections(severity);
            "#,
        )?;
        Ok(())
    }

    fn query_records(
        &self,
        where_clause: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<DetectionRecord>> {
        let sql = format!(
            "SELECT {} FROM detections {} ORDER BY timestamp_ms DESC, id DESC LIMIT ?{}",
            SELECT_COLUMNS,
            where_clause,
            params.len()
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(record_from_row(row)?);
        }
        Ok(out)
    }
}

fn record_from_row(row: &Row<'_>) -> Result<DetectionRecord> {
    let severity: String = row.get(4)?;
    let location_source: String = row.get(11)?;
    let repair_status: String = row.get(12)?;
    let repair_date_ms: Option<i64> = row.get(13)?;
    let confidence: f64 = row.get(5)?;
    let gps_quality: i64 = row.get(10)?;
    Ok(DetectionRecord {
        id: row.get(0)?,
        timestamp: from_epoch_ms(row.get(1)?)?,
        latitude: row.get(2)?,
        longitude: row.get(3)?,
        severity: severity.parse()?,
        confidence: confidence as f32,
        class_name: row.get(6)?,
        image_path: row.get(7)?,
        image_base64: row.get(8)?,
        camera_source: row.get(9)?,
        gps_quality: u8::try_from(gps_quality).unwrap_or(0),
        location_source: location_source.parse()?,
        repair_status: repair_status.parse()?,
        repair_date: repair_date_ms.map(from_epoch_ms).transpose()?,
        notes: row.get(14)?,
    })
}

impl DetectionStore for SqliteDetectionStore {
    fn add_detection(&mut self, record: &NewDetection) -> Result<i64> {
        self.conn.execute(
            r#"
            INSERT INTO detections(timestamp_ms, latitude, longitude, severity, confidence,
              class_name, image_path, image_base64, camera_source, gps_quality, location_source)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                epoch_ms(record.timestamp),
                record.latitude,
                record.longitude,
                record.severity.as_str(),
                record.confidence as f64,
                record.class_name,
                record.image_path,
                record.image_base64,
                record.camera_source,
                record.gps_quality as i64,
                record.location_source.as_str(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn get_detection(&self, id: i64) -> Result<Option<DetectionRecord>> {
        let sql = format!("SELECT {} FROM detections WHERE id = ?1", SELECT_COLUMNS);
        let mut stmt = self.conn.prepare(&sql)?;
        let record = stmt
            .query_row(params![id], |row| Ok(record_from_row(row)))
            .optional()?;
        record.transpose()
    }

    fn query_all(&self, limit: usize) -> Result<Vec<DetectionRecord>> {
        self.query_records("", &[&limit_param(limit)])
    }

    fn query_by_area(&self, bounds: &GeoBounds, limit: usize) -> Result<Vec<DetectionRecord>> {
        self.query_records(
            "WHERE latitude BETWEEN ?1 AND ?2 AND longitude BETWEEN ?3 AND ?4",
            &[
                &bounds.lat_min,
                &bounds.lat_max,
                &bounds.lon_min,
                &bounds.lon_max,
                &limit_param(limit),
            ],
        )
    }

    fn query_by_severity(&self, severity: Severity, limit: usize) -> Result<Vec<DetectionRecord>> {
        self.query_records(
            "WHERE severity = ?1",
            &[&severity.as_str(), &limit_param(limit)],
        )
    }

    fn query_recent(&self, hours: u32, limit: usize) -> Result<Vec<DetectionRecord>> {
        let cutoff = window_start_ms(ChronoDuration::hours(hours as i64));
        self.query_records("WHERE timestamp_ms >= ?1", &[&cutoff, &limit_param(limit)])
    }

    fn update_repair_status(
        &mut self,
        id: i64,
        status: RepairStatus,
        notes: Option<&str>,
    ) -> Result<bool> {
        let repair_date = match status {
            RepairStatus::Pending => None,
            _ => Some(epoch_ms(Utc::now())),
        };
        let changed = self.conn.execute(
            r#"
            UPDATE detections
               SET repair_status = ?1, repair_date_ms = ?2, notes = COALESCE(?3, notes)
             WHERE id = ?4
            "#,
            params![status.as_str(), repair_date, notes, id],
        )?;
        Ok(changed > 0)
    }

    fn get_statistics(&self, days: u32) -> Result<DetectionStatistics> {
        let cutoff = window_start_ms(ChronoDuration::days(days as i64));
        let mut stats = DetectionStatistics {
            period_days: days,
            by_severity: empty_severity_counts(),
            ..DetectionStatistics::default()
        };

        let (total, avg, completed, pending): (i64, Option<f64>, i64, i64) = self.conn.query_row(
            r#"
            SELECT COUNT(*), AVG(confidence),
                   COALESCE(SUM(CASE WHEN repair_status = 'completed' THEN 1 ELSE 0 END), 0),
                   COALESCE(SUM(CASE WHEN repair_status = 'pending' THEN 1 ELSE 0 END), 0)
              FROM detections WHERE timestamp_ms >= ?1
            "#,
            params![cutoff],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;
        stats.total = total as u64;
        stats.avg_confidence = avg.unwrap_or(0.0);
        stats.repairs_completed = completed as u64;
        stats.pending_repairs = pending as u64;

        let mut stmt = self.conn.prepare(
            "SELECT severity, COUNT(*) FROM detections WHERE timestamp_ms >= ?1 GROUP BY severity",
        )?;
        let mut rows = stmt.query(params![cutoff])?;
        while let Some(row) = rows.next()? {
            let severity: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            stats.by_severity.insert(severity, count as u64);
        }
        Ok(stats)
    }

    fn get_heatmap(&self, limit: usize) -> Result<Vec<HeatmapPoint>> {
        Ok(self
            .query_all(limit)?
            .iter()
            .map(HeatmapPoint::from_record)
            .collect())
    }

    fn log_gps_fix(&mut self, fix: &GpsFix) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO gps_log(timestamp_ms, latitude, longitude, quality, satellites, hdop)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                epoch_ms(fix.timestamp),
                fix.latitude,
                fix.longitude,
                fix.quality.ordinal() as i64,
                fix.satellites as i64,
                fix.hdop,
            ],
        )?;
        Ok(())
    }
}

#[derive(Clone, Debug, Default)]
pub struct InMemoryDetectionStore {
    records: Vec<DetectionRecord>,
    gps_log: Vec<GpsFix>,
}

impl InMemoryDetectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn gps_log(&self) -> &[GpsFix] {
        &self.gps_log
    }

    fn newest_first<'a>(
        &'a self,
        filter: impl Fn(&DetectionRecord) -> bool + 'a,
        limit: usize,
    ) -> Vec<DetectionRecord> {
        let mut out: Vec<DetectionRecord> =
            self.records.iter().filter(|r| filter(r)).cloned().collect();
        out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
        out.truncate(limit);
        out
    }
}

impl DetectionStore for InMemoryDetectionStore {
    fn add_detection(&mut self, record: &NewDetection) -> Result<i64> {
        let id = self.records.last().map(|r| r.id + 1).unwrap_or(1);
        self.records.push(DetectionRecord::from_new(id, record));
        Ok(id)
    }

    fn get_detection(&self, id: i64) -> Result<Option<DetectionRecord>> {
        Ok(self.records.iter().find(|r| r.id == id).cloned())
    }

    fn query_all(&self, limit: usize) -> Result<Vec<DetectionRecord>> {
        Ok(self.newest_first(|_| true, limit))
    }

    fn query_by_area(&self, bounds: &GeoBounds, limit: usize) -> Result<Vec<DetectionRecord>> {
        let bounds = *bounds;
        Ok(self.newest_first(move |r| bounds.contains(r.latitude, r.longitude), limit))
    }

    fn query_by_severity(&self, severity: Severity, limit: usize) -> Result<Vec<DetectionRecord>> {
        Ok(self.newest_first(move |r| r.severity == severity, limit))
    }

    fn query_recent(&self, hours: u32, limit: usize) -> Result<Vec<DetectionRecord>> {
        let cutoff = window_start(ChronoDuration::hours(hours as i64));
        Ok(self.newest_first(move |r| cutoff.map_or(true, |c| r.timestamp >= c), limit))
    }

    fn update_repair_status(
        &mut self,
        id: i64,
        status: RepairStatus,
        notes: Option<&str>,
    ) -> Result<bool> {
        let Some(record) = self.records.iter_mut().find(|r| r.id == id) else {
            return Ok(false);
        };
        record.repair_status = status;
        record.repair_date = match status {
            RepairStatus::Pending => None,
            _ => Some(Utc::now()),
        };
        if let Some(notes) = notes {
            record.notes = Some(notes.to_string());
        }
        Ok(true)
    }

    fn get_statistics(&self, days: u32) -> Result<DetectionStatistics> {
        let cutoff = window_start(ChronoDuration::days(days as i64));
        let mut stats = DetectionStatistics {
            period_days: days,
            by_severity: empty_severity_counts(),
            ..DetectionStatistics::default()
        };
        let mut confidence_sum = 0.0f64;
        for record in self.records.iter().filter(|r| cutoff.map_or(true, |c| r.timestamp >= c)) {
            stats.total += 1;
            confidence_sum += record.confidence as f64;
            *stats
                .by_severity
                .entry(record.severity.as_str().to_string())
                .or_insert(0) += 1;
            match record.repair_status {
                RepairStatus::Completed => stats.repairs_completed += 1,
                RepairStatus::Pending => stats.pending_repairs += 1,
                _ => {}
            }
        }
        if stats.total > 0 {
            stats.avg_confidence = confidence_sum / stats.total as f64;
        }
        Ok(stats)
    }

    fn get_heatmap(&self, limit: usize) -> Result<Vec<HeatmapPoint>> {
        Ok(self
            .query_all(limit)?
            .iter()
            .map(HeatmapPoint::from_record)
            .collect())
    }

    fn log_gps_fix(&mut self, fix: &GpsFix) -> Result<()> {
        self.gps_log.push(*fix);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_detection(severity: Severity, lat: f64, lon: f64, age_hours: i64) -> NewDetection {
        NewDetection {
            timestamp: Utc::now() - ChronoDuration::hours(age_hours),
            latitude: lat,
            longitude: lon,
            severity,
            confidence: 0.8,
            class_name: "pothole".to_string(),
            image_path: None,
            image_base64: None,
            camera_source: "main_camera".to_string(),
            gps_quality: 1,
            location_source: Provenance::LocalGpsModule,
        }
    }

    fn exercise(store: &mut dyn DetectionStore) {
        let a = store
            .add_detection(&new_detection(Severity::Low, 17.0, 75.0, 30))
            .unwrap();
        let b = store
            .add_detection(&new_detection(Severity::Medium, 17.5, 75.5, 2))
            .unwrap();
        let c = store
            .add_detection(&new_detection(Severity::High, 19.0, 72.8, 1))
            .unwrap();
        assert!(a < b && b < c);

        let all = store.query_all(10).unwrap();
        assert_eq!(all.iter().map(|r| r.id).collect::<Vec<_>>(), vec![c, b, a]);

        let bounds = GeoBounds::new(16.5, 18.0, 74.5, 76.0).unwrap();
        let area = store.query_by_area(&bounds, 10).unwrap();
        assert_eq!(area.iter().map(|r| r.id).collect::<Vec<_>>(), vec![b, a]);

        let high = store.query_by_severity(Severity::High, 10).unwrap();
        assert_eq!(high.len(), 1);
        assert_eq!(high[0].location_source, Provenance::LocalGpsModule);

        let recent = store.query_recent(24, 10).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(store.query_recent(24, 1).unwrap().len(), 1);

        assert!(store
            .update_repair_status(a, RepairStatus::Completed, Some("patched"))
            .unwrap());
        assert!(!store
            .update_repair_status(999, RepairStatus::Completed, None)
            .unwrap());
        let updated = store.get_detection(a).unwrap().unwrap();
        assert_eq!(updated.repair_status, RepairStatus::Completed);
        assert!(updated.repair_date.is_some());
        assert_eq!(updated.notes.as_deref(), Some("patched"));

        assert!(store
            .update_repair_status(a, RepairStatus::Pending, None)
            .unwrap());
        let reopened = store.get_detection(a).unwrap().unwrap();
        assert!(reopened.repair_date.is_none());
        assert_eq!(reopened.notes.as_deref(), Some("patched"));
        store
            .update_repair_status(b, RepairStatus::Completed, None)
            .unwrap();

        let stats = store.get_statistics(7).unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_severity["Low"], 1);
        assert_eq!(stats.by_severity["Medium"], 1);
        assert_eq!(stats.by_severity["High"], 1);
        assert_eq!(stats.repairs_completed, 1);
        assert_eq!(stats.pending_repairs, 2);
        assert!((stats.avg_confidence - 0.8).abs() < 1e-6);

        let heat = store.get_heatmap(10).unwrap();
        let weights: Vec<u32> = heat.iter().rev().map(|p| p.weight).collect();
        assert_eq!(weights, vec![1, 5, 10]);
        assert!(store.get_detection(12345).unwrap().is_none());
    }

    #[test]
    fn sqlite_store_contract() {
        let mut store = SqliteDetectionStore::open(&crate::shared_memory_uri()).unwrap();
        exercise(&mut store);
    }

    #[test]
    fn in_memory_store_contract() {
        let mut store = InMemoryDetectionStore::new();
        exercise(&mut store);
    }

    fn widest_windows_cover_everything(store: &mut dyn DetectionStore) {
        store
            .add_detection(&new_detection(Severity::High, 17.0, 75.0, 24 * 400))
            .unwrap();
        store
            .add_detection(&new_detection(Severity::Low, 17.1, 75.1, 0))
            .unwrap();
        assert_eq!(store.query_recent(u32::MAX, 10).unwrap().len(), 2);
        let stats = store.get_statistics(u32::MAX).unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.period_days, u32::MAX);
    }

    #[test]
    fn unbounded_look_back_on_sqlite() {
        let mut store = SqliteDetectionStore::open(&crate::shared_memory_uri()).unwrap();
        widest_windows_cover_everything(&mut store);
    }

    #[test]
    fn unbounded_look_back_in_memory() {
        let mut store = InMemoryDetectionStore::new();
        widest_windows_cover_everything(&mut store);
    }

    #[test]
    fn statistics_on_empty_store() {
        let store = SqliteDetectionStore::open(&crate::shared_memory_uri()).unwrap();
        let stats = store.get_statistics(30).unwrap();
        assert_eq!(stats.total, 0);
        assert_eq!(stats.avg_confidence, 0.0);
        assert_eq!(stats.by_severity.len(), 3);
    }

    #[test]
    fn gps_fixes_are_logged() {
        let fix = GpsFix {
            latitude: 17.66,
            longitude: 75.90,
            timestamp: Utc::now(),
            quality: crate::FixQuality::Dgps,
            satellites: 9,
            altitude_m: Some(480.0),
            hdop: Some(0.9),
        };
        let mut store = SqliteDetectionStore::open(&crate::shared_memory_uri()).unwrap();
        store.log_gps_fix(&fix).unwrap();
        let count: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM gps_log", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);

        let mut mem = InMemoryDetectionStore::new();
        mem.log_gps_fix(&fix).unwrap();
        assert_eq!(mem.gps_log(), &[fix]);
    }
}
