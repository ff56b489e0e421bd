//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, ErrorCode, Result as SqlResult, Row};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use super::models::*;
use crate::scheduler::HealthStatus;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

const DEVICE_COLUMNS: &str = "id, device_id, ip, description, category, enabled, status, \
     response_ms, last_check, created_at, updated_at";

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Not found")]
    NotFound,
    #[error("Device {0} already exists")]
    Duplicate(String),
}

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the database with migrations.
    fn init(&self) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();

        // Run migrations inline (embedded SQL)
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 1 failed: {}", e)))?;

        Ok(())
    }

    // --- Device CRUD ---

    /// Add a new device and return its row ID.
    pub fn add_device(&self, device: &mut Device) -> Result<i64, DbError> {
        let now = Utc::now();
        if device.category.trim().is_empty() {
            device.category = DEFAULT_CATEGORY.to_string();
        }

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO devices (device_id, ip, description, category, enabled, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            params![
                device.device_id,
                device.ip,
                device.description,
                device.category,
                device.enabled,
                HealthStatus::Unknown.as_str(),
                format_time(now),
            ],
        )
        .map_err(|e| duplicate_or(e, &device.device_id))?;

        device.id = conn.last_insert_rowid();
        device.status = HealthStatus::Unknown;
        device.created_at = now;
        device.updated_at = now;
        Ok(device.id)
    }

    /// Update the editable fields of an existing device. Monitoring columns
    /// are left untouched.
    pub fn update_device(&self, device_id: &str, device: &Device) -> Result<(), DbError> {
        let category = if device.category.trim().is_empty() {
            DEFAULT_CATEGORY
        } else {
            device.category.as_str()
        };

        let conn = self.conn.lock().unwrap();
        let changed = conn
            .execute(
                "UPDATE devices SET device_id=?1, ip=?2, description=?3, category=?4, enabled=?5, updated_at=?6
                 WHERE device_id=?7",
                params![
                    device.device_id,
                    device.ip,
                    device.description,
                    category,
                    device.enabled,
                    format_time(Utc::now()),
                    device_id,
                ],
            )
            .map_err(|e| duplicate_or(e, &device.device_id))?;

        if changed == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Get all devices ordered by device ID.
    pub fn get_devices(&self) -> Result<Vec<Device>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM devices ORDER BY device_id",
            DEVICE_COLUMNS
        ))?;

        let devices = stmt
            .query_map([], device_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(devices)
    }

    /// Get a device by its device ID.
    pub fn get_device(&self, device_id: &str) -> Result<Device, DbError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!("SELECT {} FROM devices WHERE device_id = ?1", DEVICE_COLUMNS),
            params![device_id],
            device_from_row,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => DbError::NotFound,
            other => DbError::Sqlite(other),
        })
    }

    /// Delete a device.
    pub fn delete_device(&self, device_id: &str) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute("DELETE FROM devices WHERE device_id = ?1", params![device_id])?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    // --- Monitoring ---

    /// Devices the monitoring engine should probe.
    pub fn list_enabled_devices(&self) -> Result<Vec<DeviceRecord>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT device_id, ip, enabled FROM devices WHERE enabled = 1 ORDER BY device_id",
        )?;

        let records = stmt
            .query_map([], |row| {
                Ok(DeviceRecord {
                    id: row.get(0)?,
                    address: row.get(1)?,
                    enabled: row.get(2)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(records)
    }

    /// Apply a cycle's status batch atomically.
    ///
    /// Reads the affected device IDs once, then writes every known device in
    /// a single transaction. Updates for unknown devices are skipped. Returns
    /// the number of devices written.
    pub fn apply_status_batch(&self, updates: &[StatusUpdate]) -> Result<usize, DbError> {
        if updates.is_empty() {
            return Ok(0);
        }

        let conn = self.conn.lock().unwrap();

        let known: HashSet<String> = {
            let placeholders = vec!["?"; updates.len()].join(",");
            let mut stmt = conn.prepare(&format!(
                "SELECT device_id FROM devices WHERE device_id IN ({})",
                placeholders
            ))?;
            let ids = stmt
                .query_map(params_from_iter(updates.iter().map(|u| &u.device_id)), |row| {
                    row.get::<_, String>(0)
                })?
                .collect::<SqlResult<HashSet<_>>>()?;
            ids
        };

        let tx = conn.unchecked_transaction()?;
        let mut applied = 0;

        {
            let mut stmt = tx.prepare(
                "UPDATE devices SET status=?1, response_ms=?2, last_check=?3 WHERE device_id=?4",
            )?;

            for update in updates {
                if !known.contains(&update.device_id) {
                    tracing::debug!("Skipping status for unknown device {}", update.device_id);
                    continue;
                }
                stmt.execute(params![
                    update.status.as_str(),
                    update.latency_ms,
                    format_time(update.checked_at),
                    update.device_id,
                ])?;
                applied += 1;
            }
        }

        tx.commit()?;
        Ok(applied)
    }
}

fn device_from_row(row: &Row<'_>) -> SqlResult<Device> {
    let status: String = row.get(6)?;
    let last_check: Option<String> = row.get(8)?;
    let created_at: String = row.get(9)?;
    let updated_at: String = row.get(10)?;

    Ok(Device {
        id: row.get(0)?,
        device_id: row.get(1)?,
        ip: row.get(2)?,
        description: row.get(3)?,
        category: row.get(4)?,
        enabled: row.get(5)?,
        status: status.parse().unwrap_or_default(),
        response_ms: row.get(7)?,
        last_check: last_check.as_deref().and_then(parse_db_time),
        created_at: parse_db_time(&created_at).unwrap_or_else(Utc::now),
        updated_at: parse_db_time(&updated_at).unwrap_or_else(Utc::now),
    })
}

fn duplicate_or(e: rusqlite::Error, device_id: &str) -> DbError {
    match &e {
        rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation => {
            DbError::Duplicate(device_id.to_string())
        }
        _ => DbError::Sqlite(e),
    }
}

fn format_time(t: DateTime<Utc>) -> String {
    t.format(TIME_FORMAT).to_string()
}

fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [TIME_FORMAT, "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::NamedTempFile;

    fn device(device_id: &str, ip: &str) -> Device {
        Device {
            device_id: device_id.to_string(),
            ip: ip.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_device_crud() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();

        // Create
        let mut d = device("T001", "10.2.98.112");
        d.category = String::new();
        let id = store.add_device(&mut d).unwrap();
        assert!(id > 0);

        // Read
        let fetched = store.get_device("T001").unwrap();
        assert_eq!(fetched.ip, "10.2.98.112");
        assert_eq!(fetched.category, DEFAULT_CATEGORY);
        assert_eq!(fetched.status, HealthStatus::Unknown);
        assert!(fetched.enabled);

        // Update
        let mut updated = fetched;
        updated.description = "North gate".to_string();
        updated.ip = "10.2.98.113".to_string();
        store.update_device("T001", &updated).unwrap();

        let fetched2 = store.get_device("T001").unwrap();
        assert_eq!(fetched2.description, "North gate");
        assert_eq!(fetched2.ip, "10.2.98.113");

        // Delete
        store.delete_device("T001").unwrap();
        assert!(matches!(store.get_device("T001"), Err(DbError::NotFound)));
        assert!(matches!(store.delete_device("T001"), Err(DbError::NotFound)));
    }

    #[test]
    fn test_duplicate_device_rejected() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();

        store.add_device(&mut device("T001", "10.0.0.1")).unwrap();
        let err = store.add_device(&mut device("T001", "10.0.0.2")).unwrap_err();
        assert!(matches!(err, DbError::Duplicate(id) if id == "T001"));
    }

    #[test]
    fn test_update_missing_device() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();

        let err = store.update_device("nope", &device("nope", "10.0.0.1")).unwrap_err();
        assert!(matches!(err, DbError::NotFound));
    }

    #[test]
    fn test_list_enabled_devices() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();

        store.add_device(&mut device("T002", "10.0.0.2")).unwrap();
        store.add_device(&mut device("T001", "10.0.0.1")).unwrap();
        let mut disabled = device("T003", "10.0.0.3");
        disabled.enabled = false;
        store.add_device(&mut disabled).unwrap();

        let records = store.list_enabled_devices().unwrap();
        let ids: Vec<_> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["T001", "T002"]);
        assert!(records.iter().all(|r| r.enabled));
        assert_eq!(records[0].address, "10.0.0.1");
    }

    #[test]
    fn test_status_batch_reads_back_identically() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();

        let base = Utc::now();
        let mut updates = Vec::new();
        for i in 0..20 {
            let id = format!("T{:03}", i);
            store.add_device(&mut device(&id, &format!("10.0.0.{}", i))).unwrap();
            updates.push(StatusUpdate {
                device_id: id,
                status: match i % 3 {
                    0 => HealthStatus::Online,
                    1 => HealthStatus::Offline,
                    _ => HealthStatus::Error,
                },
                latency_ms: (i % 3 == 0).then(|| 10.5 + i as f64),
                checked_at: base + Duration::milliseconds(i),
            });
        }

        assert_eq!(store.apply_status_batch(&updates).unwrap(), 20);
        // Applying the same batch again changes nothing
        assert_eq!(store.apply_status_batch(&updates).unwrap(), 20);

        for update in &updates {
            let d = store.get_device(&update.device_id).unwrap();
            assert_eq!(d.status, update.status);
            assert_eq!(d.response_ms, update.latency_ms);
            assert_eq!(d.last_check, Some(update.checked_at));
        }
    }

    #[test]
    fn test_status_batch_skips_unknown_devices() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        store.add_device(&mut device("T001", "10.0.0.1")).unwrap();

        let now = Utc::now();
        let updates = vec![
            StatusUpdate {
                device_id: "T001".to_string(),
                status: HealthStatus::Online,
                latency_ms: Some(4.0),
                checked_at: now,
            },
            StatusUpdate {
                device_id: "ghost".to_string(),
                status: HealthStatus::Offline,
                latency_ms: None,
                checked_at: now,
            },
        ];

        assert_eq!(store.apply_status_batch(&updates).unwrap(), 1);
        assert!(matches!(store.get_device("ghost"), Err(DbError::NotFound)));
        assert_eq!(store.apply_status_batch(&[]).unwrap(), 0);
    }
}
