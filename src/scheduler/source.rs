//! Device source seam between the engine and persistent storage.

use thiserror::Error;

use crate::db::{DbError, DeviceRecord, StatusUpdate, Store};

#[derive(Error, Debug)]
pub enum SourceError {
    /// The backing store could not be reached at all.
    #[error("device source unavailable: {0}")]
    Unavailable(String),
    /// The store was reachable but refused the operation.
    #[error("device source rejected the request: {0}")]
    Rejected(String),
}

impl From<DbError> for SourceError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::Sqlite(e) => SourceError::Unavailable(e.to_string()),
            other => SourceError::Rejected(other.to_string()),
        }
    }
}

/// Supplies device records to the engine and accepts its status batches.
///
/// Calls are blocking; the engine runs them on the blocking pool.
pub trait DeviceSource: Send + Sync {
    fn list_enabled_devices(&self) -> Result<Vec<DeviceRecord>, SourceError>;

    /// Apply every update or none of them.
    fn apply_status_batch(&self, updates: &[StatusUpdate]) -> Result<(), SourceError>;
}

impl DeviceSource for Store {
    fn list_enabled_devices(&self) -> Result<Vec<DeviceRecord>, SourceError> {
        Ok(Store::list_enabled_devices(self)?)
    }

    fn apply_status_batch(&self, updates: &[StatusUpdate]) -> Result<(), SourceError> {
        let applied = Store::apply_status_batch(self, updates)?;
        if applied < updates.len() {
            tracing::debug!(
                "Status batch: {} of {} devices written",
                applied,
                updates.len()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod memory {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// In-memory device source with switchable failures.
    #[derive(Default)]
    pub struct MemorySource {
        pub devices: Mutex<Vec<DeviceRecord>>,
        pub batches: Mutex<Vec<Vec<StatusUpdate>>>,
        pub fail_list: AtomicBool,
        pub fail_apply: AtomicBool,
    }

    impl MemorySource {
        pub fn with_devices(devices: &[(&str, &str)]) -> Self {
            let source = Self::default();
            source.set_devices(devices);
            source
        }

        pub fn set_devices(&self, devices: &[(&str, &str)]) {
            *self.devices.lock().unwrap() = devices
                .iter()
                .map(|(id, address)| DeviceRecord {
                    id: id.to_string(),
                    address: address.to_string(),
                    enabled: true,
                })
                .collect();
        }

        pub fn batch_count(&self) -> usize {
            self.batches.lock().unwrap().len()
        }
    }

    impl DeviceSource for MemorySource {
        fn list_enabled_devices(&self) -> Result<Vec<DeviceRecord>, SourceError> {
            if self.fail_list.load(Ordering::SeqCst) {
                return Err(SourceError::Unavailable("database is locked".to_string()));
            }
            Ok(self
                .devices
                .lock()
                .unwrap()
                .iter()
                .filter(|d| d.enabled)
                .cloned()
                .collect())
        }

        fn apply_status_batch(&self, updates: &[StatusUpdate]) -> Result<(), SourceError> {
            if self.fail_apply.load(Ordering::SeqCst) {
                return Err(SourceError::Unavailable("disk I/O error".to_string()));
            }
            self.batches.lock().unwrap().push(updates.to_vec());
            Ok(())
        }
    }
}
