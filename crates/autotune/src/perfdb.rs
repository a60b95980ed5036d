//! Process-wide performance database mirror.

use crate::multi::{DbLayer, MultiFileDb};
use crate::paths::DbPaths;
use convforge_backend_gpu::DeviceIdentity;
use convforge_problem::Result;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info};

/// Device-scoped two-layer databases behind one lock.
///
/// Writers for the same key serialize through the lock guarding the mirror;
/// the last writer wins.
#[derive(Debug)]
pub struct PerformanceDatabase {
    paths: DbPaths,
    devices: Mutex<HashMap<DeviceIdentity, MultiFileDb>>,
}

impl PerformanceDatabase {
    pub fn new(paths: DbPaths) -> Self {
        Self {
            paths,
            devices: Mutex::new(HashMap::new()),
        }
    }

    pub fn paths(&self) -> &DbPaths {
        &self.paths
    }

    pub fn find(&self, identity: &DeviceIdentity, key: &str) -> Option<String> {
        self.find_with_layer(identity, key).map(|(blob, _)| blob)
    }

    pub fn find_with_layer(&self, identity: &DeviceIdentity, key: &str) -> Option<(String, DbLayer)> {
        self.with_device(identity, |db| {
            let found = db.find_with_layer(key);
            debug!(device = %identity, key, hit = found.is_some(), "performance database lookup");
            found
        })
    }

    /// Persists a tuning to the user layer for the device.
    pub fn update(&self, identity: &DeviceIdentity, key: &str, blob: &str) -> Result<()> {
        self.with_device(identity, |db| db.store(key, blob))?;
        info!(device = %identity, key, blob, "stored tuning");
        Ok(())
    }

    pub fn remove(&self, identity: &DeviceIdentity, key: &str) -> Result<bool> {
        self.with_device(identity, |db| db.remove(key))
    }

    /// Drops the in-memory mirror; files are reread on next access.
    pub fn clear(&self) {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    fn with_device<T>(&self, identity: &DeviceIdentity, f: impl FnOnce(&mut MultiFileDb) -> T) -> T {
        let mut devices = self.devices.lock().unwrap_or_else(PoisonError::into_inner);
        let db = devices.entry(identity.clone()).or_insert_with(|| {
            MultiFileDb::new(self.paths.shared_path(identity), self.paths.user_path(identity))
        });
        f(db)
    }
}
