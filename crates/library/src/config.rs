//! Library instance configuration.

use convforge_autotune::{Autotuner, CancellationToken, DbPaths, SearchBudget};
use convforge_backend_gpu::ProbeOptions;
use convforge_problem::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LibraryConfig {
    /// Directory holding the read-only shared performance databases.
    pub system_db_dir: PathBuf,
    /// Directory receiving locally discovered tunings.
    pub user_db_dir: PathBuf,
    pub disable_asm_kernels: bool,
    pub disable_binaries: bool,
    pub compile_timeout_ms: Option<u64>,
    pub search_timeout_ms: Option<u64>,
    pub autotune_warmup_runs: usize,
    pub autotune_runs: usize,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            system_db_dir: PathBuf::from("db"),
            user_db_dir: PathBuf::from(".convforge/db"),
            disable_asm_kernels: false,
            disable_binaries: false,
            compile_timeout_ms: None,
            search_timeout_ms: None,
            autotune_warmup_runs: 1,
            autotune_runs: 5,
        }
    }
}

impl LibraryConfig {
    /// Reads a JSON config; absent fields keep their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let blob = fs::read_to_string(path).map_err(|err| {
            Error::configuration(format!("cannot read config {}: {err}", path.display()))
        })?;
        serde_json::from_str(&blob).map_err(|err| {
            Error::configuration(format!("invalid config {}: {err}", path.display()))
        })
    }

    pub fn probe_options(&self) -> ProbeOptions {
        ProbeOptions {
            disable_asm_kernels: self.disable_asm_kernels,
            disable_binaries: self.disable_binaries,
        }
    }

    pub fn db_paths(&self) -> DbPaths {
        DbPaths::new(&self.system_db_dir, &self.user_db_dir)
    }

    pub fn compile_timeout(&self) -> Option<Duration> {
        self.compile_timeout_ms.map(Duration::from_millis)
    }

    pub fn search_timeout(&self) -> Option<Duration> {
        self.search_timeout_ms.map(Duration::from_millis)
    }

    pub fn autotuner(&self, cancel: CancellationToken) -> Autotuner {
        Autotuner::new()
            .with_repetitions(self.autotune_warmup_runs, self.autotune_runs)
            .with_budget(SearchBudget::new(cancel).with_timeout(self.search_timeout()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn partial_json_keeps_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("convforge.json");
        fs::write(&path, r#"{ "user_db_dir": "/tmp/tunings", "search_timeout_ms": 250 }"#).unwrap();

        let config = LibraryConfig::load(&path).unwrap();
        assert_eq!(config.user_db_dir, PathBuf::from("/tmp/tunings"));
        assert_eq!(config.search_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.autotune_runs, 5);
        assert_eq!(config.compile_timeout(), None);

        let tuner = config.autotuner(CancellationToken::new());
        assert_eq!(tuner.warmup_runs(), 1);
        assert_eq!(tuner.budget().timeout(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn unreadable_or_invalid_config_is_a_configuration_error() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            LibraryConfig::load(dir.path().join("missing.json")),
            Err(Error::Configuration(_))
        ));

        let path = dir.path().join("bad.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(LibraryConfig::load(&path), Err(Error::Configuration(_))));
    }
}
