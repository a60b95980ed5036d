//! Single-file performance database.
//!
//! One record per line: `<key> <token0>.<token1>...<tokenN>`. The file is read
//! on first access. Missing or unreadable files load as empty; malformed lines
//! are logged and skipped.

use convforge_problem::{Error, Result};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Splits a record line into key and tuning blob. Blank lines yield `Ok(None)`.
pub fn parse_record(line: &str) -> std::result::Result<Option<(&str, &str)>, &'static str> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let mut fields = line.split_whitespace();
    let (Some(key), Some(blob)) = (fields.next(), fields.next()) else {
        return Err("missing tuning tokens");
    };
    if fields.next().is_some() {
        return Err("trailing fields after tuning tokens");
    }
    if blob.split('.').any(str::is_empty) {
        return Err("empty tuning token");
    }
    Ok(Some((key, blob)))
}

fn check_record(key: &str, blob: &str) -> Result<()> {
    if key.is_empty() || key.contains(char::is_whitespace) {
        return Err(Error::configuration(format!("invalid database key `{key}`")));
    }
    if blob.is_empty() || blob.contains(char::is_whitespace) || blob.split('.').any(str::is_empty) {
        return Err(Error::configuration(format!("invalid tuning blob `{blob}` for `{key}`")));
    }
    Ok(())
}

#[derive(Debug)]
pub struct Db {
    path: PathBuf,
    records: Option<BTreeMap<String, String>>,
}

impl Db {
    /// Does not touch the file system until the first lookup.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            records: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_loaded(&self) -> bool {
        self.records.is_some()
    }

    pub fn find(&mut self, key: &str) -> Option<String> {
        self.records().get(key).cloned()
    }

    /// Inserts or overwrites a record and rewrites the file.
    pub fn store(&mut self, key: &str, blob: &str) -> Result<()> {
        check_record(key, blob)?;
        self.records().insert(key.to_string(), blob.to_string());
        self.flush()
    }

    /// Removes a record; returns whether it existed.
    pub fn remove(&mut self, key: &str) -> Result<bool> {
        let existed = self.records().remove(key).is_some();
        if existed {
            self.flush()?;
        }
        Ok(existed)
    }

    pub fn len(&mut self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&mut self) -> bool {
        self.len() == 0
    }

    pub fn keys(&mut self) -> Vec<String> {
        self.records().keys().cloned().collect()
    }

    /// Writes every record in key order, creating parent directories.
    pub fn flush(&mut self) -> Result<()> {
        let path = self.path.clone();
        let io_err = |source: io::Error| Error::DatabaseIo {
            path: path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(io_err)?;
            }
        }

        let mut out = Vec::new();
        for (key, blob) in self.records().iter() {
            writeln!(out, "{key} {blob}").map_err(io_err)?;
        }
        fs::write(&self.path, out).map_err(io_err)?;
        debug!(path = %self.path.display(), "performance database written");
        Ok(())
    }

    fn records(&mut self) -> &mut BTreeMap<String, String> {
        let path = &self.path;
        self.records.get_or_insert_with(|| load(path))
    }
}

fn load(path: &Path) -> BTreeMap<String, String> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "performance database not found; starting empty");
            return BTreeMap::new();
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "performance database unreadable; starting empty");
            return BTreeMap::new();
        }
    };

    let mut records = BTreeMap::new();
    for (idx, line) in text.lines().enumerate() {
        match parse_record(line) {
            Ok(Some((key, blob))) => {
                records.insert(key.to_string(), blob.to_string());
            }
            Ok(None) => {}
            Err(reason) => {
                warn!(path = %path.display(), line = idx + 1, reason, "skipping malformed database line");
            }
        }
    }
    debug!(path = %path.display(), records = records.len(), "performance database loaded");
    records
}
