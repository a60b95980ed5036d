use convforge_backend_gpu::DeviceIdentity;
use std::path::{Path, PathBuf};

pub const SHARED_DB_SUFFIX: &str = "cd.pdb.txt";
pub const USER_DB_SUFFIX: &str = "cd.updb.txt";

/// Roots of the shared and user database layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbPaths {
    pub system_dir: PathBuf,
    pub user_dir: PathBuf,
}

impl DbPaths {
    pub fn new(system_dir: impl Into<PathBuf>, user_dir: impl Into<PathBuf>) -> Self {
        Self {
            system_dir: system_dir.into(),
            user_dir: user_dir.into(),
        }
    }

    /// `<system_dir>/<name>_<cu>.cd.pdb.txt`
    pub fn shared_path(&self, identity: &DeviceIdentity) -> PathBuf {
        db_file(&self.system_dir, identity, SHARED_DB_SUFFIX)
    }

    /// `<user_dir>/<name>_<cu>.cd.updb.txt`
    pub fn user_path(&self, identity: &DeviceIdentity) -> PathBuf {
        db_file(&self.user_dir, identity, USER_DB_SUFFIX)
    }
}

fn db_file(root: &Path, identity: &DeviceIdentity, suffix: &str) -> PathBuf {
    root.join(format!("{}_{}.{}", file_stem(&identity.name), identity.compute_units, suffix))
}

/// Adapter names may carry separators and spaces, e.g. GL renderer strings.
fn file_stem(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | ' ' => '_',
            c => c,
        })
        .collect()
}
