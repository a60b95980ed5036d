use crate::db::Db;
use convforge_problem::Result;
use std::path::PathBuf;

/// Which layer answered a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbLayer {
    User,
    Shared,
}

/// Read-only shared layer overlaid by a writable user layer.
#[derive(Debug)]
pub struct MultiFileDb {
    shared: Db,
    user: Db,
}

impl MultiFileDb {
    pub fn new(shared_path: impl Into<PathBuf>, user_path: impl Into<PathBuf>) -> Self {
        Self {
            shared: Db::new(shared_path),
            user: Db::new(user_path),
        }
    }

    /// User entries shadow shared entries for the same key.
    pub fn find(&mut self, key: &str) -> Option<String> {
        self.find_with_layer(key).map(|(blob, _)| blob)
    }

    pub fn find_with_layer(&mut self, key: &str) -> Option<(String, DbLayer)> {
        if let Some(blob) = self.user.find(key) {
            return Some((blob, DbLayer::User));
        }
        self.shared.find(key).map(|blob| (blob, DbLayer::Shared))
    }

    /// Writes go to the user layer only.
    pub fn store(&mut self, key: &str, blob: &str) -> Result<()> {
        self.user.store(key, blob)
    }

    /// Removes a user override; shared records are never modified.
    pub fn remove(&mut self, key: &str) -> Result<bool> {
        self.user.remove(key)
    }

    pub fn shared(&mut self) -> &mut Db {
        &mut self.shared
    }

    pub fn user(&mut self) -> &mut Db {
        &mut self.user
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn user_layer_overrides_shared() {
        let dir = tempdir().unwrap();
        let shared = dir.path().join("dev_4.cd.pdb.txt");
        fs::write(&shared, "k 1.1.1\nonly-shared 2.2\n").unwrap();
        let mut db = MultiFileDb::new(&shared, dir.path().join("dev_4.cd.updb.txt"));

        assert_eq!(db.find_with_layer("k"), Some(("1.1.1".into(), DbLayer::Shared)));
        db.store("k", "9.9.9").unwrap();
        assert_eq!(db.find_with_layer("k"), Some(("9.9.9".into(), DbLayer::User)));
        assert_eq!(db.find("only-shared").as_deref(), Some("2.2"));

        // Shared file is untouched by writes.
        assert_eq!(fs::read_to_string(&shared).unwrap(), "k 1.1.1\nonly-shared 2.2\n");

        assert!(db.remove("k").unwrap());
        assert_eq!(db.find("k").as_deref(), Some("1.1.1"));
        assert!(!db.remove("only-shared").unwrap());
    }
}
