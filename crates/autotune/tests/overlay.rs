use convforge_autotune::{DbLayer, DbPaths, PerformanceDatabase};
use convforge_backend_gpu::DeviceIdentity;
use std::fs;
use tempfile::tempdir;

const KEY: &str = "64-8-8-5x5-32-8-8-100-0x0-1x1-1x1-0-NCHW-FP32-F";

#[test]
fn shared_record_is_found_when_user_layer_is_empty() {
    let system = tempdir().unwrap();
    let user = tempdir().unwrap();
    let identity = DeviceIdentity::new("gfx900", 64);
    fs::write(
        system.path().join("gfx900_64.cd.pdb.txt"),
        format!("{KEY} 16.16.8.8.2.4.1.1.4\n"),
    )
    .unwrap();
    fs::write(user.path().join("gfx900_64.cd.updb.txt"), "").unwrap();

    let db = PerformanceDatabase::new(DbPaths::new(system.path(), user.path()));
    assert_eq!(
        db.find_with_layer(&identity, KEY),
        Some(("16.16.8.8.2.4.1.1.4".to_string(), DbLayer::Shared))
    );
    assert_eq!(db.find(&identity, "3-32-32-5x5-16-30-30-100-2x2-1x1-1x1-0-NCHW-FP32-F"), None);
}

#[test]
fn user_record_overrides_and_survives_reload() {
    let system = tempdir().unwrap();
    let user = tempdir().unwrap();
    let identity = DeviceIdentity::new("gfx900", 64);
    fs::write(
        system.path().join("gfx900_64.cd.pdb.txt"),
        format!("{KEY} 16.16.8.8.2.4.1.1.4\n"),
    )
    .unwrap();

    let paths = DbPaths::new(system.path(), user.path().join("tunings"));
    let db = PerformanceDatabase::new(paths.clone());
    db.update(&identity, KEY, "8.8.4.4.1.2.2.2.1").unwrap();
    drop(db);

    let reopened = PerformanceDatabase::new(paths);
    assert_eq!(
        reopened.find_with_layer(&identity, KEY),
        Some(("8.8.4.4.1.2.2.2.1".to_string(), DbLayer::User))
    );
}

#[test]
fn unreadable_shared_layer_degrades_to_empty() {
    let system = tempdir().unwrap();
    let user = tempdir().unwrap();
    let identity = DeviceIdentity::new("gfx900", 64);
    // A directory where the file should be cannot be read as text.
    fs::create_dir(system.path().join("gfx900_64.cd.pdb.txt")).unwrap();

    let db = PerformanceDatabase::new(DbPaths::new(system.path(), user.path()));
    assert_eq!(db.find(&identity, KEY), None);
}
