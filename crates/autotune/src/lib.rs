//! Tuning persistence and search for convforge.
//!
//! Stored tunings live in flat text files scoped by device identity: a
//! read-only shared layer shipped with the library and a user layer that
//! receives locally discovered configurations. [`PerformanceDatabase`] keeps
//! the in-memory mirror of both for the process lifetime.

pub mod db;
pub mod multi;
pub mod paths;
pub mod perfdb;
pub mod tuner;

pub use db::*;
pub use multi::*;
pub use paths::*;
pub use perfdb::*;
pub use tuner::*;
