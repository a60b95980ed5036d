//! In-memory caches for compiled programs and launchable kernels.
//!
//! Both caches are process-wide state owned by a library instance. Entries are
//! only removed by explicit clears; growth is unbounded.

pub mod kernel;
pub mod program;

pub use kernel::*;
pub use program::*;
