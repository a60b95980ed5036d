//! Device interface for convforge.
//!
//! The [`Device`] trait is the boundary to the GPU runtime: identity, platform
//! introspection and program builds. [`CapabilityCache`] probes each distinct
//! device once and hands the resulting flags to every [`ExecutionContext`].

pub mod capability;
pub mod context;
pub mod device;
pub mod runtime;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use capability::*;
pub use context::*;
pub use device::*;
pub use runtime::*;
