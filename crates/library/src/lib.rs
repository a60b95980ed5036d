//! convforge: pick, tune and cache GPU kernels for convolution-family
//! operators.
//!
//! A [`Library`] owns the process-wide state for one device: probed
//! capabilities, the two-layer performance database and the program and
//! kernel caches. Problems go in as [`ProblemDescriptor`] values plus an
//! [`OperatorKind`]; compiled, launch-ready kernels come out.

#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod library;

pub use config::*;
pub use library::*;

pub use convforge_autotune as autotune;
pub use convforge_backend_gpu as backend;
pub use convforge_cache as cache;
pub use convforge_problem::{
    ConvParams, DataType, Direction, Error, Layout, LrnParams, LrnRegion, NeuronKind, NeuronParams, OperatorKind,
    PoolingMethod, PoolingParams, ProblemDescriptor, Result, TensorShape,
};
pub use convforge_solvers as solvers;
