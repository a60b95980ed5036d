//! Solver candidates and the search engine.
//!
//! Every candidate is a stateless [`SolverCandidate`]. The [`SolverRegistry`]
//! holds them in priority order per operator family and the [`SearchEngine`]
//! walks that order, resolving tuning configurations through the performance
//! database or empirical search.

pub mod config;
pub mod conv_asm;
pub mod conv_direct;
pub mod conv_wrw;
pub mod engine;
pub mod misc;
pub mod registry;
pub mod solution;
pub mod solver;
pub mod winograd;

pub use config::*;
pub use conv_asm::*;
pub use conv_direct::*;
pub use conv_wrw::*;
pub use engine::*;
pub use misc::*;
pub use registry::*;
pub use solution::*;
pub use solver::*;
pub use winograd::*;
