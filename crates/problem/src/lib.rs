//! Problem fingerprints for convforge.
//!
//! A [`ProblemDescriptor`] captures the shape, type and direction of one compute
//! operation and serializes it to the canonical key shared by the performance
//! database and the kernel cache. [`OperatorKind`] names the operator family the
//! descriptor belongs to, so solver selection is driven by data rather than by type.

pub mod descriptor;
pub mod error;
pub mod operator;

pub use descriptor::*;
pub use error::*;
pub use operator::*;
