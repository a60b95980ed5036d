//! Runtime collaborator interface.

use convforge_problem::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Physical device identity; scopes database files and capability probes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub name: String,
    pub compute_units: usize,
}

impl DeviceIdentity {
    pub fn new(name: impl Into<String>, compute_units: usize) -> Self {
        Self {
            name: name.into(),
            compute_units,
        }
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.name, self.compute_units)
    }
}

/// Platform strings exposed by runtimes that allow introspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformInfo {
    pub platform_vendor: String,
    /// e.g. `"OpenCL 2.0 AMD-APP (2482.3)"`.
    pub platform_version: String,
    pub device_vendor_id: u32,
    /// e.g. `"2482.3 (HSA1.1,LC)"`.
    pub driver_version: String,
}

/// A request to build one program.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProgramRequest {
    pub source_id: String,
    pub options: String,
    /// `source_id` holds the program text itself rather than a name.
    pub inline_source: bool,
}

/// A compiled, device-specific program artifact.
pub trait CompiledProgram: Send + Sync + fmt::Debug {
    fn source_id(&self) -> &str;
}

pub trait Device: Send + Sync {
    fn identity(&self) -> DeviceIdentity;

    /// `None` when the backend cannot introspect its platform.
    fn platform_info(&self) -> Option<PlatformInfo>;

    /// Whether a working assembler is installed for this device.
    fn assembler_available(&self) -> bool;

    /// Probe for the assembler metadata bug present before the vendor runtime
    /// metadata format. Only consulted on backends without platform info.
    fn assembler_has_metadata_bug(&self) -> bool {
        true
    }

    /// Blocking build. Errors are reported as `Error::Compilation`.
    fn build_program(&self, request: &ProgramRequest) -> Result<Box<dyn CompiledProgram>>;
}

pub type DeviceHandle = Arc<dyn Device>;
