//! Device capability detection.
//!
//! This is the only place that introspects the device or its platform. Results
//! are cached per [`DeviceIdentity`] for the lifetime of the owning library
//! instance and handed to execution contexts as plain flags.

use crate::device::{Device, DeviceIdentity, PlatformInfo};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info};

pub const RECOGNIZED_PLATFORM_VENDOR: &str = "Advanced Micro Devices, Inc.";
pub const RECOGNIZED_DEVICE_VENDOR_ID: u32 = 0x1002;

const DRIVER_VERSION_DELIMITERS: &str = " (),*";
const LIGHTNING_COMPILER_TOKEN: &str = "LC";

// Runtime build numbers at which the code object metadata format changed.
const METADATA_V2_BUILD: u64 = 2338;
const METADATA_V3_BUILD: u64 = 2389;
const METADATA_VENDOR_RUNTIME_BUILD: u64 = 2535;

/// Code object metadata convention of the runtime, in release order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MetadataVersion {
    Unknown,
    V1,
    V2,
    V3,
    VendorRuntime,
}

impl MetadataVersion {
    /// Assumed when the platform cannot tell us.
    pub const DEFAULT: MetadataVersion = MetadataVersion::V3;
}

impl Default for MetadataVersion {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for MetadataVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MetadataVersion::Unknown => "Unknown",
            MetadataVersion::V1 => "V1",
            MetadataVersion::V2 => "V2",
            MetadataVersion::V3 => "V3",
            MetadataVersion::VendorRuntime => "VendorRuntime",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Capabilities {
    pub use_asm_kernels: bool,
    pub use_binaries: bool,
    pub metadata_version: MetadataVersion,
}

/// Switches that force capabilities off regardless of what the device reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeOptions {
    pub disable_asm_kernels: bool,
    pub disable_binaries: bool,
}

/// True when `token` appears in `s` as a whole token between delimiters.
pub fn is_token_within(s: &str, delimiters: &str, token: &str) -> bool {
    s.split(|c| delimiters.contains(c))
        .filter(|part| !part.is_empty())
        .any(|part| part == token)
}

/// Classifies a platform version such as `"OpenCL 2.0 AMD-APP (2334.0)"` by the
/// build number following the first `(`.
pub fn classify_platform_version(version: &str) -> MetadataVersion {
    let Some(open) = version.find('(') else {
        return MetadataVersion::Unknown;
    };
    let digits: String = version[open + 1..]
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    let Ok(build) = digits.parse::<u64>() else {
        return MetadataVersion::Unknown;
    };

    if build < METADATA_V2_BUILD {
        MetadataVersion::V1
    } else if build < METADATA_V3_BUILD {
        MetadataVersion::V2
    } else if build < METADATA_VENDOR_RUNTIME_BUILD {
        MetadataVersion::V3
    } else {
        MetadataVersion::VendorRuntime
    }
}

pub fn is_recognized_platform(info: &PlatformInfo) -> bool {
    info.platform_vendor == RECOGNIZED_PLATFORM_VENDOR
        && info.device_vendor_id == RECOGNIZED_DEVICE_VENDOR_ID
        && is_token_within(
            &info.driver_version,
            DRIVER_VERSION_DELIMITERS,
            LIGHTNING_COMPILER_TOKEN,
        )
}

/// Runs detection against the device without consulting any cache.
pub fn probe_device(device: &dyn Device, options: ProbeOptions) -> Capabilities {
    let metadata_version = match device.platform_info() {
        Some(info) if is_recognized_platform(&info) => classify_platform_version(&info.platform_version),
        Some(info) => {
            debug!(
                vendor = %info.platform_vendor,
                vendor_id = info.device_vendor_id,
                "platform not recognized; assembly and binary kernels disabled"
            );
            return Capabilities::default();
        }
        None => {
            if device.assembler_has_metadata_bug() {
                MetadataVersion::DEFAULT
            } else {
                MetadataVersion::VendorRuntime
            }
        }
    };

    Capabilities {
        use_asm_kernels: !options.disable_asm_kernels && device.assembler_available(),
        use_binaries: !options.disable_binaries,
        metadata_version,
    }
}

/// Process-wide capability cache keyed by device identity.
#[derive(Debug, Default)]
pub struct CapabilityCache {
    options: ProbeOptions,
    entries: Mutex<HashMap<DeviceIdentity, Capabilities>>,
}

impl CapabilityCache {
    pub fn new(options: ProbeOptions) -> Self {
        Self {
            options,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn options(&self) -> ProbeOptions {
        self.options
    }

    /// Probes on first use of an identity; later calls reuse the stored result.
    pub fn detect(&self, device: &dyn Device) -> Capabilities {
        let identity = device.identity();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(caps) = entries.get(&identity) {
            return *caps;
        }

        let caps = probe_device(device, self.options);
        info!(
            device = %identity,
            asm = caps.use_asm_kernels,
            binaries = caps.use_binaries,
            metadata = %caps.metadata_version,
            "device capabilities detected"
        );
        entries.insert(identity, caps);
        caps
    }

    pub fn cached(&self, identity: &DeviceIdentity) -> Option<Capabilities> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(identity)
            .copied()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every probed entry; called on library shutdown.
    pub fn clear(&self) {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}
