//! Launchable kernels and the (algorithm, network config) slot cache.

use crate::program::{Program, ProgramCache};
use convforge_backend_gpu::{DeviceHandle, ProgramRequest};
use convforge_problem::{Error, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};
use tracing::debug;

/// Algorithm tags containing this marker pass program text as the source id.
pub const INLINE_SOURCE_MARKER: &str = "GEMM";

/// A named entry point in a program bound to launch dimensions.
#[derive(Debug, Clone)]
pub struct Kernel {
    pub program: Program,
    pub entry_point: String,
    pub local_work: Vec<usize>,
    pub global_work: Vec<usize>,
}

impl Kernel {
    pub fn name(&self) -> &str {
        &self.entry_point
    }
}

/// Everything needed to build one kernel and optionally cache it.
#[derive(Debug, Clone, Default)]
pub struct KernelRequest {
    pub algorithm: String,
    pub network_config: String,
    pub source_id: String,
    pub entry_point: String,
    pub local_work: Vec<usize>,
    pub global_work: Vec<usize>,
    pub options: String,
    pub slot: usize,
}

impl KernelRequest {
    pub fn new(source_id: impl Into<String>, entry_point: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            entry_point: entry_point.into(),
            ..Self::default()
        }
    }

    pub fn cached_as(mut self, algorithm: impl Into<String>, network_config: impl Into<String>) -> Self {
        self.algorithm = algorithm.into();
        self.network_config = network_config.into();
        self
    }

    pub fn with_work(mut self, local: Vec<usize>, global: Vec<usize>) -> Self {
        self.local_work = local;
        self.global_work = global;
        self
    }

    pub fn with_options(mut self, options: impl Into<String>) -> Self {
        self.options = options.into();
        self
    }

    pub fn at_slot(mut self, slot: usize) -> Self {
        self.slot = slot;
        self
    }

    fn is_cacheable(&self) -> bool {
        !self.algorithm.is_empty() && !self.network_config.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct KernelKey {
    algorithm: String,
    network_config: String,
}

impl KernelKey {
    fn new(algorithm: &str, network_config: &str) -> Self {
        Self {
            algorithm: algorithm.to_string(),
            network_config: network_config.to_string(),
        }
    }
}

/// Kernel slot vectors keyed by (algorithm, network config), backed by a
/// [`ProgramCache`] so every program is compiled at most once.
#[derive(Default)]
pub struct KernelCache {
    programs: ProgramCache,
    kernels: Mutex<HashMap<KernelKey, Vec<Option<Kernel>>>>,
}

impl KernelCache {
    pub fn new(programs: ProgramCache) -> Self {
        Self {
            programs,
            kernels: Mutex::new(HashMap::new()),
        }
    }

    pub fn programs(&self) -> &ProgramCache {
        &self.programs
    }

    /// Builds the kernel, compiling its program on first use. The kernel is
    /// stored at `request.slot` only when both key strings are non-empty.
    pub fn add_kernel(&self, device: &DeviceHandle, request: KernelRequest) -> Result<Kernel> {
        let kernel = self.build_kernel(device, &request)?;

        if request.is_cacheable() {
            let key = KernelKey::new(&request.algorithm, &request.network_config);
            let mut kernels = self.kernels.lock().unwrap_or_else(PoisonError::into_inner);
            let slots = kernels.entry(key).or_default();
            if slots.len() <= request.slot {
                slots.resize(request.slot + 1, None);
            }
            slots[request.slot] = Some(kernel.clone());
            debug!(
                algorithm = %request.algorithm,
                network_config = %request.network_config,
                slot = request.slot,
                kernel = %kernel.entry_point,
                "kernel cached"
            );
        }
        Ok(kernel)
    }

    /// Builds the kernel without touching the slot map.
    pub fn build_kernel(&self, device: &DeviceHandle, request: &KernelRequest) -> Result<Kernel> {
        let program_request = ProgramRequest {
            source_id: request.source_id.clone(),
            options: request.options.clone(),
            inline_source: request.algorithm.contains(INLINE_SOURCE_MARKER),
        };
        let program = self.programs.get_or_compile(device, &program_request)?;
        Ok(Kernel {
            program,
            entry_point: request.entry_point.clone(),
            local_work: request.local_work.clone(),
            global_work: request.global_work.clone(),
        })
    }

    /// Populated kernels for the key in slot order. Absent and cleared keys
    /// both yield an empty vector.
    pub fn get_kernels(&self, algorithm: &str, network_config: &str) -> Vec<Kernel> {
        self.get_kernel_slots(algorithm, network_config)
            .into_iter()
            .flatten()
            .collect()
    }

    /// Raw slot vector, including holes left by sparse slot indices.
    pub fn get_kernel_slots(&self, algorithm: &str, network_config: &str) -> Vec<Option<Kernel>> {
        self.kernels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&KernelKey::new(algorithm, network_config))
            .cloned()
            .unwrap_or_default()
    }

    /// First populated kernel for the key.
    pub fn get_kernel(&self, algorithm: &str, network_config: &str) -> Option<Kernel> {
        self.get_kernels(algorithm, network_config).into_iter().next()
    }

    /// Removes exactly the slot vector for the key.
    pub fn clear_kernels(&self, algorithm: &str, network_config: &str) -> Result<()> {
        if algorithm.is_empty() || network_config.is_empty() {
            return Err(Error::configuration(
                "clearing kernels requires a non-empty algorithm and network config",
            ));
        }
        let removed = self
            .kernels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&KernelKey::new(algorithm, network_config));
        if removed.is_some() {
            debug!(algorithm, network_config, "kernels cleared");
        }
        Ok(())
    }

    /// Replaces the slot vector for a key under one lock acquisition.
    pub fn replace_kernels(&self, algorithm: &str, network_config: &str, kernels: Vec<Kernel>) -> Result<()> {
        if algorithm.is_empty() || network_config.is_empty() {
            return Err(Error::configuration(
                "replacing kernels requires a non-empty algorithm and network config",
            ));
        }
        self.kernels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                KernelKey::new(algorithm, network_config),
                kernels.into_iter().map(Some).collect(),
            );
        Ok(())
    }

    pub fn key_count(&self) -> usize {
        self.kernels.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Drops every kernel and program.
    pub fn clear(&self) {
        self.kernels.lock().unwrap_or_else(PoisonError::into_inner).clear();
        self.programs.clear();
    }
}

impl fmt::Debug for KernelCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelCache")
            .field("programs", &self.programs)
            .field("keys", &self.key_count())
            .finish()
    }
}
