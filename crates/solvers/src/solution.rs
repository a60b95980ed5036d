use crate::config::TuningConfig;
use convforge_backend_gpu::DeviceHandle;
use convforge_cache::{Kernel, KernelCache, KernelRequest};
use convforge_problem::{Error, Result};
use std::fmt;
use tracing::debug;

/// How a kernel's program is supplied to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    Source,
    Assembly,
    Binary,
}

/// Build parameters of one kernel in a solution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelInfo {
    pub source_id: String,
    pub entry_point: String,
    pub local_work: Vec<usize>,
    pub global_work: Vec<usize>,
    pub options: String,
    pub kind: SourceKind,
}

impl KernelInfo {
    pub fn new(kind: SourceKind, source_id: impl Into<String>, entry_point: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            entry_point: entry_point.into(),
            local_work: Vec::new(),
            global_work: Vec::new(),
            options: String::new(),
            kind,
        }
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

    fn request(&self, algorithm: &str, slot: usize) -> KernelRequest {
        KernelRequest::new(self.source_id.clone(), self.entry_point.clone())
            .cached_as(algorithm, "")
            .with_work(self.local_work.clone(), self.global_work.clone())
            .with_options(self.options.clone())
            .at_slot(slot)
    }
}

/// Everything needed to run one solver's answer to a problem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Solution {
    pub solver_id: &'static str,
    pub kernels: Vec<KernelInfo>,
    pub workspace_bytes: usize,
    pub tuning: TuningConfig,
}

impl Solution {
    pub fn new(solver_id: &'static str, kernels: Vec<KernelInfo>) -> Self {
        Self {
            solver_id,
            kernels,
            workspace_bytes: 0,
            tuning: TuningConfig::default(),
        }
    }

    pub fn with_workspace(mut self, bytes: usize) -> Self {
        self.workspace_bytes = bytes;
        self
    }

    pub fn with_tuning(mut self, tuning: TuningConfig) -> Self {
        self.tuning = tuning;
        self
    }

    pub fn uses_binaries(&self) -> bool {
        self.kernels.iter().any(|k| k.kind == SourceKind::Binary)
    }

    /// Builds every kernel in order. With a non-empty algorithm and network
    /// config the key's slot vector is replaced by the new kernels, slot `i`
    /// holding kernel `i`; with both empty the kernels are returned uncached.
    pub fn add_kernels(
        &self,
        cache: &KernelCache,
        device: &DeviceHandle,
        algorithm: &str,
        network_config: &str,
    ) -> Result<Vec<Kernel>> {
        if algorithm.is_empty() != network_config.is_empty() {
            return Err(Error::configuration(format!(
                "algorithm `{algorithm}` and network config `{network_config}` must both be set or both be empty"
            )));
        }

        let mut kernels = Vec::with_capacity(self.kernels.len());
        for (slot, info) in self.kernels.iter().enumerate() {
            debug!(solver = self.solver_id, kernel = %info.entry_point, slot, "building kernel");
            kernels.push(cache.build_kernel(device, &info.request(algorithm, slot))?);
        }

        if !algorithm.is_empty() {
            cache.replace_kernels(algorithm, network_config, kernels.clone())?;
        }
        Ok(kernels)
    }
}

impl fmt::Display for Solution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.solver_id)?;
        if !self.tuning.is_empty() {
            write!(f, " [{}]", self.tuning)?;
        }
        Ok(())
    }
}
