//! The library instance: owner of every process-wide cache.

use crate::config::LibraryConfig;
use convforge_autotune::{CancellationToken, PerformanceDatabase};
use convforge_backend_gpu::{Capabilities, CapabilityCache, DeviceHandle, ExecutionContext};
use convforge_cache::{Kernel, KernelCache, ProgramCache};
use convforge_problem::{Direction, Error, OperatorKind, ProblemDescriptor, Result};
use convforge_solvers::{KernelTimer, SearchEngine, Solution, SolverRegistry};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Algorithm tags used as the first half of kernel cache keys.
pub mod algorithm {
    use super::*;

    pub const CONV_FORWARD: &str = "convolution.direct.forward";
    pub const CONV_BACKWARD_DATA: &str = "convolution.direct.backward-data";
    pub const CONV_BACKWARD_WEIGHTS: &str = "convolution.direct.backward-weights";
    pub const WINOGRAD_FORWARD: &str = "convolution.winograd.forward";
    pub const WINOGRAD_BACKWARD_DATA: &str = "convolution.winograd.backward-data";
    pub const POOLING_FORWARD: &str = "pooling.forward";
    pub const POOLING_BACKWARD: &str = "pooling.backward";
    pub const LRN_FORWARD: &str = "lrn.forward";
    pub const LRN_BACKWARD: &str = "lrn.backward";
    pub const NEURON_FORWARD: &str = "neuron.forward";
    pub const NEURON_BACKWARD: &str = "neuron.backward";

    /// Default tag for an operator and direction.
    pub fn tag_for(operator: &OperatorKind, direction: Direction) -> &'static str {
        let forward = direction.is_forward();
        match operator {
            OperatorKind::DirectConvolution => match direction {
                Direction::BackwardWeights => CONV_BACKWARD_WEIGHTS,
                Direction::BackwardData => CONV_BACKWARD_DATA,
                _ => CONV_FORWARD,
            },
            OperatorKind::WinogradConvolution if forward => WINOGRAD_FORWARD,
            OperatorKind::WinogradConvolution => WINOGRAD_BACKWARD_DATA,
            OperatorKind::Pooling(_) if forward => POOLING_FORWARD,
            OperatorKind::Pooling(_) => POOLING_BACKWARD,
            OperatorKind::Lrn(_) if forward => LRN_FORWARD,
            OperatorKind::Lrn(_) => LRN_BACKWARD,
            OperatorKind::Neuron(_) if forward => NEURON_FORWARD,
            OperatorKind::Neuron(_) => NEURON_BACKWARD,
        }
    }
}

/// One timed solution from [`Library::rank_solutions`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerfResult {
    pub solver: &'static str,
    pub time: Duration,
    pub workspace_bytes: usize,
}

/// Owns the capability cache, the performance database mirror and the
/// kernel cache for one device. Everything is torn down by
/// [`Library::shutdown`].
pub struct Library {
    config: LibraryConfig,
    device: DeviceHandle,
    capabilities: CapabilityCache,
    kernels: Arc<KernelCache>,
    engine: SearchEngine,
    cancel: CancellationToken,
}

impl Library {
    pub fn new(config: LibraryConfig, device: DeviceHandle) -> Self {
        let cancel = CancellationToken::new();
        let capabilities = CapabilityCache::new(config.probe_options());
        let db = Arc::new(PerformanceDatabase::new(config.db_paths()));
        let kernels = Arc::new(KernelCache::new(
            ProgramCache::new().with_compile_timeout(config.compile_timeout()),
        ));
        let engine = SearchEngine::new(SolverRegistry::standard(), db, Arc::clone(&kernels))
            .with_tuner(config.autotuner(cancel.clone()));

        info!(
            device = %device.identity(),
            system_db = %config.system_db_dir.display(),
            user_db = %config.user_db_dir.display(),
            "library instance created"
        );
        Self {
            config,
            device,
            capabilities,
            kernels,
            engine,
            cancel,
        }
    }

    /// Timer used by contexts that request empirical search.
    pub fn with_timer(mut self, timer: Arc<dyn KernelTimer>) -> Self {
        self.engine = self.engine.with_timer(timer);
        self
    }

    /// Replaces the solver registry, keeping the database and caches.
    pub fn with_registry(mut self, registry: SolverRegistry) -> Self {
        let db = Arc::clone(self.engine.database());
        self.engine = SearchEngine::new(registry, db, Arc::clone(&self.kernels))
            .with_tuner(self.config.autotuner(self.cancel.clone()));
        self
    }

    pub fn config(&self) -> &LibraryConfig {
        &self.config
    }

    pub fn device(&self) -> &DeviceHandle {
        &self.device
    }

    pub fn kernel_cache(&self) -> &KernelCache {
        &self.kernels
    }

    pub fn database(&self) -> &PerformanceDatabase {
        self.engine.database()
    }

    pub fn engine(&self) -> &SearchEngine {
        &self.engine
    }

    pub fn capability_cache(&self) -> &CapabilityCache {
        &self.capabilities
    }

    /// Probes the device on first use.
    pub fn capabilities(&self) -> Capabilities {
        self.capabilities.detect(self.device.as_ref())
    }

    pub fn context(&self, problem: ProblemDescriptor, operator: OperatorKind) -> Result<ExecutionContext> {
        ExecutionContext::new(problem, operator, Arc::clone(&self.device), self.capabilities())
    }

    pub fn find_solution(&self, ctx: &ExecutionContext) -> Result<Solution> {
        self.engine.find_solution(ctx)
    }

    pub fn find_all_solutions(&self, ctx: &ExecutionContext) -> Result<Vec<Solution>> {
        self.engine.find_all_solutions(ctx)
    }

    /// Builds a solution's kernels, caching them under the key when both
    /// strings are set.
    pub fn add_kernels(&self, algorithm: &str, network_config: &str, solution: &Solution) -> Result<Vec<Kernel>> {
        solution.add_kernels(&self.kernels, &self.device, algorithm, network_config)
    }

    pub fn get_kernels(&self, algorithm: &str, network_config: &str) -> Vec<Kernel> {
        self.kernels.get_kernels(algorithm, network_config)
    }

    pub fn clear_kernels(&self, algorithm: &str, network_config: &str) -> Result<()> {
        self.kernels.clear_kernels(algorithm, network_config)
    }

    /// Kernels ready to launch for a problem, keyed by its canonical key and
    /// the operator's parameters. A cache hit skips both search and
    /// compilation.
    pub fn prepare(&self, problem: ProblemDescriptor, operator: OperatorKind, algorithm: &str) -> Result<Vec<Kernel>> {
        let ctx = self.context(problem, operator)?;
        let key = ctx.network_config()?;

        let cached = self.kernels.get_kernels(algorithm, &key);
        if !cached.is_empty() {
            debug!(algorithm, %key, kernels = cached.len(), "kernel cache hit");
            return Ok(cached);
        }

        debug!(algorithm, %key, "kernel cache miss");
        let solution = self.find_solution(&ctx)?;
        self.add_kernels(algorithm, &key, &solution)
    }

    /// Times every applicable solution and installs the fastest under
    /// `algorithm` and the context's network config. Solutions needing more than
    /// `workspace_limit` bytes or more than two kernels are skipped.
    pub fn rank_solutions(
        &self,
        ctx: &ExecutionContext,
        timer: &dyn KernelTimer,
        workspace_limit: usize,
        algorithm: &str,
    ) -> Result<Vec<PerfResult>> {
        let mut timed: Vec<(PerfResult, Solution)> = Vec::new();

        for solution in self.find_all_solutions(ctx)? {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if solution.workspace_bytes > workspace_limit {
                debug!(
                    solver = solution.solver_id,
                    required = solution.workspace_bytes,
                    workspace_limit,
                    "skipping solution: workspace too small"
                );
                continue;
            }
            if solution.kernels.len() > 2 {
                debug!(solver = solution.solver_id, kernels = solution.kernels.len(), "skipping solution: too many kernels");
                continue;
            }

            let time = solution
                .add_kernels(&self.kernels, &self.device, "", "")
                .and_then(|kernels| timer.time_kernels(ctx, &solution, &kernels));
            match time {
                Ok(time) => {
                    debug!(solver = solution.solver_id, ?time, "solution timed");
                    timed.push((
                        PerfResult {
                            solver: solution.solver_id,
                            time,
                            workspace_bytes: solution.workspace_bytes,
                        },
                        solution,
                    ));
                }
                Err(err) => warn!(solver = solution.solver_id, error = %err, "skipping solution"),
            }
        }

        timed.sort_by(|a, b| a.0.time.cmp(&b.0.time));
        let Some((best, best_solution)) = timed.first() else {
            return Err(Error::unsupported(format!(
                "no {} solution could be timed within {workspace_limit} bytes of workspace",
                ctx.operator()
            )));
        };

        if !algorithm.is_empty() {
            let key = ctx.network_config()?;
            self.add_kernels(algorithm, &key, best_solution)?;
        }
        info!(solver = best.solver, time = ?best.time, candidates = timed.len(), "solutions ranked");

        Ok(timed.into_iter().map(|(result, _)| result).collect())
    }

    /// Token that stops running searches when cancelled.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancels running searches and drops every cache.
    pub fn shutdown(&mut self) -> Result<()> {
        self.cancel.cancel();
        self.kernels.clear();
        self.capabilities.clear();
        self.engine.database().clear();
        info!(device = %self.device.identity(), "library instance shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convforge_backend_gpu::testing::FakeDevice;
    use convforge_problem::{ConvParams, PoolingParams};
    use tempfile::tempdir;

    #[test]
    fn tags_follow_operator_and_direction() {
        assert_eq!(
            algorithm::tag_for(&OperatorKind::DirectConvolution, Direction::BackwardWeights),
            algorithm::CONV_BACKWARD_WEIGHTS
        );
        assert_eq!(
            algorithm::tag_for(&OperatorKind::Pooling(PoolingParams::default()), Direction::BackwardData),
            algorithm::POOLING_BACKWARD
        );
    }

    #[test]
    fn shutdown_drops_caches() {
        let dir = tempdir().unwrap();
        let config = LibraryConfig {
            system_db_dir: dir.path().join("system"),
            user_db_dir: dir.path().join("user"),
            ..LibraryConfig::default()
        };
        let mut library = Library::new(config, Arc::new(FakeDevice::new("fake", 4)));
        let problem = ProblemDescriptor::new(Direction::Forward)
            .with_input(8, 16, 16)
            .with_kernel(3, 3)
            .with_output(8, 16, 16)
            .with_conv(ConvParams::new((1, 1), (1, 1), (1, 1)));

        let kernels = library
            .prepare(problem, OperatorKind::DirectConvolution, algorithm::CONV_FORWARD)
            .unwrap();
        assert!(!kernels.is_empty());
        assert_eq!(library.capability_cache().len(), 1);

        library.shutdown().unwrap();
        assert!(library.cancellation().is_cancelled());
        assert_eq!(library.kernel_cache().key_count(), 0);
        assert!(library.capability_cache().is_empty());
    }
}
