use crate::config::TuningConfig;
use crate::solution::Solution;
use convforge_autotune::{Autotuner, Measurement};
use convforge_backend_gpu::ExecutionContext;
use convforge_cache::{Kernel, KernelCache};
use convforge_problem::Result;
use std::sync::Arc;
use std::time::Duration;

/// Runs built kernels once on the device and reports elapsed device time.
pub trait KernelTimer: Send + Sync {
    fn time_kernels(&self, ctx: &ExecutionContext, solution: &Solution, kernels: &[Kernel]) -> Result<Duration>;
}

/// Collaborators available to an empirical search.
pub struct SearchEnv<'a> {
    pub kernels: &'a KernelCache,
    pub timer: &'a dyn KernelTimer,
    pub tuner: &'a Autotuner,
}

impl SearchEnv<'_> {
    /// Builds the solution's kernels uncached and times one run.
    pub fn measure(&self, ctx: &ExecutionContext, solution: &Solution) -> Result<Duration> {
        let kernels = solution.add_kernels(self.kernels, ctx.device(), "", "")?;
        self.timer.time_kernels(ctx, solution, &kernels)
    }
}

pub trait SolverCandidate: Send + Sync {
    fn id(&self) -> &'static str;

    /// Pure predicate over the problem and capability flags.
    fn is_applicable(&self, ctx: &ExecutionContext) -> bool;

    fn is_tunable(&self) -> bool {
        false
    }

    /// Configuration used when nothing is stored and no search runs.
    fn default_config(&self, _ctx: &ExecutionContext) -> TuningConfig {
        TuningConfig::default()
    }

    /// Whether a stored blob parses and validates for this solver.
    fn accepts_config(&self, _ctx: &ExecutionContext, config: &TuningConfig) -> bool {
        config.is_empty()
    }

    /// Configurations tried by empirical search, in order.
    fn search_space(&self, _ctx: &ExecutionContext) -> Vec<TuningConfig> {
        Vec::new()
    }

    /// Times `seed` followed by the search space and returns the fastest.
    /// A later configuration only wins when strictly faster.
    fn search(
        &self,
        ctx: &ExecutionContext,
        env: &SearchEnv<'_>,
        seed: Option<TuningConfig>,
    ) -> Result<Measurement<TuningConfig>> {
        let mut candidates: Vec<TuningConfig> = seed.into_iter().collect();
        for config in self.search_space(ctx) {
            if !candidates.contains(&config) {
                candidates.push(config);
            }
        }
        env.tuner.tune(candidates, |config| {
            let solution = self.get_solution(ctx, config)?;
            env.measure(ctx, &solution)
        })
    }

    fn get_solution(&self, ctx: &ExecutionContext, config: &TuningConfig) -> Result<Solution>;
}

pub type DynSolver = Arc<dyn SolverCandidate>;

/// Shared launch-size helpers.
pub(crate) fn div_ceil(value: usize, divisor: usize) -> usize {
    value.div_ceil(divisor.max(1))
}

pub(crate) fn round_up(value: usize, multiple: usize) -> usize {
    div_ceil(value, multiple) * multiple.max(1)
}
