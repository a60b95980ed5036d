//! Priority-ordered solver search.

use crate::config::TuningConfig;
use crate::registry::SolverRegistry;
use crate::solution::Solution;
use crate::solver::{DynSolver, KernelTimer, SearchEnv};
use convforge_autotune::{Autotuner, PerformanceDatabase};
use convforge_backend_gpu::ExecutionContext;
use convforge_cache::KernelCache;
use convforge_problem::{Error, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Walks the registry's candidates for a context and resolves each chosen
/// solver's tuning through the performance database or empirical search.
pub struct SearchEngine {
    registry: SolverRegistry,
    db: Arc<PerformanceDatabase>,
    kernels: Arc<KernelCache>,
    tuner: Autotuner,
    timer: Option<Arc<dyn KernelTimer>>,
}

impl SearchEngine {
    pub fn new(registry: SolverRegistry, db: Arc<PerformanceDatabase>, kernels: Arc<KernelCache>) -> Self {
        Self {
            registry,
            db,
            kernels,
            tuner: Autotuner::new(),
            timer: None,
        }
    }

    pub fn with_tuner(mut self, tuner: Autotuner) -> Self {
        self.tuner = tuner;
        self
    }

    /// Timer used when a context asks for empirical search.
    pub fn with_timer(mut self, timer: Arc<dyn KernelTimer>) -> Self {
        self.timer = Some(timer);
        self
    }

    pub fn registry(&self) -> &SolverRegistry {
        &self.registry
    }

    pub fn database(&self) -> &Arc<PerformanceDatabase> {
        &self.db
    }

    pub fn kernel_cache(&self) -> &Arc<KernelCache> {
        &self.kernels
    }

    pub fn tuner(&self) -> &Autotuner {
        &self.tuner
    }

    /// Applicable candidates in priority order.
    pub fn applicable(&self, ctx: &ExecutionContext) -> Vec<DynSolver> {
        self.registry
            .candidates(ctx)
            .iter()
            .filter(|solver| solver.is_applicable(ctx))
            .cloned()
            .collect()
    }

    /// Best solution of the first applicable candidate.
    pub fn find_solution(&self, ctx: &ExecutionContext) -> Result<Solution> {
        let solver = self
            .applicable(ctx)
            .into_iter()
            .next()
            .ok_or_else(|| no_candidate(ctx))?;
        let solution = self.solve(&solver, ctx)?;
        info!(
            solver = solution.solver_id,
            tuning = %solution.tuning,
            operator = %ctx.operator(),
            "selected solution"
        );
        Ok(solution)
    }

    /// One solution per applicable candidate, in priority order.
    pub fn find_all_solutions(&self, ctx: &ExecutionContext) -> Result<Vec<Solution>> {
        let applicable = self.applicable(ctx);
        if applicable.is_empty() {
            return Err(no_candidate(ctx));
        }
        applicable.iter().map(|solver| self.solve(solver, ctx)).collect()
    }

    fn solve(&self, solver: &DynSolver, ctx: &ExecutionContext) -> Result<Solution> {
        let config = self.resolve_config(solver, ctx)?;
        solver.get_solution(ctx, &config)
    }

    /// Tuning for `solver`: the stored record or the heuristic default, or
    /// the result of empirical search when the context asks for it. A
    /// search result different from the stored record is written back to
    /// the user layer, unless the record holds tuning this solver cannot
    /// read.
    pub fn resolve_config(&self, solver: &DynSolver, ctx: &ExecutionContext) -> Result<TuningConfig> {
        if !solver.is_tunable() {
            return Ok(solver.default_config(ctx));
        }

        let key = ctx.problem_key()?;
        let identity = ctx.device_identity();
        let recorded = self.db.find(&identity, &key).map(TuningConfig::new);
        let stored = recorded.clone().filter(|config| {
            let usable = solver.accepts_config(ctx, config);
            if !usable {
                debug!(solver = solver.id(), %key, tuning = %config, "stored tuning not usable by solver");
            }
            usable
        });

        if !ctx.do_search() {
            return Ok(stored.unwrap_or_else(|| solver.default_config(ctx)));
        }

        let timer = self.timer.as_deref().ok_or_else(|| {
            Error::configuration("empirical search requested but no kernel timer is configured")
        })?;
        let env = SearchEnv {
            kernels: &self.kernels,
            timer,
            tuner: &self.tuner,
        };

        match solver.search(ctx, &env, stored.clone()) {
            Ok(best) => {
                info!(
                    solver = solver.id(),
                    %key,
                    tuning = %best.config,
                    average_ms = best.average_ms(),
                    "search finished"
                );
                if recorded.is_some() && stored.is_none() {
                    // The record belongs to another solver of this problem.
                    debug!(solver = solver.id(), %key, "leaving foreign stored tuning in place");
                } else if stored.as_ref() != Some(&best.config) {
                    if let Err(err) = self.db.update(&identity, &key, best.config.as_str()) {
                        warn!(%key, error = %err, "could not persist tuning");
                    }
                }
                Ok(best.config)
            }
            Err(err @ (Error::Cancelled | Error::Timeout { .. })) => Err(err),
            Err(err) => {
                warn!(solver = solver.id(), %key, error = %err, "search failed, keeping stored or default tuning");
                Ok(stored.unwrap_or_else(|| solver.default_config(ctx)))
            }
        }
    }
}

fn no_candidate(ctx: &ExecutionContext) -> Error {
    let key = ctx
        .problem_key()
        .unwrap_or_else(|_| format!("{:?}", ctx.problem().direction));
    Error::unsupported(format!("no applicable {} solver for {key}", ctx.operator()))
}
