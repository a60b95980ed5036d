//! Non-convolution operators: pooling, local response normalization and
//! element-wise neuron activations.

use crate::config::{CompileOptions, TuningConfig};
use crate::solution::{KernelInfo, Solution, SourceKind};
use crate::solver::{div_ceil, round_up, SolverCandidate};
use convforge_backend_gpu::ExecutionContext;
use convforge_problem::{
    Error, LrnParams, LrnRegion, NeuronParams, OperatorKind, PoolingMethod, PoolingParams, Result,
};

fn pooling_params(ctx: &ExecutionContext) -> Option<PoolingParams> {
    match ctx.operator() {
        OperatorKind::Pooling(params) => Some(*params),
        _ => None,
    }
}

fn lrn_params(ctx: &ExecutionContext) -> Option<LrnParams> {
    match ctx.operator() {
        OperatorKind::Lrn(params) => Some(*params),
        _ => None,
    }
}

fn neuron_params(ctx: &ExecutionContext) -> Option<NeuronParams> {
    match ctx.operator() {
        OperatorKind::Neuron(params) => Some(*params),
        _ => None,
    }
}

fn wrong_operator(solver: &str, ctx: &ExecutionContext) -> Error {
    Error::unsupported(format!("{solver} cannot solve a {} problem", ctx.operator()))
}

/// Tile shape shared by both pooling directions.
const POOL_GROUP: (usize, usize) = (8, 8);
const POOL_OUT_PIX: (usize, usize) = (2, 4);

#[derive(Debug, Default, Clone, Copy)]
pub struct PoolingDirect;

impl SolverCandidate for PoolingDirect {
    fn id(&self) -> &'static str {
        "PoolingDirect"
    }

    fn is_applicable(&self, ctx: &ExecutionContext) -> bool {
        let Some(params) = pooling_params(ctx) else {
            return false;
        };
        let direction = ctx.problem().direction;
        params.method != PoolingMethod::Stochastic
            && !direction.is_backward_weights()
            && params.window_h > 0
            && params.window_w > 0
            && params.pad_v < params.window_h
            && params.pad_h < params.window_w
    }

    fn get_solution(&self, ctx: &ExecutionContext, _config: &TuningConfig) -> Result<Solution> {
        let params = pooling_params(ctx).ok_or_else(|| wrong_operator(self.id(), ctx))?;
        let p = ctx.problem();
        let forward = p.direction.is_forward();

        let method_id = match params.method {
            PoolingMethod::Max => 0,
            PoolingMethod::Average => 1,
            PoolingMethod::Stochastic => 2,
        };
        let options = CompileOptions::for_context(ctx)
            .define("POOLING_OP_ID", method_id)
            .define("KERNEL_SZ0", params.window_w)
            .define("KERNEL_SZ1", params.window_h)
            .define("PAD0", params.pad_h)
            .define("PAD1", params.pad_v)
            .define("STRIDE0", params.stride_h)
            .define("STRIDE1", params.stride_v)
            .define("GRP_TILE0", POOL_GROUP.0)
            .define("GRP_TILE1", POOL_GROUP.1)
            .define("OUT_PIX_TILE0", POOL_OUT_PIX.0)
            .define("OUT_PIX_TILE1", POOL_OUT_PIX.1)
            .flag("PROPAGATE_NAN", params.propagate_nan)
            .build();

        // Forward tiles the pooled plane, backward tiles the full one.
        let (plane_h, plane_w) = if forward {
            (p.out_height, p.out_width)
        } else {
            (p.in_height, p.in_width)
        };
        let global = vec![
            div_ceil(plane_w, POOL_GROUP.0 * POOL_OUT_PIX.0) * POOL_GROUP.0,
            div_ceil(plane_h, POOL_GROUP.1 * POOL_OUT_PIX.1) * POOL_GROUP.1,
            p.n_outputs * p.batch,
        ];
        let local = vec![POOL_GROUP.0, POOL_GROUP.1, 1];

        let kernel = if forward {
            KernelInfo::new(SourceKind::Source, "pooling.cl", "pooling_fwd")
        } else {
            let entry = match params.method {
                PoolingMethod::Max => "pooling_max_bwd",
                _ => "pooling_avg_bwd",
            };
            KernelInfo::new(SourceKind::Source, "pooling_bwd.cl", entry)
        };
        Ok(Solution::new(
            self.id(),
            vec![kernel.with_work(local, global).with_options(options)],
        ))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LrnDirect;

impl SolverCandidate for LrnDirect {
    fn id(&self) -> &'static str {
        "LrnDirect"
    }

    fn is_applicable(&self, ctx: &ExecutionContext) -> bool {
        let direction = ctx.problem().direction;
        lrn_params(ctx).is_some_and(|params| params.area > 0)
            && (direction.is_forward() || direction.is_backward_data())
    }

    fn get_solution(&self, ctx: &ExecutionContext, _config: &TuningConfig) -> Result<Solution> {
        let params = lrn_params(ctx).ok_or_else(|| wrong_operator(self.id(), ctx))?;
        let p = ctx.problem();
        let forward = p.direction.is_forward();
        let entry = match (params.region, forward) {
            (LrnRegion::WithinChannel, true) => "lrn_within_fwd",
            (LrnRegion::WithinChannel, false) => "lrn_within_bwd",
            (LrnRegion::AcrossChannels, true) => "lrn_across_fwd",
            (LrnRegion::AcrossChannels, false) => "lrn_across_bwd",
        };

        let options = CompileOptions::for_context(ctx)
            .define("LRN_KERNEL_SZ", params.area)
            .define("LRN_PAD", params.area.saturating_sub(1) / 2)
            .define("N_INPUTS", p.n_inputs)
            .define("IN_WIDTH", p.in_width)
            .define("IN_HEIGHT", p.in_height)
            .define("BATCH_SZ", p.batch)
            .build();

        const GROUP: (usize, usize) = (8, 8);
        let kernel = KernelInfo::new(SourceKind::Source, "lrn.cl", entry)
            .with_work(
                vec![GROUP.0, GROUP.1, 1],
                vec![
                    div_ceil(p.in_width, GROUP.0) * GROUP.0,
                    div_ceil(p.in_height, GROUP.1) * GROUP.1,
                    p.n_inputs * p.batch,
                ],
            )
            .with_options(options);
        Ok(Solution::new(self.id(), vec![kernel]))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NeuronDirect;

impl SolverCandidate for NeuronDirect {
    fn id(&self) -> &'static str {
        "NeuronDirect"
    }

    fn is_applicable(&self, ctx: &ExecutionContext) -> bool {
        let direction = ctx.problem().direction;
        neuron_params(ctx).is_some() && (direction.is_forward() || direction.is_backward_data())
    }

    fn get_solution(&self, ctx: &ExecutionContext, _config: &TuningConfig) -> Result<Solution> {
        let params = neuron_params(ctx).ok_or_else(|| wrong_operator(self.id(), ctx))?;
        let p = ctx.problem();
        let entry = if p.direction.is_forward() {
            "neuron_fwd"
        } else {
            "neuron_bwd"
        };

        const GROUP: usize = 256;
        let elements = p.batch * p.n_inputs * p.in_height * p.in_width;
        let kernel = KernelInfo::new(SourceKind::Source, "neuron.cl", entry)
            .with_work(vec![GROUP, 1, 1], vec![round_up(div_ceil(elements, 4), GROUP), 1, 1])
            .with_options(
                CompileOptions::for_context(ctx)
                    .define("NRN_OP_ID", params.kind.ordinal())
                    .define("N_ELEMENTS", elements)
                    .build(),
            );
        Ok(Solution::new(self.id(), vec![kernel]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convforge_backend_gpu::testing::FakeDevice;
    use convforge_backend_gpu::Capabilities;
    use convforge_problem::{Direction, NeuronKind, ProblemDescriptor};
    use std::sync::Arc;

    fn ctx(direction: Direction, operator: OperatorKind) -> ExecutionContext {
        let problem = ProblemDescriptor::new(direction)
            .with_input(64, 56, 56)
            .with_output(64, 28, 28)
            .with_batch(4);
        ExecutionContext::new(
            problem,
            operator,
            Arc::new(FakeDevice::new("fake", 8)),
            Capabilities::default(),
        )
        .unwrap()
    }

    #[test]
    fn pooling_picks_entry_by_direction_and_method() {
        let max = OperatorKind::Pooling(PoolingParams::default());
        let fwd = PoolingDirect
            .get_solution(&ctx(Direction::Forward, max), &TuningConfig::default())
            .unwrap();
        assert_eq!(fwd.kernels[0].entry_point, "pooling_fwd");
        assert_eq!(fwd.kernels[0].local_work, vec![8, 8, 1]);
        assert_eq!(fwd.kernels[0].global_work, vec![16, 8, 256]);

        let avg = OperatorKind::Pooling(PoolingParams {
            method: PoolingMethod::Average,
            ..PoolingParams::default()
        });
        let bwd = PoolingDirect
            .get_solution(&ctx(Direction::BackwardData, avg), &TuningConfig::default())
            .unwrap();
        assert_eq!(bwd.kernels[0].source_id, "pooling_bwd.cl");
        assert_eq!(bwd.kernels[0].entry_point, "pooling_avg_bwd");
    }

    #[test]
    fn pooling_rejects_stochastic_and_oversized_padding() {
        let stochastic = OperatorKind::Pooling(PoolingParams {
            method: PoolingMethod::Stochastic,
            ..PoolingParams::default()
        });
        assert!(!PoolingDirect.is_applicable(&ctx(Direction::Forward, stochastic)));

        let padded = OperatorKind::Pooling(PoolingParams {
            pad_v: 3,
            ..PoolingParams::default()
        });
        assert!(!PoolingDirect.is_applicable(&ctx(Direction::Forward, padded)));
        assert!(!PoolingDirect.is_applicable(&ctx(Direction::Forward, OperatorKind::Lrn(LrnParams::default()))));
    }

    #[test]
    fn lrn_defines_window() {
        let across = OperatorKind::Lrn(LrnParams {
            region: LrnRegion::AcrossChannels,
            ..LrnParams::default()
        });
        let solution = LrnDirect
            .get_solution(&ctx(Direction::BackwardData, across), &TuningConfig::default())
            .unwrap();
        let kernel = &solution.kernels[0];
        assert_eq!(kernel.entry_point, "lrn_across_bwd");
        assert!(kernel.options.contains("-DLRN_KERNEL_SZ=5"));
        assert!(kernel.options.contains("-DLRN_PAD=2"));
    }

    #[test]
    fn neuron_encodes_activation() {
        let relu = OperatorKind::Neuron(NeuronParams {
            kind: NeuronKind::Relu,
            ..NeuronParams::default()
        });
        let c = ctx(Direction::Forward, relu);
        assert!(NeuronDirect.is_applicable(&c));
        let solution = NeuronDirect.get_solution(&c, &TuningConfig::default()).unwrap();
        assert!(solution.kernels[0].options.contains("-DNRN_OP_ID=3"));
        assert_eq!(solution.kernels[0].local_work, vec![256, 1, 1]);

        let lrn = ctx(Direction::Forward, OperatorKind::Lrn(LrnParams::default()));
        assert!(!NeuronDirect.is_applicable(&lrn));
        assert!(NeuronDirect.get_solution(&lrn, &TuningConfig::default()).is_err());
    }
}
