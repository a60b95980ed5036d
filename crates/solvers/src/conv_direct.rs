//! Direct convolutions compiled from kernel source.

use crate::config::{CompileOptions, LegacyPerformanceConfig, PerformanceConfig, TuningConfig};
use crate::solution::{KernelInfo, Solution, SourceKind};
use crate::solver::{div_ceil, round_up, SolverCandidate};
use convforge_backend_gpu::ExecutionContext;
use convforge_problem::{Error, ProblemDescriptor, Result};

/// Problem geometry shared by every direct source kernel.
fn base_options(ctx: &ExecutionContext) -> CompileOptions {
    let p = ctx.problem();
    CompileOptions::for_context(ctx)
        .flag("DIR_FORWARD", p.direction.is_forward())
        .define("FILTER_SIZE0", p.kernel_w)
        .define("FILTER_SIZE1", p.kernel_h)
        .define("FILTER_PAD0", p.pad_h)
        .define("FILTER_PAD1", p.pad_v)
        .define("FILTER_STRIDE0", p.stride_h)
        .define("FILTER_STRIDE1", p.stride_v)
        .define("N_INPUTS", p.n_inputs)
        .define("N_OUTPUTS", p.n_outputs)
        .define("BATCH_SZ", p.batch)
        .define("IN_WIDTH", p.in_width)
        .define("IN_HEIGHT", p.in_height)
        .define("OUT_WIDTH", p.out_width)
        .define("OUT_HEIGHT", p.out_height)
        .flag("CONV_BIAS", p.bias)
}

fn no_dilation(p: &ProblemDescriptor) -> bool {
    p.dilation_h == 1 && p.dilation_v == 1
}

fn data_direction(p: &ProblemDescriptor) -> bool {
    p.direction.is_forward() || p.direction.is_backward_data()
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ConvDirect11x11;

impl SolverCandidate for ConvDirect11x11 {
    fn id(&self) -> &'static str {
        "ConvDirect11x11"
    }

    fn is_applicable(&self, ctx: &ExecutionContext) -> bool {
        let p = ctx.problem();
        p.direction.is_forward()
            && no_dilation(p)
            && p.kernel_h == 11
            && p.kernel_w == 11
            && p.stride_h == p.stride_v
            && p.stride_h > 1
    }

    fn get_solution(&self, ctx: &ExecutionContext, _config: &TuningConfig) -> Result<Solution> {
        let p = ctx.problem();
        const GROUP: usize = 256;
        const OUT_PIX: usize = 4;
        let kernel = KernelInfo::new(SourceKind::Source, "conv_11x11.cl", "conv_fwd_11x11")
            .with_work(
                vec![GROUP, 1, 1],
                vec![
                    round_up(div_ceil(p.out_width * p.out_height, OUT_PIX), GROUP),
                    p.n_outputs,
                    p.batch,
                ],
            )
            .with_options(base_options(ctx).define("OUT_PIX_TILE", OUT_PIX).build());
        Ok(Solution::new(self.id(), vec![kernel]))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ConvDirect3x3;

impl SolverCandidate for ConvDirect3x3 {
    fn id(&self) -> &'static str {
        "ConvDirect3x3"
    }

    fn is_applicable(&self, ctx: &ExecutionContext) -> bool {
        let p = ctx.problem();
        p.direction.is_forward()
            && no_dilation(p)
            && p.kernel_h == 3
            && p.kernel_w == 3
            && p.pad_h == 1
            && p.pad_v == 1
            && p.stride_h == 1
            && p.stride_v == 1
            && p.in_width <= 256
            && p.in_height <= 256
    }

    fn get_solution(&self, ctx: &ExecutionContext, _config: &TuningConfig) -> Result<Solution> {
        let p = ctx.problem();
        const TILE: usize = 16;
        const OUT_PIX: usize = 2;
        let kernel = KernelInfo::new(SourceKind::Source, "conv_3x3.cl", "conv_fwd_3x3")
            .with_work(
                vec![TILE, TILE, 1],
                vec![
                    round_up(div_ceil(p.out_width, OUT_PIX), TILE),
                    round_up(div_ceil(p.out_height, OUT_PIX), TILE),
                    p.n_outputs * p.batch,
                ],
            )
            .with_options(
                base_options(ctx)
                    .define("GRP_TILE0", TILE)
                    .define("GRP_TILE1", TILE)
                    .define("OUT_PIX_TILE0", OUT_PIX)
                    .define("OUT_PIX_TILE1", OUT_PIX)
                    .build(),
            );
        Ok(Solution::new(self.id(), vec![kernel]))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ConvDirect1x1;

impl SolverCandidate for ConvDirect1x1 {
    fn id(&self) -> &'static str {
        "ConvDirect1x1"
    }

    fn is_applicable(&self, ctx: &ExecutionContext) -> bool {
        let p = ctx.problem();
        data_direction(p)
            && no_dilation(p)
            && p.kernel_h == 1
            && p.kernel_w == 1
            && p.pad_h == 0
            && p.pad_v == 0
            && p.stride_h == 1
            && p.stride_v == 1
            && p.n_inputs % 4 == 0
            && p.n_outputs % 4 == 0
    }

    fn get_solution(&self, ctx: &ExecutionContext, _config: &TuningConfig) -> Result<Solution> {
        let p = ctx.problem();
        const GROUP: usize = 256;
        const N_OUT_TILES: usize = 4;
        let kernel = KernelInfo::new(SourceKind::Source, "conv_1x1.cl", "conv_1x1")
            .with_work(
                vec![GROUP, 1, 1],
                vec![
                    round_up(p.out_width * p.out_height, GROUP),
                    div_ceil(p.n_outputs, N_OUT_TILES),
                    p.batch,
                ],
            )
            .with_options(base_options(ctx).define("N_OUT_TILES", N_OUT_TILES).build());
        Ok(Solution::new(self.id(), vec![kernel]))
    }
}

/// Fallback direct convolution driven by the nine-token tuning record.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConvDirectGeneric;

impl ConvDirectGeneric {
    fn perf_config(&self, ctx: &ExecutionContext, config: &TuningConfig) -> Result<LegacyPerformanceConfig> {
        if config.is_empty() {
            return Ok(LegacyPerformanceConfig::heuristic(ctx.problem()));
        }
        LegacyPerformanceConfig::from_tuning(config, ctx.problem())
            .ok_or_else(|| Error::configuration(format!("invalid direct convolution tuning `{config}`")))
    }
}

impl SolverCandidate for ConvDirectGeneric {
    fn id(&self) -> &'static str {
        "ConvDirectGeneric"
    }

    fn is_applicable(&self, ctx: &ExecutionContext) -> bool {
        let p = ctx.problem();
        data_direction(p)
            && no_dilation(p)
            && p.stride_h <= 2
            && p.stride_v <= 2
            && p.kernel_h <= p.in_height + 2 * p.pad_v
            && p.kernel_w <= p.in_width + 2 * p.pad_h
    }

    fn is_tunable(&self) -> bool {
        true
    }

    fn default_config(&self, ctx: &ExecutionContext) -> TuningConfig {
        LegacyPerformanceConfig::heuristic(ctx.problem()).to_tuning()
    }

    fn accepts_config(&self, ctx: &ExecutionContext, config: &TuningConfig) -> bool {
        LegacyPerformanceConfig::from_tuning(config, ctx.problem()).is_some()
    }

    fn search_space(&self, ctx: &ExecutionContext) -> Vec<TuningConfig> {
        LegacyPerformanceConfig::search_space(ctx.problem())
            .iter()
            .map(PerformanceConfig::to_tuning)
            .collect()
    }

    fn get_solution(&self, ctx: &ExecutionContext, config: &TuningConfig) -> Result<Solution> {
        let p = ctx.problem();
        let perf = self.perf_config(ctx, config)?;

        let alus = perf.grp_tile0 * perf.grp_tile1;
        let blocks0 = div_ceil(p.out_width, perf.in_tile0);
        let blocks1 = div_ceil(p.out_height, perf.in_tile1);
        let out_tile_groups = div_ceil(p.n_outputs, perf.n_out_pix_tiles);
        let stack_groups = div_ceil(p.batch, perf.n_stacks);

        let options = base_options(ctx)
            .define("GRP_TILE0", perf.grp_tile0)
            .define("GRP_TILE1", perf.grp_tile1)
            .define("IN_TILE0", perf.in_tile0)
            .define("IN_TILE1", perf.in_tile1)
            .define("OUT_TILE0", perf.out_pix_tile0)
            .define("OUT_TILE1", perf.out_pix_tile1)
            .define("N_OUT_TILES", perf.n_out_pix_tiles)
            .define("N_IN_TILES_PERSTACK", perf.n_in_data_tiles)
            .define("N_STACKS", perf.n_stacks)
            .build();

        let kernel = KernelInfo::new(SourceKind::Source, "conv_direct_uni.cl", "conv_uni")
            .with_work(
                vec![alus, 1, 1],
                vec![blocks0 * blocks1 * alus, out_tile_groups, stack_groups],
            )
            .with_options(options);
        Ok(Solution::new(self.id(), vec![kernel]).with_tuning(perf.to_tuning()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convforge_backend_gpu::testing::FakeDevice;
    use convforge_backend_gpu::Capabilities;
    use convforge_problem::{ConvParams, Direction, OperatorKind};
    use std::sync::Arc;

    fn ctx(problem: ProblemDescriptor) -> ExecutionContext {
        ExecutionContext::new(
            problem,
            OperatorKind::DirectConvolution,
            Arc::new(FakeDevice::new("fake", 8)),
            Capabilities::default(),
        )
        .unwrap()
    }

    fn scenario_a() -> ProblemDescriptor {
        ProblemDescriptor::new(Direction::Forward)
            .with_input(3, 32, 32)
            .with_kernel(5, 5)
            .with_output(16, 30, 30)
            .with_conv(ConvParams::new((2, 2), (1, 1), (1, 1)))
            .with_batch(100)
    }

    #[test]
    fn generic_solver_covers_scenario_a_only_among_specialized() {
        let c = ctx(scenario_a());
        assert!(ConvDirectGeneric.is_applicable(&c));
        assert!(!ConvDirect3x3.is_applicable(&c));
        assert!(!ConvDirect1x1.is_applicable(&c));
        assert!(!ConvDirect11x11.is_applicable(&c));
    }

    #[test]
    fn generic_solution_follows_tuning_record() {
        let c = ctx(scenario_a());
        let config = TuningConfig::new("16.16.8.8.2.4.1.1.4");
        let solution = ConvDirectGeneric.get_solution(&c, &config).unwrap();
        let kernel = &solution.kernels[0];
        assert_eq!(kernel.local_work, vec![256, 1, 1]);
        // 30x30 output in 8x8 tiles, 16 outputs one per tile group, 100 images in stacks of 4.
        assert_eq!(kernel.global_work, vec![4 * 4 * 256, 16, 25]);
        assert!(kernel.options.contains(" -DN_STACKS=4"));
        assert!(kernel.options.contains(" -DFILTER_PAD0=2"));
        assert_eq!(solution.tuning, config);
    }

    #[test]
    fn empty_tuning_uses_heuristic() {
        let c = ctx(scenario_a());
        let solution = ConvDirectGeneric.get_solution(&c, &TuningConfig::default()).unwrap();
        assert_eq!(solution.tuning, ConvDirectGeneric.default_config(&c));
        assert!(ConvDirectGeneric.accepts_config(&c, &solution.tuning));
    }

    #[test]
    fn eleven_by_eleven_is_forward_and_strided() {
        let alexnet = ProblemDescriptor::new(Direction::Forward)
            .with_input(3, 227, 227)
            .with_kernel(11, 11)
            .with_output(96, 55, 55)
            .with_conv(ConvParams::new((0, 0), (4, 4), (1, 1)));
        assert!(ConvDirect11x11.is_applicable(&ctx(alexnet.clone())));
        // Stride 4 is beyond the generic kernel.
        assert!(!ConvDirectGeneric.is_applicable(&ctx(alexnet.clone())));

        let mut backward = alexnet;
        backward.direction = Direction::BackwardData;
        assert!(!ConvDirect11x11.is_applicable(&ctx(backward)));
    }
}
