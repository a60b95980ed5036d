//! Backward-weights convolutions.

use crate::config::{CompileOptions, TuningConfig};
use crate::conv_asm::asm_usable;
use crate::solution::{KernelInfo, Solution, SourceKind};
use crate::solver::{div_ceil, round_up, SolverCandidate};
use convforge_backend_gpu::ExecutionContext;
use convforge_problem::{ProblemDescriptor, Result};

/// Images reduced by one work-group before partial sums spill to workspace.
const BATCH_PER_STACK: usize = 16;

fn wrw_options(ctx: &ExecutionContext) -> CompileOptions {
    let p = ctx.problem();
    CompileOptions::for_context(ctx)
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
}

fn is_wrw(p: &ProblemDescriptor) -> bool {
    p.direction.is_backward_weights() && p.dilation_h == 1 && p.dilation_v == 1
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ConvWrwAsm3x3;

impl SolverCandidate for ConvWrwAsm3x3 {
    fn id(&self) -> &'static str {
        "ConvWrwAsm3x3"
    }

    fn is_applicable(&self, ctx: &ExecutionContext) -> bool {
        let p = ctx.problem();
        asm_usable(ctx)
            && is_wrw(p)
            && p.kernel_h == 3
            && p.kernel_w == 3
            && p.pad_h == 1
            && p.pad_v == 1
            && p.stride_h == 1
            && p.stride_v == 1
            && p.n_outputs % 4 == 0
    }

    fn get_solution(&self, ctx: &ExecutionContext, _config: &TuningConfig) -> Result<Solution> {
        let p = ctx.problem();
        let kernel = KernelInfo::new(SourceKind::Assembly, "wrw3x3.s", "wrw3x3_asm")
            .with_work(vec![64, 1, 1], vec![64, p.n_inputs, div_ceil(p.n_outputs, 4)])
            .with_options(
                wrw_options(ctx)
                    .define("metadata_version", ctx.capabilities().metadata_version as u8)
                    .build(),
            );
        Ok(Solution::new(self.id(), vec![kernel]))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ConvWrw1x1;

impl SolverCandidate for ConvWrw1x1 {
    fn id(&self) -> &'static str {
        "ConvWrw1x1"
    }

    fn is_applicable(&self, ctx: &ExecutionContext) -> bool {
        let p = ctx.problem();
        is_wrw(p)
            && p.kernel_h == 1
            && p.kernel_w == 1
            && p.pad_h == 0
            && p.pad_v == 0
            && p.stride_h == 1
            && p.stride_v == 1
    }

    fn get_solution(&self, ctx: &ExecutionContext, _config: &TuningConfig) -> Result<Solution> {
        let p = ctx.problem();
        const GROUP: usize = 256;
        let kernel = KernelInfo::new(SourceKind::Source, "wrw_1x1.cl", "wrw_1x1")
            .with_work(
                vec![GROUP, 1, 1],
                vec![GROUP * div_ceil(p.n_inputs, 4), p.n_outputs, 1],
            )
            .with_options(wrw_options(ctx).build());
        Ok(Solution::new(self.id(), vec![kernel]))
    }
}

/// Any backward-weights shape. Large batches are split into stacks whose
/// partial weights land in workspace and are summed by a second kernel.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConvWrwGeneric;

impl SolverCandidate for ConvWrwGeneric {
    fn id(&self) -> &'static str {
        "ConvWrwGeneric"
    }

    fn is_applicable(&self, ctx: &ExecutionContext) -> bool {
        is_wrw(ctx.problem())
    }

    fn get_solution(&self, ctx: &ExecutionContext, _config: &TuningConfig) -> Result<Solution> {
        let p = ctx.problem();
        const GROUP: usize = 256;
        let stacks = div_ceil(p.batch, BATCH_PER_STACK);
        let options = wrw_options(ctx).define("N_BATCH_STACKS", stacks).build();

        let main = KernelInfo::new(SourceKind::Source, "wrw_generic.cl", "wrw_partial")
            .with_work(
                vec![GROUP, 1, 1],
                vec![GROUP * stacks, p.n_inputs, p.n_outputs],
            )
            .with_options(options.clone());
        if stacks == 1 {
            return Ok(Solution::new(self.id(), vec![main]));
        }

        let weights_elems = p.n_inputs * p.n_outputs * p.kernel_h * p.kernel_w;
        let reduce = KernelInfo::new(SourceKind::Source, "wrw_generic.cl", "wrw_reduce")
            .with_work(vec![GROUP, 1, 1], vec![round_up(weights_elems, GROUP), 1, 1])
            .with_options(options);
        Ok(Solution::new(self.id(), vec![main, reduce]).with_workspace(p.weights_size_bytes() * stacks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convforge_backend_gpu::testing::FakeDevice;
    use convforge_backend_gpu::{Capabilities, MetadataVersion};
    use convforge_problem::{ConvParams, Direction, OperatorKind};
    use std::sync::Arc;

    fn ctx(problem: ProblemDescriptor, caps: Capabilities) -> ExecutionContext {
        ExecutionContext::new(
            problem,
            OperatorKind::DirectConvolution,
            Arc::new(FakeDevice::new("fake", 8)),
            caps,
        )
        .unwrap()
    }

    fn wrw(kernel: usize, pad: usize, batch: usize) -> ProblemDescriptor {
        ProblemDescriptor::new(Direction::BackwardWeights)
            .with_input(32, 28, 28)
            .with_kernel(kernel, kernel)
            .with_output(64, 28, 28)
            .with_conv(ConvParams::new((pad, pad), (1, 1), (1, 1)))
            .with_batch(batch)
    }

    #[test]
    fn only_backward_weights_is_accepted() {
        let weights = ctx(wrw(3, 1, 1), Capabilities::default());
        assert!(ConvWrwGeneric.is_applicable(&weights));

        let mut data = wrw(3, 1, 1);
        data.direction = Direction::BackwardData;
        assert!(!ConvWrwGeneric.is_applicable(&ctx(data, Capabilities::default())));
    }

    #[test]
    fn asm_wrw_needs_assembler() {
        let asm = Capabilities {
            use_asm_kernels: true,
            use_binaries: false,
            metadata_version: MetadataVersion::V3,
        };
        assert!(ConvWrwAsm3x3.is_applicable(&ctx(wrw(3, 1, 8), asm)));
        assert!(!ConvWrwAsm3x3.is_applicable(&ctx(wrw(3, 1, 8), Capabilities::default())));
        assert!(ConvWrw1x1.is_applicable(&ctx(wrw(1, 0, 8), Capabilities::default())));
    }

    #[test]
    fn large_batches_reduce_through_workspace() {
        let small = ConvWrwGeneric
            .get_solution(&ctx(wrw(3, 1, 16), Capabilities::default()), &TuningConfig::default())
            .unwrap();
        assert_eq!(small.kernels.len(), 1);
        assert_eq!(small.workspace_bytes, 0);

        let big_problem = wrw(3, 1, 64);
        let bytes = big_problem.weights_size_bytes();
        let big = ConvWrwGeneric
            .get_solution(&ctx(big_problem, Capabilities::default()), &TuningConfig::default())
            .unwrap();
        assert_eq!(big.kernels.len(), 2);
        assert_eq!(big.kernels[1].entry_point, "wrw_reduce");
        assert_eq!(big.workspace_bytes, bytes * 4);
    }
}
