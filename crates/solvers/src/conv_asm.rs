//! Hand-written assembly convolutions.

use crate::config::{Asm3x3PerformanceConfig, CompileOptions, PerformanceConfig, TuningConfig};
use crate::solution::{KernelInfo, Solution, SourceKind};
use crate::solver::{div_ceil, round_up, SolverCandidate};
use convforge_backend_gpu::{ExecutionContext, MetadataVersion};
use convforge_problem::{DataType, Error, Layout, ProblemDescriptor, Result};

const WAVE_SIZE: usize = 64;

/// Assembly kernels need the assembler, a known metadata format and plain
/// FP32 NCHW tensors without dilation.
pub(crate) fn asm_usable(ctx: &ExecutionContext) -> bool {
    let caps = ctx.capabilities();
    let p = ctx.problem();
    caps.use_asm_kernels
        && caps.metadata_version != MetadataVersion::Unknown
        && p.in_data_type == DataType::F32
        && p.in_layout == Layout::Nchw
        && p.dilation_h == 1
        && p.dilation_v == 1
}

fn data_direction(p: &ProblemDescriptor) -> bool {
    p.direction.is_forward() || p.direction.is_backward_data()
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ConvAsm3x3Direct;

impl ConvAsm3x3Direct {
    fn perf_config(&self, ctx: &ExecutionContext, config: &TuningConfig) -> Result<Asm3x3PerformanceConfig> {
        if config.is_empty() {
            return Ok(Asm3x3PerformanceConfig::heuristic(ctx.problem()));
        }
        Asm3x3PerformanceConfig::from_tuning(config, ctx.problem())
            .ok_or_else(|| Error::configuration(format!("invalid 3x3 assembly tuning `{config}`")))
    }
}

impl SolverCandidate for ConvAsm3x3Direct {
    fn id(&self) -> &'static str {
        "ConvAsm3x3Direct"
    }

    fn is_applicable(&self, ctx: &ExecutionContext) -> bool {
        let p = ctx.problem();
        asm_usable(ctx)
            && data_direction(p)
            && p.kernel_h == 3
            && p.kernel_w == 3
            && p.pad_h == 1
            && p.pad_v == 1
            && p.stride_h == 1
            && p.stride_v == 1
            && (4..=1000).contains(&p.in_width)
    }

    fn is_tunable(&self) -> bool {
        true
    }

    fn default_config(&self, ctx: &ExecutionContext) -> TuningConfig {
        Asm3x3PerformanceConfig::heuristic(ctx.problem()).to_tuning()
    }

    fn accepts_config(&self, ctx: &ExecutionContext, config: &TuningConfig) -> bool {
        Asm3x3PerformanceConfig::from_tuning(config, ctx.problem()).is_some()
    }

    fn search_space(&self, ctx: &ExecutionContext) -> Vec<TuningConfig> {
        Asm3x3PerformanceConfig::search_space(ctx.problem())
            .iter()
            .map(PerformanceConfig::to_tuning)
            .collect()
    }

    fn get_solution(&self, ctx: &ExecutionContext, config: &TuningConfig) -> Result<Solution> {
        let p = ctx.problem();
        let perf = self.perf_config(ctx, config)?;
        let forward = p.direction.is_forward();

        let options = CompileOptions::for_context(ctx)
            .define("batch_size", p.batch)
            .define("img_width", p.in_width)
            .define("img_height", p.in_height)
            .define("input_channels", p.n_inputs)
            .define("output_channels", p.n_outputs)
            .flag("reverse_weights", !forward)
            .define("limit_wave_cnt", perf.limit_wave_cnt)
            .define("filters_per_wave", perf.filters_per_wave)
            .define("output_lines_per_wave", perf.output_lines_per_wave)
            .define("metadata_version", ctx.capabilities().metadata_version as u8)
            .build();

        let line_groups = div_ceil(p.out_height, perf.output_lines_per_wave);
        let filter_groups = div_ceil(p.n_outputs, perf.filters_per_wave);
        let kernel = KernelInfo::new(SourceKind::Assembly, "conv3x3.s", "conv3x3_asm")
            .with_work(
                vec![WAVE_SIZE, 1, 1],
                vec![WAVE_SIZE, line_groups, filter_groups * p.batch],
            )
            .with_options(options);

        Ok(Solution::new(self.id(), vec![kernel]).with_tuning(perf.to_tuning()))
    }
}

/// 1x1 assembly convolution. Stride 2 runs through a workspace: forward
/// subsamples the input first, backward data upsamples the result after.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConvAsm1x1Direct;

impl SolverCandidate for ConvAsm1x1Direct {
    fn id(&self) -> &'static str {
        "ConvAsm1x1Direct"
    }

    fn is_applicable(&self, ctx: &ExecutionContext) -> bool {
        let p = ctx.problem();
        let stride_ok = (p.stride_h == 1 && p.stride_v == 1) || (p.stride_h == 2 && p.stride_v == 2);
        asm_usable(ctx)
            && data_direction(p)
            && p.kernel_h == 1
            && p.kernel_w == 1
            && p.pad_h == 0
            && p.pad_v == 0
            && stride_ok
            && p.in_width <= 4096
            && p.in_height <= 4096
    }

    fn get_solution(&self, ctx: &ExecutionContext, _config: &TuningConfig) -> Result<Solution> {
        let p = ctx.problem();
        let strided = p.stride_h > 1;
        let forward = p.direction.is_forward();

        // The convolution itself always sees the smaller plane.
        let (conv_h, conv_w) = if forward {
            (p.out_height, p.out_width)
        } else {
            (p.in_height, p.in_width)
        };
        let plane_channels = if forward { p.n_inputs } else { p.n_outputs };
        let workspace = if strided {
            p.batch * plane_channels * conv_h * conv_w * p.in_data_type.element_size_bytes()
        } else {
            0
        };

        let conv = KernelInfo::new(SourceKind::Assembly, "conv1x1.s", "conv1x1_asm")
            .with_work(
                vec![WAVE_SIZE, 1, 1],
                vec![round_up(conv_h * conv_w, WAVE_SIZE), div_ceil(p.n_outputs, 4), p.batch],
            )
            .with_options(
                CompileOptions::for_context(ctx)
                    .define("batch_size", p.batch)
                    .define("img_width", conv_w)
                    .define("img_height", conv_h)
                    .define("input_channels", p.n_inputs)
                    .define("output_channels", p.n_outputs)
                    .flag("reverse_weights", !forward)
                    .define("metadata_version", ctx.capabilities().metadata_version as u8)
                    .build(),
            );

        let kernels = if !strided {
            vec![conv]
        } else {
            let (entry, big_h, big_w) = if forward {
                ("SubSample", p.in_height, p.in_width)
            } else {
                ("UpSample", p.out_height, p.out_width)
            };
            let resample = KernelInfo::new(SourceKind::Source, "resample.cl", entry)
                .with_work(
                    vec![256, 1, 1],
                    vec![round_up(conv_h * conv_w * plane_channels * p.batch, 256), 1, 1],
                )
                .with_options(
                    CompileOptions::for_context(ctx)
                        .define("RESAMPLE_STRIDE0", p.stride_h)
                        .define("RESAMPLE_STRIDE1", p.stride_v)
                        .define("RESAMPLE_IN_WIDTH", big_w)
                        .define("RESAMPLE_IN_HEIGHT", big_h)
                        .define("RESAMPLE_OUT_WIDTH", conv_w)
                        .define("RESAMPLE_OUT_HEIGHT", conv_h)
                        .build(),
                );
            if forward {
                vec![resample, conv]
            } else {
                vec![conv, resample]
            }
        };

        Ok(Solution::new(self.id(), kernels).with_workspace(workspace))
    }
}
