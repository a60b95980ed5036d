//! Precompiled Winograd convolutions.
//!
//! Binaries are built per metadata format, so the format reported by the
//! capability probe picks the code object and gates applicability.

use crate::config::TuningConfig;
use crate::solution::{KernelInfo, Solution, SourceKind};
use crate::solver::SolverCandidate;
use convforge_backend_gpu::{ExecutionContext, MetadataVersion};
use convforge_problem::{DataType, Error, Layout, ProblemDescriptor, Result};

const GROUP: usize = 256;

fn binary_tag(version: MetadataVersion) -> Option<&'static str> {
    match version {
        MetadataVersion::V2 => Some("v2"),
        MetadataVersion::V3 => Some("v3"),
        MetadataVersion::VendorRuntime => Some("vendor"),
        MetadataVersion::Unknown | MetadataVersion::V1 => None,
    }
}

fn winograd_shape(p: &ProblemDescriptor) -> bool {
    (p.direction.is_forward() || p.direction.is_backward_data())
        && p.in_data_type == DataType::F32
        && p.in_layout == Layout::Nchw
        && p.stride_h == 1
        && p.stride_v == 1
        && p.dilation_h == 1
        && p.dilation_v == 1
}

fn binary_kernel(ctx: &ExecutionContext, family: &str, entry: &str) -> Result<KernelInfo> {
    let version = ctx.capabilities().metadata_version;
    let tag = binary_tag(version)
        .ok_or_else(|| Error::unsupported(format!("no {family} binary for metadata format {version}")))?;
    // One work-group per compute unit; binaries loop over tiles internally.
    let groups = ctx.device_identity().compute_units.max(1);
    Ok(
        KernelInfo::new(SourceKind::Binary, format!("winograd_{family}_{tag}.co"), entry)
            .with_work(vec![GROUP, 1, 1], vec![GROUP * groups, 1, 1]),
    )
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ConvWinograd3x3Binary;

impl SolverCandidate for ConvWinograd3x3Binary {
    fn id(&self) -> &'static str {
        "ConvWinograd3x3Binary"
    }

    fn is_applicable(&self, ctx: &ExecutionContext) -> bool {
        let p = ctx.problem();
        let caps = ctx.capabilities();
        caps.use_binaries
            && caps.metadata_version >= MetadataVersion::V2
            && winograd_shape(p)
            && p.kernel_h == 3
            && p.kernel_w == 3
            && p.pad_h == 1
            && p.pad_v == 1
            && p.n_outputs >= 16
            && p.n_outputs % 2 == 0
    }

    fn get_solution(&self, ctx: &ExecutionContext, _config: &TuningConfig) -> Result<Solution> {
        Ok(Solution::new(self.id(), vec![binary_kernel(ctx, "3x3", "winograd_3x3")?]))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ConvWinogradRxSBinary;

impl SolverCandidate for ConvWinogradRxSBinary {
    fn id(&self) -> &'static str {
        "ConvWinogradRxSBinary"
    }

    fn is_applicable(&self, ctx: &ExecutionContext) -> bool {
        let p = ctx.problem();
        let caps = ctx.capabilities();
        caps.use_binaries
            && caps.metadata_version >= MetadataVersion::V3
            && winograd_shape(p)
            && (1..=9).contains(&p.kernel_h)
            && (1..=9).contains(&p.kernel_w)
            && p.pad_h < p.kernel_w
            && p.pad_v < p.kernel_h
            && p.n_inputs % 2 == 0
            && p.n_outputs % 2 == 0
    }

    fn get_solution(&self, ctx: &ExecutionContext, _config: &TuningConfig) -> Result<Solution> {
        Ok(Solution::new(self.id(), vec![binary_kernel(ctx, "rxs", "winograd_rxs")?]))
    }
}
