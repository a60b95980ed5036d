//! Ordered solver lists per operator family.

use crate::conv_asm::{ConvAsm1x1Direct, ConvAsm3x3Direct};
use crate::conv_direct::{ConvDirect11x11, ConvDirect1x1, ConvDirect3x3, ConvDirectGeneric};
use crate::conv_wrw::{ConvWrw1x1, ConvWrwAsm3x3, ConvWrwGeneric};
use crate::misc::{LrnDirect, NeuronDirect, PoolingDirect};
use crate::solver::{DynSolver, SolverCandidate};
use crate::winograd::{ConvWinograd3x3Binary, ConvWinogradRxSBinary};
use convforge_backend_gpu::ExecutionContext;
use convforge_problem::{Direction, OperatorKind};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SolverFamily {
    Direct,
    Winograd,
    BackwardWeights,
    Pooling,
    Lrn,
    Neuron,
}

impl SolverFamily {
    /// Backward-weights direct convolutions get their own family.
    pub fn of(operator: &OperatorKind, direction: Direction) -> Self {
        match operator {
            OperatorKind::DirectConvolution if direction.is_backward_weights() => {
                SolverFamily::BackwardWeights
            }
            OperatorKind::DirectConvolution => SolverFamily::Direct,
            OperatorKind::WinogradConvolution => SolverFamily::Winograd,
            OperatorKind::Pooling(_) => SolverFamily::Pooling,
            OperatorKind::Lrn(_) => SolverFamily::Lrn,
            OperatorKind::Neuron(_) => SolverFamily::Neuron,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SolverFamily::Direct => "direct",
            SolverFamily::Winograd => "winograd",
            SolverFamily::BackwardWeights => "backward-weights",
            SolverFamily::Pooling => "pooling",
            SolverFamily::Lrn => "lrn",
            SolverFamily::Neuron => "neuron",
        }
    }
}

impl fmt::Display for SolverFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Candidates in priority order. Registration order is the tie-break:
/// earlier solvers win when several apply.
#[derive(Default, Clone)]
pub struct SolverRegistry {
    families: HashMap<SolverFamily, Vec<DynSolver>>,
}

impl SolverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn standard() -> Self {
        let mut registry = Self::new();

        registry.register(SolverFamily::Direct, ConvAsm3x3Direct);
        registry.register(SolverFamily::Direct, ConvAsm1x1Direct);
        registry.register(SolverFamily::Direct, ConvDirect11x11);
        registry.register(SolverFamily::Direct, ConvDirect3x3);
        registry.register(SolverFamily::Direct, ConvDirect1x1);
        registry.register(SolverFamily::Direct, ConvDirectGeneric);

        registry.register(SolverFamily::Winograd, ConvWinograd3x3Binary);
        registry.register(SolverFamily::Winograd, ConvWinogradRxSBinary);

        registry.register(SolverFamily::BackwardWeights, ConvWrw1x1);
        registry.register(SolverFamily::BackwardWeights, ConvWrwAsm3x3);
        registry.register(SolverFamily::BackwardWeights, ConvWrwGeneric);

        registry.register(SolverFamily::Pooling, PoolingDirect);
        registry.register(SolverFamily::Lrn, LrnDirect);
        registry.register(SolverFamily::Neuron, NeuronDirect);
        registry
    }

    /// Appends `solver` at the lowest priority of its family.
    pub fn register<S>(&mut self, family: SolverFamily, solver: S)
    where
        S: SolverCandidate + 'static,
    {
        self.families.entry(family).or_default().push(Arc::new(solver));
    }

    pub fn family(&self, family: SolverFamily) -> &[DynSolver] {
        self.families.get(&family).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The ordered candidate list for the context's operator and direction.
    pub fn candidates(&self, ctx: &ExecutionContext) -> &[DynSolver] {
        self.family(SolverFamily::of(ctx.operator(), ctx.problem().direction))
    }

    pub fn find(&self, id: &str) -> Option<DynSolver> {
        self.families
            .values()
            .flatten()
            .find(|solver| solver.id() == id)
            .map(Arc::clone)
    }
}

impl fmt::Debug for SolverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (family, solvers) in &self.families {
            let ids: Vec<_> = solvers.iter().map(|s| s.id()).collect();
            map.entry(family, &ids);
        }
        map.finish()
    }
}
