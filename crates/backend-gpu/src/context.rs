//! Per-call execution context.

use crate::capability::Capabilities;
use crate::device::{DeviceHandle, DeviceIdentity};
use convforge_problem::{DataType, OperatorKind, ProblemDescriptor, Result};
use std::fmt;
use std::sync::Arc;

/// A problem plus everything the environment contributes to solving it.
///
/// Built for one call and dropped once a solution has been obtained. The
/// capability flags come from [`crate::CapabilityCache`]; the context never
/// probes the device itself.
#[derive(Clone)]
pub struct ExecutionContext {
    problem: ProblemDescriptor,
    operator: OperatorKind,
    general_compile_options: String,
    capabilities: Capabilities,
    do_search: bool,
    device: DeviceHandle,
}

impl ExecutionContext {
    /// Validates the problem for its operator and seeds precision defines.
    pub fn new(
        problem: ProblemDescriptor,
        operator: OperatorKind,
        device: DeviceHandle,
        capabilities: Capabilities,
    ) -> Result<Self> {
        if operator.is_convolution() {
            problem.validate_convolution()?;
        } else {
            problem.validate()?;
        }

        let mut context = Self {
            problem,
            operator,
            general_compile_options: String::new(),
            capabilities,
            do_search: false,
            device,
        };
        context.setup_floats();
        Ok(context)
    }

    pub fn with_do_search(mut self, do_search: bool) -> Self {
        self.do_search = do_search;
        self
    }

    fn setup_floats(&mut self) {
        let defines = match self.problem.in_data_type {
            DataType::F32 => " -DUSE_FP32=1 -DUSE_FP16=0",
            DataType::F16 => " -DUSE_FP32=0 -DUSE_FP16=1",
            DataType::BF16 => " -DUSE_FP32=0 -DUSE_FP16=0 -DUSE_BFP16=1",
        };
        self.general_compile_options.push_str(defines);
    }

    /// Appends an option to the accumulated general compile options.
    pub fn add_compile_option(&mut self, option: &str) {
        let option = option.trim();
        if option.is_empty() {
            return;
        }
        self.general_compile_options.push(' ');
        self.general_compile_options.push_str(option);
    }

    pub fn problem(&self) -> &ProblemDescriptor {
        &self.problem
    }

    pub fn operator(&self) -> &OperatorKind {
        &self.operator
    }

    pub fn general_compile_options(&self) -> &str {
        &self.general_compile_options
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn do_search(&self) -> bool {
        self.do_search
    }

    pub fn device(&self) -> &DeviceHandle {
        &self.device
    }

    pub fn device_handle(&self) -> DeviceHandle {
        Arc::clone(&self.device)
    }

    pub fn device_identity(&self) -> DeviceIdentity {
        self.device.identity()
    }

    /// Canonical key of the wrapped problem.
    pub fn problem_key(&self) -> Result<String> {
        self.problem.serialize()
    }

    /// Kernel cache key: the problem key plus any operator parameters.
    pub fn network_config(&self) -> Result<String> {
        let key = self.problem.serialize()?;
        Ok(match self.operator.network_config() {
            Some(params) => format!("{key}-{params}"),
            None => key,
        })
    }

    pub fn is_forward(&self) -> bool {
        self.problem.direction.is_forward()
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("problem", &self.problem)
            .field("operator", &self.operator)
            .field("general_compile_options", &self.general_compile_options)
            .field("capabilities", &self.capabilities)
            .field("do_search", &self.do_search)
            .field("device", &self.device.identity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeDevice;
    use convforge_problem::{ConvParams, Direction, Error};

    fn device() -> DeviceHandle {
        Arc::new(FakeDevice::new("fake", 8))
    }

    fn conv(direction: Direction) -> ProblemDescriptor {
        ProblemDescriptor::new(direction)
            .with_input(8, 16, 16)
            .with_kernel(3, 3)
            .with_output(8, 16, 16)
            .with_conv(ConvParams::new((1, 1), (1, 1), (1, 1)))
    }

    #[test]
    fn float_defines_are_seeded() {
        let ctx = ExecutionContext::new(
            conv(Direction::Forward),
            OperatorKind::DirectConvolution,
            device(),
            Capabilities::default(),
        )
        .unwrap();
        assert_eq!(ctx.general_compile_options(), " -DUSE_FP32=1 -DUSE_FP16=0");
        assert!(!ctx.do_search());

        let half = conv(Direction::Forward).with_data_type(DataType::F16);
        let ctx = ExecutionContext::new(half, OperatorKind::DirectConvolution, device(), Capabilities::default())
            .unwrap();
        assert!(ctx.general_compile_options().contains("-DUSE_FP16=1"));
    }

    #[test]
    fn unresolved_direction_is_rejected() {
        let err = ExecutionContext::new(
            conv(Direction::Unknown),
            OperatorKind::DirectConvolution,
            device(),
            Capabilities::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn network_config_appends_operator_parameters() {
        let conv_ctx = ExecutionContext::new(
            conv(Direction::Forward),
            OperatorKind::DirectConvolution,
            device(),
            Capabilities::default(),
        )
        .unwrap();
        assert_eq!(conv_ctx.network_config().unwrap(), conv_ctx.problem_key().unwrap());

        let problem = ProblemDescriptor::new(Direction::Forward)
            .with_input(4, 8, 8)
            .with_output(4, 8, 8);
        let neuron = ExecutionContext::new(
            problem,
            OperatorKind::Neuron(Default::default()),
            device(),
            Capabilities::default(),
        )
        .unwrap();
        let key = neuron.problem_key().unwrap();
        assert_eq!(neuron.network_config().unwrap(), format!("{key}-nrnPassThrough-0-1-0"));
    }

    #[test]
    fn non_convolution_operators_skip_filter_checks() {
        let problem = ProblemDescriptor::new(Direction::Forward)
            .with_input(4, 8, 8)
            .with_output(4, 8, 8);
        let ctx = ExecutionContext::new(
            problem,
            OperatorKind::Neuron(Default::default()),
            device(),
            Capabilities::default(),
        );
        assert!(ctx.is_ok());
    }

    #[test]
    fn compile_options_accumulate() {
        let mut ctx = ExecutionContext::new(
            conv(Direction::Forward),
            OperatorKind::DirectConvolution,
            device(),
            Capabilities::default(),
        )
        .unwrap()
        .with_do_search(true);
        ctx.add_compile_option("  -DLIMIT=4 ");
        ctx.add_compile_option("");
        assert!(ctx.general_compile_options().ends_with(" -DLIMIT=4"));
        assert!(ctx.do_search());
        assert_eq!(ctx.device_identity().to_string(), "fake_8");
    }
}
