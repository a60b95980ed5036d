//! Problem descriptors and the canonical key format.
//!
//! The key is a fixed-order, dash separated rendering of a subset of the
//! descriptor fields:
//!
//! ```text
//! <n_inputs>-<in_h>-<in_w>-<kH>x<kW>-<n_outputs>-<out_h>-<out_w>-<batch>-
//! <padV>x<padH>-<strideV>x<strideH>-<dilV>x<dilV>-<bias>-<layout>-<dtype>-<F|B|W>
//! ```
//!
//! Output layout, output data type, weights layout and horizontal dilation are not
//! part of the key. Descriptors that differ only in those fields share database
//! records and cached kernels; existing database files depend on this.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    #[default]
    Unknown,
    Forward,
    BackwardData,
    BackwardWeights,
}

impl Direction {
    /// Maps the legacy `1 = forward, 0 = backward data` flag.
    pub fn from_forward_flag(forward: bool) -> Self {
        if forward {
            Direction::Forward
        } else {
            Direction::BackwardData
        }
    }

    pub fn is_known(self) -> bool {
        self != Direction::Unknown
    }

    pub fn is_forward(self) -> bool {
        self == Direction::Forward
    }

    pub fn is_backward_data(self) -> bool {
        self == Direction::BackwardData
    }

    pub fn is_backward_weights(self) -> bool {
        self == Direction::BackwardWeights
    }

    /// Single letter used as the last key field, `None` while unresolved.
    pub fn key_suffix(self) -> Option<char> {
        match self {
            Direction::Unknown => None,
            Direction::Forward => Some('F'),
            Direction::BackwardData => Some('B'),
            Direction::BackwardWeights => Some('W'),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    #[default]
    F32,
    F16,
    BF16,
}

impl DataType {
    pub fn element_size_bytes(&self) -> usize {
        match self {
            DataType::F32 => 4,
            DataType::F16 | DataType::BF16 => 2,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            DataType::F32 => "FP32",
            DataType::F16 => "FP16",
            DataType::BF16 => "BF16",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Layout {
    #[default]
    Nchw,
    Nhwc,
    Chwn,
}

impl Layout {
    pub fn tag(&self) -> &'static str {
        match self {
            Layout::Nchw => "NCHW",
            Layout::Nhwc => "NHWC",
            Layout::Chwn => "CHWN",
        }
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Plain 4-D tensor description as handed over by the tensor bookkeeping layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorShape {
    pub n: usize,
    pub c: usize,
    pub h: usize,
    pub w: usize,
    pub layout: Layout,
    pub dtype: DataType,
}

impl TensorShape {
    pub fn nchw(n: usize, c: usize, h: usize, w: usize, dtype: DataType) -> Self {
        Self {
            n,
            c,
            h,
            w,
            layout: Layout::Nchw,
            dtype,
        }
    }

    pub fn element_count(&self) -> usize {
        self.n * self.c * self.h * self.w
    }

    pub fn size_bytes(&self) -> usize {
        self.element_count() * self.dtype.element_size_bytes()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConvParams {
    pub pad_v: usize,
    pub pad_h: usize,
    pub stride_v: usize,
    pub stride_h: usize,
    pub dilation_v: usize,
    pub dilation_h: usize,
}

impl Default for ConvParams {
    fn default() -> Self {
        Self {
            pad_v: 0,
            pad_h: 0,
            stride_v: 1,
            stride_h: 1,
            dilation_v: 1,
            dilation_h: 1,
        }
    }
}

impl ConvParams {
    pub fn new(pad: (usize, usize), stride: (usize, usize), dilation: (usize, usize)) -> Self {
        Self {
            pad_v: pad.0,
            pad_h: pad.1,
            stride_v: stride.0,
            stride_h: stride.1,
            dilation_v: dilation.0,
            dilation_h: dilation.1,
        }
    }

    /// Spatial output extent along one axis; zero when the window does not fit.
    pub fn output_size(input: usize, kernel: usize, pad: usize, stride: usize, dilation: usize) -> usize {
        let span = dilation * kernel.saturating_sub(1) + 1;
        let padded = input + 2 * pad;
        if stride == 0 || padded < span {
            return 0;
        }
        (padded - span) / stride + 1
    }

    pub fn output_height(&self, in_height: usize, kernel_h: usize) -> usize {
        Self::output_size(in_height, kernel_h, self.pad_v, self.stride_v, self.dilation_v)
    }

    pub fn output_width(&self, in_width: usize, kernel_w: usize) -> usize {
        Self::output_size(in_width, kernel_w, self.pad_h, self.stride_h, self.dilation_h)
    }
}

/// Immutable fingerprint of one compute operation.
///
/// For backward directions the `in_*` fields describe the tensor the operation
/// reads (the output gradient) and the `out_*` fields the tensor it produces.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProblemDescriptor {
    pub n_inputs: usize,
    pub in_height: usize,
    pub in_width: usize,
    pub kernel_h: usize,
    pub kernel_w: usize,
    pub n_outputs: usize,
    pub out_height: usize,
    pub out_width: usize,
    pub batch: usize,
    pub pad_v: usize,
    pub pad_h: usize,
    pub stride_v: usize,
    pub stride_h: usize,
    pub dilation_v: usize,
    pub dilation_h: usize,
    pub bias: bool,
    pub in_layout: Layout,
    pub in_data_type: DataType,
    pub weights_layout: Layout,
    pub out_layout: Layout,
    pub out_data_type: DataType,
    pub direction: Direction,
}

impl Default for ProblemDescriptor {
    fn default() -> Self {
        Self {
            n_inputs: 0,
            in_height: 0,
            in_width: 0,
            kernel_h: 0,
            kernel_w: 0,
            n_outputs: 0,
            out_height: 0,
            out_width: 0,
            batch: 1,
            pad_v: 0,
            pad_h: 0,
            stride_v: 1,
            stride_h: 1,
            dilation_v: 1,
            dilation_h: 1,
            bias: false,
            in_layout: Layout::Nchw,
            in_data_type: DataType::F32,
            weights_layout: Layout::Nchw,
            out_layout: Layout::Nchw,
            out_data_type: DataType::F32,
            direction: Direction::Unknown,
        }
    }
}

impl ProblemDescriptor {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            ..Self::default()
        }
    }

    /// Builds a convolution descriptor from the x (data), w (weights) and y
    /// tensors. Backward directions swap which tensor feeds the input side.
    pub fn from_tensors(
        direction: Direction,
        x: &TensorShape,
        w: &TensorShape,
        y: &TensorShape,
        conv: ConvParams,
    ) -> Result<Self> {
        let (input, output) = match direction {
            Direction::Unknown => {
                return Err(Error::configuration(
                    "direction must be known to map tensors onto a problem",
                ))
            }
            Direction::Forward => (x, y),
            Direction::BackwardData | Direction::BackwardWeights => (y, x),
        };

        Ok(Self {
            n_inputs: input.c,
            in_height: input.h,
            in_width: input.w,
            kernel_h: w.h,
            kernel_w: w.w,
            n_outputs: output.c,
            out_height: output.h,
            out_width: output.w,
            batch: x.n,
            pad_v: conv.pad_v,
            pad_h: conv.pad_h,
            stride_v: conv.stride_v,
            stride_h: conv.stride_h,
            dilation_v: conv.dilation_v,
            dilation_h: conv.dilation_h,
            bias: false,
            in_layout: input.layout,
            in_data_type: input.dtype,
            weights_layout: w.layout,
            out_layout: output.layout,
            out_data_type: output.dtype,
            direction,
        })
    }

    pub fn with_input(mut self, channels: usize, height: usize, width: usize) -> Self {
        self.n_inputs = channels;
        self.in_height = height;
        self.in_width = width;
        self
    }

    pub fn with_output(mut self, channels: usize, height: usize, width: usize) -> Self {
        self.n_outputs = channels;
        self.out_height = height;
        self.out_width = width;
        self
    }

    pub fn with_kernel(mut self, height: usize, width: usize) -> Self {
        self.kernel_h = height;
        self.kernel_w = width;
        self
    }

    pub fn with_conv(mut self, conv: ConvParams) -> Self {
        self.pad_v = conv.pad_v;
        self.pad_h = conv.pad_h;
        self.stride_v = conv.stride_v;
        self.stride_h = conv.stride_h;
        self.dilation_v = conv.dilation_v;
        self.dilation_h = conv.dilation_h;
        self
    }

    pub fn with_batch(mut self, batch: usize) -> Self {
        self.batch = batch;
        self
    }

    pub fn with_bias(mut self, bias: bool) -> Self {
        self.bias = bias;
        self
    }

    pub fn with_layout(mut self, layout: Layout) -> Self {
        self.in_layout = layout;
        self.weights_layout = layout;
        self.out_layout = layout;
        self
    }

    pub fn with_data_type(mut self, dtype: DataType) -> Self {
        self.in_data_type = dtype;
        self.out_data_type = dtype;
        self
    }

    pub fn conv_params(&self) -> ConvParams {
        ConvParams {
            pad_v: self.pad_v,
            pad_h: self.pad_h,
            stride_v: self.stride_v,
            stride_h: self.stride_h,
            dilation_v: self.dilation_v,
            dilation_h: self.dilation_h,
        }
    }

    /// Padding seen by a backward-data kernel running the forward algorithm.
    pub fn backward_pad_h(&self) -> i64 {
        self.kernel_w as i64 - self.pad_h as i64 - 1
    }

    pub fn backward_pad_v(&self) -> i64 {
        self.kernel_h as i64 - self.pad_v as i64 - 1
    }

    pub fn in_size_bytes(&self) -> usize {
        self.batch * self.n_inputs * self.in_height * self.in_width * self.in_data_type.element_size_bytes()
    }

    pub fn out_size_bytes(&self) -> usize {
        self.batch * self.n_outputs * self.out_height * self.out_width * self.out_data_type.element_size_bytes()
    }

    pub fn weights_size_bytes(&self) -> usize {
        self.n_inputs * self.n_outputs * self.kernel_h * self.kernel_w * self.in_data_type.element_size_bytes()
    }

    /// Field checks shared by every operator kind.
    pub fn validate(&self) -> Result<()> {
        if !self.direction.is_known() {
            return Err(Error::configuration("problem direction is unknown"));
        }
        let positive = [
            ("batch", self.batch),
            ("n_inputs", self.n_inputs),
            ("n_outputs", self.n_outputs),
            ("stride_v", self.stride_v),
            ("stride_h", self.stride_h),
            ("dilation_v", self.dilation_v),
            ("dilation_h", self.dilation_h),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(Error::configuration(format!("{name} must be >= 1")));
            }
        }
        Ok(())
    }

    /// Checks specific to convolutions: a non-empty filter and spatial extents.
    pub fn validate_convolution(&self) -> Result<()> {
        self.validate()?;
        if self.kernel_h == 0 || self.kernel_w == 0 {
            return Err(Error::configuration(format!(
                "convolution filter {}x{} is empty",
                self.kernel_h, self.kernel_w
            )));
        }
        if self.in_height == 0 || self.in_width == 0 || self.out_height == 0 || self.out_width == 0 {
            return Err(Error::configuration(format!(
                "spatial extents must be non-zero (in {}x{}, out {}x{})",
                self.in_height, self.in_width, self.out_height, self.out_width
            )));
        }
        Ok(())
    }

    /// Canonical key. Fails while the direction is unresolved.
    pub fn serialize(&self) -> Result<String> {
        let suffix = self.direction.key_suffix().ok_or_else(|| {
            Error::configuration("direction must be resolved before serializing a problem")
        })?;

        Ok(format!(
            "{}-{}-{}-{}x{}-{}-{}-{}-{}-{}x{}-{}x{}-{}x{}-{}-{}-{}-{}",
            self.n_inputs,
            self.in_height,
            self.in_width,
            self.kernel_h,
            self.kernel_w,
            self.n_outputs,
            self.out_height,
            self.out_width,
            self.batch,
            self.pad_v,
            self.pad_h,
            self.stride_v,
            self.stride_h,
            self.dilation_v,
            self.dilation_v,
            u8::from(self.bias),
            self.in_layout,
            self.in_data_type,
            suffix
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn scenario_a() -> ProblemDescriptor {
        ProblemDescriptor::new(Direction::Forward)
            .with_input(3, 32, 32)
            .with_kernel(5, 5)
            .with_output(16, 30, 30)
            .with_conv(ConvParams::new((2, 2), (1, 1), (1, 1)))
            .with_batch(100)
    }

    #[test]
    fn forward_key_has_fixed_field_order() {
        let key = scenario_a().serialize().unwrap();
        assert_eq!(key, "3-32-32-5x5-16-30-30-100-2x2-1x1-1x1-0-NCHW-FP32-F");
    }

    #[test]
    fn direction_suffixes() {
        let mut problem = scenario_a();
        problem.direction = Direction::BackwardData;
        assert!(problem.serialize().unwrap().ends_with("-B"));
        problem.direction = Direction::BackwardWeights;
        assert!(problem.serialize().unwrap().ends_with("-W"));
    }

    #[test]
    fn unknown_direction_is_a_configuration_error() {
        let mut problem = scenario_a();
        problem.direction = Direction::Unknown;
        assert!(matches!(problem.serialize(), Err(Error::Configuration(_))));
    }

    #[test]
    fn key_repeats_vertical_dilation() {
        let problem = scenario_a().with_conv(ConvParams::new((2, 2), (1, 1), (3, 7)));
        assert!(problem.serialize().unwrap().contains("-3x3-"));
    }

    #[test]
    fn bias_and_type_fields() {
        let problem = scenario_a()
            .with_bias(true)
            .with_data_type(DataType::F16)
            .with_layout(Layout::Nhwc);
        assert_eq!(
            problem.serialize().unwrap(),
            "3-32-32-5x5-16-30-30-100-2x2-1x1-1x1-1-NHWC-FP16-F"
        );
    }

    #[test]
    fn from_tensors_swaps_sides_for_backward() {
        let x = TensorShape::nchw(8, 3, 32, 32, DataType::F32);
        let w = TensorShape::nchw(16, 3, 5, 5, DataType::F32);
        let y = TensorShape::nchw(8, 16, 28, 28, DataType::F32);

        let fwd = ProblemDescriptor::from_tensors(Direction::Forward, &x, &w, &y, ConvParams::default()).unwrap();
        assert_eq!((fwd.n_inputs, fwd.in_height, fwd.n_outputs, fwd.out_height), (3, 32, 16, 28));

        let bwd =
            ProblemDescriptor::from_tensors(Direction::BackwardData, &x, &w, &y, ConvParams::default()).unwrap();
        assert_eq!((bwd.n_inputs, bwd.in_height, bwd.n_outputs, bwd.out_height), (16, 28, 3, 32));
        assert_eq!(bwd.batch, 8);

        assert!(ProblemDescriptor::from_tensors(Direction::Unknown, &x, &w, &y, ConvParams::default()).is_err());
    }

    #[test]
    fn output_size_matches_convolution_arithmetic() {
        let conv = ConvParams::new((2, 2), (1, 1), (1, 1));
        assert_eq!(conv.output_height(32, 5), 32);
        let strided = ConvParams::new((0, 0), (4, 4), (1, 1));
        assert_eq!(strided.output_width(227, 11), 55);
        assert_eq!(ConvParams::output_size(2, 5, 0, 1, 1), 0);
    }

    #[test]
    fn backward_padding() {
        let problem = scenario_a().with_kernel(3, 5).with_conv(ConvParams::new((1, 2), (1, 1), (1, 1)));
        assert_eq!(problem.backward_pad_v(), 1);
        assert_eq!(problem.backward_pad_h(), 2);
    }

    #[test]
    fn validation_rejects_zero_strides_and_empty_filters() {
        assert!(scenario_a().validate_convolution().is_ok());

        let mut bad = scenario_a();
        bad.stride_h = 0;
        assert!(matches!(bad.validate(), Err(Error::Configuration(_))));

        let empty = scenario_a().with_kernel(0, 3);
        assert!(empty.validate().is_ok());
        assert!(empty.validate_convolution().is_err());
    }

    fn arb_problem() -> impl Strategy<Value = ProblemDescriptor> {
        (
            (1usize..512, 1usize..256, 1usize..256, 1usize..12, 1usize..12),
            (1usize..512, 1usize..256, 1usize..256, 1usize..256),
            (0usize..4, 0usize..4, 1usize..5, 1usize..5, 1usize..4, 1usize..4),
            any::<bool>(),
            prop_oneof![
                Just(Direction::Forward),
                Just(Direction::BackwardData),
                Just(Direction::BackwardWeights)
            ],
        )
            .prop_map(|(inp, out, conv, bias, direction)| {
                ProblemDescriptor::new(direction)
                    .with_input(inp.0, inp.1, inp.2)
                    .with_kernel(inp.3, inp.4)
                    .with_output(out.0, out.1, out.2)
                    .with_batch(out.3)
                    .with_conv(ConvParams::new((conv.0, conv.1), (conv.2, conv.3), (conv.4, conv.5)))
                    .with_bias(bias)
            })
    }

    proptest! {
        #[test]
        fn serialize_is_deterministic(problem in arb_problem()) {
            let copy = problem.clone();
            prop_assert_eq!(problem.serialize().unwrap(), copy.serialize().unwrap());
        }

        #[test]
        fn excluded_fields_do_not_change_the_key(
            problem in arb_problem(),
            dilation_h in 1usize..8,
        ) {
            let mut other = problem.clone();
            other.out_layout = Layout::Chwn;
            other.out_data_type = DataType::BF16;
            other.weights_layout = Layout::Nhwc;
            other.dilation_h = dilation_h;
            prop_assert_eq!(problem.serialize().unwrap(), other.serialize().unwrap());
        }

        #[test]
        fn key_fields_change_the_key(problem in arb_problem()) {
            let mut other = problem.clone();
            other.batch += 1;
            prop_assert_ne!(problem.serialize().unwrap(), other.serialize().unwrap());
        }
    }
}
