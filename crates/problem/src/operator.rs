//! Operator configurations.
//!
//! Each operator family is plain data carried next to the problem descriptor;
//! the solver registry picks its candidate list from the variant.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PoolingMethod {
    Average,
    #[default]
    Max,
    Stochastic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PoolingParams {
    pub method: PoolingMethod,
    pub window_h: usize,
    pub window_w: usize,
    pub pad_v: usize,
    pub pad_h: usize,
    pub stride_v: usize,
    pub stride_h: usize,
    pub propagate_nan: bool,
}

impl Default for PoolingParams {
    fn default() -> Self {
        Self {
            method: PoolingMethod::Max,
            window_h: 3,
            window_w: 3,
            pad_v: 0,
            pad_h: 0,
            stride_v: 2,
            stride_h: 2,
            propagate_nan: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LrnRegion {
    #[default]
    WithinChannel,
    AcrossChannels,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LrnParams {
    pub region: LrnRegion,
    pub area: usize,
    pub alpha: f64,
    pub beta: f64,
    pub k: f64,
}

impl Default for LrnParams {
    fn default() -> Self {
        Self {
            region: LrnRegion::WithinChannel,
            area: 5,
            alpha: 1e-4,
            beta: 0.75,
            k: 1.0,
        }
    }
}

impl LrnParams {
    /// Alpha scaled by the normalization window size.
    pub fn alpha_over_area(&self) -> f64 {
        let area = self.area.max(1) as f64;
        match self.region {
            LrnRegion::AcrossChannels => self.alpha / area,
            LrnRegion::WithinChannel => self.alpha / (area * area),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NeuronKind {
    #[default]
    PassThrough,
    Logistic,
    TanH,
    Relu,
    SoftRelu,
    Abs,
    Power,
    ClippedRelu,
}

impl NeuronKind {
    pub fn ordinal(&self) -> u32 {
        match self {
            NeuronKind::PassThrough => 0,
            NeuronKind::Logistic => 1,
            NeuronKind::TanH => 2,
            NeuronKind::Relu => 3,
            NeuronKind::SoftRelu => 4,
            NeuronKind::Abs => 5,
            NeuronKind::Power => 6,
            NeuronKind::ClippedRelu => 7,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NeuronParams {
    pub kind: NeuronKind,
    pub alpha: f64,
    pub beta: f64,
    pub gamma: f64,
}

impl Default for NeuronParams {
    fn default() -> Self {
        Self {
            kind: NeuronKind::PassThrough,
            alpha: 0.0,
            beta: 1.0,
            gamma: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub enum OperatorKind {
    /// Direct convolution in any direction, including backward-weights.
    #[default]
    DirectConvolution,
    WinogradConvolution,
    Pooling(PoolingParams),
    Lrn(LrnParams),
    Neuron(NeuronParams),
}

impl OperatorKind {
    pub fn name(&self) -> &'static str {
        match self {
            OperatorKind::DirectConvolution => "direct-convolution",
            OperatorKind::WinogradConvolution => "winograd-convolution",
            OperatorKind::Pooling(_) => "pooling",
            OperatorKind::Lrn(_) => "lrn",
            OperatorKind::Neuron(_) => "neuron",
        }
    }

    pub fn is_convolution(&self) -> bool {
        matches!(
            self,
            OperatorKind::DirectConvolution | OperatorKind::WinogradConvolution
        )
    }

    /// Operator parameters that change the generated kernels, as a key
    /// suffix. Convolutions are fully described by the problem key.
    pub fn network_config(&self) -> Option<String> {
        match self {
            OperatorKind::DirectConvolution | OperatorKind::WinogradConvolution => None,
            OperatorKind::Pooling(p) => Some(format!(
                "pool{:?}-{}x{}-{}x{}-{}x{}-nan{}",
                p.method,
                p.window_h,
                p.window_w,
                p.pad_v,
                p.pad_h,
                p.stride_v,
                p.stride_h,
                u8::from(p.propagate_nan)
            )),
            OperatorKind::Lrn(p) => Some(format!(
                "lrn{:?}-{}-{}-{}-{}",
                p.region, p.area, p.alpha, p.beta, p.k
            )),
            OperatorKind::Neuron(p) => Some(format!(
                "nrn{:?}-{}-{}-{}",
                p.kind, p.alpha, p.beta, p.gamma
            )),
        }
    }
}

impl fmt::Display for OperatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alpha_over_area_depends_on_region() {
        let across = LrnParams {
            region: LrnRegion::AcrossChannels,
            area: 5,
            alpha: 1.0,
            ..LrnParams::default()
        };
        assert!((across.alpha_over_area() - 0.2).abs() < 1e-12);

        let within = LrnParams {
            region: LrnRegion::WithinChannel,
            ..across
        };
        assert!((within.alpha_over_area() - 0.04).abs() < 1e-12);
    }

    #[test]
    fn pooling_defaults() {
        let params = PoolingParams::default();
        assert_eq!(params.method, PoolingMethod::Max);
        assert_eq!((params.window_h, params.window_w), (3, 3));
        assert_eq!((params.stride_v, params.stride_h), (2, 2));
    }

    #[test]
    fn network_config_tracks_kernel_parameters() {
        assert_eq!(OperatorKind::DirectConvolution.network_config(), None);

        let relu = OperatorKind::Neuron(NeuronParams {
            kind: NeuronKind::Relu,
            ..NeuronParams::default()
        });
        let tanh = OperatorKind::Neuron(NeuronParams {
            kind: NeuronKind::TanH,
            ..NeuronParams::default()
        });
        assert_eq!(relu.network_config().as_deref(), Some("nrnRelu-0-1-0"));
        assert_ne!(relu.network_config(), tanh.network_config());

        let wide = OperatorKind::Pooling(PoolingParams::default());
        let narrow = OperatorKind::Pooling(PoolingParams {
            window_h: 2,
            window_w: 2,
            ..PoolingParams::default()
        });
        assert_eq!(wide.network_config().as_deref(), Some("poolMax-3x3-0x0-2x2-nan0"));
        assert_ne!(wide.network_config(), narrow.network_config());

        let across = OperatorKind::Lrn(LrnParams {
            region: LrnRegion::AcrossChannels,
            ..LrnParams::default()
        });
        assert_ne!(OperatorKind::Lrn(LrnParams::default()).network_config(), across.network_config());
    }

    #[test]
    fn operator_kind_serializes_as_data() {
        let kind = OperatorKind::Pooling(PoolingParams {
            method: PoolingMethod::Average,
            ..PoolingParams::default()
        });
        let json = serde_json::to_string(&kind).unwrap();
        let parsed: OperatorKind = serde_json::from_str(&json).unwrap();
        assert_eq!(kind, parsed);
        assert_eq!(parsed.name(), "pooling");
        assert!(!parsed.is_convolution());
    }
}
