//! Reference op set run by the executor.
//! Each op reports its type id, operand ids and an attribute context for
//! the cost calculators.

use serde::{Deserialize, Serialize};

use crate::cost::{Context, OpType};
use crate::ir::graph::TensorId;

/// Type ids used in report labels and as default-table keys.
pub mod names {
    pub const CONV2D: &str = "Convolution2D";
    pub const BATCH_NORM: &str = "BatchNormalization";
    pub const RELU: &str = "ReLU";
    pub const AVERAGE_POOL2D: &str = "AveragePooling2D";
    pub const MAX_POOL2D: &str = "MaxPooling2D";
    pub const RESHAPE: &str = "Reshape";
    pub const LINEAR: &str = "Linear";
    pub const ADD_CONSTANT: &str = "AddConstant";
    pub const SOFTMAX: &str = "Softmax";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    /// Direct convolution, NHWC input, `[Co, Kh, Kw, Ci]` filter
    Conv2d {
        input: TensorId,
        weights: TensorId,
        bias: Option<TensorId>,
        output: TensorId,
        params: Conv2dParams,
    },

    /// Inference-mode batch normalization over the channel axis
    BatchNorm {
        input: TensorId,
        gamma: TensorId,
        beta: TensorId,
        mean: TensorId,
        var: TensorId,
        output: TensorId,
        eps: f32,
    },

    Relu { input: TensorId, output: TensorId },

    AveragePool2d {
        input: TensorId,
        output: TensorId,
        params: PoolParams,
    },

    MaxPool2d {
        input: TensorId,
        output: TensorId,
        params: PoolParams,
    },

    /// Reshape (zero-cost pointer reinterpret)
    Reshape { input: TensorId, output: TensorId },

    /// Fully connected, `[out, in]` weights
    Linear {
        input: TensorId,
        weights: TensorId,
        bias: Option<TensorId>,
        output: TensorId,
    },

    AddConstant {
        input: TensorId,
        output: TensorId,
        value: f32,
    },

    /// Softmax over last dimension
    Softmax { input: TensorId, output: TensorId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conv2dParams {
    pub stride: [usize; 2],
    /// Zero padding on each side, `[pad_h, pad_w]`
    pub pad: [usize; 2],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolParams {
    pub ksize: [usize; 2],
    pub stride: [usize; 2],
}

impl Op {
    pub fn op_type(&self) -> OpType {
        let name = match self {
            Op::Conv2d { .. } => names::CONV2D,
            Op::BatchNorm { .. } => names::BATCH_NORM,
            Op::Relu { .. } => names::RELU,
            Op::AveragePool2d { .. } => names::AVERAGE_POOL2D,
            Op::MaxPool2d { .. } => names::MAX_POOL2D,
            Op::Reshape { .. } => names::RESHAPE,
            Op::Linear { .. } => names::LINEAR,
            Op::AddConstant { .. } => names::ADD_CONSTANT,
            Op::Softmax { .. } => names::SOFTMAX,
        };
        OpType::from(name)
    }

    pub fn inputs(&self) -> Vec<TensorId> {
        match self {
            Op::Conv2d {
                input,
                weights,
                bias,
                ..
            }
            | Op::Linear {
                input,
                weights,
                bias,
                ..
            } => {
                let mut v = vec![*input, *weights];
                // bias is optional
                if let Some(b) = bias {
                    v.push(*b);
                }
                v
            }
            Op::BatchNorm {
                input,
                gamma,
                beta,
                mean,
                var,
                ..
            } => vec![*input, *gamma, *beta, *mean, *var],
            Op::Relu { input, .. }
            | Op::AveragePool2d { input, .. }
            | Op::MaxPool2d { input, .. }
            | Op::Reshape { input, .. }
            | Op::AddConstant { input, .. }
            | Op::Softmax { input, .. } => vec![*input],
        }
    }

    pub fn output(&self) -> TensorId {
        match self {
            Op::Conv2d { output, .. }
            | Op::BatchNorm { output, .. }
            | Op::Relu { output, .. }
            | Op::AveragePool2d { output, .. }
            | Op::MaxPool2d { output, .. }
            | Op::Reshape { output, .. }
            | Op::Linear { output, .. }
            | Op::AddConstant { output, .. }
            | Op::Softmax { output, .. } => *output,
        }
    }

    /// Attributes a calculator cannot recover from operand shapes.
    pub fn attrs(&self) -> Context {
        match self {
            Op::Conv2d { params, .. } => Context::new()
                .with("stride", params.stride.to_vec())
                .with("pad", params.pad.to_vec()),
            Op::AveragePool2d { params, .. } | Op::MaxPool2d { params, .. } => Context::new()
                .with("ksize", params.ksize.to_vec())
                .with("stride", params.stride.to_vec()),
            Op::BatchNorm { eps, .. } => Context::new().with("eps", *eps as f64),
            Op::AddConstant { value, .. } => Context::new().with("value", *value as f64),
            _ => Context::new(),
        }
    }
}
