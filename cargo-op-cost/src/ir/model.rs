//! A runnable model: op graph plus the flat parameter buffer its constant
//! tensors point into, and a shape-inferring builder for it.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ir::graph::{DType, Graph, Tensor, TensorId, TensorKind};
use crate::ir::op::{Conv2dParams, Op, PoolParams};

/// Constant tensors reference into `data` via `TensorKind::Constant { offset, len }` (in floats).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    pub graph: Graph<Op>,
    #[serde(default)]
    pub data: Vec<f32>,
}

impl Model {
    /// Parse and [`validate`](Model::validate).
    pub fn from_json(text: &str) -> Result<Model> {
        let model: Model =
            serde_json::from_str(text).map_err(|e| Error::Graph(format!("bad model JSON: {e}")))?;
        model.validate()?;
        Ok(model)
    }

    pub fn load(path: &Path) -> Result<Model> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Number of elements the (single) graph input expects.
    pub fn input_size(&self) -> Result<usize> {
        match self.graph.inputs.as_slice() {
            [id] => {
                let shape = &self.tensor(*id)?.shape;
                numel(shape).ok_or_else(|| Error::Graph(format!("input shape {shape:?} overflows usize")))
            }
            other => Err(Error::Graph(format!(
                "expected 1 input tensor, found {}",
                other.len()
            ))),
        }
    }

    /// Structural checks the executor relies on: every tensor id is in
    /// range, constants lie inside `data`, and each op's operand shapes
    /// agree with each other and with its output.
    pub fn validate(&self) -> Result<()> {
        for (i, t) in self.graph.tensors.iter().enumerate() {
            let n = numel(&t.shape)
                .ok_or_else(|| Error::Graph(format!("t{i}: shape {:?} overflows usize", t.shape)))?;
            if let TensorKind::Constant { offset, len } = t.kind {
                if len != n {
                    return Err(Error::Graph(format!(
                        "t{i}: constant holds {len} values, shape needs {n}"
                    )));
                }
                if offset.checked_add(len).map_or(true, |end| end > self.data.len()) {
                    return Err(Error::Graph(format!(
                        "t{i}: constant range {offset}+{len} exceeds parameter buffer of {}",
                        self.data.len()
                    )));
                }
            }
        }
        for &id in self.graph.inputs.iter().chain(&self.graph.outputs) {
            self.tensor(id)?;
        }
        for (i, op) in self.graph.ops.iter().enumerate() {
            self.check_op(op).map_err(|e| match e {
                Error::Graph(msg) => Error::Graph(format!("op {i} ({}): {msg}", op.op_type())),
                other => other,
            })?;
        }
        Ok(())
    }

    fn tensor(&self, id: TensorId) -> Result<&Tensor> {
        self.graph.tensors.get(id).ok_or_else(|| {
            Error::Graph(format!(
                "tensor id {id} out of range ({} tensors)",
                self.graph.tensors.len()
            ))
        })
    }

    fn check_op(&self, op: &Op) -> Result<()> {
        for id in op.inputs().into_iter().chain([op.output()]) {
            self.tensor(id)?;
        }
        let s = |id: TensorId| self.graph.tensor(id).shape.as_slice();

        match op {
            Op::Conv2d {
                input,
                weights,
                bias,
                output,
                params,
            } => {
                let [n, h, w, ci] = nhwc(s(*input))?;
                let [co, kh, kw, wci] = nhwc(s(*weights))?;
                if wci != ci {
                    return Err(Error::Graph(format!(
                        "filter expects {wci} input channels, input has {ci}"
                    )));
                }
                if let Some(b) = bias {
                    expect_len("bias", s(*b), co)?;
                }
                let ho = window_out(h, kh, params.stride[0], params.pad[0])?;
                let wo = window_out(w, kw, params.stride[1], params.pad[1])?;
                expect_shape(s(*output), &[n, ho, wo, co])
            }
            Op::BatchNorm {
                input,
                gamma,
                beta,
                mean,
                var,
                output,
                ..
            } => {
                let [_, _, _, c] = nhwc(s(*input))?;
                for (name, id) in [("gamma", gamma), ("beta", beta), ("mean", mean), ("var", var)] {
                    expect_len(name, s(*id), c)?;
                }
                expect_shape(s(*output), s(*input))
            }
            Op::AveragePool2d {
                input,
                output,
                params,
            }
            | Op::MaxPool2d {
                input,
                output,
                params,
            } => {
                let [n, h, w, c] = nhwc(s(*input))?;
                let ho = window_out(h, params.ksize[0], params.stride[0], 0)?;
                let wo = window_out(w, params.ksize[1], params.stride[1], 0)?;
                expect_shape(s(*output), &[n, ho, wo, c])
            }
            Op::Linear {
                input,
                weights,
                bias,
                output,
            } => {
                let (batch, in_features) = match s(*input) {
                    &[b, i] => (b, i),
                    other => {
                        return Err(Error::Graph(format!(
                            "linear expects a 2D input, got {other:?}"
                        )))
                    }
                };
                let out_features = match s(*weights) {
                    &[o, i] if i == in_features => o,
                    other => {
                        return Err(Error::Graph(format!(
                            "weights {other:?} do not take {in_features} input features"
                        )))
                    }
                };
                if let Some(b) = bias {
                    expect_len("bias", s(*b), out_features)?;
                }
                expect_shape(s(*output), &[batch, out_features])
            }
            Op::Relu { input, output }
            | Op::Reshape { input, output }
            | Op::Softmax { input, output }
            | Op::AddConstant { input, output, .. } => {
                if numel(s(*input)) != numel(s(*output)) {
                    return Err(Error::Graph(format!(
                        "output {:?} does not hold the {:?} input's elements",
                        s(*output),
                        s(*input)
                    )));
                }
                Ok(())
            }
        }
    }
}

pub struct ModelBuilder {
    graph: Graph<Op>,
    data: Vec<f32>,
    seed: u32,
}

impl Default for ModelBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelBuilder {
    pub fn new() -> Self {
        Self {
            graph: Graph::new(),
            data: Vec::new(),
            seed: 0x2545_f491,
        }
    }

    pub fn input(&mut self, shape: Vec<usize>) -> TensorId {
        let id = self.graph.add_tensor(shape, DType::F32, TensorKind::Input);
        self.graph.inputs.push(id);
        id
    }

    pub fn shape(&self, id: TensorId) -> &[usize] {
        &self.graph.tensor(id).shape
    }

    pub fn conv2d(
        &mut self,
        x: TensorId,
        out_channels: usize,
        ksize: usize,
        stride: usize,
        pad: usize,
        bias: bool,
    ) -> Result<TensorId> {
        let [n, h, w, ci] = self.nhwc(x)?;
        let ho = window_out(h, ksize, stride, pad)?;
        let wo = window_out(w, ksize, stride, pad)?;
        let weights = self.param(vec![out_channels, ksize, ksize, ci]);
        let bias = bias.then(|| self.param(vec![out_channels]));
        let output = self.intermediate(vec![n, ho, wo, out_channels]);
        self.graph.ops.push(Op::Conv2d {
            input: x,
            weights,
            bias,
            output,
            params: Conv2dParams {
                stride: [stride, stride],
                pad: [pad, pad],
            },
        });
        Ok(output)
    }

    /// Freshly initialised statistics: gamma 1, beta 0, mean 0, var 1.
    pub fn batch_norm(&mut self, x: TensorId) -> Result<TensorId> {
        let [_, _, _, c] = self.nhwc(x)?;
        let gamma = self.constant(vec![c], |_| 1.0);
        let beta = self.constant(vec![c], |_| 0.0);
        let mean = self.constant(vec![c], |_| 0.0);
        let var = self.constant(vec![c], |_| 1.0);
        let output = self.intermediate(self.shape(x).to_vec());
        self.graph.ops.push(Op::BatchNorm {
            input: x,
            gamma,
            beta,
            mean,
            var,
            output,
            eps: 2e-5,
        });
        Ok(output)
    }

    pub fn relu(&mut self, x: TensorId) -> TensorId {
        let output = self.intermediate(self.shape(x).to_vec());
        self.graph.ops.push(Op::Relu { input: x, output });
        output
    }

    pub fn average_pool2d(
        &mut self,
        x: TensorId,
        ksize: [usize; 2],
        stride: [usize; 2],
    ) -> Result<TensorId> {
        let (output, params) = self.pool(x, ksize, stride)?;
        self.graph.ops.push(Op::AveragePool2d {
            input: x,
            output,
            params,
        });
        Ok(output)
    }

    pub fn max_pool2d(
        &mut self,
        x: TensorId,
        ksize: [usize; 2],
        stride: [usize; 2],
    ) -> Result<TensorId> {
        let (output, params) = self.pool(x, ksize, stride)?;
        self.graph.ops.push(Op::MaxPool2d {
            input: x,
            output,
            params,
        });
        Ok(output)
    }

    pub fn reshape(&mut self, x: TensorId, shape: Vec<usize>) -> Result<TensorId> {
        let from: usize = self.shape(x).iter().product();
        let to: usize = shape.iter().product();
        if from != to {
            return Err(Error::Graph(format!(
                "cannot reshape {:?} ({from} elements) into {shape:?}",
                self.shape(x)
            )));
        }
        let output = self.intermediate(shape);
        self.graph.ops.push(Op::Reshape { input: x, output });
        Ok(output)
    }

    /// `x` must be `[batch, in_features]`.
    pub fn linear(&mut self, x: TensorId, out_features: usize, bias: bool) -> Result<TensorId> {
        let (batch, in_features) = match self.shape(x) {
            &[b, i] => (b, i),
            other => {
                return Err(Error::Graph(format!(
                    "linear expects a 2D input, got {other:?}"
                )))
            }
        };
        let weights = self.param(vec![out_features, in_features]);
        let bias = bias.then(|| self.param(vec![out_features]));
        let output = self.intermediate(vec![batch, out_features]);
        self.graph.ops.push(Op::Linear {
            input: x,
            weights,
            bias,
            output,
        });
        Ok(output)
    }

    pub fn add_constant(&mut self, x: TensorId, value: f32) -> TensorId {
        let output = self.intermediate(self.shape(x).to_vec());
        self.graph.ops.push(Op::AddConstant {
            input: x,
            output,
            value,
        });
        output
    }

    pub fn softmax(&mut self, x: TensorId) -> TensorId {
        let output = self.intermediate(self.shape(x).to_vec());
        self.graph.ops.push(Op::Softmax { input: x, output });
        output
    }

    pub fn finish(mut self, output: TensorId) -> Model {
        self.graph.tensor_mut(output).kind = TensorKind::Output;
        self.graph.outputs.push(output);
        Model {
            graph: self.graph,
            data: self.data,
        }
    }

    fn nhwc(&self, x: TensorId) -> Result<[usize; 4]> {
        nhwc(self.shape(x))
    }

    fn pool(
        &mut self,
        x: TensorId,
        ksize: [usize; 2],
        stride: [usize; 2],
    ) -> Result<(TensorId, PoolParams)> {
        let [n, h, w, c] = self.nhwc(x)?;
        let ho = window_out(h, ksize[0], stride[0], 0)?;
        let wo = window_out(w, ksize[1], stride[1], 0)?;
        let output = self.intermediate(vec![n, ho, wo, c]);
        Ok((output, PoolParams { ksize, stride }))
    }

    fn intermediate(&mut self, shape: Vec<usize>) -> TensorId {
        self.graph
            .add_tensor(shape, DType::F32, TensorKind::Intermediate)
    }

    fn constant(&mut self, shape: Vec<usize>, fill: impl FnMut(usize) -> f32) -> TensorId {
        let len: usize = shape.iter().product();
        let offset = self.data.len();
        self.data.extend((0..len).map(fill));
        self.graph
            .add_tensor(shape, DType::F32, TensorKind::Constant { offset, len })
    }

    /// Small deterministic pseudo-random weights in [-0.1, 0.1).
    fn param(&mut self, shape: Vec<usize>) -> TensorId {
        let len: usize = shape.iter().product();
        let offset = self.data.len();
        for _ in 0..len {
            self.seed = self.seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            let unit = (self.seed >> 8) as f32 / (1u32 << 24) as f32;
            self.data.push((unit - 0.5) * 0.2);
        }
        self.graph
            .add_tensor(shape, DType::F32, TensorKind::Constant { offset, len })
    }
}

fn numel(shape: &[usize]) -> Option<usize> {
    shape.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
}

fn nhwc(shape: &[usize]) -> Result<[usize; 4]> {
    match shape {
        &[n, h, w, c] => Ok([n, h, w, c]),
        other => Err(Error::Graph(format!(
            "expected a 4D NHWC tensor, got {other:?}"
        ))),
    }
}

fn expect_len(what: &str, shape: &[usize], len: usize) -> Result<()> {
    if numel(shape) == Some(len) {
        Ok(())
    } else {
        Err(Error::Graph(format!("{what} has shape {shape:?}, expected {len} values")))
    }
}

fn expect_shape(got: &[usize], want: &[usize]) -> Result<()> {
    if got == want {
        Ok(())
    } else {
        Err(Error::Graph(format!("output has shape {got:?}, expected {want:?}")))
    }
}

fn window_out(input: usize, k: usize, stride: usize, pad: usize) -> Result<usize> {
    let padded = pad.checked_mul(2).and_then(|p| p.checked_add(input));
    match padded {
        Some(padded) if stride != 0 && k != 0 && padded >= k => Ok((padded - k) / stride + 1),
        _ => Err(Error::Graph(format!(
            "window {k} (stride {stride}, pad {pad}) does not fit input {input}"
        ))),
    }
}
