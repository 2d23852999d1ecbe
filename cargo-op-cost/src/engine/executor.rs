//! Reference engine: runs an f32 [`Model`] op by op with the naive kernels
//! and announces each op to subscribed observers before computing it.

use std::sync::Arc;

use crate::cost::Context;
use crate::engine::kernels;
use crate::engine::{HookId, Hooks, HostEngine, OperationEvent, OperationObserver};
use crate::error::{Error, Result};
use crate::ir::graph::{DType, Graph, TensorId, TensorKind};
use crate::ir::{Model, Op};

#[derive(Default)]
pub struct Executor {
    hooks: Hooks,
    train: bool,
}

impl HostEngine for Executor {
    fn subscribe(&mut self, observer: Arc<dyn OperationObserver>) -> HookId {
        self.hooks.subscribe(observer)
    }

    fn unsubscribe(&mut self, id: HookId) -> bool {
        self.hooks.unsubscribe(id)
    }
}

impl Executor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value of the `train` flag passed to observers. The kernels always run
    /// in inference mode.
    pub fn with_train(mut self, train: bool) -> Self {
        self.train = train;
        self
    }

    pub fn hook_count(&self) -> usize {
        self.hooks.len()
    }

    /// Run `model` on `input` and return the graph output. The model is
    /// validated first; nothing is dispatched for a malformed graph.
    pub fn run(&mut self, model: &Model, input: &[f32]) -> Result<Vec<f32>> {
        model.validate()?;
        let graph = &model.graph;
        check_f32(graph)?;

        let input_id = match graph.inputs.as_slice() {
            [id] => *id,
            other => {
                return Err(Error::Graph(format!(
                    "expected 1 input tensor, found {}",
                    other.len()
                )))
            }
        };
        let output_id = match graph.outputs.as_slice() {
            [id] => *id,
            other => {
                return Err(Error::Graph(format!(
                    "expected 1 output tensor, found {}",
                    other.len()
                )))
            }
        };
        let expected = numel(graph, input_id);
        if input.len() != expected {
            return Err(Error::Graph(format!(
                "input has {} elements, graph expects {expected}",
                input.len()
            )));
        }

        let mut buffers: Vec<Option<Vec<f32>>> = vec![None; graph.tensors.len()];
        buffers[input_id] = Some(input.to_vec());

        for op in &graph.ops {
            let op_type = op.op_type();
            let inputs = graph.descs(&op.inputs());
            let outputs = graph.descs(&[op.output()]);
            let mut context = op.attrs();
            context.insert("train", self.train);

            self.hooks.dispatch(&OperationEvent {
                op_type: &op_type,
                inputs: &inputs,
                outputs: &outputs,
                context: &context,
            })?;

            let result = compute(model, op, &buffers)?;
            buffers[op.output()] = Some(result);
        }

        buffers[output_id]
            .take()
            .ok_or_else(|| Error::Graph(format!("output t{output_id} was never written")))
    }
}

fn check_f32(graph: &Graph<Op>) -> Result<()> {
    match graph.tensors.iter().find(|t| t.dtype != DType::F32) {
        Some(t) => Err(Error::Graph(format!(
            "executor only runs f32 graphs; t{} is {:?}",
            t.id, t.dtype
        ))),
        None => Ok(()),
    }
}

fn numel(graph: &Graph<Op>, id: TensorId) -> usize {
    graph.tensor(id).shape.iter().product()
}

fn shape4(graph: &Graph<Op>, id: TensorId) -> Result<[usize; 4]> {
    match graph.tensor(id).shape.as_slice() {
        &[n, h, w, c] => Ok([n, h, w, c]),
        other => Err(Error::Graph(format!(
            "t{id}: expected a 4D NHWC tensor, got {other:?}"
        ))),
    }
}

/// Borrow a tensor's current value: a slice of the parameter buffer for
/// constants, the computed buffer otherwise.
fn read<'a>(model: &'a Model, buffers: &'a [Option<Vec<f32>>], id: TensorId) -> Result<&'a [f32]> {
    let data = match &model.graph.tensor(id).kind {
        TensorKind::Constant { offset, len } => model.data.get(*offset..*offset + *len),
        _ => buffers[id].as_deref(),
    };
    let data =
        data.ok_or_else(|| Error::Graph(format!("t{id} is read before it is available")))?;
    let expected = numel(&model.graph, id);
    if data.len() != expected {
        return Err(Error::Graph(format!(
            "t{id} holds {} values, shape needs {expected}",
            data.len()
        )));
    }
    Ok(data)
}

fn read_opt<'a>(
    model: &'a Model,
    buffers: &'a [Option<Vec<f32>>],
    id: Option<TensorId>,
) -> Result<Option<&'a [f32]>> {
    id.map(|id| read(model, buffers, id)).transpose()
}

fn compute(model: &Model, op: &Op, buffers: &[Option<Vec<f32>>]) -> Result<Vec<f32>> {
    let graph = &model.graph;
    let mut out = vec![0.0f32; numel(graph, op.output())];

    match op {
        Op::Conv2d {
            input,
            weights,
            bias,
            output,
            params,
        } => {
            kernels::conv2d(
                read(model, buffers, *input)?,
                shape4(graph, *input)?,
                read(model, buffers, *weights)?,
                shape4(graph, *weights)?,
                read_opt(model, buffers, *bias)?,
                params.stride,
                params.pad,
                &mut out,
                shape4(graph, *output)?,
            );
        }
        Op::BatchNorm {
            input,
            gamma,
            beta,
            mean,
            var,
            eps,
            ..
        } => {
            kernels::batch_norm(
                read(model, buffers, *input)?,
                read(model, buffers, *gamma)?,
                read(model, buffers, *beta)?,
                read(model, buffers, *mean)?,
                read(model, buffers, *var)?,
                *eps,
                &mut out,
            );
        }
        Op::Relu { input, .. } => kernels::relu(read(model, buffers, *input)?, &mut out),
        Op::AveragePool2d {
            input,
            output,
            params,
        } => kernels::average_pool2d(
            read(model, buffers, *input)?,
            shape4(graph, *input)?,
            params.ksize,
            params.stride,
            &mut out,
            shape4(graph, *output)?,
        ),
        Op::MaxPool2d {
            input,
            output,
            params,
        } => kernels::max_pool2d(
            read(model, buffers, *input)?,
            shape4(graph, *input)?,
            params.ksize,
            params.stride,
            &mut out,
            shape4(graph, *output)?,
        ),
        Op::Reshape { input, .. } => kernels::reshape(read(model, buffers, *input)?, &mut out),
        Op::Linear {
            input,
            weights,
            bias,
            ..
        } => {
            let (batch, in_features) = match graph.tensor(*input).shape.as_slice() {
                &[b, i] => (b, i),
                other => {
                    return Err(Error::Graph(format!(
                        "linear expects a 2D input, got {other:?}"
                    )))
                }
            };
            let out_features = graph.tensor(*weights).shape.first().copied().unwrap_or(0);
            kernels::fully_connected(
                read(model, buffers, *input)?,
                batch,
                in_features,
                read(model, buffers, *weights)?,
                read_opt(model, buffers, *bias)?,
                &mut out,
                out_features,
            );
        }
        Op::AddConstant { input, value, .. } => {
            kernels::add_constant(read(model, buffers, *input)?, *value, &mut out)
        }
        Op::Softmax { input, .. } => {
            let dim = graph.tensor(*input).shape.last().copied().unwrap_or(1);
            kernels::softmax(read(model, buffers, *input)?, dim, &mut out);
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Recorder;
    use crate::ir::ModelBuilder;
    use crate::zoo;

    #[test]
    fn runs_simple_convnet() {
        let model = zoo::simple_convnet().unwrap();
        let input = vec![0.5f32; model.input_size().unwrap()];
        let out = Executor::new().run(&model, &input).unwrap();
        assert_eq!(out.len(), 10);
        assert!(out.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn events_follow_graph_order_with_attrs() {
        let model = zoo::simple_convnet().unwrap();
        let recorder = Arc::new(Recorder::new());
        let mut exec = Executor::new().with_train(false);
        exec.subscribe(recorder.clone());
        exec.run(&model, &vec![0.0; 3072]).unwrap();

        let events = recorder.events();
        assert_eq!(events.len(), model.graph.ops.len());
        for (ev, op) in events.iter().zip(&model.graph.ops) {
            assert_eq!(ev.op_type, op.op_type());
            assert_eq!(ev.context.get_bool("train"), Some(false));
        }
        assert_eq!(events[0].inputs[0].shape, vec![1, 32, 32, 3]);
        assert_eq!(events[0].outputs[0].shape, vec![1, 32, 32, 32]);
        assert_eq!(events[0].context.get_pair("pad"), Some([1, 1]));
        assert_eq!(events[9].context.get_pair("ksize"), Some([32, 32]));
    }

    #[test]
    fn observer_does_not_change_results() {
        let model = zoo::mlp().unwrap();
        let input: Vec<f32> = (0..784).map(|i| (i % 13) as f32 / 13.0).collect();
        let plain = Executor::new().run(&model, &input).unwrap();

        let mut observed = Executor::new();
        observed.subscribe(Arc::new(Recorder::new()));
        assert_eq!(observed.run(&model, &input).unwrap(), plain);
    }

    #[test]
    fn rejects_wrong_input_length() {
        let model = zoo::mlp().unwrap();
        let err = Executor::new().run(&model, &[0.0; 3]).unwrap_err();
        assert!(matches!(err, Error::Graph(_)));
    }

    #[test]
    fn rejects_non_f32_graphs() {
        let mut b = ModelBuilder::new();
        let x = b.input(vec![1, 4]);
        let y = b.softmax(x);
        let mut model = b.finish(y);
        model.graph.tensor_mut(x).dtype = DType::I8;
        assert!(matches!(
            Executor::new().run(&model, &[0.0; 4]),
            Err(Error::Graph(_))
        ));
    }

    #[test]
    fn truncated_parameter_buffer_is_an_error() {
        let mut model = zoo::mlp().unwrap();
        model.data.truncate(10);
        let err = Executor::new().run(&model, &[0.0; 784]).unwrap_err();
        assert!(matches!(err, Error::Graph(_)));
    }

    #[test]
    fn shrunken_batch_norm_params_rejected_before_dispatch() {
        let mut model = zoo::simple_convnet().unwrap();
        let beta = match &model.graph.ops[1] {
            Op::BatchNorm { beta, .. } => *beta,
            other => panic!("expected batch norm, got {other:?}"),
        };
        let t = model.graph.tensor_mut(beta);
        t.shape = vec![1];
        if let TensorKind::Constant { len, .. } = &mut t.kind {
            *len = 1;
        }
        let recorder = Arc::new(Recorder::new());
        let mut exec = Executor::new();
        exec.subscribe(recorder.clone());
        let err = exec.run(&model, &vec![0.0; 3072]).unwrap_err();
        assert!(matches!(err, Error::Graph(ref msg) if msg.contains("beta")));
        assert!(recorder.events().is_empty());
    }

    #[test]
    fn dangling_tensor_id_is_an_error() {
        let mut model = zoo::mlp().unwrap();
        for op in &mut model.graph.ops {
            if let Op::Relu { input, .. } = op {
                *input = 999;
                break;
            }
        }
        let err = Executor::new().run(&model, &[0.0; 784]).unwrap_err();
        assert!(matches!(err, Error::Graph(ref msg) if msg.contains("999")));
    }

    #[test]
    fn add_constant_and_unsubscribe() {
        let mut b = ModelBuilder::new();
        let x = b.input(vec![2, 2]);
        let y = b.add_constant(x, 1.0);
        let model = b.finish(y);

        let recorder = Arc::new(Recorder::new());
        let mut exec = Executor::new();
        let id = exec.subscribe(recorder.clone());
        assert_eq!(exec.run(&model, &[0.0, 1.0, 2.0, 3.0]).unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
        assert!(exec.unsubscribe(id));
        exec.run(&model, &[0.0; 4]).unwrap();
        assert_eq!(recorder.events().len(), 1);
        assert_eq!(exec.hook_count(), 0);
    }
}
