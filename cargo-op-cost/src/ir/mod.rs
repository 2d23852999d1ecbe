pub mod graph;
pub mod model;
pub mod op;

pub use graph::{DType, Graph, Tensor, TensorDesc, TensorId, TensorKind};
pub use model::{Model, ModelBuilder};
pub use op::{Conv2dParams, Op, PoolParams};
