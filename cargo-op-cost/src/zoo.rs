//! Ready-made models for demos and tests.

use crate::error::{Error, Result};
use crate::ir::{Model, ModelBuilder};

pub const MODEL_NAMES: &[&str] = &["simple-convnet", "mlp"];

pub fn by_name(name: &str) -> Result<Model> {
    match name {
        "simple-convnet" => simple_convnet(),
        "mlp" => mlp(),
        other => Err(Error::Graph(format!(
            "unknown zoo model '{other}' (available: {})",
            MODEL_NAMES.join(", ")
        ))),
    }
}

/// Three conv/batch-norm/relu blocks, global average pooling, two dense layers.
///
/// Input `[1, 32, 32, 3]`, output `[1, 10]`, 14 ops.
pub fn simple_convnet() -> Result<Model> {
    let mut b = ModelBuilder::new();
    let mut h = b.input(vec![1, 32, 32, 3]);
    for _ in 0..3 {
        h = b.conv2d(h, 32, 3, 1, 1, true)?;
        h = b.batch_norm(h)?;
        h = b.relu(h);
    }
    let (height, width) = (b.shape(h)[1], b.shape(h)[2]);
    h = b.average_pool2d(h, [height, width], [height, width])?;
    let batch = b.shape(h)[0];
    let features: usize = b.shape(h)[1..].iter().product();
    h = b.reshape(h, vec![batch, features])?;
    h = b.linear(h, 100, true)?;
    h = b.relu(h);
    h = b.linear(h, 10, true)?;
    Ok(b.finish(h))
}

/// 784 → 128 → 10 classifier with a softmax head.
pub fn mlp() -> Result<Model> {
    let mut b = ModelBuilder::new();
    let x = b.input(vec![1, 784]);
    let h = b.linear(x, 128, true)?;
    let h = b.relu(h);
    let h = b.linear(h, 10, true)?;
    let y = b.softmax(h);
    Ok(b.finish(y))
}
