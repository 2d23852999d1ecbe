//! Built-in calculators for the reference op set. All report element counts.
//!
//! Layouts follow the executor: activations NHWC, conv filters
//! `[Co, Kh, Kw, Ci]`, linear weights `[out, in]`.

use crate::cost::calculator::CostCalculator;
use crate::cost::registry::DefaultTable;
use crate::cost::{Context, Cost, CostUnits, OpType};
use crate::ir::graph::TensorDesc;
use crate::ir::op::names;

type CalcResult = Result<Cost, String>;

pub fn table() -> DefaultTable {
    let mut t = DefaultTable::new();
    let mut add = |name: &str, f: fn(&OpType, &[TensorDesc], &Context) -> CalcResult| {
        t.insert(name, CostCalculator::native(f).with_units(CostUnits::Elements));
    };
    add(names::CONV2D, conv2d);
    add(names::BATCH_NORM, batch_norm);
    add(names::RELU, elementwise_unary);
    add(names::ADD_CONSTANT, elementwise_unary);
    add(names::AVERAGE_POOL2D, average_pool2d);
    add(names::MAX_POOL2D, max_pool2d);
    add(names::RESHAPE, reshape);
    add(names::LINEAR, linear);
    add(names::SOFTMAX, softmax);
    t
}

/// Multiply-add cost: 1 flop when fused, otherwise 2.
fn mac(ctx: &Context) -> u64 {
    if ctx.get_bool("fma_1flop").unwrap_or(true) {
        1
    } else {
        2
    }
}

fn arg<'a>(op: &OpType, inputs: &'a [TensorDesc], i: usize) -> Result<&'a TensorDesc, String> {
    inputs
        .get(i)
        .ok_or_else(|| format!("{op}: expected at least {} inputs, got {}", i + 1, inputs.len()))
}

fn nhwc(op: &OpType, d: &TensorDesc) -> Result<[u64; 4], String> {
    match d.shape.as_slice() {
        &[n, h, w, c] => Ok([n as u64, h as u64, w as u64, c as u64]),
        other => Err(format!("{op}: expected a 4D NHWC tensor, got {other:?}")),
    }
}

fn overflow(op: &OpType) -> String {
    format!("{op}: cost overflows u64")
}

fn size(op: &OpType, d: &TensorDesc) -> Result<u64, String> {
    d.size().ok_or_else(|| overflow(op))
}

fn product(op: &OpType, factors: &[u64]) -> Result<u64, String> {
    factors
        .iter()
        .try_fold(1u64, |acc, &f| acc.checked_mul(f))
        .ok_or_else(|| overflow(op))
}

fn sum(op: &OpType, terms: &[u64]) -> Result<u64, String> {
    terms
        .iter()
        .try_fold(0u64, |acc, &t| acc.checked_add(t))
        .ok_or_else(|| overflow(op))
}

/// Output extent of a sliding window. Errors when the window does not fit.
fn out_dim(op: &OpType, input: u64, k: u64, stride: u64, pad: u64) -> Result<u64, String> {
    if stride == 0 {
        return Err(format!("{op}: stride must be positive"));
    }
    let padded = sum(op, &[input, product(op, &[2, pad])?])?;
    if padded < k {
        return Err(format!("{op}: window {k} larger than padded input {padded}"));
    }
    Ok((padded - k) / stride + 1)
}

fn conv2d(op: &OpType, inputs: &[TensorDesc], ctx: &Context) -> CalcResult {
    let x = arg(op, inputs, 0)?;
    let w = arg(op, inputs, 1)?;
    let bias = inputs.get(2);
    let [n, h, wd, ci] = nhwc(op, x)?;
    let [co, kh, kw, wci] = nhwc(op, w)?;
    if wci != ci {
        return Err(format!("{op}: filter expects {wci} channels, input has {ci}"));
    }
    let [sh, sw] = ctx.get_pair("stride").unwrap_or([1, 1]);
    let [ph, pw] = ctx.get_pair("pad").unwrap_or([0, 0]);
    let ho = out_dim(op, h, kh, sh, ph)?;
    let wo = out_dim(op, wd, kw, sw, pw)?;
    let out = product(op, &[n, ho, wo, co])?;

    let mut flops = product(op, &[out, kh, kw, ci, mac(ctx)])?;
    let mut mread = sum(op, &[size(op, x)?, size(op, w)?])?;
    if let Some(b) = bias {
        flops = sum(op, &[flops, out])?;
        mread = sum(op, &[mread, size(op, b)?])?;
    }
    Ok(Cost::new(flops, mread, out))
}

/// Inference-mode normalization: `(x - mean) * scale + beta` per element.
fn batch_norm(op: &OpType, inputs: &[TensorDesc], ctx: &Context) -> CalcResult {
    let n = size(op, arg(op, inputs, 0)?)?;
    let per_elem = if mac(ctx) == 1 { 2 } else { 3 };
    let mut mread = n;
    for p in &inputs[1..] {
        mread = sum(op, &[mread, size(op, p)?])?;
    }
    Ok(Cost::new(product(op, &[n, per_elem])?, mread, n))
}

fn elementwise_unary(op: &OpType, inputs: &[TensorDesc], _ctx: &Context) -> CalcResult {
    let n = size(op, arg(op, inputs, 0)?)?;
    Ok(Cost::new(n, n, n))
}

fn pool_out(op: &OpType, inputs: &[TensorDesc], ctx: &Context) -> Result<(u64, u64, u64), String> {
    let x = arg(op, inputs, 0)?;
    let [n, h, w, c] = nhwc(op, x)?;
    let [kh, kw] = ctx
        .get_pair("ksize")
        .ok_or_else(|| format!("{op}: missing 'ksize' in context"))?;
    let [sh, sw] = ctx.get_pair("stride").unwrap_or([kh, kw]);
    let [ph, pw] = ctx.get_pair("pad").unwrap_or([0, 0]);
    let ho = out_dim(op, h, kh, sh, ph)?;
    let wo = out_dim(op, w, kw, sw, pw)?;
    let out = product(op, &[n, ho, wo, c])?;
    Ok((size(op, x)?, out, product(op, &[kh, kw])?))
}

fn average_pool2d(op: &OpType, inputs: &[TensorDesc], ctx: &Context) -> CalcResult {
    let (read, out, window) = pool_out(op, inputs, ctx)?;
    let flops = sum(op, &[product(op, &[out, window])?, out])?;
    Ok(Cost::new(flops, read, out))
}

fn max_pool2d(op: &OpType, inputs: &[TensorDesc], ctx: &Context) -> CalcResult {
    let (read, out, window) = pool_out(op, inputs, ctx)?;
    Ok(Cost::new(product(op, &[out, window])?, read, out))
}

/// Pointer reinterpret; no traffic.
fn reshape(op: &OpType, inputs: &[TensorDesc], _ctx: &Context) -> CalcResult {
    arg(op, inputs, 0)?;
    Ok(Cost::ZERO)
}

fn linear(op: &OpType, inputs: &[TensorDesc], ctx: &Context) -> CalcResult {
    let x = arg(op, inputs, 0)?;
    let w = arg(op, inputs, 1)?;
    let bias = inputs.get(2);
    let batch = x.shape.first().copied().unwrap_or(1) as u64;
    if batch == 0 {
        return Ok(Cost::ZERO);
    }
    let x_size = size(op, x)?;
    let in_features = x_size / batch;
    let (out_features, w_in) = match w.shape.as_slice() {
        &[o, i] => (o as u64, i as u64),
        other => return Err(format!("{op}: expected 2D weights, got {other:?}")),
    };
    if w_in != in_features {
        return Err(format!(
            "{op}: weights take {w_in} features, input has {in_features}"
        ));
    }
    let out = product(op, &[batch, out_features])?;
    let mut flops = product(op, &[out, in_features, mac(ctx)])?;
    let mut mread = sum(op, &[x_size, size(op, w)?])?;
    if let Some(b) = bias {
        flops = sum(op, &[flops, out])?;
        mread = sum(op, &[mread, size(op, b)?])?;
    }
    Ok(Cost::new(flops, mread, out))
}

/// exp, running sum and divide per element.
fn softmax(op: &OpType, inputs: &[TensorDesc], _ctx: &Context) -> CalcResult {
    let n = size(op, arg(op, inputs, 0)?)?;
    Ok(Cost::new(product(op, &[3, n])?, n, n))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::graph::DType;

    fn f32(shape: &[usize]) -> TensorDesc {
        TensorDesc::new(shape.to_vec(), DType::F32)
    }

    fn run(name: &str, inputs: &[TensorDesc], ctx: &Context) -> Cost {
        table()
            .get(name)
            .unwrap()
            .invoke(&name.into(), inputs, ctx)
            .unwrap()
    }

    #[test]
    fn conv2d_same_padding() {
        // [1,32,32,3] * [32,3,3,3] pad=1 → [1,32,32,32]
        let ctx = Context::new().with("stride", vec![1, 1]).with("pad", vec![1, 1]);
        let inputs = [f32(&[1, 32, 32, 3]), f32(&[32, 3, 3, 3]), f32(&[32])];
        let out = 32 * 32 * 32;
        let c = run(names::CONV2D, &inputs, &ctx);
        assert_eq!(c.flops, out * 27 + out);
        assert_eq!(c.mread, 3072 + 864 + 32);
        assert_eq!(c.mwrite, out);

        let no_fma = run(names::CONV2D, &inputs, &ctx.clone().with("fma_1flop", false));
        assert_eq!(no_fma.flops, out * 27 * 2 + out);
    }

    #[test]
    fn conv2d_stride_without_bias() {
        // 28x28, 5x5 kernel, stride 2, no pad → 12x12
        let ctx = Context::new().with("stride", vec![2, 2]);
        let c = run(names::CONV2D, &[f32(&[1, 28, 28, 1]), f32(&[8, 5, 5, 1])], &ctx);
        assert_eq!(c.mwrite, 12 * 12 * 8);
        assert_eq!(c.flops, 12 * 12 * 8 * 25);
    }

    #[test]
    fn conv2d_rejects_channel_mismatch() {
        let err = table()
            .get(names::CONV2D)
            .unwrap()
            .invoke(
                &names::CONV2D.into(),
                &[f32(&[1, 8, 8, 3]), f32(&[4, 3, 3, 2])],
                &Context::new(),
            )
            .unwrap_err();
        assert!(err.to_string().contains("channels"));
    }

    #[test]
    fn linear_counts_batch() {
        let inputs = [f32(&[2, 32]), f32(&[100, 32]), f32(&[100])];
        let c = run(names::LINEAR, &inputs, &Context::new());
        assert_eq!(c.flops, 2 * 100 * 32 + 2 * 100);
        assert_eq!(c.mread, 64 + 3200 + 100);
        assert_eq!(c.mwrite, 200);
    }

    #[test]
    fn global_average_pool() {
        let ctx = Context::new().with("ksize", vec![32, 32]);
        let c = run(names::AVERAGE_POOL2D, &[f32(&[1, 32, 32, 32])], &ctx);
        assert_eq!(c.mwrite, 32);
        assert_eq!(c.flops, 32 * 1024 + 32);
        assert_eq!(c.mread, 32 * 1024);
    }

    #[test]
    fn pooling_needs_ksize() {
        let calc = table();
        let err = calc
            .get(names::MAX_POOL2D)
            .unwrap()
            .invoke(&names::MAX_POOL2D.into(), &[f32(&[1, 4, 4, 1])], &Context::new())
            .unwrap_err();
        assert!(err.to_string().contains("ksize"));
    }

    #[test]
    fn max_pool_2x2() {
        let ctx = Context::new().with("ksize", vec![2, 2]);
        let c = run(names::MAX_POOL2D, &[f32(&[1, 28, 28, 8])], &ctx);
        assert_eq!(c.mwrite, 14 * 14 * 8);
        assert_eq!(c.flops, 14 * 14 * 8 * 4);
    }

    #[test]
    fn batch_norm_reads_params() {
        let x = f32(&[1, 4, 4, 8]);
        let p = f32(&[8]);
        let inputs = [x, p.clone(), p.clone(), p.clone(), p];
        let c = run(names::BATCH_NORM, &inputs, &Context::new());
        assert_eq!(c, Cost::new(256, 128 + 32, 128));
    }

    #[test]
    fn reshape_and_unary() {
        let x = [f32(&[3, 5])];
        assert_eq!(run(names::RESHAPE, &x, &Context::new()), Cost::ZERO);
        assert_eq!(run(names::RELU, &x, &Context::new()), Cost::new(15, 15, 15));
        assert_eq!(run(names::SOFTMAX, &x, &Context::new()), Cost::new(45, 15, 15));
    }

    #[test]
    fn oversized_shapes_are_errors_not_wraparound() {
        let huge = [f32(&[1 << 32, 1 << 32, 2])];
        let err = table()
            .get(names::RELU)
            .unwrap()
            .invoke(&names::RELU.into(), &huge, &Context::new())
            .unwrap_err();
        assert!(err.to_string().contains("overflows u64"));

        // fits as elements, but three flops each does not
        let big = [f32(&[1 << 32, 1 << 31])];
        let err = table()
            .get(names::SOFTMAX)
            .unwrap()
            .invoke(&names::SOFTMAX.into(), &big, &Context::new())
            .unwrap_err();
        assert!(err.to_string().contains("overflows u64"));
    }
}
