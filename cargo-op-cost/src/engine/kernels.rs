//! Naive reference kernels - correct but slow.
//! Activations are NHWC; the executor sizes every buffer from the graph.

/// 2D Convolution (NHWC, naive) with padding support
///
/// - `input`:  [N, H, W, Ci]
/// - `filter`: [Co, Kh, Kw, Ci]
/// - `bias`:   [Co]
/// - `padding`: [pad_h, pad_w] - zero padding on each side
/// - `output`: [N, Ho, Wo, Co]
pub fn conv2d(
    input: &[f32],
    input_shape: [usize; 4],
    filter: &[f32],
    filter_shape: [usize; 4],
    bias: Option<&[f32]>,
    stride: [usize; 2],
    padding: [usize; 2],
    output: &mut [f32],
    output_shape: [usize; 4],
) {
    let [n, h, w, ci] = input_shape;
    let [co, kh, kw, _] = filter_shape;
    let [_, ho, wo, _] = output_shape;
    let [sh, sw] = stride;
    let [pad_h, pad_w] = padding;

    for batch in 0..n {
        for oy in 0..ho {
            for ox in 0..wo {
                for oc in 0..co {
                    let mut sum = bias.map_or(0.0, |b| b[oc]);
                    for ky in 0..kh {
                        for kx in 0..kw {
                            let iy_padded = oy * sh + ky;
                            let ix_padded = ox * sw + kx;

                            // inside the zero border
                            if iy_padded < pad_h || ix_padded < pad_w {
                                continue;
                            }
                            let iy = iy_padded - pad_h;
                            let ix = ix_padded - pad_w;
                            if iy >= h || ix >= w {
                                continue;
                            }

                            for ic in 0..ci {
                                let in_idx = batch * (h * w * ci) + iy * (w * ci) + ix * ci + ic;
                                let f_idx = oc * (kh * kw * ci) + ky * (kw * ci) + kx * ci + ic;
                                sum += input[in_idx] * filter[f_idx];
                            }
                        }
                    }
                    let out_idx = batch * (ho * wo * co) + oy * (wo * co) + ox * co + oc;
                    output[out_idx] = sum;
                }
            }
        }
    }
}

/// Inference batch normalization over the innermost (channel) axis.
pub fn batch_norm(
    input: &[f32],
    gamma: &[f32],
    beta: &[f32],
    mean: &[f32],
    var: &[f32],
    eps: f32,
    output: &mut [f32],
) {
    let c = gamma.len();
    for (i, (x, y)) in input.iter().zip(output.iter_mut()).enumerate() {
        let ch = i % c;
        let scale = gamma[ch] / (var[ch] + eps).sqrt();
        *y = (x - mean[ch]) * scale + beta[ch];
    }
}

pub fn relu(input: &[f32], output: &mut [f32]) {
    for (x, y) in input.iter().zip(output.iter_mut()) {
        *y = x.max(0.0);
    }
}

/// Visit every pooling window (NHWC, no padding) and store `reduce(window)`.
fn pool2d(
    input: &[f32],
    input_shape: [usize; 4],
    kernel: [usize; 2],
    stride: [usize; 2],
    output: &mut [f32],
    output_shape: [usize; 4],
    init: f32,
    fold: impl Fn(f32, f32) -> f32,
    finish: impl Fn(f32) -> f32,
) {
    let [n, h, w, c] = input_shape;
    let [kh, kw] = kernel;
    let [sh, sw] = stride;
    let [_, ho, wo, _] = output_shape;

    for batch in 0..n {
        for oy in 0..ho {
            for ox in 0..wo {
                for ch in 0..c {
                    let mut acc = init;
                    for ky in 0..kh {
                        for kx in 0..kw {
                            let iy = oy * sh + ky;
                            let ix = ox * sw + kx;
                            let in_idx = batch * (h * w * c) + iy * (w * c) + ix * c + ch;
                            acc = fold(acc, input[in_idx]);
                        }
                    }
                    let out_idx = batch * (ho * wo * c) + oy * (wo * c) + ox * c + ch;
                    output[out_idx] = finish(acc);
                }
            }
        }
    }
}

/// 2D Max Pooling (NHWC, naive)
pub fn max_pool2d(
    input: &[f32],
    input_shape: [usize; 4],
    kernel: [usize; 2],
    stride: [usize; 2],
    output: &mut [f32],
    output_shape: [usize; 4],
) {
    pool2d(
        input,
        input_shape,
        kernel,
        stride,
        output,
        output_shape,
        f32::NEG_INFINITY,
        f32::max,
        |v| v,
    );
}

/// 2D Average Pooling (NHWC, naive)
pub fn average_pool2d(
    input: &[f32],
    input_shape: [usize; 4],
    kernel: [usize; 2],
    stride: [usize; 2],
    output: &mut [f32],
    output_shape: [usize; 4],
) {
    let window = (kernel[0] * kernel[1]) as f32;
    pool2d(
        input,
        input_shape,
        kernel,
        stride,
        output,
        output_shape,
        0.0,
        |acc, v| acc + v,
        |sum| sum / window,
    );
}

/// Reshape (copy)
pub fn reshape(input: &[f32], output: &mut [f32]) {
    output.copy_from_slice(input);
}

/// Fully Connected (naive), batched
///
/// - `input`:   [batch, in_features]
/// - `weights`: [out_features, in_features]
/// - `bias`:    [out_features]
/// - `output`:  [batch, out_features]
pub fn fully_connected(
    input: &[f32],
    batch: usize,
    in_features: usize,
    weights: &[f32],
    bias: Option<&[f32]>,
    output: &mut [f32],
    out_features: usize,
) {
    for b in 0..batch {
        let row = &input[b * in_features..(b + 1) * in_features];
        for o in 0..out_features {
            let mut sum = bias.map_or(0.0, |bias| bias[o]);
            for i in 0..in_features {
                sum += row[i] * weights[o * in_features + i];
            }
            output[b * out_features + o] = sum;
        }
    }
}

pub fn add_constant(input: &[f32], value: f32, output: &mut [f32]) {
    for (x, y) in input.iter().zip(output.iter_mut()) {
        *y = x + value;
    }
}

/// Softmax over rows of length `dim`.
pub fn softmax(input: &[f32], dim: usize, output: &mut [f32]) {
    if dim == 0 {
        return;
    }
    for (row, out) in input.chunks(dim).zip(output.chunks_mut(dim)) {
        let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut sum = 0.0;
        for (x, y) in row.iter().zip(out.iter_mut()) {
            *y = (x - max).exp();
            sum += *y;
        }
        for y in out.iter_mut() {
            *y /= sum;
        }
    }
}
