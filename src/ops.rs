//! Numeric kernels on NHWC tensors
//!
//! Every kernel builds new graph values from its inputs, so gradients flow back
//! to the variables they were computed from.

use std::{fmt, str::FromStr};

use rand::Rng;

use crate::{
    tensor::{Tensor, TensorError, tree_sum},
    values::Value,
};

/// Padding scheme of convolutions and pooling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Padding {
    /// Output size is `ceil(in / stride)`, the input is zero padded as evenly as possible
    Same,
    /// Only windows that fit entirely inside the input
    Valid,
}

impl FromStr for Padding {
    type Err = TensorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SAME" => Ok(Padding::Same),
            "VALID" => Ok(Padding::Valid),
            other => Err(TensorError::InvalidParameter {
                param: "padding",
                reason: format!("'{}' is neither SAME nor VALID", other),
            }),
        }
    }
}

impl fmt::Display for Padding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Padding::Same => write!(f, "SAME"),
            Padding::Valid => write!(f, "VALID"),
        }
    }
}

/// Kind of pooling reduction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    Max,
    Avg,
}

/// Output length and leading padding of one spatial dimension
fn output_dim(
    input: usize,
    window: usize,
    stride: usize,
    padding: Padding,
) -> Result<(usize, usize), TensorError> {
    if window == 0 || stride == 0 {
        return Err(TensorError::InvalidParameter {
            param: "window",
            reason: format!("kernel size {} and stride {} must be positive", window, stride),
        });
    }
    match padding {
        Padding::Same => {
            let out = input.div_ceil(stride);
            let total = ((out.saturating_sub(1)) * stride + window).saturating_sub(input);
            Ok((out, total / 2))
        }
        Padding::Valid => {
            if input < window {
                return Err(TensorError::InvalidParameter {
                    param: "window",
                    reason: format!("window {} does not fit input of size {}", window, input),
                });
            }
            Ok(((input - window) / stride + 1, 0))
        }
    }
}

fn dims4(t: &Tensor) -> Result<[usize; 4], TensorError> {
    match t.shape() {
        &[a, b, c, d] => Ok([a, b, c, d]),
        shape => Err(TensorError::Rank {
            expected: 4,
            shape: shape.to_vec(),
        }),
    }
}

fn dims2(t: &Tensor) -> Result<[usize; 2], TensorError> {
    match t.shape() {
        &[a, b] => Ok([a, b]),
        shape => Err(TensorError::Rank {
            expected: 2,
            shape: shape.to_vec(),
        }),
    }
}

/// Input coordinate for an output coordinate and kernel offset, `None` when it falls into padding
fn input_coord(out: usize, offset: usize, stride: usize, pad: usize, size: usize) -> Option<usize> {
    (out * stride + offset)
        .checked_sub(pad)
        .filter(|&i| i < size)
}

/// 2-D convolution of an NHWC input with an HWIO kernel
pub fn conv2d(
    input: &Tensor,
    kernel: &Tensor,
    strides: (usize, usize),
    padding: Padding,
) -> Result<Tensor, TensorError> {
    let [n, h, w, c] = dims4(input)?;
    let [kh, kw, kc, out_c] = dims4(kernel)?;
    if kc != c {
        return Err(TensorError::ShapeMismatch {
            expected: vec![kh, kw, c, out_c],
            got: kernel.shape().to_vec(),
        });
    }
    let (oh, pad_top) = output_dim(h, kh, strides.0, padding)?;
    let (ow, pad_left) = output_dim(w, kw, strides.1, padding)?;

    let mut data = Vec::with_capacity(n * oh * ow * out_c);
    for b in 0..n {
        for oy in 0..oh {
            for ox in 0..ow {
                for o in 0..out_c {
                    let mut terms = vec![];
                    for ky in 0..kh {
                        let Some(iy) = input_coord(oy, ky, strides.0, pad_top, h) else {
                            continue;
                        };
                        for kx in 0..kw {
                            let Some(ix) = input_coord(ox, kx, strides.1, pad_left, w) else {
                                continue;
                            };
                            for ci in 0..c {
                                terms.push(input.get(&[b, iy, ix, ci]) * kernel.get(&[ky, kx, ci, o]));
                            }
                        }
                    }
                    data.push(tree_sum(terms));
                }
            }
        }
    }
    Tensor::from_vec(&[n, oh, ow, out_c], data)
}

/// Adds `bias` along the last dimension
pub fn bias_add(input: &Tensor, bias: &Tensor) -> Result<Tensor, TensorError> {
    let channels = input.shape().last().copied().unwrap_or(0);
    if bias.shape() != [channels] {
        return Err(TensorError::ShapeMismatch {
            expected: vec![channels],
            got: bias.shape().to_vec(),
        });
    }
    let data = input
        .values()
        .iter()
        .enumerate()
        .map(|(i, v)| v + &bias.values()[i % channels])
        .collect();
    Tensor::from_vec(input.shape(), data)
}

/// `[m, k] x [k, n] -> [m, n]`
pub fn matmul(a: &Tensor, b: &Tensor) -> Result<Tensor, TensorError> {
    let [m, k] = dims2(a)?;
    let [kb, n] = dims2(b)?;
    if k != kb {
        return Err(TensorError::ShapeMismatch {
            expected: vec![k, n],
            got: b.shape().to_vec(),
        });
    }
    let mut data = Vec::with_capacity(m * n);
    for i in 0..m {
        for j in 0..n {
            let terms = (0..k).map(|l| a.get(&[i, l]) * b.get(&[l, j])).collect();
            data.push(tree_sum(terms));
        }
    }
    Tensor::from_vec(&[m, n], data)
}

pub fn relu(input: &Tensor) -> Tensor {
    input.map(Value::relu)
}

/// Max or average pooling, `ksize` and `strides` are `[1, h, w, 1]`.
/// Padded positions never take part in the reduction.
pub fn pool(
    input: &Tensor,
    kind: PoolKind,
    ksize: [usize; 4],
    strides: [usize; 4],
    padding: Padding,
) -> Result<Tensor, TensorError> {
    if ksize[0] != 1 || ksize[3] != 1 || strides[0] != 1 || strides[3] != 1 {
        return Err(TensorError::InvalidParameter {
            param: "ksize",
            reason: format!(
                "pooling over batch or channels is not supported (ksize {:?}, strides {:?})",
                ksize, strides
            ),
        });
    }
    let [n, h, w, c] = dims4(input)?;
    let (oh, pad_top) = output_dim(h, ksize[1], strides[1], padding)?;
    let (ow, pad_left) = output_dim(w, ksize[2], strides[2], padding)?;

    let mut data = Vec::with_capacity(n * oh * ow * c);
    for b in 0..n {
        for oy in 0..oh {
            for ox in 0..ow {
                for ci in 0..c {
                    let mut window = vec![];
                    for ky in 0..ksize[1] {
                        let Some(iy) = input_coord(oy, ky, strides[1], pad_top, h) else {
                            continue;
                        };
                        for kx in 0..ksize[2] {
                            if let Some(ix) = input_coord(ox, kx, strides[2], pad_left, w) {
                                window.push(input.get(&[b, iy, ix, ci]).clone());
                            }
                        }
                    }
                    let count = window.len();
                    let reduced = match kind {
                        PoolKind::Max => window
                            .into_iter()
                            .reduce(|acc, v| acc.max(&v))
                            .unwrap_or_else(|| Value::new(0.0)),
                        PoolKind::Avg => &tree_sum(window) / &Value::new(count.max(1) as f32),
                    };
                    data.push(reduced);
                }
            }
        }
    }
    Tensor::from_vec(&[n, oh, ow, c], data)
}

/// Local response normalization across channels:
/// `x / (bias + alpha * sum(x[c - r ..= c + r]^2)) ^ beta`
pub fn local_response_norm(
    input: &Tensor,
    depth_radius: usize,
    bias: f32,
    alpha: f32,
    beta: f32,
) -> Result<Tensor, TensorError> {
    let channels = input.shape().last().copied().unwrap_or(0);
    if channels == 0 {
        return Err(TensorError::Rank {
            expected: 1,
            shape: input.shape().to_vec(),
        });
    }
    let two = Value::new(2.0);
    let squares = input.map(|v| v.pow(&two));
    let (bias, alpha, beta) = (Value::new(bias), Value::new(alpha), Value::new(beta));

    let data = input
        .values()
        .iter()
        .enumerate()
        .map(|(i, x)| {
            let c = i % channels;
            let start = i - c;
            let lo = c.saturating_sub(depth_radius);
            let hi = (c + depth_radius).min(channels - 1);
            let sqr_sum = tree_sum(squares.values()[start + lo..=start + hi].to_vec());
            let denom = (&bias + &(&alpha * &sqr_sum)).pow(&beta);
            x / &denom
        })
        .collect();
    Tensor::from_vec(input.shape(), data)
}

/// Keeps every element with probability `keep_prob`, scaling kept elements by `1 / keep_prob`
pub fn dropout<R: Rng + ?Sized>(
    input: &Tensor,
    keep_prob: f32,
    rng: &mut R,
) -> Result<Tensor, TensorError> {
    if !(keep_prob > 0.0 && keep_prob <= 1.0) {
        return Err(TensorError::InvalidParameter {
            param: "keep_prob",
            reason: format!("{} is not in (0, 1]", keep_prob),
        });
    }
    if keep_prob == 1.0 {
        return Ok(input.clone());
    }
    let scale = Value::new(1.0 / keep_prob);
    let zero = Value::new(0.0);
    let data = input
        .values()
        .iter()
        .map(|v| {
            if rng.random::<f32>() < keep_prob {
                v * &scale
            } else {
                v * &zero
            }
        })
        .collect();
    Tensor::from_vec(input.shape(), data)
}
