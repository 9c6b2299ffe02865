//! Parallel CPU backend kernels
//!
//! # CPU Backend
//!
//! This module provides the CPU implementations of every primitive the crate
//! can compile. It is the default backend, and the fallback whenever the GPU
//! path is disabled or fails.
//!
//! ## Features
//!
//! - Parallel execution using [`rayon`](https://docs.rs/rayon), one task per
//!   output plane (or per output channel for weight gradients)
//! - Plain row-major `f32` in and out; layouts are handled by [`super::layout`]
//!
//! ## Implemented Ops
//!
//! - `conv_forward`: Direct convolution with optional bias
//! - `conv_backward_data`: Gradient of the convolution source
//! - `conv_backward_weights`: Gradient of the weights and bias
//! - `relu_forward` / `relu_backward`: Leaky ReLU
//! - `pool_forward` / `pool_backward`: Max pooling (with argmax workspace) and
//!   average pooling (padding excluded)
//! - `concat`: Concatenation along any axis
//!
//! ## Determinism
//!
//! Every output element is accumulated by a single task in a fixed loop
//! order, so results are bit-identical across runs and thread counts.

use rayon::prelude::*;

use super::Kernel;
use crate::desc::{Algorithm, ConvolutionDesc, PoolingDesc};

/// Executes `kernel` on plain inputs, returning plain outputs in binding order.
///
/// # Errors
/// A description of the problem when the inputs do not have the sizes the
/// kernel expects.
pub fn run(kernel: &Kernel<'_>, inputs: &[Vec<f32>]) -> Result<Vec<Vec<f32>>, String> {
    match *kernel {
        Kernel::Nop => Ok(Vec::new()),
        Kernel::Reorder => Ok(vec![input(inputs, 0, None)?.to_vec()]),
        Kernel::Concat { axis, dims } => Ok(vec![concat(inputs, axis, dims)?]),
        Kernel::ConvForward(conv) => {
            let bias = inputs.get(2).map(Vec::as_slice);
            Ok(vec![conv_forward(conv, input(inputs, 0, None)?, input(inputs, 1, None)?, bias)])
        }
        Kernel::ConvBackwardData(conv) => Ok(vec![conv_backward_data(
            conv,
            input(inputs, 0, None)?,
            input(inputs, 1, None)?,
        )]),
        Kernel::ConvBackwardWeights(conv) => {
            let (diff_weights, diff_bias) =
                conv_backward_weights(conv, input(inputs, 0, None)?, input(inputs, 1, None)?);
            let mut out = vec![diff_weights];
            if conv.bias.is_some() {
                out.push(diff_bias);
            }
            Ok(out)
        }
        Kernel::ReluForward { alpha } => Ok(vec![relu_forward(input(inputs, 0, None)?, alpha)]),
        Kernel::ReluBackward { alpha } => {
            let src = input(inputs, 0, None)?;
            Ok(vec![relu_backward(src, input(inputs, 1, Some(src.len()))?, alpha)])
        }
        Kernel::PoolForward(pool) => {
            let (dst, workspace) = pool_forward(pool, input(inputs, 0, None)?);
            let mut out = vec![dst];
            if pool.has_workspace() {
                out.push(workspace);
            }
            Ok(out)
        }
        Kernel::PoolBackward(pool) => {
            let diff_dst = input(inputs, 0, None)?;
            let workspace = inputs.get(1).map(Vec::as_slice);
            if pool.algorithm == Algorithm::PoolingMax && workspace.is_none() {
                return Err("max pooling backward without a workspace".into());
            }
            Ok(vec![pool_backward(pool, diff_dst, workspace)])
        }
    }
}

fn input(inputs: &[Vec<f32>], index: usize, len: Option<usize>) -> Result<&[f32], String> {
    let data = inputs
        .get(index)
        .ok_or_else(|| format!("missing input #{index}"))?;
    match len {
        Some(len) if data.len() != len => Err(format!(
            "input #{index} has {} elements, expected {len}",
            data.len()
        )),
        _ => Ok(data),
    }
}

/// Extents of a 4-D tensor.
#[derive(Debug, Clone, Copy)]
struct Dims4 {
    n: usize,
    c: usize,
    h: usize,
    w: usize,
}

impl Dims4 {
    fn of(dims: &[usize]) -> Self {
        Self {
            n: dims[0],
            c: dims[1],
            h: dims[2],
            w: dims[3],
        }
    }

    fn plane(&self) -> usize {
        self.h * self.w
    }
}

/// Maps output coordinate `o` and window offset `k` to an input coordinate.
#[inline]
fn input_coord(o: usize, k: usize, stride: usize, pad: usize, extent: usize) -> Option<usize> {
    (o * stride + k).checked_sub(pad).filter(|&i| i < extent)
}

/// Convolution forward:
/// $$ dst_{n,o,y,x} = bias_o + \sum_{c,k_h,k_w} src_{n,c,y s_h + k_h - p_h, x s_w + k_w - p_w} \cdot w_{o,c,k_h,k_w} $$
///
/// Parallel over `(n, o)` output planes.
pub fn conv_forward(conv: &ConvolutionDesc, src: &[f32], weights: &[f32], bias: Option<&[f32]>) -> Vec<f32> {
    let s = Dims4::of(conv.src.dims());
    let d = Dims4::of(conv.dst.dims());
    let wd = Dims4::of(conv.weights.dims());
    let (kh, kw) = (wd.h, wd.w);
    let win = conv.window;

    let mut dst = vec![0.0f32; d.n * d.c * d.plane()];
    if d.plane() == 0 {
        return dst;
    }
    dst.par_chunks_mut(d.plane())
        .enumerate()
        .for_each(|(plane, out)| {
            let (n, o) = (plane / d.c, plane % d.c);
            let b = bias.map_or(0.0, |b| b[o]);
            for y in 0..d.h {
                for x in 0..d.w {
                    let mut acc = b;
                    for c in 0..s.c {
                        let src_base = (n * s.c + c) * s.plane();
                        let w_base = (o * wd.c + c) * kh * kw;
                        for ky in 0..kh {
                            let Some(iy) = input_coord(y, ky, win.strides[0], win.padding_l[0], s.h) else {
                                continue;
                            };
                            for kx in 0..kw {
                                let Some(ix) = input_coord(x, kx, win.strides[1], win.padding_l[1], s.w) else {
                                    continue;
                                };
                                acc += src[src_base + iy * s.w + ix] * weights[w_base + ky * kw + kx];
                            }
                        }
                    }
                    out[y * d.w + x] = acc;
                }
            }
        });
    dst
}

/// Gradient of the convolution source. Parallel over `(n, c)` planes of `diff_src`.
pub fn conv_backward_data(conv: &ConvolutionDesc, diff_dst: &[f32], weights: &[f32]) -> Vec<f32> {
    let s = Dims4::of(conv.src.dims());
    let d = Dims4::of(conv.dst.dims());
    let wd = Dims4::of(conv.weights.dims());
    let (kh, kw) = (wd.h, wd.w);
    let win = conv.window;

    let mut diff_src = vec![0.0f32; s.n * s.c * s.plane()];
    if s.plane() == 0 {
        return diff_src;
    }
    diff_src
        .par_chunks_mut(s.plane())
        .enumerate()
        .for_each(|(plane, out)| {
            let (n, c) = (plane / s.c, plane % s.c);
            for o in 0..d.c {
                let dst_base = (n * d.c + o) * d.plane();
                let w_base = (o * wd.c + c) * kh * kw;
                for y in 0..d.h {
                    for ky in 0..kh {
                        let Some(iy) = input_coord(y, ky, win.strides[0], win.padding_l[0], s.h) else {
                            continue;
                        };
                        for x in 0..d.w {
                            let g = diff_dst[dst_base + y * d.w + x];
                            for kx in 0..kw {
                                if let Some(ix) = input_coord(x, kx, win.strides[1], win.padding_l[1], s.w) {
                                    out[iy * s.w + ix] += g * weights[w_base + ky * kw + kx];
                                }
                            }
                        }
                    }
                }
            }
        });
    diff_src
}

/// Gradients of the weights and bias. Parallel over output channels.
pub fn conv_backward_weights(conv: &ConvolutionDesc, src: &[f32], diff_dst: &[f32]) -> (Vec<f32>, Vec<f32>) {
    let s = Dims4::of(conv.src.dims());
    let d = Dims4::of(conv.dst.dims());
    let wd = Dims4::of(conv.weights.dims());
    let (kh, kw) = (wd.h, wd.w);
    let win = conv.window;
    let per_output = wd.c * kh * kw;

    let mut diff_bias = vec![0.0f32; wd.n];
    let mut diff_weights = vec![0.0f32; wd.n * per_output];
    if per_output == 0 {
        return (diff_weights, diff_bias);
    }
    diff_weights
        .par_chunks_mut(per_output)
        .zip(diff_bias.par_iter_mut())
        .enumerate()
        .for_each(|(o, (gw, gb))| {
            for n in 0..d.n {
                let dst_base = (n * d.c + o) * d.plane();
                for y in 0..d.h {
                    for x in 0..d.w {
                        let g = diff_dst[dst_base + y * d.w + x];
                        *gb += g;
                        for c in 0..s.c {
                            let src_base = (n * s.c + c) * s.plane();
                            for ky in 0..kh {
                                let Some(iy) = input_coord(y, ky, win.strides[0], win.padding_l[0], s.h) else {
                                    continue;
                                };
                                for kx in 0..kw {
                                    if let Some(ix) = input_coord(x, kx, win.strides[1], win.padding_l[1], s.w) {
                                        gw[(c * kh + ky) * kw + kx] += g * src[src_base + iy * s.w + ix];
                                    }
                                }
                            }
                        }
                    }
                }
            }
        });
    (diff_weights, diff_bias)
}

/// Leaky ReLU: `x` if positive, `alpha * x` otherwise.
pub fn relu_forward(src: &[f32], alpha: f32) -> Vec<f32> {
    src.par_iter()
        .map(|&x| if x > 0.0 { x } else { alpha * x })
        .collect()
}

/// Leaky ReLU gradient, masked by the forward input.
pub fn relu_backward(src: &[f32], diff_dst: &[f32], alpha: f32) -> Vec<f32> {
    src.par_iter()
        .zip(diff_dst.par_iter())
        .map(|(&x, &g)| if x > 0.0 { g } else { alpha * g })
        .collect()
}

/// Pooling forward. Returns the destination and, for max pooling, the argmax
/// of every window as a flat `h * w + x` index into its source plane (`-1`
/// for windows that lie entirely in the padding).
pub fn pool_forward(pool: &PoolingDesc, src: &[f32]) -> (Vec<f32>, Vec<f32>) {
    let s = Dims4::of(pool.src.dims());
    let d = Dims4::of(pool.dst.dims());
    let [kh, kw] = pool.kernel;
    let win = pool.window;
    let max = pool.algorithm == Algorithm::PoolingMax;

    let mut dst = vec![0.0f32; d.n * d.c * d.plane()];
    let mut workspace = vec![-1.0f32; dst.len()];
    if d.plane() == 0 {
        return (dst, workspace);
    }
    dst.par_chunks_mut(d.plane())
        .zip(workspace.par_chunks_mut(d.plane()))
        .enumerate()
        .for_each(|(plane, (out, ws))| {
            let input = &src[plane * s.plane()..(plane + 1) * s.plane()];
            for y in 0..d.h {
                for x in 0..d.w {
                    let mut best = f32::NEG_INFINITY;
                    let mut arg = None;
                    let mut sum = 0.0f32;
                    let mut count = 0usize;
                    for ky in 0..kh {
                        let Some(iy) = input_coord(y, ky, win.strides[0], win.padding_l[0], s.h) else {
                            continue;
                        };
                        for kx in 0..kw {
                            let Some(ix) = input_coord(x, kx, win.strides[1], win.padding_l[1], s.w) else {
                                continue;
                            };
                            let v = input[iy * s.w + ix];
                            if arg.is_none() || v > best {
                                best = v;
                                arg = Some(iy * s.w + ix);
                            }
                            sum += v;
                            count += 1;
                        }
                    }
                    let at = y * d.w + x;
                    out[at] = match (max, arg) {
                        (_, None) => 0.0,
                        (true, Some(_)) => best,
                        (false, Some(_)) => sum / count as f32,
                    };
                    ws[at] = arg.map_or(-1.0, |a| a as f32);
                }
            }
        });
    (dst, workspace)
}

/// Pooling gradient. Parallel over `(n, c)` planes of `diff_src`.
///
/// Max pooling routes each gradient to the recorded argmax; average pooling
/// spreads it evenly over the window's in-bounds elements.
pub fn pool_backward(pool: &PoolingDesc, diff_dst: &[f32], workspace: Option<&[f32]>) -> Vec<f32> {
    let s = Dims4::of(pool.src.dims());
    let d = Dims4::of(pool.dst.dims());
    let [kh, kw] = pool.kernel;
    let win = pool.window;

    let mut diff_src = vec![0.0f32; s.n * s.c * s.plane()];
    if s.plane() == 0 || d.plane() == 0 {
        return diff_src;
    }
    diff_src
        .par_chunks_mut(s.plane())
        .enumerate()
        .for_each(|(plane, out)| {
            let grads = &diff_dst[plane * d.plane()..(plane + 1) * d.plane()];
            if let Some(ws) = workspace {
                let args = &ws[plane * d.plane()..(plane + 1) * d.plane()];
                for (&g, &a) in grads.iter().zip(args) {
                    if a >= 0.0 && (a as usize) < out.len() {
                        out[a as usize] += g;
                    }
                }
                return;
            }
            for y in 0..d.h {
                for x in 0..d.w {
                    let cells: Vec<usize> = (0..kh)
                        .filter_map(|ky| input_coord(y, ky, win.strides[0], win.padding_l[0], s.h))
                        .flat_map(|iy| {
                            (0..kw)
                                .filter_map(move |kx| input_coord(x, kx, win.strides[1], win.padding_l[1], s.w))
                                .map(move |ix| iy * s.w + ix)
                        })
                        .collect();
                    if cells.is_empty() {
                        continue;
                    }
                    let share = grads[y * d.w + x] / cells.len() as f32;
                    for cell in cells {
                        out[cell] += share;
                    }
                }
            }
        });
    diff_src
}

/// Concatenates plain tensors along `axis` into a tensor of extents `dims`.
pub fn concat(inputs: &[Vec<f32>], axis: usize, dims: &[usize]) -> Result<Vec<f32>, String> {
    let outer: usize = dims[..axis].iter().product();
    let inner: usize = dims[axis + 1..].iter().product();
    let total: usize = dims.iter().product();
    let mut out = Vec::with_capacity(total);
    if outer * inner == 0 {
        return Ok(out);
    }
    let chunks: Vec<usize> = inputs.iter().map(|i| i.len() / outer).collect();
    if chunks.iter().sum::<usize>() * outer != total {
        return Err(format!("concat inputs hold {} elements, output needs {total}",
            inputs.iter().map(Vec::len).sum::<usize>()));
    }
    for o in 0..outer {
        for (input, &chunk) in inputs.iter().zip(&chunks) {
            out.extend_from_slice(&input[o * chunk..(o + 1) * chunk]);
        }
    }
    Ok(out)
}
