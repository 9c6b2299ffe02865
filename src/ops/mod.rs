//! # Compute Backends
//!
//! Kernels that execute compiled primitives, one submodule per backend:
//!
//! - [`cpu`]: Multi-threaded `rayon` kernels (always available, the fallback)
//! - [`wgpu`] *(opt-in)*: Convolution forward as a WGSL compute shader
//! - [`dispatch`]: Picks a backend from the engine kind
//! - [`layout`]: Moves tensors between bound buffers and plain `f32` data
//!
//! ## Data Flow
//!
//! Kernels never see physical layouts. The stream gathers every input into a
//! plain row-major `f32` tensor (converting element types), the kernel maps
//! plain inputs to plain outputs, and the stream scatters each result into its
//! destination layout. A reorder is therefore the identity kernel, except
//! between equal element types, where the stream copies elements unconverted.
//!
//! ## Feature Flags
//!
//! - `wgpu`: Enables the `wgpu` (WebGPU) backend

pub mod cpu;
pub mod dispatch;
pub mod layout;
#[cfg(feature = "wgpu")]
pub mod wgpu;

use crate::desc::{ConvolutionDesc, PoolingDesc, PropKind};
use crate::primitive_desc::{Operation, PrimitiveDesc};

/// What a backend has to compute for one primitive.
#[derive(Debug, Clone, Copy)]
pub enum Kernel<'a> {
    /// Copy through; layout and type conversion happen around the kernel.
    Reorder,
    /// Concatenation of inputs of the given extents along `axis`.
    Concat {
        /// Axis.
        axis: usize,
        /// Extents of the output.
        dims: &'a [usize],
    },
    /// `dst = conv(src, weights) + bias`.
    ConvForward(&'a ConvolutionDesc),
    /// `diff_src` from `diff_dst` and `weights`.
    ConvBackwardData(&'a ConvolutionDesc),
    /// `diff_weights` (and `diff_bias`) from `src` and `diff_dst`.
    ConvBackwardWeights(&'a ConvolutionDesc),
    /// Leaky ReLU.
    ReluForward {
        /// Negative slope.
        alpha: f32,
    },
    /// Leaky ReLU gradient from `src` and `diff_dst`.
    ReluBackward {
        /// Negative slope.
        alpha: f32,
    },
    /// Pooling forward, with argmax output when the descriptor keeps a workspace.
    PoolForward(&'a PoolingDesc),
    /// Pooling gradient.
    PoolBackward(&'a PoolingDesc),
    /// Memory primitives have nothing to compute.
    Nop,
}

impl<'a> Kernel<'a> {
    /// The kernel that realizes `desc`.
    pub(crate) fn of(desc: &'a PrimitiveDesc) -> Self {
        match &desc.op {
            Operation::Memory(_) => Self::Nop,
            Operation::Reorder => Self::Reorder,
            Operation::Concat { axis } => Self::Concat {
                axis: *axis,
                dims: desc.slots.dst.first().map_or(&[][..], |md| md.dims()),
            },
            Operation::Convolution(c) => match c.prop_kind {
                PropKind::BackwardData => Self::ConvBackwardData(c),
                PropKind::BackwardWeights => Self::ConvBackwardWeights(c),
                _ => Self::ConvForward(c),
            },
            Operation::Eltwise(e) if e.prop_kind.is_forward() => Self::ReluForward { alpha: e.alpha },
            Operation::Eltwise(e) => Self::ReluBackward { alpha: e.alpha },
            Operation::Pooling(p) if p.prop_kind.is_forward() => Self::PoolForward(p),
            Operation::Pooling(p) => Self::PoolBackward(p),
        }
    }
}
