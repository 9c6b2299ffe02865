//! Operation descriptors.
//!
//! These are plain, engine-independent descriptions of one operation, built
//! from [`MemoryDesc`]s and parameters. Constructors check that the shapes
//! agree with each other; turning a descriptor into something executable is
//! the job of [`Runtime::primitive_desc_create`](crate::Runtime::primitive_desc_create).

use crate::error::{DnnError, Result};
use crate::memory::{DataType, MemoryDesc};

/// Which pass an operation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropKind {
    /// Training forward pass; keeps whatever the backward pass needs.
    Forward,
    /// Inference-only forward pass.
    ForwardInference,
    /// Gradient with respect to the data input.
    BackwardData,
    /// Gradient with respect to the weights (and bias).
    BackwardWeights,
}

impl PropKind {
    /// Whether this is one of the forward kinds.
    pub const fn is_forward(self) -> bool {
        matches!(self, Self::Forward | Self::ForwardInference)
    }
}

/// Algorithm selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    /// Direct (non-Winograd, non-FFT) convolution.
    ConvolutionDirect,
    /// Rectified linear unit with a negative slope.
    EltwiseRelu,
    /// Max pooling.
    PoolingMax,
    /// Average pooling, padding excluded from the divisor.
    PoolingAvg,
}

/// How out-of-bounds input elements are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PaddingKind {
    /// Padded elements read as zero.
    #[default]
    Zero,
}

/// 2-D window geometry shared by convolution and pooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Window {
    /// Step between consecutive windows.
    pub strides: [usize; 2],
    /// Padding before the first element, per spatial dim.
    pub padding_l: [usize; 2],
    /// Padding after the last element, per spatial dim.
    pub padding_r: [usize; 2],
    /// Padding semantics.
    pub padding_kind: PaddingKind,
}

impl Window {
    /// Validates raw parameters.
    ///
    /// # Errors
    /// [`DnnError::InvalidShape`] unless every list has two entries, strides are
    /// positive and paddings are non-negative.
    pub fn new(
        strides: &[i64],
        padding_l: &[i64],
        padding_r: &[i64],
        padding_kind: PaddingKind,
    ) -> Result<Self> {
        fn pair(what: &str, v: &[i64], min: i64) -> Result<[usize; 2]> {
            match v {
                [a, b] if *a >= min && *b >= min => Ok([*a as usize, *b as usize]),
                _ => Err(DnnError::invalid_shape(format!("bad {what} {v:?}"))),
            }
        }
        Ok(Self {
            strides: pair("strides", strides, 1)?,
            padding_l: pair("left padding", padding_l, 0)?,
            padding_r: pair("right padding", padding_r, 0)?,
            padding_kind,
        })
    }

    /// Output extent along spatial dim `d` for an input extent and window size.
    fn output_extent(&self, d: usize, input: usize, window: usize) -> Option<usize> {
        let padded = input + self.padding_l[d] + self.padding_r[d];
        padded
            .checked_sub(window)
            .map(|span| span / self.strides[d] + 1)
    }

    fn check_spatial(&self, src: &[usize], dst: &[usize], window: [usize; 2]) -> Result<()> {
        for d in 0..2 {
            let expected = self.output_extent(d, src[2 + d], window[d]);
            if expected != Some(dst[2 + d]) {
                return Err(DnnError::shape_mismatch(format!(
                    "spatial dim {d}: input {} with window {} gives {expected:?}, descriptor says {}",
                    src[2 + d],
                    window[d],
                    dst[2 + d]
                )));
            }
        }
        Ok(())
    }
}

fn require_rank(md: &MemoryDesc, rank: usize, what: &str) -> Result<()> {
    if md.ndims() == rank {
        Ok(())
    } else {
        Err(DnnError::invalid_shape(format!(
            "{what} must have {rank} dims, got {}",
            md.ndims()
        )))
    }
}

fn require_eq(a: usize, b: usize, what: &str) -> Result<()> {
    if a == b {
        Ok(())
    } else {
        Err(DnnError::shape_mismatch(format!("{what}: {a} != {b}")))
    }
}

/// 2-D convolution.
///
/// Slots are named after the forward pass; for `BackwardData` `src` holds
/// `diff_src`, for `BackwardWeights` `weights`/`bias` hold their gradients, and
/// for both backward kinds `dst` holds `diff_dst`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvolutionDesc {
    /// Pass.
    pub prop_kind: PropKind,
    /// Algorithm; only [`Algorithm::ConvolutionDirect`] is realizable.
    pub algorithm: Algorithm,
    /// Source (or source gradient).
    pub src: MemoryDesc,
    /// Weights (or weights gradient), `(o, i, kh, kw)`.
    pub weights: MemoryDesc,
    /// Optional bias (or bias gradient), `(o)`.
    pub bias: Option<MemoryDesc>,
    /// Destination (or destination gradient).
    pub dst: MemoryDesc,
    /// Window geometry.
    pub window: Window,
}

impl ConvolutionDesc {
    #[allow(clippy::too_many_arguments)]
    fn build(
        prop_kind: PropKind,
        algorithm: Algorithm,
        src: &MemoryDesc,
        weights: &MemoryDesc,
        bias: Option<&MemoryDesc>,
        dst: &MemoryDesc,
        window: Window,
    ) -> Result<Self> {
        require_rank(src, 4, "convolution source")?;
        require_rank(weights, 4, "convolution weights")?;
        require_rank(dst, 4, "convolution destination")?;
        let (s, w, d) = (src.dims(), weights.dims(), dst.dims());
        require_eq(s[0], d[0], "minibatch")?;
        require_eq(s[1], w[1], "input channels")?;
        require_eq(d[1], w[0], "output channels")?;
        if let Some(bias) = bias {
            require_rank(bias, 1, "convolution bias")?;
            require_eq(bias.dims()[0], w[0], "bias length")?;
        }
        window.check_spatial(s, d, [w[2], w[3]])?;
        Ok(Self {
            prop_kind,
            algorithm,
            src: src.clone(),
            weights: weights.clone(),
            bias: bias.cloned(),
            dst: dst.clone(),
            window,
        })
    }

    /// Forward convolution (`Forward` or `ForwardInference`).
    ///
    /// # Errors
    /// [`DnnError::InvalidShape`] for wrong ranks, [`DnnError::ShapeMismatch`]
    /// when the extents do not agree with each other or with the window, and
    /// [`DnnError::UnsupportedConfiguration`] for a backward `prop_kind`.
    pub fn forward(
        prop_kind: PropKind,
        algorithm: Algorithm,
        src: &MemoryDesc,
        weights: &MemoryDesc,
        bias: Option<&MemoryDesc>,
        dst: &MemoryDesc,
        window: Window,
    ) -> Result<Self> {
        if !prop_kind.is_forward() {
            return Err(DnnError::unsupported(format!(
                "{prop_kind:?} is not a forward propagation kind"
            )));
        }
        Self::build(prop_kind, algorithm, src, weights, bias, dst, window)
    }

    /// Gradient of a convolution with respect to its source.
    ///
    /// # Errors
    /// Same shape rules as [`ConvolutionDesc::forward`].
    pub fn backward_data(
        algorithm: Algorithm,
        diff_src: &MemoryDesc,
        weights: &MemoryDesc,
        diff_dst: &MemoryDesc,
        window: Window,
    ) -> Result<Self> {
        Self::build(
            PropKind::BackwardData,
            algorithm,
            diff_src,
            weights,
            None,
            diff_dst,
            window,
        )
    }

    /// Gradient of a convolution with respect to its weights and bias.
    ///
    /// # Errors
    /// Same shape rules as [`ConvolutionDesc::forward`].
    pub fn backward_weights(
        algorithm: Algorithm,
        src: &MemoryDesc,
        diff_weights: &MemoryDesc,
        diff_bias: Option<&MemoryDesc>,
        diff_dst: &MemoryDesc,
        window: Window,
    ) -> Result<Self> {
        Self::build(
            PropKind::BackwardWeights,
            algorithm,
            src,
            diff_weights,
            diff_bias,
            diff_dst,
            window,
        )
    }
}

/// Element-wise activation.
#[derive(Debug, Clone, PartialEq)]
pub struct EltwiseDesc {
    /// `Forward`, `ForwardInference` or `BackwardData`.
    pub prop_kind: PropKind,
    /// Only [`Algorithm::EltwiseRelu`].
    pub algorithm: Algorithm,
    /// Forward input.
    pub data: MemoryDesc,
    /// Gradient layout, backward only.
    pub diff_data: Option<MemoryDesc>,
    /// Slope for negative inputs.
    pub alpha: f32,
}

impl EltwiseDesc {
    /// Forward activation.
    ///
    /// # Errors
    /// [`DnnError::UnsupportedConfiguration`] for a backward `prop_kind`.
    pub fn forward(
        prop_kind: PropKind,
        algorithm: Algorithm,
        data: &MemoryDesc,
        alpha: f32,
    ) -> Result<Self> {
        if !prop_kind.is_forward() {
            return Err(DnnError::unsupported("eltwise forward needs a forward kind"));
        }
        Ok(Self {
            prop_kind,
            algorithm,
            data: data.clone(),
            diff_data: None,
            alpha,
        })
    }

    /// Gradient of the activation with respect to its input.
    ///
    /// # Errors
    /// [`DnnError::ShapeMismatch`] when `diff_data` and `data` differ in extents.
    pub fn backward(
        algorithm: Algorithm,
        diff_data: &MemoryDesc,
        data: &MemoryDesc,
        alpha: f32,
    ) -> Result<Self> {
        if diff_data.dims() != data.dims() {
            return Err(DnnError::shape_mismatch(format!(
                "eltwise gradient {:?} vs data {:?}",
                diff_data.dims(),
                data.dims()
            )));
        }
        Ok(Self {
            prop_kind: PropKind::BackwardData,
            algorithm,
            data: data.clone(),
            diff_data: Some(diff_data.clone()),
            alpha,
        })
    }
}

/// 2-D pooling.
///
/// For `BackwardData` `src` holds `diff_src` and `dst` holds `diff_dst`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolingDesc {
    /// Pass.
    pub prop_kind: PropKind,
    /// [`Algorithm::PoolingMax`] or [`Algorithm::PoolingAvg`].
    pub algorithm: Algorithm,
    /// Source (or source gradient).
    pub src: MemoryDesc,
    /// Destination (or destination gradient).
    pub dst: MemoryDesc,
    /// Pooling window extents.
    pub kernel: [usize; 2],
    /// Window geometry.
    pub window: Window,
}

impl PoolingDesc {
    fn build(
        prop_kind: PropKind,
        algorithm: Algorithm,
        src: &MemoryDesc,
        dst: &MemoryDesc,
        kernel: &[i64],
        window: Window,
    ) -> Result<Self> {
        require_rank(src, 4, "pooling source")?;
        require_rank(dst, 4, "pooling destination")?;
        let kernel = match kernel {
            [h, w] if *h > 0 && *w > 0 => [*h as usize, *w as usize],
            _ => return Err(DnnError::invalid_shape(format!("bad pooling kernel {kernel:?}"))),
        };
        require_eq(src.dims()[0], dst.dims()[0], "minibatch")?;
        require_eq(src.dims()[1], dst.dims()[1], "channels")?;
        window.check_spatial(src.dims(), dst.dims(), kernel)?;
        Ok(Self {
            prop_kind,
            algorithm,
            src: src.clone(),
            dst: dst.clone(),
            kernel,
            window,
        })
    }

    /// Forward pooling.
    ///
    /// # Errors
    /// [`DnnError::ShapeMismatch`] when the extents disagree with the window.
    pub fn forward(
        prop_kind: PropKind,
        algorithm: Algorithm,
        src: &MemoryDesc,
        dst: &MemoryDesc,
        kernel: &[i64],
        window: Window,
    ) -> Result<Self> {
        if !prop_kind.is_forward() {
            return Err(DnnError::unsupported("pooling forward needs a forward kind"));
        }
        Self::build(prop_kind, algorithm, src, dst, kernel, window)
    }

    /// Gradient of pooling with respect to its source.
    ///
    /// # Errors
    /// Same as [`PoolingDesc::forward`].
    pub fn backward(
        algorithm: Algorithm,
        diff_src: &MemoryDesc,
        diff_dst: &MemoryDesc,
        kernel: &[i64],
        window: Window,
    ) -> Result<Self> {
        Self::build(PropKind::BackwardData, algorithm, diff_src, diff_dst, kernel, window)
    }

    /// Whether this pooling carries an argmax workspace.
    pub fn has_workspace(&self) -> bool {
        self.algorithm == Algorithm::PoolingMax && self.prop_kind != PropKind::ForwardInference
    }
}

/// Any operation that can be compiled with
/// [`Runtime::primitive_desc_create`](crate::Runtime::primitive_desc_create).
#[derive(Debug, Clone, PartialEq)]
pub enum OpDesc {
    /// Convolution.
    Convolution(ConvolutionDesc),
    /// Element-wise activation.
    Eltwise(EltwiseDesc),
    /// Pooling.
    Pooling(PoolingDesc),
}

impl OpDesc {
    /// Every memory descriptor the operation mentions.
    pub(crate) fn memory_descs(&self) -> Vec<&MemoryDesc> {
        match self {
            Self::Convolution(c) => {
                let mut v = vec![&c.src, &c.weights, &c.dst];
                v.extend(c.bias.as_ref());
                v
            }
            Self::Eltwise(e) => {
                let mut v = vec![&e.data];
                v.extend(e.diff_data.as_ref());
                v
            }
            Self::Pooling(p) => vec![&p.src, &p.dst],
        }
    }

    /// Whether every tensor is `F32`, the only type the compute kernels handle.
    pub(crate) fn is_f32(&self) -> bool {
        self.memory_descs()
            .iter()
            .all(|md| md.data_type() == DataType::F32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Format;

    fn md(dims: &[i64]) -> MemoryDesc {
        MemoryDesc::new(dims, DataType::F32, Format::Any).unwrap()
    }

    fn window(stride: i64, pad: i64) -> Window {
        Window::new(&[stride, stride], &[pad, pad], &[pad, pad], PaddingKind::Zero).unwrap()
    }

    #[test]
    fn alexnet_conv1_geometry_is_accepted() {
        let conv = ConvolutionDesc::forward(
            PropKind::Forward,
            Algorithm::ConvolutionDirect,
            &md(&[32, 3, 227, 227]),
            &md(&[96, 3, 11, 11]),
            Some(&MemoryDesc::new(&[96], DataType::F32, Format::X).unwrap()),
            &md(&[32, 96, 55, 55]),
            window(4, 0),
        );
        assert!(conv.is_ok());
    }

    #[test]
    fn wrong_output_extent_is_a_shape_mismatch() {
        let conv = ConvolutionDesc::forward(
            PropKind::Forward,
            Algorithm::ConvolutionDirect,
            &md(&[1, 3, 8, 8]),
            &md(&[4, 3, 3, 3]),
            None,
            &md(&[1, 4, 7, 6]),
            window(1, 0),
        );
        assert!(matches!(conv, Err(DnnError::ShapeMismatch(_))));
    }

    #[test]
    fn zero_stride_is_an_invalid_shape() {
        assert!(matches!(
            Window::new(&[0, 1], &[0, 0], &[0, 0], PaddingKind::Zero),
            Err(DnnError::InvalidShape(_))
        ));
    }

    #[test]
    fn pooling_workspace_only_for_max_training() {
        let src = md(&[1, 2, 4, 4]);
        let dst = md(&[1, 2, 2, 2]);
        let max = PoolingDesc::forward(
            PropKind::Forward,
            Algorithm::PoolingMax,
            &src,
            &dst,
            &[2, 2],
            window(2, 0),
        )
        .unwrap();
        assert!(max.has_workspace());
        let avg = PoolingDesc { algorithm: Algorithm::PoolingAvg, ..max };
        assert!(!avg.has_workspace());
    }
}
