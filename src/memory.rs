//! Memory descriptors.
//!
//! A [`MemoryDesc`] describes an N-dimensional tensor: its logical extents, its
//! element [`DataType`] and a physical [`Format`] (the order in which elements
//! are laid out in memory). The special format [`Format::Any`] lets a compiled
//! primitive pick the layout it prefers; the choice is discovered afterwards
//! through the query interface.
//!
//! Logical dimensions are always given in canonical order: `(n, c, h, w)` for
//! activations, `(o, i, h, w)` for weights, `(n, c)` / `(o, i)` for 2-D data.
//! The format only decides where each logical element lands.
//!
//! ## Blocked formats
//!
//! `nChw8c`, `nChw16c`, `OIhw8i8o`, `OIhw16i16o` and `Ohwi8o` split a channel
//! dimension into blocks. The blocked dimension is padded up to a whole number
//! of blocks, so their byte size can exceed the plain one.

use briny::prelude::*;
use core::fmt;

use crate::error::{DnnError, Result};

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    /// 32-bit float.
    F32,
    /// 32-bit signed integer.
    S32,
    /// 16-bit signed integer.
    S16,
    /// 8-bit signed integer.
    S8,
    /// 8-bit unsigned integer.
    U8,
}

impl DataType {
    /// Size of one element in bytes.
    pub const fn size(self) -> usize {
        match self {
            Self::F32 | Self::S32 => 4,
            Self::S16 => 2,
            Self::S8 | Self::U8 => 1,
        }
    }
}

/// Physical layout tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    /// Let the primitive choose.
    Any,
    /// 1-D.
    X,
    /// 2-D activations, row-major.
    Nc,
    /// 2-D weights, row-major.
    Oi,
    /// 2-D weights, transposed.
    Io,
    /// 4-D activations, plain.
    Nchw,
    /// 4-D activations, channels last.
    Nhwc,
    /// 4-D activations, batch last.
    Chwn,
    /// 4-D activations, channels blocked by 8.
    NChw8c,
    /// 4-D activations, channels blocked by 16.
    NChw16c,
    /// 4-D weights, plain.
    Oihw,
    /// 4-D weights, output channels last.
    Ihwo,
    /// 4-D weights, spatial first.
    Hwio,
    /// 4-D weights, both channel dims blocked by 8.
    OIhw8i8o,
    /// 4-D weights, both channel dims blocked by 16.
    OIhw16i16o,
    /// 4-D weights, output channels blocked by 8, input channels innermost.
    Ohwi8o,
}

impl Format {
    /// Number of dimensions the format describes, `None` for [`Format::Any`].
    pub const fn ndims(self) -> Option<usize> {
        match self {
            Self::Any => None,
            Self::X => Some(1),
            Self::Nc | Self::Oi | Self::Io => Some(2),
            _ => Some(4),
        }
    }

    /// Whether some dimension is split into blocks.
    pub const fn is_blocked(self) -> bool {
        matches!(
            self,
            Self::NChw8c | Self::NChw16c | Self::OIhw8i8o | Self::OIhw16i16o | Self::Ohwi8o
        )
    }

    /// Block size per logical dimension (1 = not blocked).
    const fn blocks(self) -> [usize; 4] {
        match self {
            Self::NChw8c => [1, 8, 1, 1],
            Self::NChw16c => [1, 16, 1, 1],
            Self::OIhw8i8o => [8, 8, 1, 1],
            Self::OIhw16i16o => [16, 16, 1, 1],
            Self::Ohwi8o => [8, 1, 1, 1],
            _ => [1, 1, 1, 1],
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Any => "any",
            Self::X => "x",
            Self::Nc => "nc",
            Self::Oi => "oi",
            Self::Io => "io",
            Self::Nchw => "nchw",
            Self::Nhwc => "nhwc",
            Self::Chwn => "chwn",
            Self::NChw8c => "nChw8c",
            Self::NChw16c => "nChw16c",
            Self::Oihw => "oihw",
            Self::Ihwo => "ihwo",
            Self::Hwio => "hwio",
            Self::OIhw8i8o => "OIhw8i8o",
            Self::OIhw16i16o => "OIhw16i16o",
            Self::Ohwi8o => "Ohwi8o",
        };
        f.write_str(name)
    }
}

/// Untrusted dimensions as handed over by a caller.
struct RawShape {
    dims: Vec<i64>,
    format: Format,
}

impl Validate for RawShape {
    fn validate(&self) -> core::result::Result<(), ValidationError> {
        if self.dims.is_empty() || self.dims.iter().any(|&d| d < 0) {
            return Err(ValidationError);
        }
        if self.format.ndims().is_some_and(|n| n != self.dims.len()) {
            return Err(ValidationError);
        }
        if self.format == Format::Any && self.dims.len() > 4 {
            return Err(ValidationError);
        }
        Ok(())
    }
}

/// Shape, element type and layout of a tensor. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemoryDesc {
    dims: Vec<usize>,
    data_type: DataType,
    format: Format,
}

/// What two descriptors must share to be interchangeable byte for byte.
#[derive(Debug, PartialEq, Eq)]
enum Signature {
    Plain(Vec<usize>),
    Blocked(Format),
}

impl MemoryDesc {
    /// Builds a descriptor from caller-supplied extents.
    ///
    /// Extents are signed so that negative values coming from a host language
    /// can be rejected rather than wrapped. Zero extents are allowed.
    ///
    /// # Errors
    /// [`DnnError::InvalidShape`] for an empty dimension list, a negative
    /// extent, more than four dimensions, or a rank the format cannot express.
    pub fn new(dims: &[i64], data_type: DataType, format: Format) -> Result<Self> {
        let trusted = TrustedData::new(RawShape {
            dims: dims.to_vec(),
            format,
        })
        .map_err(|_| {
            DnnError::invalid_shape(format!("{dims:?} is not a valid {format} shape"))
        })?;
        let raw = trusted.into_inner();
        let desc = Self {
            dims: raw.dims.iter().map(|&d| d as usize).collect(),
            data_type,
            format: raw.format,
        };
        if desc.checked_byte_size().is_none() {
            return Err(DnnError::invalid_shape(format!(
                "{dims:?} {data_type:?} does not fit in addressable memory"
            )));
        }
        Ok(desc)
    }

    /// Padded byte size, `None` when it exceeds `isize::MAX`.
    fn checked_byte_size(&self) -> Option<usize> {
        if self.dims.contains(&0) {
            return Some(0);
        }
        let blocks = self.format.blocks();
        self.dims
            .iter()
            .zip(blocks)
            .try_fold(self.data_type.size(), |acc, (&extent, block)| {
                acc.checked_mul(extent.div_ceil(block).checked_mul(block)?)
            })
            .filter(|&bytes| isize::try_from(bytes).is_ok())
    }

    /// Same as [`MemoryDesc::new`] for extents already known to be non-negative.
    ///
    /// # Errors
    /// See [`MemoryDesc::new`].
    pub fn from_dims(dims: &[usize], data_type: DataType, format: Format) -> Result<Self> {
        let signed: Vec<i64> = dims
            .iter()
            .map(|&d| i64::try_from(d).unwrap_or(-1))
            .collect();
        Self::new(&signed, data_type, format)
    }

    /// A copy of this descriptor with another layout.
    ///
    /// # Errors
    /// [`DnnError::InvalidShape`] when the rank does not fit `format`.
    pub fn with_format(&self, format: Format) -> Result<Self> {
        Self::from_dims(&self.dims, self.data_type, format)
    }

    /// Logical extents.
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Number of dimensions.
    pub fn ndims(&self) -> usize {
        self.dims.len()
    }

    /// Element type.
    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    /// Layout tag.
    pub fn format(&self) -> Format {
        self.format
    }

    /// Whether the layout is still undecided.
    pub fn is_any(&self) -> bool {
        self.format == Format::Any
    }

    /// Extents rounded up to whole blocks.
    pub fn padded_dims(&self) -> Vec<usize> {
        let blocks = self.format.blocks();
        self.dims
            .iter()
            .enumerate()
            .map(|(d, &extent)| extent.div_ceil(blocks[d]) * blocks[d])
            .collect()
    }

    /// Number of logical elements.
    pub fn element_count(&self) -> usize {
        if self.dims.contains(&0) {
            return 0;
        }
        self.dims.iter().product()
    }

    /// Number of bytes a buffer in this layout occupies, padding included.
    ///
    /// Bounded by `isize::MAX`, checked when the descriptor is built.
    pub fn byte_size(&self) -> usize {
        self.checked_byte_size().unwrap_or(usize::MAX)
    }

    /// Physical element offset of a logical index.
    ///
    /// `Any` is treated as row-major; it never reaches a kernel.
    pub fn offset(&self, idx: &[usize]) -> usize {
        debug_assert_eq!(idx.len(), self.dims.len(), "index rank mismatch");
        let p = self.padded_dims();
        match self.format {
            Format::Any | Format::X | Format::Nc | Format::Oi | Format::Nchw | Format::Oihw => {
                idx.iter().zip(&p).fold(0, |acc, (&i, &d)| acc * d + i)
            }
            Format::Io => idx[1] * p[0] + idx[0],
            Format::Nhwc => ((idx[0] * p[2] + idx[2]) * p[3] + idx[3]) * p[1] + idx[1],
            Format::Chwn | Format::Ihwo => {
                ((idx[1] * p[2] + idx[2]) * p[3] + idx[3]) * p[0] + idx[0]
            }
            Format::Hwio => ((idx[2] * p[3] + idx[3]) * p[1] + idx[1]) * p[0] + idx[0],
            Format::NChw8c | Format::NChw16c => {
                let b = self.format.blocks()[1];
                (((idx[0] * (p[1] / b) + idx[1] / b) * p[2] + idx[2]) * p[3] + idx[3]) * b
                    + idx[1] % b
            }
            Format::OIhw8i8o | Format::OIhw16i16o => {
                let b = self.format.blocks()[0];
                let outer = ((idx[0] / b) * (p[1] / b) + idx[1] / b) * p[2] + idx[2];
                (outer * p[3] + idx[3]) * b * b + (idx[1] % b) * b + idx[0] % b
            }
            Format::Ohwi8o => {
                let outer = ((idx[0] / 8) * p[2] + idx[2]) * p[3] + idx[3];
                (outer * p[1] + idx[1]) * 8 + idx[0] % 8
            }
        }
    }

    fn signature(&self) -> Signature {
        if self.format.is_blocked() {
            return Signature::Blocked(self.format);
        }
        let mut unit = vec![0; self.dims.len()];
        let strides = (0..self.dims.len())
            .map(|d| {
                if self.dims[d] <= 1 {
                    return 0;
                }
                unit[d] = 1;
                let stride = self.offset(&unit);
                unit[d] = 0;
                stride
            })
            .collect();
        Signature::Plain(strides)
    }

    /// Whether two descriptors describe the same bytes in the same order.
    ///
    /// Dimensions and element type must match exactly and so must the physical
    /// ordering. Different tags that produce identical orderings (e.g. `nchw`
    /// and `nhwc` with a single channel) compare equal. Neither side may be
    /// `Any`.
    pub fn physically_equal(&self, other: &Self) -> bool {
        if self.is_any() || other.is_any() {
            return false;
        }
        self.dims == other.dims
            && self.data_type == other.data_type
            && self.signature() == other.signature()
    }
}

impl fmt::Display for MemoryDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:{:?}:{}", self.dims, self.data_type, self.format)
    }
}

/// Calls `f` with every logical index of `dims` in row-major order.
pub(crate) fn for_each_index(dims: &[usize], mut f: impl FnMut(&[usize])) {
    if dims.iter().any(|&d| d == 0) {
        return;
    }
    let mut idx = vec![0usize; dims.len()];
    loop {
        f(&idx);
        let mut d = dims.len();
        loop {
            if d == 0 {
                return;
            }
            d -= 1;
            idx[d] += 1;
            if idx[d] < dims[d] {
                break;
            }
            idx[d] = 0;
        }
    }
}
