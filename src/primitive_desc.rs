//! Primitive descriptors: compiled plans bound to an engine.
//!
//! Compilation turns an [`OpDesc`] into a [`PrimitiveDesc`] by resolving every
//! [`Format::Any`] slot to the layout the backend prefers. The resolved
//! layouts are only visible through the query interface
//! ([`Runtime::primitive_desc_query_pd`]); callers must query before they
//! allocate or reconcile buffers.
//!
//! Backward primitives take the matching forward descriptor as a *hint* and
//! adopt its layouts, so gradients line up with what the forward pass chose.

use crate::desc::{Algorithm, ConvolutionDesc, EltwiseDesc, OpDesc, PoolingDesc, PropKind};
use crate::engine::Engine;
use crate::error::{DnnError, Result};
use crate::memory::{DataType, Format, MemoryDesc};
use crate::registry::Handle;
use crate::runtime::Runtime;

/// Argument slot of a compiled primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    /// Source.
    Src,
    /// Weights; index 1 is the bias.
    Weights,
    /// Destination.
    Dst,
    /// Gradient of the destination.
    DiffDst,
    /// Gradient of the source.
    DiffSrc,
    /// Gradient of the weights; index 1 is the bias gradient.
    DiffWeights,
    /// Scratch state shared between a forward and its backward primitive.
    Workspace,
}

/// Coarse kind of a compiled primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveKind {
    /// Memory container.
    Memory,
    /// Layout conversion.
    Reorder,
    /// Concatenation.
    Concat,
    /// Convolution.
    Convolution,
    /// Element-wise activation.
    Eltwise,
    /// Pooling.
    Pooling,
}

/// Operation a descriptor was compiled from, with every layout resolved.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Operation {
    Memory(MemoryDesc),
    Reorder,
    Concat { axis: usize },
    Convolution(ConvolutionDesc),
    Eltwise(EltwiseDesc),
    Pooling(PoolingDesc),
}

/// Resolved memory descriptors per slot.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Slots {
    pub(crate) src: Vec<MemoryDesc>,
    pub(crate) weights: Vec<MemoryDesc>,
    pub(crate) dst: Vec<MemoryDesc>,
    pub(crate) diff_dst: Vec<MemoryDesc>,
    pub(crate) diff_src: Vec<MemoryDesc>,
    pub(crate) diff_weights: Vec<MemoryDesc>,
    pub(crate) workspace: Vec<MemoryDesc>,
}

impl Slots {
    pub(crate) fn get(&self, kind: QueryKind) -> &[MemoryDesc] {
        match kind {
            QueryKind::Src => &self.src,
            QueryKind::Weights => &self.weights,
            QueryKind::Dst => &self.dst,
            QueryKind::DiffDst => &self.diff_dst,
            QueryKind::DiffSrc => &self.diff_src,
            QueryKind::DiffWeights => &self.diff_weights,
            QueryKind::Workspace => &self.workspace,
        }
    }
}

/// A compiled operation plan. Owns no buffers.
#[derive(Debug, Clone, PartialEq)]
pub struct PrimitiveDesc {
    pub(crate) engine: Handle<Engine>,
    pub(crate) op: Operation,
    pub(crate) slots: Slots,
}

impl PrimitiveDesc {
    /// A memory descriptor; its only slot is itself, as `Dst` 0.
    pub(crate) fn memory(engine: Handle<Engine>, md: MemoryDesc) -> Self {
        Self {
            engine,
            slots: Slots {
                dst: vec![md.clone()],
                ..Slots::default()
            },
            op: Operation::Memory(md),
        }
    }

    /// Coarse kind.
    pub fn kind(&self) -> PrimitiveKind {
        match self.op {
            Operation::Memory(_) => PrimitiveKind::Memory,
            Operation::Reorder => PrimitiveKind::Reorder,
            Operation::Concat { .. } => PrimitiveKind::Concat,
            Operation::Convolution(_) => PrimitiveKind::Convolution,
            Operation::Eltwise(_) => PrimitiveKind::Eltwise,
            Operation::Pooling(_) => PrimitiveKind::Pooling,
        }
    }

    /// Engine this plan was compiled for.
    pub fn engine(&self) -> Handle<Engine> {
        self.engine
    }

    /// The described memory, for memory descriptors only.
    pub fn memory_desc(&self) -> Option<&MemoryDesc> {
        match &self.op {
            Operation::Memory(md) => Some(md),
            _ => None,
        }
    }

    /// Resolved descriptor of a slot, `None` when absent.
    pub fn query(&self, kind: QueryKind, index: usize) -> Option<&MemoryDesc> {
        self.slots.get(kind).get(index)
    }

    /// Layouts the input bindings must have, in binding order.
    pub(crate) fn input_descs(&self) -> Vec<&MemoryDesc> {
        let s = &self.slots;
        match &self.op {
            Operation::Memory(_) => Vec::new(),
            Operation::Reorder | Operation::Eltwise(_) if self.is_forward() => {
                s.src.iter().collect()
            }
            Operation::Eltwise(_) => vec![&s.src[0], &s.diff_dst[0]],
            Operation::Reorder | Operation::Concat { .. } => s.src.iter().collect(),
            Operation::Convolution(c) => match c.prop_kind {
                PropKind::BackwardData => vec![&s.diff_dst[0], &s.weights[0]],
                PropKind::BackwardWeights => vec![&s.src[0], &s.diff_dst[0]],
                _ => s.src.iter().chain(&s.weights).collect(),
            },
            Operation::Pooling(p) if p.prop_kind.is_forward() => vec![&s.src[0]],
            Operation::Pooling(_) => s.diff_dst.iter().chain(&s.workspace).collect(),
        }
    }

    /// Layouts the output bindings must have, in binding order.
    pub(crate) fn output_descs(&self) -> Vec<&MemoryDesc> {
        let s = &self.slots;
        match &self.op {
            Operation::Memory(_) => Vec::new(),
            Operation::Eltwise(_) if !self.is_forward() => vec![&s.diff_src[0]],
            Operation::Reorder | Operation::Concat { .. } | Operation::Eltwise(_) => {
                vec![&s.dst[0]]
            }
            Operation::Convolution(c) => match c.prop_kind {
                PropKind::BackwardData => vec![&s.diff_src[0]],
                PropKind::BackwardWeights => s.diff_weights.iter().collect(),
                _ => vec![&s.dst[0]],
            },
            Operation::Pooling(p) if p.prop_kind.is_forward() => {
                s.dst.iter().chain(&s.workspace).collect()
            }
            Operation::Pooling(_) => vec![&s.diff_src[0]],
        }
    }

    fn is_forward(&self) -> bool {
        match &self.op {
            Operation::Eltwise(e) => e.prop_kind.is_forward(),
            Operation::Convolution(c) => c.prop_kind.is_forward(),
            Operation::Pooling(p) => p.prop_kind.is_forward(),
            _ => true,
        }
    }
}

/// Layout the CPU kernels prefer for activations.
fn preferred_activation(md: &MemoryDesc) -> Format {
    match md.ndims() {
        1 => Format::X,
        2 => Format::Nc,
        _ if md.dims()[1] > 0 && md.dims()[1] % 8 == 0 => Format::NChw8c,
        _ => Format::Nchw,
    }
}

/// Layout the CPU kernels prefer for weights.
fn preferred_weights(md: &MemoryDesc) -> Format {
    let d = md.dims();
    match md.ndims() {
        1 => Format::X,
        2 => Format::Oi,
        _ if d[0] > 0 && d[1] > 0 && d[0] % 8 == 0 && d[1] % 8 == 0 => Format::OIhw8i8o,
        _ => Format::Oihw,
    }
}

/// Resolves `md` if it is `Any`: first from the hint, then from the backend preference.
fn resolve(md: &MemoryDesc, hint: Option<&MemoryDesc>, preferred: fn(&MemoryDesc) -> Format) -> Result<MemoryDesc> {
    if !md.is_any() {
        return Ok(md.clone());
    }
    let format = match hint {
        Some(h) if h.dims() == md.dims() => h.format(),
        _ => preferred(md),
    };
    log::debug!("resolved {md} to {format}");
    md.with_format(format)
}

fn hint_slot(hint: Option<&PrimitiveDesc>, kind: QueryKind) -> Option<&MemoryDesc> {
    hint.and_then(|h| h.query(kind, 0))
}

fn compile_convolution(conv: &ConvolutionDesc, hint: Option<&PrimitiveDesc>) -> Result<(Operation, Slots)> {
    if conv.algorithm != Algorithm::ConvolutionDirect {
        return Err(DnnError::unsupported(format!("{:?} is not a convolution algorithm", conv.algorithm)));
    }
    if !conv.prop_kind.is_forward() {
        let forward = hint.filter(|h| {
            matches!(&h.op, Operation::Convolution(f) if f.prop_kind == PropKind::Forward)
        });
        if forward.is_none() {
            return Err(DnnError::unsupported(
                "backward convolution needs the forward training descriptor as hint",
            ));
        }
    }
    let src = resolve(&conv.src, hint_slot(hint, QueryKind::Src), preferred_activation)?;
    let weights = resolve(&conv.weights, hint_slot(hint, QueryKind::Weights), preferred_weights)?;
    let bias = conv
        .bias
        .as_ref()
        .map(|b| resolve(b, None, preferred_activation))
        .transpose()?;
    let dst = resolve(&conv.dst, hint_slot(hint, QueryKind::Dst), preferred_activation)?;

    let mut slots = Slots::default();
    match conv.prop_kind {
        PropKind::Forward | PropKind::ForwardInference => {
            slots.src = vec![src.clone()];
            slots.weights = std::iter::once(weights.clone()).chain(bias.clone()).collect();
            slots.dst = vec![dst.clone()];
        }
        PropKind::BackwardData => {
            slots.diff_src = vec![src.clone()];
            slots.weights = vec![weights.clone()];
            slots.diff_dst = vec![dst.clone()];
        }
        PropKind::BackwardWeights => {
            slots.src = vec![src.clone()];
            slots.diff_weights = std::iter::once(weights.clone()).chain(bias.clone()).collect();
            slots.diff_dst = vec![dst.clone()];
        }
    }
    let resolved = ConvolutionDesc {
        src,
        weights,
        bias,
        dst,
        ..conv.clone()
    };
    Ok((Operation::Convolution(resolved), slots))
}

fn compile_eltwise(eltwise: &EltwiseDesc, hint: Option<&PrimitiveDesc>) -> Result<(Operation, Slots)> {
    if eltwise.algorithm != Algorithm::EltwiseRelu {
        return Err(DnnError::unsupported(format!("{:?} is not an eltwise algorithm", eltwise.algorithm)));
    }
    let data = resolve(&eltwise.data, hint_slot(hint, QueryKind::Src), preferred_activation)?;
    let mut slots = Slots {
        src: vec![data.clone()],
        ..Slots::default()
    };
    let diff_data = match &eltwise.diff_data {
        Some(diff) => {
            // gradients follow the data layout unless told otherwise
            let diff = resolve(diff, Some(&data), preferred_activation)?;
            slots.diff_dst = vec![diff.clone()];
            slots.diff_src = vec![diff.clone()];
            Some(diff)
        }
        None => {
            slots.dst = vec![data.clone()];
            None
        }
    };
    let resolved = EltwiseDesc {
        data,
        diff_data,
        ..eltwise.clone()
    };
    Ok((Operation::Eltwise(resolved), slots))
}

fn compile_pooling(pool: &PoolingDesc, hint: Option<&PrimitiveDesc>) -> Result<(Operation, Slots)> {
    if !matches!(pool.algorithm, Algorithm::PoolingMax | Algorithm::PoolingAvg) {
        return Err(DnnError::unsupported(format!("{:?} is not a pooling algorithm", pool.algorithm)));
    }
    let forward_hint = hint.filter(|h| {
        matches!(&h.op, Operation::Pooling(f) if f.prop_kind.is_forward() && f.algorithm == pool.algorithm)
    });
    if !pool.prop_kind.is_forward() && pool.algorithm == Algorithm::PoolingMax && forward_hint.is_none() {
        return Err(DnnError::unsupported(
            "max pooling backward needs the forward descriptor as hint for its workspace",
        ));
    }
    let src = resolve(&pool.src, hint_slot(forward_hint, QueryKind::Src), preferred_activation)?;
    let dst = resolve(&pool.dst, hint_slot(forward_hint, QueryKind::Dst), preferred_activation)?;
    let mut slots = Slots::default();
    if pool.prop_kind.is_forward() {
        slots.src = vec![src.clone()];
        slots.dst = vec![dst.clone()];
        if pool.has_workspace() {
            let ws = MemoryDesc::from_dims(dst.dims(), DataType::S32, dst.format())?;
            slots.workspace = vec![ws];
        }
    } else {
        slots.diff_src = vec![src.clone()];
        slots.diff_dst = vec![dst.clone()];
        if pool.algorithm == Algorithm::PoolingMax {
            slots.workspace = forward_hint
                .map(|h| h.slots.workspace.clone())
                .unwrap_or_default();
        }
    }
    let resolved = PoolingDesc {
        src,
        dst,
        ..pool.clone()
    };
    Ok((Operation::Pooling(resolved), slots))
}

impl Runtime {
    pub(crate) fn register_primitive_desc(&mut self, pd: PrimitiveDesc) -> Handle<PrimitiveDesc> {
        let kind = pd.kind();
        let handle = self.primitive_descs.insert(pd);
        log::debug!("created {kind:?} primitive descriptor {handle:?}");
        self.journal(handle.into());
        handle
    }

    /// Compiles `op` for `engine`.
    ///
    /// `hint` is the forward descriptor a backward primitive must agree with.
    ///
    /// # Errors
    /// [`DnnError::UnsupportedConfiguration`] when the backend cannot realize
    /// the operation (non-`F32` data, wrong algorithm, missing hint), and
    /// [`DnnError::UseAfterFree`] for a destroyed engine or hint.
    pub fn primitive_desc_create(
        &mut self,
        op: &OpDesc,
        engine: Handle<Engine>,
        hint: Option<Handle<PrimitiveDesc>>,
    ) -> Result<Handle<PrimitiveDesc>> {
        self.engines.get(engine)?;
        let hint = hint.map(|h| self.primitive_descs.get(h)).transpose()?;
        if hint.is_some_and(|h| h.engine != engine) {
            return Err(DnnError::unsupported("hint was compiled for another engine"));
        }
        if !op.is_f32() {
            return Err(DnnError::unsupported("compute primitives only support f32 data"));
        }
        let (op, slots) = match op {
            OpDesc::Convolution(c) => compile_convolution(c, hint)?,
            OpDesc::Eltwise(e) => compile_eltwise(e, hint)?,
            OpDesc::Pooling(p) => compile_pooling(p, hint)?,
        };
        Ok(self.register_primitive_desc(PrimitiveDesc { engine, op, slots }))
    }

    /// Describes a memory container of layout `md` on `engine`.
    ///
    /// # Errors
    /// [`DnnError::UnsupportedConfiguration`] when `md` is still `Any`.
    pub fn memory_primitive_desc_create(
        &mut self,
        md: &MemoryDesc,
        engine: Handle<Engine>,
    ) -> Result<Handle<PrimitiveDesc>> {
        self.engines.get(engine)?;
        if md.is_any() {
            return Err(DnnError::unsupported("memory needs a concrete format, not `any`"));
        }
        Ok(self.register_primitive_desc(PrimitiveDesc::memory(engine, md.clone())))
    }

    fn memory_of(&self, pd: Handle<PrimitiveDesc>) -> Result<(Handle<Engine>, MemoryDesc)> {
        let pd = self.primitive_descs.get(pd)?;
        let md = pd
            .memory_desc()
            .ok_or_else(|| DnnError::unsupported(format!("{:?} descriptor is not a memory descriptor", pd.kind())))?;
        Ok((pd.engine, md.clone()))
    }

    /// Compiles a conversion from the layout of `input` to that of `output`.
    ///
    /// Element types may differ; integer destinations saturate.
    ///
    /// # Errors
    /// [`DnnError::ShapeMismatch`] when the logical extents differ.
    pub fn reorder_primitive_desc_create(
        &mut self,
        input: Handle<PrimitiveDesc>,
        output: Handle<PrimitiveDesc>,
    ) -> Result<Handle<PrimitiveDesc>> {
        let (in_engine, src) = self.memory_of(input)?;
        let (engine, dst) = self.memory_of(output)?;
        self.engines.get(in_engine)?;
        self.engines.get(engine)?;
        if in_engine != engine {
            return Err(DnnError::unsupported("reorder between memories of different engines"));
        }
        if src.dims() != dst.dims() {
            return Err(DnnError::shape_mismatch(format!(
                "cannot reorder {:?} into {:?}",
                src.dims(),
                dst.dims()
            )));
        }
        Ok(self.register_primitive_desc(PrimitiveDesc {
            engine,
            op: Operation::Reorder,
            slots: Slots {
                src: vec![src],
                dst: vec![dst],
                ..Slots::default()
            },
        }))
    }

    /// Compiles a concatenation of `inputs` along `axis` into `output`.
    ///
    /// `output` may use `Any`, in which case it takes the first input's format.
    ///
    /// # Errors
    /// [`DnnError::ShapeMismatch`] when inputs disagree outside `axis` or the
    /// output extent along `axis` is not the sum of the inputs'.
    pub fn concat_primitive_desc_create(
        &mut self,
        output: &MemoryDesc,
        inputs: &[Handle<PrimitiveDesc>],
        axis: usize,
    ) -> Result<Handle<PrimitiveDesc>> {
        let mut srcs = Vec::with_capacity(inputs.len());
        let mut engine = None;
        for &input in inputs {
            let (e, md) = self.memory_of(input)?;
            self.engines.get(e)?;
            if *engine.get_or_insert(e) != e {
                return Err(DnnError::unsupported("concat inputs live on different engines"));
            }
            srcs.push(md);
        }
        let (Some(engine), Some(first)) = (engine, srcs.first()) else {
            return Err(DnnError::ArityMismatch {
                what: "concat inputs",
                expected: 1,
                got: 0,
            });
        };
        let ndims = output.ndims();
        if axis >= ndims {
            return Err(DnnError::invalid_shape(format!("concat axis {axis} out of {ndims} dims")));
        }
        let mut along = 0;
        for md in &srcs {
            if md.data_type() != output.data_type() {
                return Err(DnnError::unsupported("concat inputs must share the output data type"));
            }
            if md.ndims() != ndims
                || (0..ndims).any(|d| d != axis && md.dims()[d] != output.dims()[d])
            {
                return Err(DnnError::shape_mismatch(format!(
                    "concat input {:?} does not fit output {:?} outside axis {axis}",
                    md.dims(),
                    output.dims()
                )));
            }
            along += md.dims()[axis];
        }
        if along != output.dims()[axis] {
            return Err(DnnError::shape_mismatch(format!(
                "concat inputs sum to {along} along axis {axis}, output has {}",
                output.dims()[axis]
            )));
        }
        let dst = if output.is_any() {
            output.with_format(first.format())?
        } else {
            output.clone()
        };
        Ok(self.register_primitive_desc(PrimitiveDesc {
            engine,
            op: Operation::Concat { axis },
            slots: Slots {
                src: srcs,
                dst: vec![dst],
                ..Slots::default()
            },
        }))
    }

    /// Destroys a primitive descriptor. Primitives created from it stay valid.
    ///
    /// # Errors
    /// [`DnnError::UseAfterFree`] when already destroyed.
    pub fn primitive_desc_destroy(&mut self, pd: Handle<PrimitiveDesc>) -> Result<()> {
        let removed = self.primitive_descs.remove(pd)?;
        log::debug!("destroyed {:?} primitive descriptor {pd:?}", removed.kind());
        Ok(())
    }

    /// Kind of a compiled descriptor.
    ///
    /// # Errors
    /// [`DnnError::UseAfterFree`] when destroyed.
    pub fn primitive_desc_kind(&self, pd: Handle<PrimitiveDesc>) -> Result<PrimitiveKind> {
        Ok(self.primitive_descs.get(pd)?.kind())
    }

    /// Resolved layout of a slot, as a value.
    ///
    /// `Ok(None)` means the primitive has no such slot.
    ///
    /// # Errors
    /// [`DnnError::UseAfterFree`] when `pd` is destroyed.
    pub fn primitive_desc_query_memory(
        &self,
        pd: Handle<PrimitiveDesc>,
        kind: QueryKind,
        index: usize,
    ) -> Result<Option<MemoryDesc>> {
        Ok(self.primitive_descs.get(pd)?.query(kind, index).cloned())
    }

    /// Memory descriptor of a slot, registered as a new handle owned by the caller.
    ///
    /// `Ok(None)` means the primitive has no such slot (or `index` is out of
    /// range); it is not an error. The returned layout is never `Any`.
    ///
    /// # Errors
    /// [`DnnError::UseAfterFree`] when `pd` is destroyed.
    pub fn primitive_desc_query_pd(
        &mut self,
        pd: Handle<PrimitiveDesc>,
        kind: QueryKind,
        index: usize,
    ) -> Result<Option<Handle<PrimitiveDesc>>> {
        let compiled = self.primitive_descs.get(pd)?;
        let engine = compiled.engine;
        let Some(md) = compiled.query(kind, index).cloned() else {
            return Ok(None);
        };
        debug_assert!(!md.is_any(), "compiled slot left unresolved");
        Ok(Some(self.register_primitive_desc(PrimitiveDesc::memory(engine, md))))
    }
}
