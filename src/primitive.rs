//! Primitives: executable graph nodes.
//!
//! A primitive is a compiled [`PrimitiveDesc`] plus explicit wiring. Inputs
//! are [`PrimitiveAt`] bindings (an upstream primitive and which of its
//! outputs to read), outputs are memory primitives that receive the result.
//! Memory primitives are the leaves: they carry no wiring, only a buffer.
//!
//! Buffers bound with [`Runtime::memory_set_data_handle`] belong to the
//! caller. They are never copied, freed or resized here.

use core::ptr::NonNull;

use crate::error::{DnnError, Result};
use crate::primitive_desc::{PrimitiveDesc, PrimitiveKind};
use crate::registry::Handle;
use crate::runtime::Runtime;

/// An input binding: output `output_index` of `primitive`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrimitiveAt {
    /// Upstream primitive.
    pub primitive: Handle<Primitive>,
    /// Which of its outputs; always 0 for memory primitives.
    pub output_index: usize,
}

impl PrimitiveAt {
    /// Binds the first output of `primitive`.
    pub fn new(primitive: Handle<Primitive>) -> Self {
        Self {
            primitive,
            output_index: 0,
        }
    }

    /// Binds output `output_index` of `primitive`.
    pub fn at(primitive: Handle<Primitive>, output_index: usize) -> Self {
        Self {
            primitive,
            output_index,
        }
    }
}

impl From<Handle<Primitive>> for PrimitiveAt {
    fn from(primitive: Handle<Primitive>) -> Self {
        Self::new(primitive)
    }
}

/// Storage behind a memory primitive.
#[derive(Debug)]
pub(crate) enum Buffer {
    /// Caller memory.
    External { ptr: NonNull<u8>, len: usize },
    /// Zeroed scratch memory owned by the runtime.
    Owned(Vec<u8>),
}

impl Buffer {
    pub(crate) fn zeroed(len: usize) -> Result<Self> {
        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(len)
            .map_err(|_| DnnError::ResourceExhaustion { bytes: len })?;
        bytes.resize(len, 0);
        Ok(Self::Owned(bytes))
    }

    pub(crate) fn len(&self) -> usize {
        match self {
            Self::External { len, .. } => *len,
            Self::Owned(bytes) => bytes.len(),
        }
    }

    fn as_ptr(&self) -> *mut u8 {
        match self {
            Self::External { ptr, .. } => ptr.as_ptr(),
            Self::Owned(bytes) => bytes.as_ptr().cast_mut(),
        }
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        match self {
            // SAFETY: `memory_set_data_handle` requires `ptr` to stay valid for
            // `len` bytes for as long as it is bound.
            Self::External { ptr, len } => unsafe { core::slice::from_raw_parts(ptr.as_ptr(), *len) },
            Self::Owned(bytes) => bytes,
        }
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        match self {
            // SAFETY: as in `bytes`; the caller also promised no other access
            // while a stream runs.
            Self::External { ptr, len } => unsafe {
                core::slice::from_raw_parts_mut(ptr.as_ptr(), *len)
            },
            Self::Owned(bytes) => bytes,
        }
    }
}

/// An executable node.
#[derive(Debug)]
pub struct Primitive {
    pub(crate) desc: PrimitiveDesc,
    pub(crate) inputs: Vec<PrimitiveAt>,
    pub(crate) outputs: Vec<Handle<Primitive>>,
    pub(crate) buffer: Option<Buffer>,
}

impl Primitive {
    /// Kind of the compiled operation.
    pub fn kind(&self) -> PrimitiveKind {
        self.desc.kind()
    }

    pub(crate) fn is_memory(&self) -> bool {
        self.kind() == PrimitiveKind::Memory
    }
}

impl Runtime {
    fn register_primitive(&mut self, primitive: Primitive) -> Handle<Primitive> {
        let kind = primitive.kind();
        let handle = self.primitives.insert(primitive);
        log::debug!("created {kind:?} primitive {handle:?}");
        self.journal(handle.into());
        handle
    }

    /// Memory primitive an input binding reads from.
    ///
    /// # Errors
    /// [`DnnError::UseAfterFree`] when the upstream primitive is gone and
    /// [`DnnError::ArityMismatch`] when `output_index` names no output.
    pub(crate) fn resolve_input(&self, at: PrimitiveAt) -> Result<Handle<Primitive>> {
        let upstream = self.primitives.get(at.primitive)?;
        if upstream.is_memory() {
            return if at.output_index == 0 {
                Ok(at.primitive)
            } else {
                Err(DnnError::ArityMismatch {
                    what: "memory primitive outputs",
                    expected: 1,
                    got: at.output_index + 1,
                })
            };
        }
        upstream
            .outputs
            .get(at.output_index)
            .copied()
            .ok_or(DnnError::ArityMismatch {
                what: "upstream primitive outputs",
                expected: upstream.outputs.len(),
                got: at.output_index + 1,
            })
    }

    /// Assembles a primitive from a compiled descriptor and its wiring.
    ///
    /// The number of bindings must match the operation exactly, e.g. a
    /// convolution takes `[src, weights]` or `[src, weights, bias]` and one
    /// output. Layouts of the bound memory are not checked against the
    /// descriptor; reconcile external buffers with
    /// [`Runtime::prepare_reorder`] first.
    ///
    /// # Errors
    /// - [`DnnError::ArityMismatch`] for a wrong binding count, an output that
    ///   is not a memory primitive, or an input index past the upstream's outputs.
    /// - [`DnnError::UseAfterFree`] for a destroyed descriptor, engine or binding.
    pub fn primitive_create(
        &mut self,
        pd: Handle<PrimitiveDesc>,
        inputs: &[PrimitiveAt],
        outputs: &[Handle<Primitive>],
    ) -> Result<Handle<Primitive>> {
        let desc = self.primitive_descs.get(pd)?.clone();
        self.engines.get(desc.engine)?;

        let expected_inputs = desc.input_descs().len();
        if inputs.len() != expected_inputs {
            return Err(DnnError::ArityMismatch {
                what: "inputs",
                expected: expected_inputs,
                got: inputs.len(),
            });
        }
        let expected_outputs = desc.output_descs().len();
        if outputs.len() != expected_outputs {
            return Err(DnnError::ArityMismatch {
                what: "outputs",
                expected: expected_outputs,
                got: outputs.len(),
            });
        }
        for &at in inputs {
            self.resolve_input(at)?;
        }
        let mut memory_outputs = 0;
        for &output in outputs {
            if self.primitives.get(output)?.is_memory() {
                memory_outputs += 1;
            }
        }
        if memory_outputs != outputs.len() {
            return Err(DnnError::ArityMismatch {
                what: "memory outputs",
                expected: outputs.len(),
                got: memory_outputs,
            });
        }

        Ok(self.register_primitive(Primitive {
            desc,
            inputs: inputs.to_vec(),
            outputs: outputs.to_vec(),
            buffer: None,
        }))
    }

    /// Creates a memory primitive with no buffer bound yet.
    ///
    /// # Errors
    /// [`DnnError::ArityMismatch`] when `pd` is not a memory descriptor: every
    /// other primitive needs its bindings.
    pub fn memory_primitive_create(&mut self, pd: Handle<PrimitiveDesc>) -> Result<Handle<Primitive>> {
        let kind = self.primitive_descs.get(pd)?.kind();
        if kind != PrimitiveKind::Memory {
            return Err(DnnError::ArityMismatch {
                what: "bindings",
                expected: 1,
                got: 0,
            });
        }
        self.primitive_create(pd, &[], &[])
    }

    fn memory_mut(&mut self, primitive: Handle<Primitive>) -> Result<&mut Primitive> {
        let prim = self.primitives.get_mut(primitive)?;
        if !prim.is_memory() {
            return Err(DnnError::InvalidState(format!(
                "{:?} primitive has no data handle",
                prim.kind()
            )));
        }
        Ok(prim)
    }

    fn required_bytes(prim: &Primitive) -> usize {
        prim.desc.memory_desc().map_or(0, |md| md.byte_size())
    }

    /// Binds caller memory to a memory primitive, replacing any previous buffer.
    ///
    /// # Errors
    /// [`DnnError::InvalidState`] for a non-memory primitive and
    /// [`DnnError::ShapeMismatch`] when `len` is below the layout's byte size.
    ///
    /// # Safety
    /// `ptr` must be valid for reads and writes of `len` bytes until the
    /// handle is cleared, replaced or the primitive destroyed, and must not be
    /// accessed elsewhere while a stream that uses it is executing.
    pub unsafe fn memory_set_data_handle(
        &mut self,
        primitive: Handle<Primitive>,
        ptr: *mut u8,
        len: usize,
    ) -> Result<()> {
        let prim = self.memory_mut(primitive)?;
        let required = Self::required_bytes(prim);
        if len < required {
            return Err(DnnError::shape_mismatch(format!(
                "buffer of {len} bytes bound where {required} are needed"
            )));
        }
        let Some(ptr) = NonNull::new(ptr) else {
            return Err(DnnError::InvalidState("null data handle".into()));
        };
        prim.buffer = Some(Buffer::External { ptr, len });
        log::trace!("bound {len} bytes to {primitive:?}");
        Ok(())
    }

    /// Binds a zeroed buffer of the layout's byte size, owned by the runtime.
    ///
    /// # Errors
    /// [`DnnError::ResourceExhaustion`] when the allocation fails and
    /// [`DnnError::InvalidState`] for a non-memory primitive.
    pub fn memory_allocate(&mut self, primitive: Handle<Primitive>) -> Result<()> {
        let prim = self.memory_mut(primitive)?;
        prim.buffer = Some(Buffer::zeroed(Self::required_bytes(prim))?);
        Ok(())
    }

    /// Address of the bound buffer, `None` when nothing is bound.
    ///
    /// # Errors
    /// [`DnnError::InvalidState`] for a non-memory primitive.
    pub fn memory_get_data_handle(&self, primitive: Handle<Primitive>) -> Result<Option<*mut u8>> {
        let prim = self.primitives.get(primitive)?;
        if !prim.is_memory() {
            return Err(DnnError::InvalidState(format!(
                "{:?} primitive has no data handle",
                prim.kind()
            )));
        }
        Ok(prim.buffer.as_ref().map(Buffer::as_ptr))
    }

    /// Contents of the bound buffer.
    ///
    /// # Errors
    /// [`DnnError::InvalidState`] for a non-memory primitive or one without a buffer.
    pub fn memory_bytes(&self, primitive: Handle<Primitive>) -> Result<&[u8]> {
        let prim = self.primitives.get(primitive)?;
        prim.buffer
            .as_ref()
            .filter(|_| prim.is_memory())
            .map(Buffer::bytes)
            .ok_or_else(|| DnnError::InvalidState(format!("{primitive:?} has no bound buffer")))
    }

    /// Unbinds the buffer. Owned scratch memory is freed; caller memory is not touched.
    ///
    /// # Errors
    /// [`DnnError::InvalidState`] for a non-memory primitive.
    pub fn memory_clear_data_handle(&mut self, primitive: Handle<Primitive>) -> Result<()> {
        self.memory_mut(primitive)?.buffer = None;
        Ok(())
    }

    /// The descriptor a primitive was built from, as a new handle owned by the caller.
    ///
    /// # Errors
    /// [`DnnError::UseAfterFree`] when `primitive` is destroyed.
    pub fn primitive_get_primitive_desc(&mut self, primitive: Handle<Primitive>) -> Result<Handle<PrimitiveDesc>> {
        let desc = self.primitives.get(primitive)?.desc.clone();
        Ok(self.register_primitive_desc(desc))
    }

    /// Kind of a primitive.
    ///
    /// # Errors
    /// [`DnnError::UseAfterFree`] when destroyed.
    pub fn primitive_kind(&self, primitive: Handle<Primitive>) -> Result<PrimitiveKind> {
        Ok(self.primitives.get(primitive)?.kind())
    }

    /// Destroys a primitive. Primitives wired to it fail when executed.
    ///
    /// # Errors
    /// [`DnnError::UseAfterFree`] when already destroyed.
    pub fn primitive_destroy(&mut self, primitive: Handle<Primitive>) -> Result<()> {
        let removed = self.primitives.remove(primitive)?;
        log::debug!("destroyed {:?} primitive {primitive:?}", removed.kind());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desc::{Algorithm, EltwiseDesc, OpDesc, PropKind};
    use crate::engine::EngineKind;
    use crate::memory::{DataType, Format, MemoryDesc};

    fn setup() -> (Runtime, Handle<PrimitiveDesc>, Handle<PrimitiveDesc>) {
        let mut rt = Runtime::new();
        let engine = rt.engine_create(EngineKind::Cpu, 0).unwrap();
        let md = MemoryDesc::new(&[2, 4], DataType::F32, Format::Nc).unwrap();
        let mem = rt.memory_primitive_desc_create(&md, engine).unwrap();
        let relu = OpDesc::Eltwise(
            EltwiseDesc::forward(PropKind::ForwardInference, Algorithm::EltwiseRelu, &md, 0.0)
                .unwrap(),
        );
        let relu = rt.primitive_desc_create(&relu, engine, None).unwrap();
        (rt, mem, relu)
    }

    #[test]
    fn fresh_memory_has_no_buffer() {
        let (mut rt, mem, _) = setup();
        let m = rt.memory_primitive_create(mem).unwrap();
        assert_eq!(rt.memory_get_data_handle(m).unwrap(), None);
        rt.memory_allocate(m).unwrap();
        assert_eq!(rt.memory_bytes(m).unwrap(), &[0u8; 32][..]);
        rt.memory_clear_data_handle(m).unwrap();
        assert!(rt.memory_bytes(m).is_err());
    }

    #[test]
    fn short_buffers_are_refused_at_bind_time() {
        let (mut rt, mem, _) = setup();
        let m = rt.memory_primitive_create(mem).unwrap();
        let mut data = vec![0f32; 7];
        let err = unsafe { rt.memory_set_data_handle(m, data.as_mut_ptr().cast(), 28) };
        assert!(matches!(err, Err(DnnError::ShapeMismatch(_))));
    }

    #[test]
    fn compute_primitives_need_their_bindings() {
        let (mut rt, mem, relu) = setup();
        assert!(matches!(
            rt.memory_primitive_create(relu),
            Err(DnnError::ArityMismatch { .. })
        ));
        let src = rt.memory_primitive_create(mem).unwrap();
        let dst = rt.memory_primitive_create(mem).unwrap();
        assert_eq!(
            rt.primitive_create(relu, &[], &[dst]),
            Err(DnnError::ArityMismatch {
                what: "inputs",
                expected: 1,
                got: 0
            })
        );
        let p = rt.primitive_create(relu, &[src.into()], &[dst]).unwrap();
        assert!(matches!(
            rt.primitive_create(relu, &[p.into()], &[p]),
            Err(DnnError::ArityMismatch { what: "memory outputs", .. })
        ));
        // output 0 of a compute primitive resolves to its destination memory
        assert_eq!(rt.resolve_input(PrimitiveAt::new(p)).unwrap(), dst);
        assert!(rt.resolve_input(PrimitiveAt::at(p, 1)).is_err());
    }

    #[test]
    fn data_handles_belong_to_memory_primitives() {
        let (mut rt, mem, relu) = setup();
        let src = rt.memory_primitive_create(mem).unwrap();
        let dst = rt.memory_primitive_create(mem).unwrap();
        let p = rt.primitive_create(relu, &[src.into()], &[dst]).unwrap();
        let mut data = vec![0f32; 8];
        let err = unsafe { rt.memory_set_data_handle(p, data.as_mut_ptr().cast(), 32) };
        assert!(matches!(err, Err(DnnError::InvalidState(_))));
        let copy = rt.primitive_get_primitive_desc(p).unwrap();
        assert_eq!(rt.primitive_desc_kind(copy).unwrap(), PrimitiveKind::Eltwise);
    }
}
