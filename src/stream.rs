//! Execution streams.
//!
//! A stream runs a *net*, an ordered list of primitives, and reports whether
//! every one of them succeeded. Primitives run strictly in list order; there
//! is no dependency analysis, so producers must come before their consumers.
//!
//! ```text
//! Created --submit--> Submitted --wait--> Completed
//!                         |                  |
//!                         +-----> Failed <---+ (rerun)
//! ```
//!
//! An [`Eager`](StreamKind::Eager) stream executes inside `submit`, a
//! [`Lazy`](StreamKind::Lazy) one inside `wait`. The observable contract is
//! the same: `wait` returns `Ok` exactly when the stream is `Completed`.

use crate::error::{DnnError, Result};
use crate::memory::MemoryDesc;
use crate::ops::{self, Kernel};
use crate::primitive::Primitive;
use crate::primitive_desc::PrimitiveKind;
use crate::registry::Handle;
use crate::runtime::Runtime;

/// When a stream executes its net.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StreamKind {
    /// Synchronously inside `submit`.
    #[default]
    Eager,
    /// Deferred until `wait`.
    Lazy,
}

/// Lifecycle of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamState {
    /// Nothing submitted yet.
    Created,
    /// A net is submitted and not yet waited on.
    Submitted,
    /// The net ran to completion.
    Completed,
    /// Some primitive failed; the error is kept for every later `wait`.
    Failed,
}

/// An execution context for one net.
#[derive(Debug)]
pub struct Stream {
    kind: StreamKind,
    state: StreamState,
    net: Vec<Handle<Primitive>>,
    executed: bool,
    error: Option<DnnError>,
}

impl Runtime {
    /// Creates a stream.
    pub fn stream_create(&mut self, kind: StreamKind) -> Handle<Stream> {
        let handle = self.streams.insert(Stream {
            kind,
            state: StreamState::Created,
            net: Vec::new(),
            executed: false,
            error: None,
        });
        log::debug!("created {kind:?} stream {handle:?}");
        self.journal(handle.into());
        handle
    }

    /// Current state.
    ///
    /// # Errors
    /// [`DnnError::UseAfterFree`] when destroyed.
    pub fn stream_state(&self, stream: Handle<Stream>) -> Result<StreamState> {
        Ok(self.streams.get(stream)?.state)
    }

    /// Hands `net` to the stream. An eager stream runs it before returning.
    ///
    /// # Errors
    /// [`DnnError::InvalidState`] unless the stream is `Created`; for eager
    /// streams, the first execution failure (the stream is then `Failed`).
    pub fn stream_submit(&mut self, stream: Handle<Stream>, net: &[Handle<Primitive>]) -> Result<()> {
        let s = self.streams.get_mut(stream)?;
        if s.state != StreamState::Created {
            return Err(DnnError::InvalidState(format!(
                "submit on a {:?} stream",
                s.state
            )));
        }
        s.state = StreamState::Submitted;
        s.net = net.to_vec();
        log::debug!("submitted {} primitives to {stream:?}", net.len());
        if s.kind == StreamKind::Eager {
            self.run_stream(stream)?;
        }
        Ok(())
    }

    /// Blocks until the submitted net has finished.
    ///
    /// # Errors
    /// The execution failure, on this and every later call, or
    /// [`DnnError::InvalidState`] when nothing was submitted.
    pub fn stream_wait(&mut self, stream: Handle<Stream>) -> Result<()> {
        let s = self.streams.get(stream)?;
        match (s.state, s.executed) {
            (StreamState::Created, _) => Err(DnnError::InvalidState("wait before submit".into())),
            (StreamState::Completed, _) => Ok(()),
            (StreamState::Failed, _) => Err(s
                .error
                .clone()
                .unwrap_or_else(|| DnnError::InvalidState("stream failed".into()))),
            (StreamState::Submitted, executed) => {
                if !executed {
                    self.run_stream(stream)?;
                }
                let s = self.streams.get_mut(stream)?;
                s.state = StreamState::Completed;
                log::info!("stream {stream:?} completed {} primitives", s.net.len());
                Ok(())
            }
        }
    }

    /// Runs a completed net again, e.g. for the next batch of input data.
    ///
    /// # Errors
    /// [`DnnError::InvalidState`] unless the stream is `Completed`; otherwise
    /// as [`Runtime::stream_submit`].
    pub fn stream_rerun(&mut self, stream: Handle<Stream>) -> Result<()> {
        let s = self.streams.get_mut(stream)?;
        if s.state != StreamState::Completed {
            return Err(DnnError::InvalidState(format!(
                "rerun on a {:?} stream",
                s.state
            )));
        }
        s.state = StreamState::Submitted;
        s.executed = false;
        if s.kind == StreamKind::Eager {
            self.run_stream(stream)?;
        }
        Ok(())
    }

    /// Destroys a stream. Its net is left untouched.
    ///
    /// # Errors
    /// [`DnnError::UseAfterFree`] when already destroyed.
    pub fn stream_destroy(&mut self, stream: Handle<Stream>) -> Result<()> {
        let removed = self.streams.remove(stream)?;
        log::debug!("destroyed {:?} stream {stream:?}", removed.state);
        Ok(())
    }

    fn run_stream(&mut self, stream: Handle<Stream>) -> Result<()> {
        let net = self.streams.get(stream)?.net.clone();
        let outcome = net
            .iter()
            .enumerate()
            .try_for_each(|(index, &primitive)| self.execute(index, primitive));
        let s = self.streams.get_mut(stream)?;
        match &outcome {
            Ok(()) => s.executed = true,
            Err(e) => {
                log::warn!("stream {stream:?} failed: {e}");
                s.state = StreamState::Failed;
                s.error = Some(e.clone());
            }
        }
        outcome
    }

    /// Runs one primitive of a net.
    fn execute(&mut self, index: usize, primitive: Handle<Primitive>) -> Result<()> {
        let prim = self.primitives.get(primitive)?;
        if prim.is_memory() {
            return Ok(());
        }
        let engine = *self.engines.get(prim.desc.engine)?;
        log::trace!("executing #{index} {:?} on {engine}", prim.kind());

        let sources = prim
            .inputs
            .iter()
            .map(|&at| self.resolve_input(at))
            .collect::<Result<Vec<_>>>()?;
        let input_slots: Vec<MemoryDesc> = prim.desc.input_descs().into_iter().cloned().collect();
        let outputs: Vec<(Handle<Primitive>, MemoryDesc)> = prim
            .outputs
            .iter()
            .copied()
            .zip(prim.desc.output_descs().into_iter().cloned())
            .collect();

        if prim.kind() == PrimitiveKind::Reorder {
            if let ([source], [source_slot], [(output, output_slot)]) =
                (sources.as_slice(), input_slots.as_slice(), outputs.as_slice())
            {
                if self.copy_exact(index, *source, source_slot, *output, output_slot)? {
                    return Ok(());
                }
            }
        }

        let mut inputs = Vec::with_capacity(sources.len());
        for (source, md) in sources.iter().zip(&input_slots) {
            inputs.push(self.gather(index, *source, md)?);
        }
        let prim = self.primitives.get(primitive)?;
        let kernel = Kernel::of(&prim.desc);
        let results = ops::dispatch::run(engine.kind, &kernel, &inputs)
            .map_err(|reason| DnnError::execution(index, reason))?;
        for ((output, md), values) in outputs.iter().zip(results) {
            self.scatter(index, *output, md, &values)?;
        }
        Ok(())
    }

    /// Copies a reorder's elements untouched when both sides share an element type.
    ///
    /// Returns `false` when the types differ and the converting path has to run.
    fn copy_exact(
        &mut self,
        index: usize,
        source: Handle<Primitive>,
        source_slot: &MemoryDesc,
        output: Handle<Primitive>,
        output_slot: &MemoryDesc,
    ) -> Result<bool> {
        let from = self.bound_layout(index, source, source_slot)?;
        let to = self.bound_layout(index, output, output_slot)?;
        if from.data_type() != to.data_type() {
            return Ok(false);
        }
        let packed = {
            let prim = self.primitives.get(source)?;
            let bytes = prim.buffer.as_ref().map(|b| b.bytes()).unwrap_or_default();
            ops::layout::gather_raw(bytes, &from)
        };
        if let Some(buffer) = self.primitives.get_mut(output)?.buffer.as_mut() {
            ops::layout::scatter_raw(buffer.bytes_mut(), &to, &packed);
        }
        Ok(true)
    }

    /// Layout of the buffer bound to `memory`, checked against the slot it fills.
    fn bound_layout(&self, index: usize, memory: Handle<Primitive>, slot: &MemoryDesc) -> Result<MemoryDesc> {
        let prim = self.primitives.get(memory)?;
        let md = prim.desc.memory_desc().unwrap_or(slot);
        if md.dims() != slot.dims() {
            return Err(DnnError::execution(
                index,
                format!("{memory:?} is {md}, the primitive expects {slot}"),
            ));
        }
        match prim.buffer.as_ref() {
            None => Err(DnnError::execution(index, format!("{memory:?} has no bound buffer"))),
            Some(b) if b.len() < md.byte_size() => Err(DnnError::execution(
                index,
                format!("{memory:?} holds {} bytes, {md} needs {}", b.len(), md.byte_size()),
            )),
            Some(_) => Ok(md.clone()),
        }
    }

    /// Reads a bound buffer into a plain row-major `f32` tensor.
    fn gather(&self, index: usize, memory: Handle<Primitive>, slot: &MemoryDesc) -> Result<Vec<f32>> {
        let md = self.bound_layout(index, memory, slot)?;
        let prim = self.primitives.get(memory)?;
        let bytes = prim.buffer.as_ref().map(|b| b.bytes()).unwrap_or_default();
        Ok(ops::layout::gather(bytes, &md))
    }

    /// Writes a plain row-major `f32` tensor into a bound buffer.
    fn scatter(&mut self, index: usize, memory: Handle<Primitive>, slot: &MemoryDesc, values: &[f32]) -> Result<()> {
        let md = self.bound_layout(index, memory, slot)?;
        if let Some(buffer) = self.primitives.get_mut(memory)?.buffer.as_mut() {
            ops::layout::scatter(buffer.bytes_mut(), &md, values);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desc::{Algorithm, EltwiseDesc, OpDesc, PropKind};
    use crate::engine::EngineKind;
    use crate::memory::{DataType, Format};

    struct Net {
        rt: Runtime,
        relu: Handle<Primitive>,
        src: Vec<f32>,
        dst: Vec<f32>,
    }

    fn relu_net() -> Net {
        let mut rt = Runtime::new();
        let engine = rt.engine_create(EngineKind::Cpu, 0).unwrap();
        let md = MemoryDesc::new(&[1, 4], DataType::F32, Format::Nc).unwrap();
        let mem = rt.memory_primitive_desc_create(&md, engine).unwrap();
        let op = OpDesc::Eltwise(
            EltwiseDesc::forward(PropKind::ForwardInference, Algorithm::EltwiseRelu, &md, 0.5).unwrap(),
        );
        let pd = rt.primitive_desc_create(&op, engine, None).unwrap();
        let src_mem = rt.memory_primitive_create(mem).unwrap();
        let dst_mem = rt.memory_primitive_create(mem).unwrap();
        let mut net = Net {
            relu: rt.primitive_create(pd, &[src_mem.into()], &[dst_mem]).unwrap(),
            rt,
            src: vec![-2.0, -1.0, 0.0, 3.0],
            dst: vec![0.0; 4],
        };
        unsafe {
            net.rt.memory_set_data_handle(src_mem, net.src.as_mut_ptr().cast(), 16).unwrap();
            net.rt.memory_set_data_handle(dst_mem, net.dst.as_mut_ptr().cast(), 16).unwrap();
        }
        net
    }

    #[test]
    fn eager_stream_runs_on_submit() {
        let mut net = relu_net();
        let s = net.rt.stream_create(StreamKind::Eager);
        assert_eq!(net.rt.stream_state(s).unwrap(), StreamState::Created);
        net.rt.stream_submit(s, &[net.relu]).unwrap();
        assert_eq!(net.rt.stream_state(s).unwrap(), StreamState::Submitted);
        net.rt.stream_wait(s).unwrap();
        assert_eq!(net.rt.stream_state(s).unwrap(), StreamState::Completed);
        assert_eq!(net.dst, vec![-1.0, -0.5, 0.0, 3.0]);
    }

    #[test]
    fn lazy_stream_runs_on_wait() {
        let mut net = relu_net();
        let s = net.rt.stream_create(StreamKind::Lazy);
        net.rt.stream_submit(s, &[net.relu]).unwrap();
        assert_eq!(net.dst, vec![0.0; 4]);
        net.rt.stream_wait(s).unwrap();
        assert_eq!(net.dst[3], 3.0);
        assert!(net.rt.stream_submit(s, &[net.relu]).is_err());
    }

    #[test]
    fn rerun_requires_completion() {
        let mut net = relu_net();
        let s = net.rt.stream_create(StreamKind::Eager);
        assert!(net.rt.stream_rerun(s).is_err());
        net.rt.stream_submit(s, &[net.relu]).unwrap();
        net.rt.stream_wait(s).unwrap();
        net.src[0] = 4.0;
        net.rt.stream_rerun(s).unwrap();
        net.rt.stream_wait(s).unwrap();
        assert_eq!(net.dst[0], 4.0);
    }

    #[test]
    fn failure_sticks_to_the_stream() {
        let mut net = relu_net();
        let inputs = net.rt.primitives.get(net.relu).unwrap().inputs.clone();
        net.rt.memory_clear_data_handle(inputs[0].primitive).unwrap();
        let s = net.rt.stream_create(StreamKind::Eager);
        let err = net.rt.stream_submit(s, &[net.relu]).unwrap_err();
        assert!(matches!(err, DnnError::BackendExecutionFailure { index: 0, .. }));
        assert_eq!(net.rt.stream_state(s).unwrap(), StreamState::Failed);
        assert_eq!(net.rt.stream_wait(s), Err(err.clone()));
        assert_eq!(net.rt.stream_wait(s), Err(err));
    }
}
