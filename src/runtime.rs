//! The runtime facade and scoped resource release.
//!
//! A [`Runtime`] owns one [`Arena`] per resource kind. Every component of the
//! crate adds its operations to `Runtime` in its own module, so the whole
//! handle-based surface reads as one flat API:
//!
//! ```rust
//! use briny_dnn::{DataType, EngineKind, Format, MemoryDesc, Runtime};
//!
//! let mut rt = Runtime::new();
//! let engine = rt.engine_create(EngineKind::Cpu, 0).unwrap();
//! let md = MemoryDesc::new(&[2, 3], DataType::F32, Format::Nc).unwrap();
//! let pd = rt.memory_primitive_desc_create(&md, engine).unwrap();
//! rt.primitive_desc_destroy(pd).unwrap();
//! rt.engine_destroy(engine).unwrap();
//! ```

use crate::engine::Engine;
use crate::primitive::Primitive;
use crate::primitive_desc::PrimitiveDesc;
use crate::registry::{Arena, Handle};
use crate::stream::Stream;
use core::ops::{Deref, DerefMut};

/// A handle of any resource kind, used for journaling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnyHandle {
    /// An engine.
    Engine(Handle<Engine>),
    /// A primitive descriptor.
    PrimitiveDesc(Handle<PrimitiveDesc>),
    /// A primitive.
    Primitive(Handle<Primitive>),
    /// A stream.
    Stream(Handle<Stream>),
}

impl From<Handle<Engine>> for AnyHandle {
    fn from(h: Handle<Engine>) -> Self {
        Self::Engine(h)
    }
}

impl From<Handle<PrimitiveDesc>> for AnyHandle {
    fn from(h: Handle<PrimitiveDesc>) -> Self {
        Self::PrimitiveDesc(h)
    }
}

impl From<Handle<Primitive>> for AnyHandle {
    fn from(h: Handle<Primitive>) -> Self {
        Self::Primitive(h)
    }
}

impl From<Handle<Stream>> for AnyHandle {
    fn from(h: Handle<Stream>) -> Self {
        Self::Stream(h)
    }
}

/// Owner of every engine, descriptor, primitive and stream.
///
/// Not `Sync`: one logical execution drives a runtime at a time. Independent
/// nets that must run concurrently belong in independent runtimes.
pub struct Runtime {
    pub(crate) engines: Arena<Engine>,
    pub(crate) primitive_descs: Arena<PrimitiveDesc>,
    pub(crate) primitives: Arena<Primitive>,
    pub(crate) streams: Arena<Stream>,
    journals: Vec<Vec<AnyHandle>>,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    /// Creates an empty runtime.
    pub fn new() -> Self {
        Self {
            engines: Arena::new("engine"),
            primitive_descs: Arena::new("primitive descriptor"),
            primitives: Arena::new("primitive"),
            streams: Arena::new("stream"),
            journals: Vec::new(),
        }
    }

    /// Records a freshly created handle in the innermost open scope.
    pub(crate) fn journal(&mut self, handle: AnyHandle) {
        if let Some(journal) = self.journals.last_mut() {
            journal.push(handle);
        }
    }

    /// Destroys a handle of any kind. Already destroyed handles are skipped.
    pub fn destroy(&mut self, handle: AnyHandle) {
        let released = match handle {
            AnyHandle::Engine(h) => self.engines.remove(h).is_ok(),
            AnyHandle::PrimitiveDesc(h) => self.primitive_descs.remove(h).is_ok(),
            AnyHandle::Primitive(h) => self.primitives.remove(h).is_ok(),
            AnyHandle::Stream(h) => self.streams.remove(h).is_ok(),
        };
        if released {
            log::debug!("released {handle:?}");
        }
    }

    /// Number of live resources of every kind.
    pub fn live_handles(&self) -> usize {
        self.engines.len() + self.primitive_descs.len() + self.primitives.len() + self.streams.len()
    }

    /// Opens a scope: everything created through the returned guard is
    /// destroyed when it drops, unless [`Scope::commit`] is called first.
    pub fn scope(&mut self) -> Scope<'_> {
        self.journals.push(Vec::new());
        Scope {
            runtime: self,
            committed: false,
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        let leaked = self.live_handles();
        if leaked > 0 {
            log::warn!("runtime dropped with {leaked} live handles; releasing them");
        }
        self.streams.clear();
        self.primitives.clear();
        self.primitive_descs.clear();
        self.engines.clear();
    }
}

/// Scoped acquisition guard returned by [`Runtime::scope`].
///
/// Derefs to the [`Runtime`]. On drop, every resource created while it was
/// open (and not already destroyed) is released in reverse creation order,
/// on every exit path including early returns through `?`.
pub struct Scope<'a> {
    runtime: &'a mut Runtime,
    committed: bool,
}

impl Scope<'_> {
    /// Keeps everything created in this scope alive.
    ///
    /// Inside a nested scope the handles are handed to the enclosing one.
    pub fn commit(mut self) {
        self.committed = true;
    }
}

impl Deref for Scope<'_> {
    type Target = Runtime;

    fn deref(&self) -> &Runtime {
        self.runtime
    }
}

impl DerefMut for Scope<'_> {
    fn deref_mut(&mut self) -> &mut Runtime {
        self.runtime
    }
}

impl Drop for Scope<'_> {
    fn drop(&mut self) {
        let journal = self.runtime.journals.pop().unwrap_or_default();
        if self.committed {
            if let Some(outer) = self.runtime.journals.last_mut() {
                outer.extend(journal);
            }
            return;
        }
        log::debug!("scope closed, releasing {} handles", journal.len());
        for handle in journal.into_iter().rev() {
            self.runtime.destroy(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineKind;
    use crate::error::{DnnError, Result};
    use crate::memory::{DataType, Format, MemoryDesc};

    fn build(rt: &mut Runtime, fail: bool) -> Result<()> {
        let mut scope = rt.scope();
        let engine = scope.engine_create(EngineKind::Cpu, 0)?;
        let md = MemoryDesc::new(&[4], DataType::F32, Format::X)?;
        scope.memory_primitive_desc_create(&md, engine)?;
        if fail {
            return Err(DnnError::invalid_shape("bail out"));
        }
        scope.commit();
        Ok(())
    }

    #[test]
    fn failed_builds_release_everything() {
        let mut rt = Runtime::new();
        assert!(build(&mut rt, true).is_err());
        assert_eq!(rt.live_handles(), 0);
        build(&mut rt, false).unwrap();
        assert_eq!(rt.live_handles(), 2);
    }

    #[test]
    fn nested_commit_hands_over_to_outer_scope() {
        let mut rt = Runtime::new();
        {
            let mut outer = rt.scope();
            {
                let mut inner = outer.scope();
                inner.engine_create(EngineKind::Cpu, 0).unwrap();
                inner.commit();
            }
            assert_eq!(outer.live_handles(), 1);
        }
        assert_eq!(rt.live_handles(), 0);
    }

    #[test]
    fn manual_destroy_inside_scope_is_not_repeated() {
        let mut rt = Runtime::new();
        {
            let mut scope = rt.scope();
            let engine = scope.engine_create(EngineKind::Cpu, 0).unwrap();
            scope.engine_destroy(engine).unwrap();
        }
        assert_eq!(rt.live_handles(), 0);
    }
}
