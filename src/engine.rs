//! Compute engines.
//!
//! An engine is a device context (kind + index, e.g. "CPU #0"). It is created
//! once, shared read-only by every descriptor and primitive compiled against
//! it, and must outlive all of them.
//!
//! # Supported Kinds
//!
//! - `Cpu`: Pure Rust kernels parallelised with `rayon` (always available).
//! - `Gpu`: `wgpu` compute shaders (only with the `wgpu` feature and an adapter).
//!
//! The process-wide default kind is stored in an `AtomicU8`, so bridging code
//! can pick a device once and let [`Runtime::engine_create_default`] follow it.

use crate::error::{DnnError, Result};
use crate::registry::Handle;
use crate::runtime::Runtime;
use briny::traits::{InteriorImmutable, RawConvert, StableLayout, Unaligned};
use core::convert::TryFrom;
use core::fmt;
use core::sync::atomic::{AtomicU8, Ordering};

/// Kind of device an engine drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum EngineKind {
    /// Host CPU (default).
    #[default]
    Cpu = 0,
    /// GPU through `wgpu`.
    Gpu = 1,
}

unsafe impl StableLayout for EngineKind {}
unsafe impl RawConvert for EngineKind {}
unsafe impl Unaligned for EngineKind {}
unsafe impl InteriorImmutable for EngineKind {}

impl TryFrom<u8> for EngineKind {
    type Error = DnnError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Cpu),
            1 => Ok(Self::Gpu),
            other => Err(DnnError::unsupported(format!("unknown engine kind {other}"))),
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "CPU"),
            Self::Gpu => write!(f, "GPU"),
        }
    }
}

/// A live device context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Engine {
    /// Device kind.
    pub kind: EngineKind,
    /// Device index within its kind.
    pub index: usize,
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} #{}", self.kind, self.index)
    }
}

static DEFAULT_ENGINE_KIND: AtomicU8 = AtomicU8::new(EngineKind::Cpu as u8);

/// Sets the engine kind used by [`Runtime::engine_create_default`].
pub fn set_default_engine_kind(kind: EngineKind) {
    DEFAULT_ENGINE_KIND.store(kind as u8, Ordering::Release);
}

/// Returns the process-wide default engine kind.
///
/// If the stored value is invalid, defaults to [`EngineKind::Cpu`].
pub fn default_engine_kind() -> EngineKind {
    EngineKind::try_from(DEFAULT_ENGINE_KIND.load(Ordering::Acquire)).unwrap_or_default()
}

/// Number of devices of `kind` this build can drive.
pub fn engine_count(kind: EngineKind) -> usize {
    match kind {
        EngineKind::Cpu => 1,
        EngineKind::Gpu => {
            #[cfg(feature = "wgpu")]
            {
                usize::from(crate::ops::wgpu::gpu_available())
            }
            #[cfg(not(feature = "wgpu"))]
            {
                0
            }
        }
    }
}

impl Runtime {
    /// Number of engines of `kind` that can be created.
    pub fn engine_get_count(&self, kind: EngineKind) -> usize {
        engine_count(kind)
    }

    /// Creates the `index`-th engine of `kind`.
    ///
    /// # Errors
    /// [`DnnError::UnsupportedConfiguration`] when no such device exists.
    pub fn engine_create(&mut self, kind: EngineKind, index: usize) -> Result<Handle<Engine>> {
        let count = engine_count(kind);
        if index >= count {
            return Err(DnnError::unsupported(format!(
                "{kind} engine #{index} requested but {count} available"
            )));
        }
        let engine = Engine { kind, index };
        let handle = self.engines.insert(engine);
        log::debug!("created engine {engine} as {handle:?}");
        self.journal(handle.into());
        Ok(handle)
    }

    /// Creates engine #0 of the [default kind](default_engine_kind).
    ///
    /// # Errors
    /// Same as [`Runtime::engine_create`].
    pub fn engine_create_default(&mut self) -> Result<Handle<Engine>> {
        self.engine_create(default_engine_kind(), 0)
    }

    /// Destroys an engine.
    ///
    /// Descriptors and primitives built against it are not touched; using them
    /// afterwards fails with [`DnnError::UseAfterFree`].
    ///
    /// # Errors
    /// [`DnnError::UseAfterFree`] when already destroyed.
    pub fn engine_destroy(&mut self, engine: Handle<Engine>) -> Result<()> {
        let removed = self.engines.remove(engine)?;
        log::debug!("destroyed engine {removed} ({engine:?})");
        Ok(())
    }

    /// Kind of a live engine.
    ///
    /// # Errors
    /// [`DnnError::UseAfterFree`] when destroyed.
    pub fn engine_kind(&self, engine: Handle<Engine>) -> Result<EngineKind> {
        Ok(self.engines.get(engine)?.kind)
    }
}
