//! briny_dnn: handle-based primitive graphs for deep neural network kernels.
//!
//! A caller describes tensors and operations, lets the backend compile them
//! into primitive descriptors (choosing memory layouts where the caller left
//! them open), reconciles its own buffers with those layouts, wires
//! primitives into a net, and runs the net on a stream.
//!
//! # Pipeline
//!
//! 1. [`Runtime::engine_create`] picks a device.
//! 2. [`MemoryDesc`] and the descriptors in [`desc`] say *what* to compute.
//! 3. [`Runtime::primitive_desc_create`] compiles; [`Runtime::primitive_desc_query_pd`]
//!    reveals the layouts the backend chose.
//! 4. [`Runtime::prepare_reorder`] bridges user buffers and chosen layouts,
//!    zero-copy when they already agree.
//! 5. [`Runtime::primitive_create`] wires primitives; [`Runtime::stream_submit`]
//!    and [`Runtime::stream_wait`] execute them in order.
//!
//! Every resource is an opaque, generation-checked [`Handle`]. Stale handles
//! fail with [`DnnError::UseAfterFree`] instead of touching freed state, and
//! [`Runtime::scope`] releases everything a failed build created.
//!
//! # Modules
//!
//! - [`memory`]: Element types, layout tags and memory descriptors.
//! - [`desc`]: Convolution, eltwise and pooling descriptors.
//! - [`primitive_desc`]: Compilation and the query interface.
//! - [`reorder`]: Format reconciliation.
//! - [`primitive`]: Graph assembly and buffer binding.
//! - [`stream`]: Net execution.
//! - [`ops`]: CPU and optional GPU kernels.
//!
//! # Example
//!
//! ```rust
//! use briny_dnn::{DataType, EngineKind, Format, MemoryDesc, Runtime, StreamKind};
//! use briny_dnn::desc::{Algorithm, EltwiseDesc, OpDesc, PropKind};
//!
//! let mut rt = Runtime::new();
//! let engine = rt.engine_create(EngineKind::Cpu, 0).unwrap();
//! let md = MemoryDesc::new(&[1, 3], DataType::F32, Format::Nc).unwrap();
//! let mem = rt.memory_primitive_desc_create(&md, engine).unwrap();
//! let op = OpDesc::Eltwise(
//!     EltwiseDesc::forward(PropKind::ForwardInference, Algorithm::EltwiseRelu, &md, 0.0).unwrap(),
//! );
//! let relu = rt.primitive_desc_create(&op, engine, None).unwrap();
//!
//! let (mut src, mut dst) = (vec![-1.0f32, 0.5, 2.0], vec![0.0f32; 3]);
//! let src_mem = rt.memory_primitive_create(mem).unwrap();
//! let dst_mem = rt.memory_primitive_create(mem).unwrap();
//! unsafe {
//!     rt.memory_set_data_handle(src_mem, src.as_mut_ptr().cast(), 12).unwrap();
//!     rt.memory_set_data_handle(dst_mem, dst.as_mut_ptr().cast(), 12).unwrap();
//! }
//! let p = rt.primitive_create(relu, &[src_mem.into()], &[dst_mem]).unwrap();
//!
//! let stream = rt.stream_create(StreamKind::Eager);
//! rt.stream_submit(stream, &[p]).unwrap();
//! rt.stream_wait(stream).unwrap();
//! assert_eq!(dst, vec![0.0, 0.5, 2.0]);
//! ```

pub mod desc;
pub mod engine;
pub mod error;
pub mod memory;
pub mod ops;
pub mod primitive;
pub mod primitive_desc;
pub mod registry;
pub mod reorder;
pub mod runtime;
pub mod stream;

pub use engine::{Engine, EngineKind, default_engine_kind, set_default_engine_kind};
pub use error::{DnnError, Result, Status};
pub use memory::{DataType, Format, MemoryDesc};
pub use primitive::{Primitive, PrimitiveAt};
pub use primitive_desc::{PrimitiveDesc, PrimitiveKind, QueryKind};
pub use registry::Handle;
pub use reorder::{ReorderDirection, ReorderPlan};
pub use runtime::{AnyHandle, Runtime, Scope};
pub use stream::{Stream, StreamKind, StreamState};
