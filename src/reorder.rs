//! Format reconciliation.
//!
//! User buffers come in whatever layout the caller has; compiled primitives
//! want the layout they resolved. [`Runtime::prepare_reorder`] decides whether
//! a conversion is needed and, if so, builds the scratch memory and the
//! reorder primitive that bridge the two.

use crate::error::{DnnError, Result};
use crate::memory::MemoryDesc;
use crate::primitive::{Primitive, PrimitiveAt};
use crate::primitive_desc::PrimitiveDesc;
use crate::registry::Handle;
use crate::runtime::Runtime;

/// Which way data flows through an inserted reorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReorderDirection {
    /// User buffer feeds a primitive input.
    UserToPrimitive,
    /// Primitive output lands in a user buffer.
    PrimitiveToUser,
}

/// Scratch memory plus the reorder that fills or drains it.
///
/// Both handles are owned by the caller. Submit `reorder` before the consumer
/// for [`ReorderDirection::UserToPrimitive`] and after the producer for
/// [`ReorderDirection::PrimitiveToUser`]; bind `memory` in place of the user
/// memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReorderPlan {
    /// Memory in the primitive's layout.
    pub memory: Handle<Primitive>,
    /// Conversion between the user memory and `memory`.
    pub reorder: Handle<Primitive>,
}

impl Runtime {
    fn memory_desc_of(&self, pd: Handle<PrimitiveDesc>) -> Result<&MemoryDesc> {
        let pd = self.primitive_descs.get(pd)?;
        pd.memory_desc()
            .ok_or_else(|| DnnError::unsupported(format!("{:?} descriptor is not a memory descriptor", pd.kind())))
    }

    /// Whether two memory descriptors can share a buffer without conversion.
    ///
    /// Reflexive and symmetric.
    ///
    /// # Errors
    /// [`DnnError::UseAfterFree`] for destroyed handles and
    /// [`DnnError::UnsupportedConfiguration`] for non-memory descriptors.
    pub fn memory_primitive_desc_equal(&self, a: Handle<PrimitiveDesc>, b: Handle<PrimitiveDesc>) -> Result<bool> {
        Ok(self.memory_desc_of(a)?.physically_equal(self.memory_desc_of(b)?))
    }

    /// Reconciles `user_memory` with the layout `target` a primitive requires.
    ///
    /// Returns `Ok(None)` when the layouts are physically equal: bind the user
    /// memory directly. Otherwise returns a [`ReorderPlan`] whose scratch
    /// memory owns a zeroed buffer in the `target` layout.
    ///
    /// # Errors
    /// [`DnnError::ShapeMismatch`] when the logical extents differ,
    /// [`DnnError::ResourceExhaustion`] when the scratch buffer cannot be
    /// allocated, and [`DnnError::UseAfterFree`] for destroyed handles.
    pub fn prepare_reorder(
        &mut self,
        user_memory: Handle<Primitive>,
        target: Handle<PrimitiveDesc>,
        direction: ReorderDirection,
    ) -> Result<Option<ReorderPlan>> {
        let user_desc = self.primitives.get(user_memory)?.desc.clone();
        let user_md = user_desc
            .memory_desc()
            .ok_or_else(|| DnnError::InvalidState(format!("{user_memory:?} is not a memory primitive")))?;
        let target_md = self.memory_desc_of(target)?;
        if user_md.physically_equal(target_md) {
            log::debug!("zero-copy: {user_md} already matches {target_md}");
            return Ok(None);
        }
        log::debug!("reorder needed: {user_md} -> {target_md} ({direction:?})");

        let mut scope = self.scope();
        let memory = scope.memory_primitive_create(target)?;
        scope.memory_allocate(memory)?;
        let user_pd = scope.register_primitive_desc(user_desc);
        let reorder_pd = match direction {
            ReorderDirection::UserToPrimitive => scope.reorder_primitive_desc_create(user_pd, target)?,
            ReorderDirection::PrimitiveToUser => scope.reorder_primitive_desc_create(target, user_pd)?,
        };
        let reorder = match direction {
            ReorderDirection::UserToPrimitive => {
                scope.primitive_create(reorder_pd, &[PrimitiveAt::new(user_memory)], &[memory])?
            }
            ReorderDirection::PrimitiveToUser => {
                scope.primitive_create(reorder_pd, &[PrimitiveAt::new(memory)], &[user_memory])?
            }
        };
        // only the two primitives outlive the plan; they keep their own copies of the descriptors
        scope.primitive_desc_destroy(reorder_pd)?;
        scope.primitive_desc_destroy(user_pd)?;
        scope.commit();
        Ok(Some(ReorderPlan { memory, reorder }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineKind;
    use crate::memory::{DataType, Format};

    fn md(dims: &[i64], format: Format) -> MemoryDesc {
        MemoryDesc::new(dims, DataType::F32, format).unwrap()
    }

    #[test]
    fn equality_is_reflexive_and_symmetric() {
        let mut rt = Runtime::new();
        let engine = rt.engine_create(EngineKind::Cpu, 0).unwrap();
        let descs = [
            md(&[2, 16, 3, 3], Format::Nchw),
            md(&[2, 16, 3, 3], Format::NChw8c),
            md(&[2, 16, 3, 3], Format::Nhwc),
            md(&[2, 1, 3, 3], Format::Nchw),
            md(&[2, 1, 3, 3], Format::Nhwc),
        ];
        let pds: Vec<_> = descs
            .iter()
            .map(|d| rt.memory_primitive_desc_create(d, engine).unwrap())
            .collect();
        for &a in &pds {
            assert!(rt.memory_primitive_desc_equal(a, a).unwrap());
            for &b in &pds {
                assert_eq!(
                    rt.memory_primitive_desc_equal(a, b).unwrap(),
                    rt.memory_primitive_desc_equal(b, a).unwrap()
                );
            }
        }
        assert!(rt.memory_primitive_desc_equal(pds[3], pds[4]).unwrap());
        assert!(!rt.memory_primitive_desc_equal(pds[0], pds[1]).unwrap());
    }

    #[test]
    fn reconciling_a_reordered_buffer_again_is_zero_copy() {
        let mut rt = Runtime::new();
        let engine = rt.engine_create(EngineKind::Cpu, 0).unwrap();
        let user_pd = rt
            .memory_primitive_desc_create(&md(&[1, 8, 2, 2], Format::Nchw), engine)
            .unwrap();
        let target = rt
            .memory_primitive_desc_create(&md(&[1, 8, 2, 2], Format::NChw8c), engine)
            .unwrap();
        let user = rt.memory_primitive_create(user_pd).unwrap();
        let before = rt.live_handles();

        let plan = rt
            .prepare_reorder(user, target, ReorderDirection::UserToPrimitive)
            .unwrap()
            .unwrap();
        assert_eq!(rt.live_handles(), before + 2);
        assert_eq!(rt.memory_bytes(plan.memory).unwrap().len(), 8 * 2 * 2 * 4);
        assert!(rt
            .prepare_reorder(plan.memory, target, ReorderDirection::UserToPrimitive)
            .unwrap()
            .is_none());
    }

    #[test]
    fn mismatched_extents_leave_nothing_behind() {
        let mut rt = Runtime::new();
        let engine = rt.engine_create(EngineKind::Cpu, 0).unwrap();
        let user_pd = rt
            .memory_primitive_desc_create(&md(&[1, 8, 2, 2], Format::Nchw), engine)
            .unwrap();
        let target = rt
            .memory_primitive_desc_create(&md(&[1, 8, 4, 2], Format::NChw8c), engine)
            .unwrap();
        let user = rt.memory_primitive_create(user_pd).unwrap();
        let before = rt.live_handles();
        assert!(matches!(
            rt.prepare_reorder(user, target, ReorderDirection::PrimitiveToUser),
            Err(DnnError::ShapeMismatch(_))
        ));
        assert_eq!(rt.live_handles(), before);
    }
}
