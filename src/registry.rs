//! Resource handle registry.
//!
//! Every runtime object (engines, primitive descriptors, primitives and
//! streams) lives in an [`Arena`] and is referred to from the outside by a
//! typed, generation-checked [`Handle`]. Destroying a resource frees its slot
//! and bumps the slot generation, so any handle still pointing at it is
//! rejected with [`DnnError::UseAfterFree`] instead of touching freed state.
//!
//! Ownership is manual and single-owner: the runtime never reference counts.
//! Pair every create with exactly one destroy, or let a
//! [`Scope`](crate::runtime::Scope) do it for you.

use crate::error::{DnnError, Result};
use core::fmt;
use core::hash::{Hash, Hasher};
use core::marker::PhantomData;

/// A typed, copyable reference to a resource owned by a [`Runtime`](crate::Runtime).
pub struct Handle<T> {
    index: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    const fn new(index: u32, generation: u32) -> Self {
        Self {
            index,
            generation,
            _marker: PhantomData,
        }
    }

    /// Packs the handle into an opaque non-zero integer.
    ///
    /// `0` is never produced and stands for "no handle" at the flat boundary.
    pub fn into_raw(self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }

    /// Unpacks an integer produced by [`Handle::into_raw`].
    ///
    /// Returns `None` for the null handle. A forged or stale value is only
    /// detected when the handle is used.
    pub fn from_raw(raw: u64) -> Option<Self> {
        let generation = (raw >> 32) as u32;
        if generation == 0 {
            return None;
        }
        Some(Self::new(raw as u32, generation))
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}v{})", self.index, self.generation)
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Generation-checked slot storage.
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    live: usize,
    kind: &'static str,
}

impl<T> Arena<T> {
    /// Creates an empty arena; `kind` names the resource in errors and logs.
    pub fn new(kind: &'static str) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
            kind,
        }
    }

    /// Stores `value` and returns its handle.
    pub fn insert(&mut self, value: T) -> Handle<T> {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            debug_assert!(slot.value.is_none(), "free list points at a live slot");
            slot.value = Some(value);
            return Handle::new(index, slot.generation);
        }
        let index = u32::try_from(self.slots.len()).unwrap_or(u32::MAX);
        self.slots.push(Slot {
            generation: 1,
            value: Some(value),
        });
        Handle::new(index, 1)
    }

    /// Whether `handle` still refers to a live resource.
    pub fn contains(&self, handle: Handle<T>) -> bool {
        self.slots
            .get(handle.index as usize)
            .is_some_and(|slot| slot.generation == handle.generation && slot.value.is_some())
    }

    /// Shared access to a live resource.
    ///
    /// # Errors
    /// [`DnnError::UseAfterFree`] when the handle is stale.
    pub fn get(&self, handle: Handle<T>) -> Result<&T> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.value.as_ref())
            .ok_or(DnnError::UseAfterFree(self.kind))
    }

    /// Exclusive access to a live resource.
    ///
    /// # Errors
    /// [`DnnError::UseAfterFree`] when the handle is stale.
    pub fn get_mut(&mut self, handle: Handle<T>) -> Result<&mut T> {
        let kind = self.kind;
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.value.as_mut())
            .ok_or(DnnError::UseAfterFree(kind))
    }

    /// Releases a resource exactly once.
    ///
    /// # Errors
    /// [`DnnError::UseAfterFree`] on a second destroy or a forged handle.
    pub fn remove(&mut self, handle: Handle<T>) -> Result<T> {
        let kind = self.kind;
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .ok_or(DnnError::UseAfterFree(kind))?;
        let value = slot.value.take().ok_or(DnnError::UseAfterFree(kind))?;
        // generation 0 is reserved for the null raw handle
        slot.generation = slot.generation.checked_add(1).unwrap_or(1);
        self.free.push(handle.index);
        self.live -= 1;
        Ok(value)
    }

    /// Number of live resources.
    pub fn len(&self) -> usize {
        self.live
    }

    /// Whether no resource is live.
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Drops every live resource, returning how many there were.
    pub fn clear(&mut self) -> usize {
        let leaked = self.live;
        self.slots.clear();
        self.free.clear();
        self.live = 0;
        leaked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destroyed_handles_are_rejected() {
        let mut arena = Arena::new("thing");
        let h = arena.insert(5u32);
        assert_eq!(*arena.get(h).unwrap(), 5);
        assert_eq!(arena.remove(h).unwrap(), 5);
        assert_eq!(arena.get(h), Err(DnnError::UseAfterFree("thing")));
        assert_eq!(arena.remove(h), Err(DnnError::UseAfterFree("thing")));
        assert!(arena.is_empty());
    }

    #[test]
    fn reused_slots_get_a_new_generation() {
        let mut arena = Arena::new("thing");
        let old = arena.insert('a');
        arena.remove(old).unwrap();
        let new = arena.insert('b');
        assert_ne!(old, new);
        assert!(!arena.contains(old));
        assert_eq!(*arena.get(new).unwrap(), 'b');
    }

    #[test]
    fn raw_round_trip_never_yields_zero() {
        let mut arena = Arena::new("thing");
        let h = arena.insert(());
        let raw = h.into_raw();
        assert_ne!(raw, 0);
        assert_eq!(Handle::<()>::from_raw(raw), Some(h));
        assert_eq!(Handle::<()>::from_raw(0), None);
    }

    #[test]
    fn clear_reports_leaks() {
        let mut arena = Arena::new("thing");
        arena.insert(1);
        arena.insert(2);
        assert_eq!(arena.len(), 2);
        assert_eq!(arena.clear(), 2);
        assert_eq!(arena.len(), 0);
    }
}
