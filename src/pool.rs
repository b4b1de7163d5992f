//! Generational handle pool for runtime objects.
//!
//! A [`Pool`] stores values in a growable slot arena. Each insertion returns a
//! reference-counted [`Handle`] that pins the value in place; the value is
//! dropped and the slot recycled when the last handle goes away. Every slot
//! carries a generation counter, so a packed [`RawHandle`] that outlives its
//! value resolves to `None` instead of aliasing the slot's next occupant.

use std::{
    fmt::Debug,
    ops::{Deref, DerefMut},
    sync::{
        Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard,
        atomic::{AtomicU32, Ordering},
    },
};

/// A packed slot index and generation, suitable for storage in GPU-visible
/// data or FFI boundaries. Upgrade back with [`Pool::get`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawHandle(u64);
impl RawHandle {
    fn new(index: u32, generation: u32) -> Self {
        Self((generation as u64) << 32 | index as u64)
    }
    pub fn index(&self) -> u32 {
        self.0 as u32
    }
    pub fn generation(&self) -> u32 {
        (self.0 >> 32) as u32
    }
    pub fn as_raw(&self) -> u64 {
        self.0
    }
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}
impl Debug for RawHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawHandle")
            .field("index", &self.index())
            .field("generation", &self.generation())
            .finish()
    }
}

struct Slot<T> {
    value: RwLock<Option<T>>,
    generation: AtomicU32,
    refs: AtomicU32,
}

struct PoolInner<T> {
    slots: RwLock<Vec<Arc<Slot<T>>>>,
    free: Mutex<Vec<u32>>,
}

/// A slot arena handing out generational, reference-counted handles.
pub struct Pool<T>(Arc<PoolInner<T>>);
impl<T> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}
impl<T> Default for Pool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Pool<T> {
    pub fn new() -> Self {
        Self(Arc::new(PoolInner {
            slots: RwLock::new(Vec::new()),
            free: Mutex::new(Vec::new()),
        }))
    }

    /// Stores a value and returns the sole handle to it.
    pub fn insert(&self, value: T) -> Handle<T> {
        let recycled = self.0.free.lock().unwrap().pop();
        if let Some(index) = recycled {
            let slot = self.0.slots.read().unwrap()[index as usize].clone();
            *slot.value.write().unwrap() = Some(value);
            slot.refs.store(1, Ordering::Release);
            let generation = slot.generation.load(Ordering::Acquire);
            return Handle {
                pool: self.clone(),
                slot,
                index,
                generation,
            };
        }
        let slot = Arc::new(Slot {
            value: RwLock::new(Some(value)),
            generation: AtomicU32::new(0),
            refs: AtomicU32::new(1),
        });
        let mut slots = self.0.slots.write().unwrap();
        let index = slots.len() as u32;
        slots.push(slot.clone());
        Handle {
            pool: self.clone(),
            slot,
            index,
            generation: 0,
        }
    }

    /// Upgrades a packed handle. Returns `None` if the slot was recycled
    /// since the raw handle was produced.
    pub fn get(&self, raw: RawHandle) -> Option<Handle<T>> {
        let slots = self.0.slots.read().unwrap();
        let slot = slots.get(raw.index() as usize)?.clone();
        drop(slots);
        if slot.generation.load(Ordering::Acquire) != raw.generation() {
            return None;
        }
        // Revive only while other handles keep the value alive.
        let mut refs = slot.refs.load(Ordering::Acquire);
        loop {
            if refs == 0 {
                return None;
            }
            match slot.refs.compare_exchange_weak(
                refs,
                refs + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => refs = actual,
            }
        }
        if slot.generation.load(Ordering::Acquire) != raw.generation() {
            // Lost the race against the final drop.
            slot.refs.fetch_sub(1, Ordering::AcqRel);
            return None;
        }
        Some(Handle {
            pool: self.clone(),
            slot,
            index: raw.index(),
            generation: raw.generation(),
        })
    }

    /// Number of currently occupied slots.
    pub fn len(&self) -> usize {
        let total = self.0.slots.read().unwrap().len();
        let free = self.0.free.lock().unwrap().len();
        total - free
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A reference-counted handle to a pooled value.
///
/// Cloning bumps the refcount; dropping the last clone destroys the value in
/// place, bumps the slot generation, and returns the slot to the free list.
pub struct Handle<T> {
    pool: Pool<T>,
    slot: Arc<Slot<T>>,
    index: u32,
    generation: u32,
}

impl<T> Handle<T> {
    pub fn raw(&self) -> RawHandle {
        RawHandle::new(self.index, self.generation)
    }

    /// Shared accessor. Multiple readers may hold this concurrently.
    pub fn read(&self) -> PoolRead<'_, T> {
        PoolRead {
            guard: self.slot.value.read().unwrap(),
        }
    }

    /// Exclusive accessor.
    pub fn write(&self) -> PoolWrite<'_, T> {
        PoolWrite {
            guard: self.slot.value.write().unwrap(),
        }
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        self.slot.refs.fetch_add(1, Ordering::AcqRel);
        Self {
            pool: self.pool.clone(),
            slot: self.slot.clone(),
            index: self.index,
            generation: self.generation,
        }
    }
}

impl<T> Drop for Handle<T> {
    fn drop(&mut self) {
        if self.slot.refs.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        // Last handle. Drop the value, retire the generation, recycle the slot.
        *self.slot.value.write().unwrap() = None;
        self.slot.generation.fetch_add(1, Ordering::AcqRel);
        self.pool.0.free.lock().unwrap().push(self.index);
    }
}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot) && self.generation == other.generation
    }
}
impl<T> Eq for Handle<T> {}

/// Shared read guard over a pooled value.
pub struct PoolRead<'a, T> {
    guard: RwLockReadGuard<'a, Option<T>>,
}
impl<'a, T> Deref for PoolRead<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // A live Handle keeps the slot occupied.
        self.guard.as_ref().unwrap()
    }
}

/// Exclusive write guard over a pooled value.
pub struct PoolWrite<'a, T> {
    guard: RwLockWriteGuard<'a, Option<T>>,
}
impl<'a, T> Deref for PoolWrite<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.guard.as_ref().unwrap()
    }
}
impl<'a, T> DerefMut for PoolWrite<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.as_mut().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_read_write() {
        let pool: Pool<u32> = Pool::new();
        let handle = pool.insert(7);
        assert_eq!(*handle.read(), 7);
        *handle.write() = 8;
        assert_eq!(*handle.read(), 8);
    }

    #[test]
    fn test_clone_keeps_alive() {
        let pool: Pool<String> = Pool::new();
        let a = pool.insert("hello".to_string());
        let b = a.clone();
        drop(a);
        assert_eq!(*b.read(), "hello");
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_last_drop_frees_slot() {
        let pool: Pool<u32> = Pool::new();
        let a = pool.insert(1);
        let raw = a.raw();
        drop(a);
        assert_eq!(pool.len(), 0);
        assert!(pool.get(raw).is_none());
    }

    #[test]
    fn test_stale_raw_handle_after_reuse() {
        let pool: Pool<u32> = Pool::new();
        let a = pool.insert(1);
        let stale = a.raw();
        drop(a);
        let b = pool.insert(2);
        // Slot index was reused, but the generation moved on.
        assert_eq!(b.raw().index(), stale.index());
        assert!(pool.get(stale).is_none());
        assert_eq!(*pool.get(b.raw()).unwrap().read(), 2);
    }

    #[test]
    fn test_raw_roundtrip() {
        let pool: Pool<u32> = Pool::new();
        let a = pool.insert(42);
        let packed = a.raw().as_raw();
        let restored = pool.get(RawHandle::from_raw(packed)).unwrap();
        assert_eq!(*restored.read(), 42);
        assert!(restored == a);
    }

    #[test]
    fn test_get_bumps_refcount() {
        let pool: Pool<u32> = Pool::new();
        let a = pool.insert(9);
        let b = pool.get(a.raw()).unwrap();
        drop(a);
        assert_eq!(*b.read(), 9);
    }
}
