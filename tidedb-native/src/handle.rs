//! Generation-checked registry of objects handed across the boundary

use crate::error::NativeError;
use parking_lot::Mutex;

/// Opaque reference to a registered object.
///
/// The low 32 bits index a slot, the high 32 bits carry the slot's
/// generation at registration time. Generations start at 1, so 0 is never a
/// valid handle and can stand for "none" at the boundary.
pub type Handle = u64;

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

struct Slots<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    live: usize,
}

/// Thread-safe slab mapping handles to objects of one kind.
///
/// Removing an object bumps its slot's generation, so a stale handle to a
/// reused slot is rejected instead of reaching the new occupant.
pub struct HandleTable<T> {
    kind: &'static str,
    inner: Mutex<Slots<T>>,
}

impl<T: Clone> HandleTable<T> {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            inner: Mutex::new(Slots {
                slots: Vec::new(),
                free: Vec::new(),
                live: 0,
            }),
        }
    }

    pub fn insert(&self, value: T) -> Handle {
        let mut inner = self.inner.lock();
        inner.live += 1;
        let index = match inner.free.pop() {
            Some(index) => {
                inner.slots[index as usize].value = Some(value);
                index
            }
            None => {
                inner.slots.push(Slot {
                    generation: 1,
                    value: Some(value),
                });
                (inner.slots.len() - 1) as u32
            }
        };
        let generation = inner.slots[index as usize].generation;
        (u64::from(generation) << 32) | u64::from(index)
    }

    /// Clone of the object behind `handle`
    pub fn get(&self, handle: Handle) -> Result<T, NativeError> {
        let inner = self.inner.lock();
        let (index, generation) = split(handle);
        match inner.slots.get(index) {
            Some(Slot {
                generation: g,
                value: Some(value),
            }) if *g == generation => Ok(value.clone()),
            _ => Err(self.invalid(handle)),
        }
    }

    /// Like [`get`](Self::get), but 0 maps to `None`
    pub fn get_optional(&self, handle: Handle) -> Result<Option<T>, NativeError> {
        if handle == 0 {
            return Ok(None);
        }
        self.get(handle).map(Some)
    }

    /// Unregister `handle`, returning its object
    pub fn remove(&self, handle: Handle) -> Result<T, NativeError> {
        let mut inner = self.inner.lock();
        let (index, generation) = split(handle);
        let slot = match inner.slots.get_mut(index) {
            Some(slot) if slot.generation == generation && slot.value.is_some() => slot,
            _ => return Err(self.invalid(handle)),
        };
        let value = slot.value.take();
        // Skip 0 on wrap so handles stay non-zero
        slot.generation = slot.generation.checked_add(1).unwrap_or(1);
        inner.free.push(index as u32);
        inner.live -= 1;
        value.ok_or_else(|| self.invalid(handle))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().live
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn invalid(&self, handle: Handle) -> NativeError {
        NativeError::InvalidHandle {
            kind: self.kind,
            handle,
        }
    }
}

fn split(handle: Handle) -> (usize, u32) {
    ((handle & 0xFFFF_FFFF) as usize, (handle >> 32) as u32)
}
