//! Host-owned handles into the engine heap.
//!
//! A handle is a slot in an ownership table keyed by a monotonically assigned
//! id, not a raw persistent pointer: release and double-release are table
//! operations with defined outcomes, and ids are never reused.
//!
//! Wrapped slots (host objects exposed into the engine) carry the host
//! pointer and follow a strong→weak lifecycle: a non-forced release
//! downgrades the persistent reference to a weak one whose finalizer enqueues
//! the slot on the [`SweepQueue`]; the next sweep releases the host pointer.

use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::BridgeError;

/// Identifier of a slot in the ownership table. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId(pub u64);

/// Discriminates plain engine values from host-object wrappers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    Plain,
    Wrapped,
}

/// The persistent reference held by a slot.
enum SlotRef {
    /// Keeps the engine value alive; the host owns the slot.
    Strong(v8::Global<v8::Value>),
    /// The host released the slot non-forced; the engine value is collectable
    /// and the weak finalizer reports when the host pointer may be reclaimed.
    Weak(#[allow(dead_code)] v8::Weak<v8::Value>),
}

pub(crate) struct Slot {
    value: SlotRef,
    kind: HandleKind,
    pub(crate) host_ptr: Option<*mut c_void>,
}

/// The per-context ownership table.
pub(crate) struct HandleArena {
    slots: HashMap<HandleId, Slot>,
    next_id: u64,
}

impl HandleArena {
    pub(crate) fn new() -> HandleArena {
        HandleArena {
            slots: HashMap::new(),
            next_id: 1,
        }
    }

    pub(crate) fn insert(
        &mut self,
        value: v8::Global<v8::Value>,
        kind: HandleKind,
        host_ptr: Option<*mut c_void>,
    ) -> HandleId {
        let id = HandleId(self.next_id);
        self.next_id += 1;
        self.slots.insert(
            id,
            Slot {
                value: SlotRef::Strong(value),
                kind,
                host_ptr,
            },
        );
        tracing::trace!("handle {:?} allocated ({:?})", id, kind);
        id
    }

    /// The strong persistent reference behind `id`.
    ///
    /// Downgraded slots are no longer host-visible; resolving one is the same
    /// error as resolving a released id.
    pub(crate) fn value(&self, id: HandleId) -> Result<&v8::Global<v8::Value>, BridgeError> {
        match self.slots.get(&id) {
            Some(Slot {
                value: SlotRef::Strong(global),
                ..
            }) => Ok(global),
            _ => Err(BridgeError::StaleHandle(id)),
        }
    }

    pub(crate) fn kind(&self, id: HandleId) -> Result<HandleKind, BridgeError> {
        match self.slots.get(&id) {
            Some(Slot {
                value: SlotRef::Strong(_),
                kind,
                ..
            }) => Ok(*kind),
            _ => Err(BridgeError::StaleHandle(id)),
        }
    }

    /// The host pointer owed by this slot, if it is the wrapper's owner.
    pub(crate) fn host_ptr(&self, id: HandleId) -> Result<Option<*mut c_void>, BridgeError> {
        match self.slots.get(&id) {
            Some(Slot {
                value: SlotRef::Strong(_),
                host_ptr,
                ..
            }) => Ok(*host_ptr),
            _ => Err(BridgeError::StaleHandle(id)),
        }
    }

    /// Remove a slot outright, returning it. Works on downgraded slots too,
    /// so the sweep can reclaim them.
    pub(crate) fn remove(&mut self, id: HandleId) -> Result<Slot, BridgeError> {
        let slot = self
            .slots
            .remove(&id)
            .ok_or(BridgeError::StaleHandle(id))?;
        tracing::trace!("handle {:?} removed", id);
        Ok(slot)
    }

    /// Replace a strong reference with its weak counterpart.
    pub(crate) fn downgrade(
        &mut self,
        id: HandleId,
        weak: v8::Weak<v8::Value>,
    ) -> Result<(), BridgeError> {
        let slot = self.slots.get_mut(&id).ok_or(BridgeError::StaleHandle(id))?;
        slot.value = SlotRef::Weak(weak);
        tracing::trace!("handle {:?} downgraded", id);
        Ok(())
    }

    /// Drain every slot; used by the disposal force-sweep.
    pub(crate) fn drain(&mut self) -> Vec<Slot> {
        self.slots.drain().map(|(_, slot)| slot).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }
}

/// Pending wrapper releases reported by weak finalizers.
///
/// Thread-safe because finalizers run from engine GC, not from the boundary
/// call path; the queue is drained by `gc()` and by disposal.
pub(crate) struct SweepQueue {
    pending: Mutex<Vec<HandleId>>,
    count: AtomicU64,
}

impl SweepQueue {
    pub(crate) fn new() -> Arc<SweepQueue> {
        Arc::new(SweepQueue {
            pending: Mutex::new(Vec::new()),
            count: AtomicU64::new(0),
        })
    }

    pub(crate) fn enqueue(&self, id: HandleId) {
        self.pending
            .lock()
            .expect("sweep queue poisoned")
            .push(id);
        self.count.fetch_add(1, Ordering::Release);
        tracing::trace!("wrapper {:?} queued for sweep", id);
    }

    pub(crate) fn has_pending(&self) -> bool {
        self.count.load(Ordering::Acquire) > 0
    }

    pub(crate) fn drain(&self) -> Vec<HandleId> {
        if !self.has_pending() {
            return Vec::new();
        }
        let drained: Vec<HandleId> = {
            let mut pending = self.pending.lock().expect("sweep queue poisoned");
            std::mem::take(&mut *pending)
        };
        self.count
            .fetch_sub(drained.len() as u64, Ordering::Release);
        drained
    }
}
