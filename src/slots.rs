// SPDX-License-Identifier: AGPL-3.0-or-later

//! Global data-slot allocators (spec §9 "Global slot allocators").
//!
//! Independent subsystems that want to stash a piece of user data on every
//! [`crate::message::Message`] or [`crate::connection::BusConnection`]
//! without adding a field to either struct call [`SlotClass::allocate`]
//! once to reserve a numeric slot, then read/write that slot on any object
//! of the matching kind via its [`SlotTable`], and call
//! [`SlotClass::free`] when done. Slot numbers are reused once every
//! holder has freed them, via a bounded free list behind a single lock,
//! mirroring the source's `dbus_connection_allocate_data_slot`/
//! `dbus_connection_free_data_slot` pair (and the message-object
//! equivalent).

use std::{
    any::Any,
    collections::HashMap,
    sync::{Arc, Mutex},
};

/// A reserved slot number for one object kind (message or connection).
/// Multiple callers may allocate the same kind of slot concurrently; each
/// gets its own [`SlotId`] and must free it via the same [`SlotClass`] it
/// came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(u32);

#[derive(Default)]
struct SlotClassInner {
    next: u32,
    free: Vec<u32>,
    refcounts: HashMap<u32, u32>,
}

/// A process-wide allocator for one object kind. The daemon keeps one
/// instance per kind (see `message::MESSAGE_SLOTS` and
/// `connection::CONNECTION_SLOTS`) rather than one allocator shared across
/// kinds, since a message slot number carries no meaning on a connection
/// and vice versa.
#[derive(Default)]
pub struct SlotClass {
    inner: Mutex<SlotClassInner>,
}

impl SlotClass {
    /// Reserves a slot, recycling the lowest-numbered freed slot before
    /// growing the counter, matching the source's bounded free-list
    /// behaviour under repeated allocate/free cycles.
    pub fn allocate(&self) -> SlotId {
        let mut inner = self.inner.lock().expect("slot class lock poisoned");
        let id = match inner.free.pop() {
            Some(id) => id,
            None => {
                let id = inner.next;
                inner.next += 1;
                id
            },
        };
        *inner.refcounts.entry(id).or_insert(0) += 1;
        SlotId(id)
    }

    /// Releases one reference to `slot`. Once the refcount reaches zero
    /// the slot number returns to the free list and may be handed out
    /// again by a later `allocate()`.
    pub fn free(&self, slot: SlotId) {
        let mut inner = self.inner.lock().expect("slot class lock poisoned");
        if let Some(count) = inner.refcounts.get_mut(&slot.0) {
            *count -= 1;
            if *count == 0 {
                inner.refcounts.remove(&slot.0);
                inner.free.push(slot.0);
            }
        }
    }
}

/// Per-object storage backing the slots reserved via [`SlotClass`]. Every
/// [`crate::message::Message`] and [`crate::connection::BusConnection`]
/// owns one; values are type-erased since the allocator has no way to
/// know in advance what kind of data a given subsystem will store there.
#[derive(Default)]
pub struct SlotTable {
    values: Mutex<HashMap<u32, Arc<dyn Any + Send + Sync>>>,
}

impl SlotTable {
    pub fn set(&self, slot: SlotId, value: Arc<dyn Any + Send + Sync>) {
        self.values.lock().expect("slot table lock poisoned").insert(slot.0, value);
    }

    pub fn get(&self, slot: SlotId) -> Option<Arc<dyn Any + Send + Sync>> {
        self.values.lock().expect("slot table lock poisoned").get(&slot.0).cloned()
    }

    pub fn clear(&self, slot: SlotId) {
        self.values.lock().expect("slot table lock poisoned").remove(&slot.0);
    }
}

impl std::fmt::Debug for SlotTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let values = self.values.lock().expect("slot table lock poisoned");
        f.debug_struct("SlotTable").field("slots_in_use", &values.len()).finish()
    }
}
