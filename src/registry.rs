// SPDX-License-Identifier: AGPL-3.0-or-later

//! Unique-name allocation plus well-known-name ownership and pending
//! queues, backed by a `DashMap` keyed by connection identity, with a
//! generation counter for freshly-issued identities.

use std::sync::{
    Arc,
    atomic::{AtomicU32, AtomicU64, Ordering},
};

use bitflags::bitflags;
use dashmap::DashMap;

use crate::connection::ConnectionId;

bitflags! {
    /// Flags accepted by `RequestName`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RequestNameFlags: u32 {
        const ALLOW_REPLACEMENT = 0x1;
        const REPLACE_EXISTING  = 0x2;
        const DO_NOT_QUEUE      = 0x4;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestNameReply {
    PrimaryOwner,
    InQueue,
    Exists,
    AlreadyOwner,
}

impl RequestNameReply {
    pub fn code(self) -> u32 {
        match self {
            RequestNameReply::PrimaryOwner => 1,
            RequestNameReply::InQueue => 2,
            RequestNameReply::Exists => 3,
            RequestNameReply::AlreadyOwner => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseNameReply {
    Released,
    NonExistent,
    NotOwner,
}

impl ReleaseNameReply {
    pub fn code(self) -> u32 {
        match self {
            ReleaseNameReply::Released => 1,
            ReleaseNameReply::NonExistent => 2,
            ReleaseNameReply::NotOwner => 3,
        }
    }
}

/// A single pending or current requester of a well-known name.
#[derive(Debug, Clone)]
struct Requester {
    conn: ConnectionId,
    allow_replacement: bool,
    /// The `DO_NOT_QUEUE` flag this requester itself passed when it became
    /// owner or joined the queue — consulted if this requester is later
    /// displaced by a `REPLACE_EXISTING` request, per spec outcome 3
    /// ("not enqueued unless it also originally asked not to be removed").
    do_not_queue: bool,
}

#[derive(Debug, Clone, Default)]
struct NameEntry {
    owner: Option<Requester>,
    queue: Vec<Requester>,
}

/// An ownership change a caller must broadcast as `NameOwnerChanged` (and,
/// where applicable, `NameLost`/`NameAcquired`) after the registry call
/// returns. Kept as plain data so the registry itself never touches
/// connections or the router.
#[derive(Debug, Clone)]
pub struct OwnerChange {
    pub name: String,
    pub old_owner: Option<ConnectionId>,
    pub new_owner: Option<ConnectionId>,
}

/// Unique-name allocation plus well-known-name ownership.
#[derive(Debug)]
pub struct NameRegistry {
    generation: u64,
    next_serial: AtomicU32,
    names: DashMap<String, NameEntry>,
    /// Reverse index: every name a connection currently holds (owner or
    /// queued), so disconnect cleanup does not need to scan `names`.
    held_by: DashMap<ConnectionId, Vec<String>>,
}

impl NameRegistry {
    pub fn new(generation: u64) -> Self {
        Self {
            generation,
            next_serial: AtomicU32::new(1),
            names: DashMap::new(),
            held_by: DashMap::new(),
        }
    }

    /// Issues `:<generation>.<serial>`, the unique name handed out on
    /// successful authentication.
    pub fn allocate_unique_name(&self) -> String {
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        format!(":{}.{}", self.generation, serial)
    }

    pub fn current_owner(&self, name: &str) -> Option<ConnectionId> {
        self.names.get(name).and_then(|e| e.owner.as_ref().map(|r| r.conn))
    }

    pub fn has_owner(&self, name: &str) -> bool {
        self.current_owner(name).is_some()
    }

    pub fn list_names(&self) -> Vec<String> {
        self.names.iter().filter(|e| e.owner.is_some()).map(|e| e.key().clone()).collect()
    }

    /// Implements the five-outcome priority order for name ownership.
    pub fn request_name(
        &self,
        conn: ConnectionId,
        name: &str,
        flags: RequestNameFlags,
    ) -> (RequestNameReply, Option<OwnerChange>) {
        let mut entry = self.names.entry(name.to_owned()).or_default();

        match &entry.owner {
            None => {
                entry.owner = Some(Requester {
                    conn,
                    allow_replacement: flags.contains(RequestNameFlags::ALLOW_REPLACEMENT),
                    do_not_queue: flags.contains(RequestNameFlags::DO_NOT_QUEUE),
                });
                self.track_held(conn, name);
                (
                    RequestNameReply::PrimaryOwner,
                    Some(OwnerChange { name: name.to_owned(), old_owner: None, new_owner: Some(conn) }),
                )
            },
            Some(owner) if owner.conn == conn => (RequestNameReply::AlreadyOwner, None),
            Some(owner)
                if owner.allow_replacement && flags.contains(RequestNameFlags::REPLACE_EXISTING) =>
            {
                let displaced = owner.conn;
                let displaced_wants_requeue = !owner.do_not_queue;
                entry.owner = Some(Requester {
                    conn,
                    allow_replacement: flags.contains(RequestNameFlags::ALLOW_REPLACEMENT),
                    do_not_queue: flags.contains(RequestNameFlags::DO_NOT_QUEUE),
                });
                entry.queue.retain(|r| r.conn != displaced);
                if displaced_wants_requeue {
                    entry.queue.insert(0, Requester {
                        conn: displaced,
                        allow_replacement: true,
                        do_not_queue: false,
                    });
                }
                self.untrack_held(displaced, name);
                self.track_held(conn, name);
                (
                    RequestNameReply::PrimaryOwner,
                    Some(OwnerChange {
                        name: name.to_owned(),
                        old_owner: Some(displaced),
                        new_owner: Some(conn),
                    }),
                )
            },
            Some(_) if flags.contains(RequestNameFlags::DO_NOT_QUEUE) => {
                (RequestNameReply::Exists, None)
            },
            Some(_) => {
                if !entry.queue.iter().any(|r| r.conn == conn) {
                    entry.queue.push(Requester {
                        conn,
                        allow_replacement: flags.contains(RequestNameFlags::ALLOW_REPLACEMENT),
                        do_not_queue: flags.contains(RequestNameFlags::DO_NOT_QUEUE),
                    });
                    self.track_held(conn, name);
                }
                (RequestNameReply::InQueue, None)
            },
        }
    }

    /// `ReleaseName`: pops the queue head as new owner, or clears the
    /// entry; dequeues if the caller was only queued.
    pub fn release_name(&self, conn: ConnectionId, name: &str) -> (ReleaseNameReply, Option<OwnerChange>) {
        let Some(mut entry) = self.names.get_mut(name) else {
            return (ReleaseNameReply::NonExistent, None);
        };

        match &entry.owner {
            Some(owner) if owner.conn == conn => {
                self.untrack_held(conn, name);
                let new_owner = if entry.queue.is_empty() {
                    entry.owner = None;
                    None
                } else {
                    let next = entry.queue.remove(0);
                    let new = next.conn;
                    entry.owner = Some(next);
                    Some(new)
                };
                (
                    ReleaseNameReply::Released,
                    Some(OwnerChange { name: name.to_owned(), old_owner: Some(conn), new_owner }),
                )
            },
            Some(_) => {
                if entry.queue.iter().any(|r| r.conn == conn) {
                    entry.queue.retain(|r| r.conn != conn);
                    self.untrack_held(conn, name);
                    (ReleaseNameReply::Released, None)
                } else {
                    (ReleaseNameReply::NotOwner, None)
                }
            },
            None => (ReleaseNameReply::NonExistent, None),
        }
    }

    /// Releases every name `conn` held (owner or queued) on disconnect,
    /// returning one [`OwnerChange`] per name actually affected.
    pub fn disconnect(&self, conn: ConnectionId) -> Vec<OwnerChange> {
        let Some((_, held)) = self.held_by.remove(&conn) else {
            return Vec::new();
        };
        let mut changes = Vec::new();
        for name in held {
            let Some(mut entry) = self.names.get_mut(&name) else { continue };
            let is_owner = entry.owner.as_ref().map(|r| r.conn) == Some(conn);
            if is_owner {
                let new_owner = if entry.queue.is_empty() {
                    entry.owner = None;
                    None
                } else {
                    let next = entry.queue.remove(0);
                    let new = next.conn;
                    entry.owner = Some(next);
                    Some(new)
                };
                changes.push(OwnerChange { name: name.clone(), old_owner: Some(conn), new_owner });
            } else {
                entry.queue.retain(|r| r.conn != conn);
            }
        }
        changes
    }

    fn track_held(&self, conn: ConnectionId, name: &str) {
        let mut held = self.held_by.entry(conn).or_default();
        if !held.iter().any(|n| n == name) {
            held.push(name.to_owned());
        }
    }

    fn untrack_held(&self, conn: ConnectionId, name: &str) {
        if let Some(mut held) = self.held_by.get_mut(&conn) {
            held.retain(|n| n != name);
        }
    }
}

/// Monotonic daemon-generation stamp: reset every process start, folded
/// into every issued unique name so stale names from a prior daemon
/// incarnation can never collide with a live one.
pub fn new_generation() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    COUNTER.fetch_add(1, Ordering::Relaxed) + 1
}

/// Reads the last generation stamped into `path`, increments it, and writes
/// the new value back before returning it. Missing or unparseable content
/// starts the count at 1. This is what gives the "generation" in a unique
/// name its meaning across daemon restarts within the same data directory,
/// on top of the in-process counter `new_generation` provides for a single
/// run with no seed file configured.
pub fn next_generation_from_seed_file(path: &std::path::Path) -> std::io::Result<u64> {
    let previous = std::fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or(0);
    let next = previous + 1;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, next.to_string())?;
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u64) -> ConnectionId {
        ConnectionId::from_raw(n)
    }

    #[test]
    fn unique_names_are_monotonic_and_generation_tagged() {
        let reg = NameRegistry::new(3);
        assert_eq!(reg.allocate_unique_name(), ":3.1");
        assert_eq!(reg.allocate_unique_name(), ":3.2");
    }

    #[test]
    fn scenario_2_request_name_without_queue() {
        let reg = NameRegistry::new(1);
        let a = id(1);
        let b = id(2);
        let (reply_a, change_a) = reg.request_name(a, "org.example", RequestNameFlags::DO_NOT_QUEUE);
        assert_eq!(reply_a, RequestNameReply::PrimaryOwner);
        assert!(change_a.is_some());
        let (reply_b, change_b) = reg.request_name(b, "org.example", RequestNameFlags::DO_NOT_QUEUE);
        assert_eq!(reply_b, RequestNameReply::Exists);
        assert!(change_b.is_none());
    }

    #[test]
    fn scenario_3_replacement() {
        let reg = NameRegistry::new(1);
        let a = id(1);
        let b = id(2);
        reg.request_name(a, "org.example", RequestNameFlags::ALLOW_REPLACEMENT);
        let (reply, change) = reg.request_name(b, "org.example", RequestNameFlags::REPLACE_EXISTING);
        assert_eq!(reply, RequestNameReply::PrimaryOwner);
        let change = change.expect("ownership must transfer");
        assert_eq!(change.old_owner, Some(a));
        assert_eq!(change.new_owner, Some(b));
        assert_eq!(reg.current_owner("org.example"), Some(b));
    }

    #[test]
    fn displaced_owner_is_requeued_unless_it_asked_not_to_be() {
        let reg = NameRegistry::new(1);
        let a = id(1);
        let b = id(2);
        let c = id(3);

        // a becomes owner without DO_NOT_QUEUE, so it must rejoin the
        // queue (as the new head) when replaced.
        reg.request_name(a, "org.example", RequestNameFlags::ALLOW_REPLACEMENT);
        let (reply, _) = reg.request_name(b, "org.example", RequestNameFlags::REPLACE_EXISTING);
        assert_eq!(reply, RequestNameReply::PrimaryOwner);

        // c queues behind the requeued a.
        reg.request_name(c, "org.example", RequestNameFlags::empty());

        let (reply, change) = reg.release_name(b, "org.example");
        assert_eq!(reply, ReleaseNameReply::Released);
        let change = change.expect("queue head promoted");
        assert_eq!(change.new_owner, Some(a), "displaced owner a should have been requeued ahead of c");
        assert_eq!(reg.current_owner("org.example"), Some(a));
    }

    #[test]
    fn displaced_owner_with_do_not_queue_is_not_requeued() {
        let reg = NameRegistry::new(1);
        let a = id(1);
        let b = id(2);

        // a becomes owner with DO_NOT_QUEUE set on its own original call.
        reg.request_name(
            a,
            "org.example",
            RequestNameFlags::ALLOW_REPLACEMENT | RequestNameFlags::DO_NOT_QUEUE,
        );
        let (reply, _) = reg.request_name(b, "org.example", RequestNameFlags::REPLACE_EXISTING);
        assert_eq!(reply, RequestNameReply::PrimaryOwner);

        let (reply, change) = reg.release_name(b, "org.example");
        assert_eq!(reply, ReleaseNameReply::Released);
        assert!(change.expect("owner change recorded").new_owner.is_none(), "a opted out of requeueing");
        assert!(!reg.has_owner("org.example"));
    }

    #[test]
    fn queueing_when_not_do_not_queue() {
        let reg = NameRegistry::new(1);
        let a = id(1);
        let b = id(2);
        reg.request_name(a, "org.example", RequestNameFlags::empty());
        let (reply, change) = reg.request_name(b, "org.example", RequestNameFlags::empty());
        assert_eq!(reply, RequestNameReply::InQueue);
        assert!(change.is_none());
    }

    #[test]
    fn release_promotes_queue_head() {
        let reg = NameRegistry::new(1);
        let a = id(1);
        let b = id(2);
        reg.request_name(a, "org.example", RequestNameFlags::empty());
        reg.request_name(b, "org.example", RequestNameFlags::empty());
        let (reply, change) = reg.release_name(a, "org.example");
        assert_eq!(reply, ReleaseNameReply::Released);
        let change = change.expect("queue head promoted");
        assert_eq!(change.new_owner, Some(b));
        assert_eq!(reg.current_owner("org.example"), Some(b));
    }

    #[test]
    fn disconnect_cleans_up_every_held_name() {
        let reg = NameRegistry::new(1);
        let a = id(1);
        let b = id(2);
        reg.request_name(a, "org.example", RequestNameFlags::empty());
        reg.request_name(b, "org.example", RequestNameFlags::empty());
        let changes = reg.disconnect(a);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].new_owner, Some(b));
        assert_eq!(reg.current_owner("org.example"), Some(b));
    }

    #[test]
    fn invariant_at_most_one_owner_at_a_time() {
        let reg = NameRegistry::new(1);
        for n in 1..5u64 {
            reg.request_name(id(n), "org.example", RequestNameFlags::empty());
        }
        // Exactly the first requester is reported as current owner.
        assert_eq!(reg.current_owner("org.example"), Some(id(1)));
    }

    #[test]
    fn generation_seed_file_increments_across_calls() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("generation");
        assert_eq!(next_generation_from_seed_file(&path).expect("first"), 1);
        assert_eq!(next_generation_from_seed_file(&path).expect("second"), 2);
        assert_eq!(next_generation_from_seed_file(&path).expect("third"), 3);
    }

    #[test]
    fn generation_seed_file_creates_missing_parent_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("generation");
        assert_eq!(next_generation_from_seed_file(&path).expect("creates parent"), 1);
    }
}
