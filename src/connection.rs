// SPDX-License-Identifier: AGPL-3.0-or-later

//! The per-peer glue object. Owns an outbound queue, an inbound queue, a
//! pending-reply table keyed by serial, registered match rules, and a
//! handler chain.
//!
//! A `DashMap`-backed per-request bookkeeping table plus `tokio::sync::mpsc`
//! channels hand bytes between the socket task and callers, keyed by serial
//! rather than a single in-flight request: `BusConnection` holds the
//! outbound queue the transport drains and the inbound queue the
//! router/dispatcher drains, since a bus peer can have many calls and
//! signals in flight at once instead of one blocking round trip.

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use once_cell::sync::Lazy;
use tokio::sync::{Notify, oneshot};
use tokio_util::sync::CancellationToken;

use crate::{
    error::BusError,
    message::Message,
    policy::Principal,
    slots::{SlotClass, SlotId, SlotTable},
};

/// Process-wide allocator for [`BusConnection`] user-data slots (spec §9
/// "Global slot allocators"), the connection-kind counterpart of
/// `message::MESSAGE_SLOTS`.
pub static CONNECTION_SLOTS: Lazy<SlotClass> = Lazy::new(SlotClass::default);

/// Identifies a connection for the lifetime of the daemon process. Cheap to
/// copy, used as a map key by the name registry and router instead of a raw
/// `Arc<BusConnection>` so neither needs to hold the other alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn from_raw(v: u64) -> Self {
        Self(v)
    }

    pub fn as_raw(self) -> u64 {
        self.0
    }
}

/// Allocates process-unique [`ConnectionId`]s, one per accepted peer.
#[derive(Debug, Default)]
pub struct ConnectionIdAllocator {
    next: AtomicU64,
}

impl ConnectionIdAllocator {
    pub fn next(&self) -> ConnectionId {
        ConnectionId(self.next.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

/// A single conjunctive match rule, per the router's `AddMatch`/`RemoveMatch`.
/// An absent field means "match any" field, mirroring the policy engine's
/// wildcard convention.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchRule {
    pub message_type: Option<String>,
    pub sender: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub destination: Option<String>,
    pub path: Option<String>,
}

impl MatchRule {
    pub fn matches(&self, msg: &Message) -> bool {
        let name_ok = match (&self.interface, &self.member) {
            (None, None) => true,
            _ => {
                let full = msg.name().unwrap_or_default();
                let (iface, member) = full.rsplit_once('.').unwrap_or(("", full));
                self.interface.as_deref().is_none_or(|i| i == iface)
                    && self.member.as_deref().is_none_or(|m| m == member)
            },
        };
        name_ok
            && self.sender.as_deref().is_none_or(|s| msg.sender() == Some(s))
            && self.destination.as_deref().is_none_or(|d| msg.destination() == Some(d))
    }

    /// Parses the flat `key1='val1',key2='val2'` rule-text grammar used by
    /// `AddMatch`/`RemoveMatch`.
    pub fn parse(rule_text: &str) -> Result<Self, BusError> {
        let mut rule = MatchRule::default();
        for clause in rule_text.split(',') {
            let clause = clause.trim();
            if clause.is_empty() {
                continue;
            }
            let (key, value) = clause
                .split_once('=')
                .ok_or_else(|| BusError::InvalidArgs(format!("malformed match clause: {clause}")))?;
            let value = value.trim_matches('\'').to_owned();
            match key.trim() {
                "type" => rule.message_type = Some(value),
                "sender" => rule.sender = Some(value),
                "interface" => rule.interface = Some(value),
                "member" => rule.member = Some(value),
                "destination" => rule.destination = Some(value),
                "path" => rule.path = Some(value),
                other => return Err(BusError::InvalidArgs(format!("unknown match key: {other}"))),
            }
        }
        Ok(rule)
    }
}

/// Resource caps enforced per connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionLimits {
    pub max_pending_replies: usize,
    pub max_match_rules: usize,
    pub max_outbound_bytes: u64,
    /// Largest complete envelope (header + body) the transport will
    /// reassemble before failing the connection.
    pub max_message_size: usize,
    /// Per-message cap on passed file descriptors. SCM_RIGHTS passing is a
    /// platform-specific primitive this crate does not implement (out of
    /// scope); the field exists so a config that names the cap is
    /// not silently dropped, and any future FD-passing transport has
    /// somewhere to read it from.
    pub max_fds_per_message: usize,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            max_pending_replies: 128,
            max_match_rules: 512,
            max_outbound_bytes: 128 * 1024 * 1024,
            max_message_size: 64 * 1024 * 1024,
            max_fds_per_message: 16,
        }
    }
}

bitflags::bitflags! {
    /// Readiness condition a watch is registered or reported for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WatchFlags: u32 {
        const READABLE = 0x1;
        const WRITABLE = 0x2;
    }
}

bitflags::bitflags! {
    /// Flags to `BusConnection::do_iteration`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IterationFlags: u32 {
        const DO_READING = 0x1;
        const DO_WRITING = 0x2;
        const BLOCK = 0x4;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeoutId(u64);

#[derive(Debug, Clone, Copy)]
pub struct Watch {
    pub id: WatchId,
    pub flags: WatchFlags,
}

#[derive(Debug, Clone, Copy)]
pub struct TimeoutSpec {
    pub id: TimeoutId,
    pub interval_ms: u64,
}

/// The host poller's add/remove/toggle callbacks for watches, registered
/// once via [`BusConnection::set_watch_functions`]. This crate's own host
/// (`transport`/`server`) never implements this trait — `tokio`'s
/// readiness-driven I/O already satisfies the same non-blocking-core
/// requirement — but an fd-based host could plug its own event loop in
/// here instead.
pub trait WatchFunctions: Send + Sync {
    fn add_watch(&self, watch: Watch) -> bool;
    fn remove_watch(&self, id: WatchId);
    fn toggle_watch(&self, id: WatchId, enabled: bool);
}

/// The host poller's add/remove/toggle callbacks for timeouts, registered
/// once via [`BusConnection::set_timeout_functions`].
pub trait TimeoutFunctions: Send + Sync {
    fn add_timeout(&self, timeout: TimeoutSpec) -> bool;
    fn remove_timeout(&self, id: TimeoutId);
    fn toggle_timeout(&self, id: TimeoutId, enabled: bool);
}

type ReplyHandler = Box<dyn FnOnce(Option<Message>) + Send>;

struct PendingReply {
    handler: ReplyHandler,
    _timeout_task: Option<tokio::task::JoinHandle<()>>,
}

/// Per-peer object: everything the router and the bus service interface
/// need to know about one authenticated client.
pub struct BusConnection {
    pub id: ConnectionId,
    unique_name: arc_swap_like::OnceBox<String>,
    principal: arc_swap_like::OnceBox<Principal>,

    outbound: tokio::sync::mpsc::UnboundedSender<Message>,
    inbound: std::sync::Mutex<VecDeque<Message>>,
    inbound_notify: Notify,

    next_serial: AtomicU32,
    pending_replies: DashMap<u32, PendingReply>,
    match_rules: std::sync::Mutex<Vec<MatchRule>>,

    outbound_bytes: AtomicU64,
    disconnected: AtomicBool,
    limits: ConnectionLimits,

    watch_functions: std::sync::Mutex<Option<Arc<dyn WatchFunctions>>>,
    timeout_functions: std::sync::Mutex<Option<Arc<dyn TimeoutFunctions>>>,
    write_watch: std::sync::Mutex<Option<Watch>>,
    next_watch_id: AtomicU64,

    user_data: SlotTable,

    /// Cancelled exactly once, by [`Self::mark_disconnected`]. The transport's
    /// write loop selects on this alongside the outbound channel so it exits
    /// as soon as the read half sees EOF, instead of blocking forever on
    /// `outbound_rx.recv()` while this connection is still held alive in the
    /// router's connection table.
    shutdown: CancellationToken,
}

/// A tiny "set at most once" cell. `once_cell::sync::OnceCell` would do the
/// same job; this crate already depends on it elsewhere, so `BusConnection`
/// uses it directly below — this module alias exists purely so the two
/// identity slots (`unique_name`, `principal`) read as a distinct concept
/// from the rest of the struct's fields.
mod arc_swap_like {
    pub type OnceBox<T> = once_cell::sync::OnceCell<T>;
}

impl BusConnection {
    pub fn new(
        id: ConnectionId,
        outbound: tokio::sync::mpsc::UnboundedSender<Message>,
        limits: ConnectionLimits,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            unique_name: once_cell::sync::OnceCell::new(),
            principal: once_cell::sync::OnceCell::new(),
            outbound,
            inbound: std::sync::Mutex::new(VecDeque::new()),
            inbound_notify: Notify::new(),
            next_serial: AtomicU32::new(1),
            pending_replies: DashMap::new(),
            match_rules: std::sync::Mutex::new(Vec::new()),
            outbound_bytes: AtomicU64::new(0),
            disconnected: AtomicBool::new(false),
            limits,
            watch_functions: std::sync::Mutex::new(None),
            timeout_functions: std::sync::Mutex::new(None),
            write_watch: std::sync::Mutex::new(None),
            next_watch_id: AtomicU64::new(0),
            user_data: SlotTable::default(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Reads a subsystem's user-data slot on this connection, if it ever
    /// set one. `slot` must come from [`CONNECTION_SLOTS`].
    pub fn slot_data(&self, slot: SlotId) -> Option<Arc<dyn std::any::Any + Send + Sync>> {
        self.user_data.get(slot)
    }

    /// Stores a subsystem's user-data slot on this connection. `slot` must
    /// come from [`CONNECTION_SLOTS`].
    pub fn set_slot_data(&self, slot: SlotId, value: Arc<dyn std::any::Any + Send + Sync>) {
        self.user_data.set(slot, value);
    }

    pub fn unique_name(&self) -> Option<&str> {
        self.unique_name.get().map(String::as_str)
    }

    /// Assigns the unique name on successful authentication. Idempotent:
    /// returns `false` if a name was already set.
    pub fn set_unique_name(&self, name: String) -> bool {
        self.unique_name.set(name).is_ok()
    }

    pub fn principal(&self) -> Option<Principal> {
        self.principal.get().cloned()
    }

    pub fn set_principal(&self, principal: Principal) -> bool {
        self.principal.set(principal).is_ok()
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    pub fn limits(&self) -> ConnectionLimits {
        self.limits
    }

    pub fn mark_disconnected(&self) {
        self.disconnected.store(true, Ordering::Release);
        self.shutdown.cancel();
        let serials: Vec<u32> = self.pending_replies.iter().map(|e| *e.key()).collect();
        for serial in serials {
            if let Some((_, pending)) = self.pending_replies.remove(&serial) {
                (pending.handler)(None);
            }
        }
    }

    /// Resolves once [`Self::mark_disconnected`] has run. Used by the
    /// transport's write loop to stop draining the outbound queue as soon as
    /// the read half ends, rather than waiting on a channel that stays open
    /// for as long as this connection is reachable from the router.
    pub async fn cancelled(&self) {
        self.shutdown.cancelled().await
    }

    /// Assigns the next serial (never zero, strictly increasing per
    /// connection).
    pub fn next_serial(&self) -> u32 {
        self.next_serial.fetch_add(1, Ordering::Relaxed)
    }

    /// `send(message) -> serial`: assigns a serial if unset, pushes onto the
    /// outbound queue. Fails only with a resource-limit or disconnection
    /// error.
    pub fn send(&self, message: Message) -> Result<u32, BusError> {
        if self.is_disconnected() {
            return Err(BusError::Disconnected(format!("connection {:?} is closed", self.id)));
        }
        let encoded_len = message.encode().map(|b| b.len() as u64).unwrap_or(0);
        if self.outbound_bytes.load(Ordering::Relaxed) + encoded_len > self.limits.max_outbound_bytes {
            return Err(BusError::LimitsExceeded(format!(
                "outbound byte cap ({} bytes) exceeded for connection {:?}",
                self.limits.max_outbound_bytes, self.id
            )));
        }
        if message.serial() == 0 {
            let serial = self.next_serial();
            let _ = message.assign_serial(serial);
        }
        let serial = message.serial();
        self.outbound_bytes.fetch_add(encoded_len, Ordering::Relaxed);
        self.outbound
            .send(message)
            .map_err(|_| BusError::Disconnected(format!("connection {:?} is closed", self.id)))?;
        Ok(serial)
    }

    /// `send_with_reply`: as [`Self::send`], plus registers a pending-reply
    /// record keyed by serial. The handler fires with `Some(reply)` when a
    /// matching `rply` arrives, or with `None` on cancellation/timeout.
    pub fn send_with_reply(
        self: &Arc<Self>,
        message: Message,
        handler: impl FnOnce(Option<Message>) + Send + 'static,
        timeout_ms: u64,
    ) -> Result<u32, BusError> {
        if self.pending_replies.len() >= self.limits.max_pending_replies {
            return Err(BusError::LimitsExceeded(format!(
                "max pending replies ({}) exceeded for connection {:?}",
                self.limits.max_pending_replies, self.id
            )));
        }
        let serial = self.send(message)?;

        let this = Arc::clone(self);
        let timeout_task = if timeout_ms > 0 {
            Some(tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
                this.cancel_pending_reply(serial);
            }))
        } else {
            None
        };

        self.pending_replies.insert(
            serial,
            PendingReply { handler: Box::new(handler), _timeout_task: timeout_task },
        );
        Ok(serial)
    }

    /// Delivers an inbound reply to its matching pending-reply handler, if
    /// one is still registered. Returns `true` if delivered.
    pub fn complete_pending_reply(&self, reply: Message) -> bool {
        let Some(serial) = reply.reply_serial() else { return false };
        if let Some((_, pending)) = self.pending_replies.remove(&serial) {
            (pending.handler)(Some(reply));
            true
        } else {
            false
        }
    }

    /// Cancels a pending reply by serial, invoking its handler with a
    /// synthetic `None` (the caller interprets this as `Cancelled`/timeout).
    pub fn cancel_pending_reply(&self, serial: u32) -> bool {
        if let Some((_, pending)) = self.pending_replies.remove(&serial) {
            (pending.handler)(None);
            true
        } else {
            false
        }
    }

    pub fn push_inbound(&self, message: Message) {
        self.inbound.lock().expect("inbound queue lock poisoned").push_back(message);
        self.inbound_notify.notify_waiters();
    }

    /// `pop_message()`: takes the head of the inbound queue, `None` if
    /// empty.
    pub fn pop_message(&self) -> Option<Message> {
        self.inbound.lock().expect("inbound queue lock poisoned").pop_front()
    }

    /// Blocks until a message is available or the connection disconnects.
    pub async fn pop_message_blocking(&self) -> Option<Message> {
        loop {
            if let Some(m) = self.pop_message() {
                return Some(m);
            }
            if self.is_disconnected() {
                return None;
            }
            self.inbound_notify.notified().await;
        }
    }

    pub fn add_match(&self, rule: MatchRule) -> Result<(), BusError> {
        let mut rules = self.match_rules.lock().expect("match rule lock poisoned");
        if rules.len() >= self.limits.max_match_rules {
            return Err(BusError::LimitsExceeded(format!(
                "max match rules ({}) exceeded for connection {:?}",
                self.limits.max_match_rules, self.id
            )));
        }
        if !rules.contains(&rule) {
            rules.push(rule);
        }
        Ok(())
    }

    pub fn remove_match(&self, rule: &MatchRule) {
        self.match_rules.lock().expect("match rule lock poisoned").retain(|r| r != rule);
    }

    pub fn matches_signal(&self, msg: &Message) -> bool {
        self.match_rules.lock().expect("match rule lock poisoned").iter().any(|r| r.matches(msg))
    }

    pub fn account_outbound_drained(&self, bytes: u64) {
        self.outbound_bytes.fetch_sub(bytes.min(self.outbound_bytes.load(Ordering::Relaxed)), Ordering::Relaxed);
    }
}

impl std::fmt::Debug for BusConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusConnection")
            .field("id", &self.id)
            .field("unique_name", &self.unique_name())
            .field("disconnected", &self.is_disconnected())
            .finish()
    }
}

/// Result of running a message through the filter/handler chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerResult {
    Handled,
    NotYetHandled,
    NeedMemory,
    RemoveMessage,
}

/// A one-shot channel pairing used by callers that want to `await` a reply
/// rather than register a closure, layered on top of
/// [`BusConnection::send_with_reply`].
pub fn oneshot_reply_handler() -> (impl FnOnce(Option<Message>) + Send + 'static, oneshot::Receiver<Option<Message>>)
{
    let (tx, rx) = oneshot::channel();
    (
        move |reply: Option<Message>| {
            let _ = tx.send(reply);
        },
        rx,
    )
}
