// SPDX-License-Identifier: AGPL-3.0-or-later

//! The message object (C2): a header + body container with a builder for
//! outgoing messages and an immutable, cheaply-clonable type for messages
//! that have been handed to a connection or received off the wire.
//!
//! The split between [`MessageBuilder`] (mutable, single-owner) and
//! [`Message`] (immutable once built, `Arc`-shared) follows the
//! builder-then-freeze shape used elsewhere for wire types with a
//! mutable assembly phase and an immutable, cheaply-cloned send/receive
//! phase: rather than a runtime `IMMUTABLE` error on a wrongly-timed
//! mutation, construction-vs-use is encoded in the type. `ref`/`unref`
//! fall out of `Clone`/`Drop` on `Message` instead of being reinvented as
//! named methods.

use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

use bytes::{Bytes, BytesMut};
use once_cell::sync::Lazy;

use crate::{
    slots::{SlotClass, SlotId, SlotTable},
    wire::{
        CodecError, Cursor, Endian,
        codec::{append_value, parse_value, pad_to, set_u32_at},
        value::Value,
    },
};

/// Process-wide allocator for [`Message`] user-data slots (spec §9
/// "Global slot allocators"). Subsystems that want to tag every message
/// passing through the bus with their own bookkeeping reserve a slot here
/// once via [`SlotClass::allocate`] and read/write it through
/// [`Message::slot_data`]/[`Message::set_slot_data`].
pub static MESSAGE_SLOTS: Lazy<SlotClass> = Lazy::new(SlotClass::default);

pub const FIELD_NAME: [u8; 4] = *b"name";
pub const FIELD_SERVICE: [u8; 4] = *b"srvc";
pub const FIELD_SENDER: [u8; 4] = *b"sndr";
pub const FIELD_REPLY_SERIAL: [u8; 4] = *b"rply";
pub const FIELD_ERROR_NAME: [u8; 4] = *b"errn";

pub const BOM_LITTLE: u8 = b'l';
pub const BOM_BIG: u8 = b'B';

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("message too short for preamble")]
    ShortPreamble,
    #[error("unknown byte-order marker: 0x{0:02x}")]
    UnknownByteOrder(u8),
    #[error("header not padded to 8-byte boundary")]
    UnalignedHeader,
}

fn endian_for_bom(bom: u8) -> Result<Endian, MessageError> {
    match bom {
        BOM_LITTLE => Ok(Endian::Little),
        BOM_BIG => Ok(Endian::Big),
        other => Err(MessageError::UnknownByteOrder(other)),
    }
}

fn bom_for_endian(endian: Endian) -> u8 {
    match endian {
        Endian::Little => BOM_LITTLE,
        Endian::Big => BOM_BIG,
    }
}

/// Mutable, single-owner message under construction. Not yet assigned a
/// serial: the connection that ultimately sends it stamps the serial
/// exactly once, at which point the message is frozen into a [`Message`].
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    header_fields: Vec<([u8; 4], Value)>,
    body: Vec<Value>,
}

impl MessageBuilder {
    /// Allocates a new outgoing message, stamping the `name` and `srvc`
    /// header fields.
    pub fn new(name: &str, destination: &str) -> Self {
        Self {
            header_fields: vec![
                (FIELD_NAME, Value::String(name.to_owned())),
                (FIELD_SERVICE, Value::String(destination.to_owned())),
            ],
            body: Vec::new(),
        }
    }

    /// A reply to `original`: destination is `original`'s sender, `rply` is
    /// `original`'s serial.
    pub fn new_reply(original: &Message) -> Self {
        let mut b = Self { header_fields: Vec::new(), body: Vec::new() };
        if let Some(sender) = original.sender() {
            b.header_fields.push((FIELD_SERVICE, Value::String(sender.to_owned())));
        }
        b.header_fields.push((FIELD_REPLY_SERIAL, Value::Uint32(original.serial())));
        b
    }

    /// An error reply to `original`: as `new_reply`, plus `errn` and a
    /// single string argument carrying `text`.
    pub fn new_error_reply(original: &Message, error_name: &str, text: &str) -> Self {
        let mut b = Self::new_reply(original);
        b.header_fields.push((FIELD_ERROR_NAME, Value::String(error_name.to_owned())));
        b.body.push(Value::String(text.to_owned()));
        b
    }

    pub fn set_sender(&mut self, sender: &str) -> &mut Self {
        self.set_field(FIELD_SENDER, Value::String(sender.to_owned()));
        self
    }

    pub fn set_field(&mut self, tag: [u8; 4], value: Value) {
        if let Some(existing) = self.header_fields.iter_mut().find(|(t, _)| *t == tag) {
            existing.1 = value;
        } else {
            self.header_fields.push((tag, value));
        }
    }

    pub fn field(&self, tag: [u8; 4]) -> Option<&Value> {
        self.header_fields.iter().find(|(t, _)| *t == tag).map(|(_, v)| v)
    }

    pub fn name(&self) -> Option<&str> {
        self.field(FIELD_NAME).and_then(Value::as_str)
    }

    pub fn destination(&self) -> Option<&str> {
        self.field(FIELD_SERVICE).and_then(Value::as_str)
    }

    pub fn append_arg(&mut self, value: Value) -> &mut Self {
        self.body.push(value);
        self
    }

    pub fn append_args<I: IntoIterator<Item = Value>>(&mut self, values: I) -> &mut Self {
        self.body.extend(values);
        self
    }

    /// Freezes the builder into an immutable [`Message`] with serial 0
    /// (unassigned). The connection that sends it calls
    /// [`Message::assign_serial`] exactly once.
    pub fn build(self, endian: Endian) -> Message {
        Message(Arc::new(MessageInner {
            endian,
            serial: AtomicU32::new(0),
            header_fields: self.header_fields,
            body: self.body,
            user_data: SlotTable::default(),
        }))
    }
}

#[derive(Debug)]
struct MessageInner {
    endian: Endian,
    serial: AtomicU32,
    header_fields: Vec<([u8; 4], Value)>,
    body: Vec<Value>,
    user_data: SlotTable,
}

/// An immutable, `Arc`-shared message. Cloning is cheap (bumps a reference
/// count); `ref`/`unref` in the data-model sense are `Clone`/`Drop`.
#[derive(Debug, Clone)]
pub struct Message(Arc<MessageInner>);

impl Message {
    pub fn endian(&self) -> Endian {
        self.0.endian
    }

    /// Nonzero once assigned; 0 if never handed to a connection for sending.
    pub fn serial(&self) -> u32 {
        self.0.serial.load(Ordering::Acquire)
    }

    /// Assigns the serial exactly once. Returns `false` if a serial was
    /// already assigned (the message has already been sent once).
    #[must_use]
    pub fn assign_serial(&self, serial: u32) -> bool {
        debug_assert_ne!(serial, 0, "serial must never be zero");
        self.0
            .serial
            .compare_exchange(0, serial, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn field(&self, tag: [u8; 4]) -> Option<&Value> {
        self.0.header_fields.iter().find(|(t, _)| *t == tag).map(|(_, v)| v)
    }

    pub fn has_field(&self, tag: [u8; 4]) -> bool {
        self.field(tag).is_some()
    }

    pub fn name(&self) -> Option<&str> {
        self.field(FIELD_NAME).and_then(Value::as_str)
    }

    pub fn destination(&self) -> Option<&str> {
        self.field(FIELD_SERVICE).and_then(Value::as_str)
    }

    pub fn sender(&self) -> Option<&str> {
        self.field(FIELD_SENDER).and_then(Value::as_str)
    }

    pub fn reply_serial(&self) -> Option<u32> {
        self.field(FIELD_REPLY_SERIAL).and_then(Value::as_u32)
    }

    pub fn error_name(&self) -> Option<&str> {
        self.field(FIELD_ERROR_NAME).and_then(Value::as_str)
    }

    pub fn is_error(&self) -> bool {
        self.has_field(FIELD_ERROR_NAME)
    }

    pub fn has_name(&self, name: &str) -> bool {
        self.name() == Some(name)
    }

    pub fn has_destination(&self, dest: &str) -> bool {
        self.destination() == Some(dest)
    }

    pub fn body(&self) -> &[Value] {
        &self.0.body
    }

    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.0.body.iter()
    }

    /// Reads a subsystem's user-data slot on this message, if it ever set
    /// one. `slot` must come from [`MESSAGE_SLOTS`].
    pub fn slot_data(&self, slot: SlotId) -> Option<Arc<dyn std::any::Any + Send + Sync>> {
        self.0.user_data.get(slot)
    }

    /// Stores a subsystem's user-data slot on this message. `slot` must
    /// come from [`MESSAGE_SLOTS`].
    pub fn set_slot_data(&self, slot: SlotId, value: Arc<dyn std::any::Any + Send + Sync>) {
        self.0.user_data.set(slot, value);
    }

    /// Deep copy with the serial reset to 0, as if newly built. Returns a
    /// builder so the caller may still mutate before sending again.
    pub fn copy(&self) -> MessageBuilder {
        MessageBuilder {
            header_fields: self.0.header_fields.clone(),
            body: self.0.body.clone(),
        }
    }

    /// Stamps a new `sndr` field; used by the router when a message arrives
    /// from an authenticated connection. Only valid before the message is
    /// shared beyond the router (callers should not hold other clones).
    pub fn with_sender_stamped(self, sender: &str) -> Message {
        match Arc::try_unwrap(self.0) {
            Ok(mut inner) => {
                set_field_on(&mut inner.header_fields, FIELD_SENDER, Value::String(sender.to_owned()));
                Message(Arc::new(inner))
            },
            Err(shared) => {
                let mut header_fields = shared.header_fields.clone();
                set_field_on(&mut header_fields, FIELD_SENDER, Value::String(sender.to_owned()));
                Message(Arc::new(MessageInner {
                    endian: shared.endian,
                    serial: AtomicU32::new(shared.serial.load(Ordering::Acquire)),
                    header_fields,
                    body: shared.body.clone(),
                    user_data: SlotTable::default(),
                }))
            },
        }
    }

    /// Encodes the full wire envelope: preamble + header (8-aligned) + body.
    pub fn encode(&self) -> Result<Bytes, MessageError> {
        let endian = self.0.endian;
        let mut out = BytesMut::new();

        out.extend_from_slice(&[bom_for_endian(endian), 0, 0, 0]);
        let hdr_len_offset = out.len();
        out.extend_from_slice(&[0u8; 4]); // hdr_len placeholder
        let body_len_offset = out.len();
        out.extend_from_slice(&[0u8; 4]); // body_len placeholder
        let serial = self.serial();
        match endian {
            Endian::Big => out.extend_from_slice(&serial.to_be_bytes()),
            Endian::Little => out.extend_from_slice(&serial.to_le_bytes()),
        }
        debug_assert_eq!(out.len(), crate::wire::PREAMBLE_LEN);

        let header_start = out.len();
        for (tag, value) in &self.0.header_fields {
            out.extend_from_slice(tag);
            append_value(&mut out, value, endian)?;
        }
        pad_to(&mut out, crate::wire::HEADER_ALIGN);
        let header_len = (out.len() - header_start) as u32;

        let body_start = out.len();
        for value in &self.0.body {
            append_value(&mut out, value, endian)?;
        }
        let body_len = (out.len() - body_start) as u32;

        set_u32_at(&mut out, hdr_len_offset, header_len, endian);
        set_u32_at(&mut out, body_len_offset, body_len, endian);

        Ok(out.freeze())
    }

    /// Decodes a complete envelope (preamble + header + body) previously
    /// reassembled by the transport layer.
    pub fn decode(bytes: &[u8]) -> Result<Message, MessageError> {
        if bytes.len() < crate::wire::PREAMBLE_LEN {
            return Err(MessageError::ShortPreamble);
        }
        let endian = endian_for_bom(bytes[0])?;
        let header_len = read_u32_field(bytes, 4, endian);
        let body_len = read_u32_field(bytes, 8, endian);
        let serial = read_u32_field(bytes, 12, endian);

        let header_start = crate::wire::PREAMBLE_LEN;
        let header_end = header_start + header_len as usize;
        let body_end = header_end + body_len as usize;
        if body_end > bytes.len() {
            return Err(CodecError::Overflow {
                declared: body_end,
                available: bytes.len(),
            }
            .into());
        }

        let mut header_fields = Vec::new();
        let mut hcur = Cursor::new(&bytes[header_start..header_end]);
        while !hcur.is_empty() {
            // A run of zero padding bytes at the tail looks like more
            // fields only if a full 4-byte tag remains; stop once fewer
            // than 4 bytes (pure padding) are left.
            if hcur.remaining() < 4 {
                break;
            }
            let tag_bytes = hcur.read_exact(4).map_err(MessageError::from)?;
            if tag_bytes == [0, 0, 0, 0] {
                break;
            }
            let mut tag = [0u8; 4];
            tag.copy_from_slice(tag_bytes);
            let value = parse_value(&mut hcur, endian)?;
            header_fields.push((tag, value));
        }

        let mut body = Vec::new();
        let mut bcur = Cursor::new(&bytes[header_end..body_end]);
        while !bcur.is_empty() {
            body.push(parse_value(&mut bcur, endian)?);
        }

        let msg = Message(Arc::new(MessageInner {
            endian,
            serial: AtomicU32::new(serial),
            header_fields,
            body,
            user_data: SlotTable::default(),
        }));
        Ok(msg)
    }
}

fn set_field_on(fields: &mut Vec<([u8; 4], Value)>, tag: [u8; 4], value: Value) {
    if let Some(existing) = fields.iter_mut().find(|(t, _)| *t == tag) {
        existing.1 = value;
    } else {
        fields.push((tag, value));
    }
}

/// Reads a 4-byte field directly out of the preamble, which is not subject
/// to the typed-value alignment rules and so does not go through [`Cursor`].
fn read_u32_field(bytes: &[u8], offset: usize, endian: Endian) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&bytes[offset..offset + 4]);
    match endian {
        Endian::Big => u32::from_be_bytes(b),
        Endian::Little => u32::from_le_bytes(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_roundtrip() {
        let mut b = MessageBuilder::new("Hello", "org.example.Bus");
        b.set_sender(":1.0");
        let msg = b.build(Endian::Little);
        assert!(msg.assign_serial(1));
        let bytes = msg.encode().expect("encode");
        let decoded = Message::decode(&bytes).expect("decode");
        assert_eq!(decoded.name(), Some("Hello"));
        assert_eq!(decoded.destination(), Some("org.example.Bus"));
        assert_eq!(decoded.serial(), 1);
    }

    #[test]
    fn serial_assigned_exactly_once() {
        let msg = MessageBuilder::new("Ping", "x").build(Endian::Big);
        assert!(msg.assign_serial(5));
        assert!(!msg.assign_serial(6));
        assert_eq!(msg.serial(), 5);
    }

    #[test]
    fn error_reply_carries_rply_and_errn() {
        let orig = MessageBuilder::new("DoThing", "x").build(Endian::Big);
        assert!(orig.assign_serial(7));
        let err = MessageBuilder::new_error_reply(&orig, "AccessDenied", "nope").build(Endian::Big);
        assert_eq!(err.reply_serial(), Some(7));
        assert_eq!(err.error_name(), Some("AccessDenied"));
        assert!(err.is_error());
    }

    #[test]
    fn user_data_slot_round_trips_and_is_private_per_message() {
        let slot = MESSAGE_SLOTS.allocate();
        let a = MessageBuilder::new("Ping", "x").build(Endian::Little);
        let b = MessageBuilder::new("Ping", "x").build(Endian::Little);
        a.set_slot_data(slot, std::sync::Arc::new(7u32));
        assert_eq!(
            *a.slot_data(slot).expect("set above").downcast_ref::<u32>().expect("u32"),
            7
        );
        assert!(b.slot_data(slot).is_none(), "each message has its own slot table");
        MESSAGE_SLOTS.free(slot);
    }
}
