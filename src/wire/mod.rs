// SPDX-License-Identifier: AGPL-3.0-or-later

//! Wire codec (C1): typed-value marshalling with alignment and endianness.

pub mod codec;
pub mod value;

pub use codec::{CodecError, Endian, Cursor};
pub use value::{Value, ValueType};

/// Fixed size of the envelope preamble: byte-order marker, 3 reserved
/// bytes, header length, body length, serial.
pub const PREAMBLE_LEN: usize = 16;

/// Header is padded up to this boundary.
pub const HEADER_ALIGN: usize = 8;
