//! Encoding for the post-handshake data datagram. Everything here operates on
//! plaintext (post-decrypt, pre-encrypt) bytes;
//! the encrypt/MAC step lives in `connexion.rs`.
//!
//! Per-message header byte:
//! ```text
//! bit:    7 6 5 4 | 3 2 | 1 | 0
//!         stream  |kind | frag | ack-trailer-follows
//! ```
//! `kind` is interpreted differently depending on the fragmented bit: unfragmented
//! messages use it to select {Data, Unreliable, Control, reserved}; fragmented messages
//! use it to select {First, Mid, Last, reserved} for the fragment sub-header that
//! follows the message id. This packs all five logical kinds (DATA,
//! FRAGMENT_FIRST/MID/LAST, UNRELIABLE) into the 2 bits budgeted for "kind" plus the
//! existing "fragmented" bit, rather than widening the header.
//!
//! After the header's fixed fields (id, fragment sub-header) comes a 2-byte little-endian
//! payload length, then the payload itself. This lets several messages share one datagram
//! (small reliable writes coalesce rather than each taking their own packet) and lets a
//! receiver walk them in sequence without any side channel for where one ends and the
//! next begins.

use crate::constants::ID_WIRE_MASK;
use crate::error::ProtocolError;

pub const HEADER_LEN: usize = 1;
pub const ID_LEN: usize = 3;
pub const FRAGMENT_HEADER_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnfragmentedKind {
    Data,
    Unreliable,
    Control,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentKind {
    First { huge: bool },
    Mid,
    Last,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Unfragmented(UnfragmentedKind),
    Fragment(FragmentKind),
}

/// A single parsed message header plus however much of the payload belongs to it.
#[derive(Debug, Clone, Copy)]
pub struct ParsedMessage<'a> {
    pub stream: u8,
    pub kind: MessageKind,
    /// Present for everything except `Unfragmented(Unreliable)` control-less keepalive
    /// messages; reliable and fragmented messages always carry one.
    pub id: Option<u32>,
    /// For `Fragment(First{..})`: the announced total size of the reassembled message.
    /// For `Fragment(Mid)`/`Fragment(Last)`: this fragment's byte offset into the message.
    pub fragment_field: Option<u32>,
    pub payload: &'a [u8],
    pub has_ack_trailer: bool,
}

fn pack_header(stream: u8, kind_bits: u8, fragmented: bool, has_ack_trailer: bool) -> u8 {
    debug_assert!(stream <= 0x0f);
    debug_assert!(kind_bits <= 0x03);
    (stream << 4) | (kind_bits << 2) | ((fragmented as u8) << 1) | (has_ack_trailer as u8)
}

fn unpack_header(b: u8) -> (u8, u8, bool, bool) {
    let stream = b >> 4;
    let kind_bits = (b >> 2) & 0x03;
    let fragmented = (b & 0x02) != 0;
    let has_ack_trailer = (b & 0x01) != 0;
    (stream, kind_bits, fragmented, has_ack_trailer)
}

pub fn write_id(out: &mut Vec<u8>, id: u32) {
    let id = id & ID_WIRE_MASK;
    out.push((id & 0xff) as u8);
    out.push(((id >> 8) & 0xff) as u8);
    out.push(((id >> 16) & 0xff) as u8);
}

fn read_id(b: &[u8]) -> u32 {
    (b[0] as u32) | ((b[1] as u32) << 8) | ((b[2] as u32) << 16)
}

pub fn write_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn read_u32(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

/// Append one message (header + optional id + optional fragment field + payload) to `out`.
pub fn write_message(out: &mut Vec<u8>, stream: u8, id: Option<u32>, kind: MessageKind, fragment_field: Option<u32>, has_ack_trailer: bool, payload: &[u8]) {
    let (kind_bits, fragmented) = match kind {
        MessageKind::Unfragmented(UnfragmentedKind::Data) => (0u8, false),
        MessageKind::Unfragmented(UnfragmentedKind::Unreliable) => (1u8, false),
        MessageKind::Unfragmented(UnfragmentedKind::Control) => (2u8, false),
        MessageKind::Fragment(FragmentKind::First { huge }) => (if huge { 3 } else { 0 }, true),
        MessageKind::Fragment(FragmentKind::Mid) => (1, true),
        MessageKind::Fragment(FragmentKind::Last) => (2, true),
    };
    out.push(pack_header(stream, kind_bits, fragmented, has_ack_trailer));
    if let Some(id) = id {
        write_id(out, id);
    }
    if let Some(field) = fragment_field {
        write_u32(out, field);
    }
    debug_assert!(payload.len() <= u16::MAX as usize);
    out.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    out.extend_from_slice(payload);
}

/// Parse one message starting at `buf[0]`, returning it plus the number of bytes
/// consumed so the caller can advance to the next message packed into the same
/// datagram. The payload length travels on the wire as a 2-byte prefix, so unlike the
/// header fields above this doesn't need the caller to already know message boundaries.
pub fn parse_message(buf: &[u8]) -> Result<(ParsedMessage<'_>, usize), ProtocolError> {
    if buf.is_empty() {
        return Err(ProtocolError::MalformedHeader);
    }
    let (stream, kind_bits, fragmented, has_ack_trailer) = unpack_header(buf[0]);
    let mut cursor = HEADER_LEN;

    let needs_id = !(!fragmented && kind_bits == 1); // unfragmented unreliable carries no id

    let id = if needs_id {
        if buf.len() < cursor + ID_LEN {
            return Err(ProtocolError::MalformedHeader);
        }
        let v = read_id(&buf[cursor..cursor + ID_LEN]);
        cursor += ID_LEN;
        Some(v)
    } else {
        None
    };

    let (kind, fragment_field) = if fragmented {
        if buf.len() < cursor + FRAGMENT_HEADER_LEN {
            return Err(ProtocolError::MalformedHeader);
        }
        let field = read_u32(&buf[cursor..cursor + FRAGMENT_HEADER_LEN]);
        cursor += FRAGMENT_HEADER_LEN;
        let k = match kind_bits {
            0 => FragmentKind::First { huge: false },
            3 => FragmentKind::First { huge: true },
            1 => FragmentKind::Mid,
            2 => FragmentKind::Last,
            _ => return Err(ProtocolError::UnknownKind),
        };
        (MessageKind::Fragment(k), Some(field))
    } else {
        let k = match kind_bits {
            0 => UnfragmentedKind::Data,
            1 => UnfragmentedKind::Unreliable,
            2 => UnfragmentedKind::Control,
            _ => return Err(ProtocolError::UnknownKind),
        };
        (MessageKind::Unfragmented(k), None)
    };

    if buf.len() < cursor + 2 {
        return Err(ProtocolError::MalformedHeader);
    }
    let payload_len = u16::from_le_bytes([buf[cursor], buf[cursor + 1]]) as usize;
    cursor += 2;

    if buf.len() < cursor + payload_len {
        return Err(ProtocolError::MalformedHeader);
    }
    let payload = &buf[cursor..cursor + payload_len];
    cursor += payload_len;

    Ok((
        ParsedMessage { stream, kind, id, fragment_field, payload, has_ack_trailer },
        cursor,
    ))
}

/// Top bit of an `AckEntry`'s stream byte on the wire: set when `base_id` names a real
/// contiguously-delivered id, clear when the stream has delivered nothing contiguous yet
/// (so the entry carries only out-of-order bits and `base_id` must be ignored).
const ACK_HAS_BASE_FLAG: u8 = 0x80;

/// One stream's worth of pending acknowledgment state, ready to serialize as a trailer entry.
#[derive(Debug, Clone, Copy)]
pub struct AckEntry {
    pub stream: u8,
    /// Highest contiguously-delivered id on this stream; meaningless unless `has_base`.
    pub base_id: u32,
    /// `false` when nothing has been contiguously delivered yet on this stream (the
    /// first message received was already out of order).
    pub has_base: bool,
    /// Bit `n` set means `base_id + 1 + n` has been received out of order.
    pub out_of_order_bitmap: u64,
}

pub fn write_ack_trailer(out: &mut Vec<u8>, entries: &[AckEntry]) {
    out.push(entries.len() as u8);
    for e in entries {
        let flagged_stream = e.stream | if e.has_base { ACK_HAS_BASE_FLAG } else { 0 };
        out.push(flagged_stream);
        write_id(out, e.base_id);
        out.extend_from_slice(&e.out_of_order_bitmap.to_le_bytes());
    }
}

pub fn read_ack_trailer(buf: &[u8]) -> Result<Vec<AckEntry>, ProtocolError> {
    if buf.is_empty() {
        return Err(ProtocolError::MalformedHeader);
    }
    let count = buf[0] as usize;
    let mut cursor = 1;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        if buf.len() < cursor + 1 + ID_LEN + 8 {
            return Err(ProtocolError::MalformedHeader);
        }
        let flagged_stream = buf[cursor];
        let stream = flagged_stream & !ACK_HAS_BASE_FLAG;
        let has_base = flagged_stream & ACK_HAS_BASE_FLAG != 0;
        cursor += 1;
        let base_id = read_id(&buf[cursor..cursor + ID_LEN]);
        cursor += ID_LEN;
        let mut bitmap_bytes = [0u8; 8];
        bitmap_bytes.copy_from_slice(&buf[cursor..cursor + 8]);
        cursor += 8;
        out.push(AckEntry { stream, base_id, has_base, out_of_order_bitmap: u64::from_le_bytes(bitmap_bytes) });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_round_trip_data() {
        let mut buf = Vec::new();
        write_message(&mut buf, 2, Some(42), MessageKind::Unfragmented(UnfragmentedKind::Data), None, false, b"hi");
        let (parsed, consumed) = parse_message(&buf).unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(parsed.stream, 2);
        assert_eq!(parsed.id, Some(42));
        assert_eq!(parsed.payload, b"hi");
    }

    #[test]
    fn message_round_trip_fragment_first_huge() {
        let mut buf = Vec::new();
        write_message(&mut buf, 3, Some(7), MessageKind::Fragment(FragmentKind::First { huge: true }), Some(2_000_000), true, b"chunk");
        let (parsed, _) = parse_message(&buf).unwrap();
        assert!(matches!(parsed.kind, MessageKind::Fragment(FragmentKind::First { huge: true })));
        assert_eq!(parsed.fragment_field, Some(2_000_000));
        assert!(parsed.has_ack_trailer);
    }

    #[test]
    fn two_messages_pack_into_one_datagram() {
        let mut buf = Vec::new();
        write_message(&mut buf, 0, Some(1), MessageKind::Unfragmented(UnfragmentedKind::Data), None, false, b"first");
        write_message(&mut buf, 1, Some(2), MessageKind::Unfragmented(UnfragmentedKind::Data), None, false, b"second-message");

        let (first, consumed) = parse_message(&buf).unwrap();
        assert_eq!(first.payload, b"first");
        let (second, consumed2) = parse_message(&buf[consumed..]).unwrap();
        assert_eq!(second.payload, b"second-message");
        assert_eq!(consumed + consumed2, buf.len());
    }

    #[test]
    fn ack_trailer_round_trip() {
        let entries = vec![
            AckEntry { stream: 0, base_id: 10, has_base: true, out_of_order_bitmap: 0b101 },
            AckEntry { stream: 1, base_id: 99, has_base: true, out_of_order_bitmap: 0 },
        ];
        let mut buf = Vec::new();
        write_ack_trailer(&mut buf, &entries);
        let decoded = read_ack_trailer(&buf).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].base_id, 10);
        assert_eq!(decoded[1].stream, 1);
    }
}
