//! Binary encoding of HTSP messages.
//!
//! ## Wire Layout
//!
//! ```text
//! frame := length(u32 BE) payload
//! payload := field*
//! field := type(u8) name_len(u8) data_len(u32 BE) name data
//! ```
//!
//! | tag | kind | data |
//! |-----|------|------|
//! | 1 | map  | nested `field*` |
//! | 2 | s64  | little-endian, trailing zero bytes stripped (0..=8 bytes) |
//! | 3 | str  | UTF-8 bytes |
//! | 4 | bin  | raw bytes |
//! | 5 | list | nested `field*` with empty names |
//!
//! Decoding never panics: truncated input, oversized integers, unknown tags
//! and invalid UTF-8 are reported as [`HtspError::Protocol`].

use bytes::{BufMut, Bytes, BytesMut};

use super::{Message, Value};
use crate::{HtspError, Result};

const TYPE_MAP: u8 = 1;
const TYPE_S64: u8 = 2;
const TYPE_STR: u8 = 3;
const TYPE_BIN: u8 = 4;
const TYPE_LIST: u8 = 5;

/// Size of the per-field header (type, name length, data length).
const FIELD_HEADER_SIZE: usize = 6;

/// Size of the frame length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Nesting deeper than this is rejected rather than recursed into.
const MAX_DEPTH: usize = 64;

/// Encode a message body without the length prefix.
pub fn encode_payload(msg: &Message) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(encoded_len(msg));
    write_fields(&mut buf, msg.fields.iter().map(|(n, v)| (n.as_str(), v)))?;
    Ok(buf.freeze())
}

/// Encode a complete frame: length prefix followed by the payload.
pub fn encode_frame(msg: &Message) -> Result<Bytes> {
    let body_len = encoded_len(msg);
    let len = u32::try_from(body_len)
        .map_err(|_| HtspError::protocol("frame encoding", "payload exceeds 4 GiB"))?;
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + body_len);
    buf.put_u32(len);
    write_fields(&mut buf, msg.fields.iter().map(|(n, v)| (n.as_str(), v)))?;
    Ok(buf.freeze())
}

/// Decode a complete frame including its length prefix.
///
/// The prefix must describe exactly the bytes that follow it.
pub fn decode_frame(frame: &[u8]) -> Result<Message> {
    let mut reader = ByteReader::new(frame);
    let len = reader.read_u32_be("frame length")? as usize;
    if reader.remaining() != len {
        return Err(HtspError::protocol(
            "frame decoding",
            format!("length prefix says {} bytes, {} present", len, reader.remaining()),
        ));
    }
    decode_payload(reader.rest())
}

/// Decode a message body (everything after the length prefix).
pub fn decode_payload(payload: &[u8]) -> Result<Message> {
    let mut msg = Message::new();
    let mut reader = ByteReader::new(payload);
    while !reader.is_empty() {
        let (name, value) = read_field(&mut reader, 0)?;
        msg.push_field(name, value);
    }
    Ok(msg)
}

fn encoded_len(msg: &Message) -> usize {
    msg.fields.iter().map(|(n, v)| FIELD_HEADER_SIZE + n.len() + value_len(v)).sum()
}

fn value_len(value: &Value) -> usize {
    match value {
        Value::Str(s) => s.len(),
        Value::Bin(b) => b.len(),
        Value::S64(v) => s64_len(*v),
        Value::Map(m) => encoded_len(m),
        Value::List(items) => items.iter().map(|v| FIELD_HEADER_SIZE + value_len(v)).sum(),
    }
}

fn s64_len(v: i64) -> usize {
    let u = v as u64;
    (64 - u.leading_zeros() as usize).div_ceil(8)
}

fn write_fields<'a>(
    buf: &mut BytesMut,
    fields: impl Iterator<Item = (&'a str, &'a Value)>,
) -> Result<()> {
    for (name, value) in fields {
        write_field(buf, name, value)?;
    }
    Ok(())
}

fn write_field(buf: &mut BytesMut, name: &str, value: &Value) -> Result<()> {
    let name_len = u8::try_from(name.len()).map_err(|_| {
        HtspError::protocol("field encoding", format!("field name of {} bytes", name.len()))
    })?;
    let data_len = u32::try_from(value_len(value))
        .map_err(|_| HtspError::protocol("field encoding", "field data exceeds 4 GiB"))?;

    let tag = match value {
        Value::Map(_) => TYPE_MAP,
        Value::S64(_) => TYPE_S64,
        Value::Str(_) => TYPE_STR,
        Value::Bin(_) => TYPE_BIN,
        Value::List(_) => TYPE_LIST,
    };

    buf.put_u8(tag);
    buf.put_u8(name_len);
    buf.put_u32(data_len);
    buf.put_slice(name.as_bytes());

    match value {
        Value::Str(s) => buf.put_slice(s.as_bytes()),
        Value::Bin(b) => buf.put_slice(b),
        Value::S64(v) => {
            let mut u = *v as u64;
            while u != 0 {
                buf.put_u8(u as u8);
                u >>= 8;
            }
        }
        Value::Map(m) => write_fields(buf, m.fields.iter().map(|(n, v)| (n.as_str(), v)))?,
        Value::List(items) => write_fields(buf, items.iter().map(|v| ("", v)))?,
    }
    Ok(())
}

fn read_field(reader: &mut ByteReader<'_>, depth: usize) -> Result<(String, Value)> {
    if depth > MAX_DEPTH {
        return Err(HtspError::protocol("field decoding", "nesting too deep"));
    }

    let tag = reader.read_u8("field type")?;
    let name_len = reader.read_u8("field name length")? as usize;
    let data_len = reader.read_u32_be("field data length")? as usize;
    let name = std::str::from_utf8(reader.take(name_len, "field name")?)
        .map_err(|e| HtspError::protocol("field name", e.to_string()))?
        .to_string();
    let data = reader.take(data_len, "field data")?;

    let value = match tag {
        TYPE_STR => Value::Str(
            std::str::from_utf8(data)
                .map_err(|e| HtspError::protocol(format!("string field '{}'", name), e.to_string()))?
                .to_string(),
        ),
        TYPE_BIN => Value::Bin(Bytes::copy_from_slice(data)),
        TYPE_S64 => {
            if data.len() > 8 {
                return Err(HtspError::protocol(
                    format!("integer field '{}'", name),
                    format!("{} bytes exceed 64 bits", data.len()),
                ));
            }
            let u = data.iter().rev().fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
            Value::S64(u as i64)
        }
        TYPE_MAP => {
            let mut nested = Message::new();
            let mut sub = ByteReader::new(data);
            while !sub.is_empty() {
                let (n, v) = read_field(&mut sub, depth + 1)?;
                nested.push_field(n, v);
            }
            Value::Map(nested)
        }
        TYPE_LIST => {
            let mut items = Vec::new();
            let mut sub = ByteReader::new(data);
            while !sub.is_empty() {
                let (_, v) = read_field(&mut sub, depth + 1)?;
                items.push(v);
            }
            Value::List(items)
        }
        other => {
            return Err(HtspError::protocol(
                format!("field '{}'", name),
                format!("unknown type tag {}", other),
            ));
        }
    };

    Ok((name, value))
}

/// Bounds-checked forward reader over a byte slice.
struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8]> {
        if n > self.remaining() {
            return Err(HtspError::protocol(
                "truncated input",
                format!("{} needs {} bytes, {} left", what, n, self.remaining()),
            ));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u8(&mut self, what: &str) -> Result<u8> {
        Ok(self.take(1, what)?[0])
    }

    fn read_u32_be(&mut self, what: &str) -> Result<u32> {
        let bytes = self.take(4, what)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample() -> Message {
        let mut stream = Message::new();
        stream.set("index", 1u32).set("type", "H264");
        Message::request("subscriptionStart")
            .with("subscriptionId", 7u32)
            .with("streams", vec![Value::Map(stream)])
            .with("challenge", vec![0u8, 1, 2, 255])
            .with("negative", -2i64)
            .with("zero", 0i64)
    }

    #[test]
    fn known_layout_for_small_message() {
        let msg = Message::new().with("a", 1u32);
        let frame = encode_frame(&msg).unwrap();
        assert_eq!(frame.as_ref(), &[0, 0, 0, 8, TYPE_S64, 1, 0, 0, 0, 1, b'a', 1]);
    }

    #[test]
    fn s64_strips_trailing_zero_bytes() {
        assert_eq!(s64_len(0), 0);
        assert_eq!(s64_len(1), 1);
        assert_eq!(s64_len(255), 1);
        assert_eq!(s64_len(256), 2);
        assert_eq!(s64_len(-1), 8);
        assert_eq!(s64_len(i64::MAX), 8);
    }

    #[test]
    fn round_trip_all_kinds() {
        let msg = sample();
        let frame = encode_frame(&msg).unwrap();
        assert_eq!(decode_frame(&frame).unwrap(), msg);

        let payload = encode_payload(&msg).unwrap();
        assert_eq!(&frame[LENGTH_PREFIX_SIZE..], payload.as_ref());
        assert_eq!(decode_payload(&payload).unwrap(), msg);
    }

    #[test]
    fn corrupted_length_prefix_is_rejected() {
        let mut frame = encode_frame(&sample()).unwrap().to_vec();
        frame[3] = frame[3].wrapping_add(1);
        assert!(matches!(decode_frame(&frame), Err(HtspError::Protocol { .. })));
        assert!(matches!(decode_frame(&frame[..2]), Err(HtspError::Protocol { .. })));
    }

    #[test]
    fn truncated_payload_is_rejected() {
        // A single field has no inner boundary a cut could land on.
        let msg = Message::new().with("challenge", vec![7u8; 20]);
        let payload = encode_payload(&msg).unwrap();
        for cut in 1..payload.len() {
            let result = decode_payload(&payload[..cut]);
            assert!(result.is_err(), "cut at {} decoded", cut);
        }
    }

    #[test]
    fn unknown_type_tag_is_rejected() {
        let bytes = [9u8, 1, 0, 0, 0, 0, b'x'];
        let err = decode_payload(&bytes).unwrap_err();
        assert!(err.to_string().contains("unknown type tag 9"));
    }

    #[test]
    fn oversized_integer_is_rejected() {
        let bytes = [TYPE_S64, 1, 0, 0, 0, 9, b'x', 1, 2, 3, 4, 5, 6, 7, 8, 9];
        assert!(decode_payload(&bytes).is_err());
    }

    #[test]
    fn overlong_name_fails_encoding() {
        let msg = Message::new().with("n".repeat(256), 1u32);
        assert!(encode_payload(&msg).is_err());
    }

    #[test]
    fn deep_nesting_is_rejected_without_overflow() {
        let mut payload: Vec<u8> = Vec::new();
        for _ in 0..(MAX_DEPTH + 10) {
            let mut outer = vec![TYPE_MAP, 0];
            outer.extend_from_slice(&(payload.len() as u32).to_be_bytes());
            outer.extend_from_slice(&payload);
            payload = outer;
        }
        assert!(decode_payload(&payload).is_err());
    }

    fn arb_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            ".{0,24}".prop_map(Value::Str),
            prop::collection::vec(any::<u8>(), 0..32).prop_map(Value::from),
            any::<i64>().prop_map(Value::S64),
        ];
        leaf.prop_recursive(4, 48, 6, |inner| {
            prop_oneof![
                prop::collection::vec(("[a-zA-Z]{1,12}", inner.clone()), 0..6).prop_map(|fields| {
                    let mut msg = Message::new();
                    for (n, v) in fields {
                        msg.push_field(n, v);
                    }
                    Value::Map(msg)
                }),
                prop::collection::vec(inner, 0..6).prop_map(Value::List),
            ]
        })
    }

    fn arb_message() -> impl Strategy<Value = Message> {
        prop::collection::vec(("[a-zA-Z]{0,16}", arb_value()), 0..10).prop_map(|fields| {
            let mut msg = Message::new();
            for (n, v) in fields {
                msg.push_field(n, v);
            }
            msg
        })
    }

    proptest! {
        #[test]
        fn prop_decode_inverts_encode(msg in arb_message()) {
            let frame = encode_frame(&msg).unwrap();
            prop_assert_eq!(decode_frame(&frame).unwrap(), msg.clone());
            let again = encode_frame(&decode_frame(&frame).unwrap()).unwrap();
            prop_assert_eq!(again, frame);
        }

        #[test]
        fn prop_corrupted_frames_never_panic(
            msg in arb_message(),
            flips in prop::collection::vec((any::<prop::sample::Index>(), any::<u8>()), 1..8)
        ) {
            let mut frame = encode_frame(&msg).unwrap().to_vec();
            for (index, byte) in flips {
                let i = index.index(frame.len());
                frame[i] ^= byte;
            }
            let _ = decode_frame(&frame);
        }

        #[test]
        fn prop_arbitrary_bytes_never_panic(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
            let _ = decode_payload(&bytes);
            let _ = decode_frame(&bytes);
        }
    }
}
