//! Reference wire format: a length-prefixed framed request/response protocol.
//!
//! Every frame carries a fixed 8-byte header followed by a bounded payload:
//!
//! ```text
//! +--------+--------+--------+--------+--------+--------+--------+--------+
//! | txn id (u16)    | proto id (u16)  | length (u16)    | unit   | op     |
//! +--------+--------+--------+--------+--------+--------+--------+--------+
//! | payload (length - 2 bytes) ...
//! ```
//!
//! `length` counts the unit and op bytes plus the payload, so a frame with an
//! empty payload declares length 2. The decoder rejects a declared length
//! beyond [`MAX_PAYLOAD_LEN`] before any allocation happens, and rejects
//! operation codes outside the known set without looking at their payload.
//! Decoding is a pure function of the input bytes: malformed or adversarial
//! input surfaces as a [`ProtocolError`], never a panic.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use fieldgate_core::{DataType, GatewayError, ProtocolError, TagValue};
use tokio_util::codec::{Decoder, Encoder};

/// Hard cap on the payload of one frame.
pub const MAX_PAYLOAD_LEN: usize = 256;

/// Header bytes preceding the payload.
pub const HEADER_LEN: usize = 8;

/// Protocol identifier expected in every header.
const PROTOCOL_ID: u16 = 0;

/// Response op codes set this bit to signal a device exception.
const EXCEPTION_BIT: u8 = 0x80;

/// Closed set of operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    /// Read holding registers (`"4xxxx"` addresses)
    ReadHolding,
    /// Read input registers (`"3xxxx"` addresses)
    ReadInput,
    /// Write registers at a single tag address
    WriteSingle,
    /// Device identification string
    Identify,
}

impl OpCode {
    pub fn as_u8(self) -> u8 {
        match self {
            OpCode::ReadHolding => 0x03,
            OpCode::ReadInput => 0x04,
            OpCode::WriteSingle => 0x06,
            OpCode::Identify => 0x2b,
        }
    }

    /// Accepts only codes in the known set. Anything else is rejected
    /// rather than interpreted.
    pub fn from_u8(code: u8) -> Result<Self, ProtocolError> {
        match code {
            0x03 => Ok(OpCode::ReadHolding),
            0x04 => Ok(OpCode::ReadInput),
            0x06 => Ok(OpCode::WriteSingle),
            0x2b => Ok(OpCode::Identify),
            other => Err(ProtocolError::UnknownOpCode { code: other }),
        }
    }
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub txn_id: u16,
    pub unit_id: u8,
    pub op: OpCode,
    /// Exception code reported by the device, if the response op had the
    /// exception bit set. The payload is the exception detail in that case.
    pub exception: Option<u8>,
    pub payload: Bytes,
}

impl Frame {
    pub fn request(txn_id: u16, unit_id: u8, op: OpCode, payload: Bytes) -> Self {
        Self {
            txn_id,
            unit_id,
            op,
            exception: None,
            payload,
        }
    }
}

/// Codec implementing [`Decoder`] and [`Encoder`] for [`Frame`].
#[derive(Debug, Default)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = GatewayError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, GatewayError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        // Validate the header before reserving anything for the body.
        let declared = u16::from_be_bytes([src[4], src[5]]) as usize;
        let proto_id = u16::from_be_bytes([src[2], src[3]]);
        if proto_id != PROTOCOL_ID {
            return Err(ProtocolError::malformed(format!(
                "unexpected protocol id {proto_id}"
            ))
            .into());
        }
        if declared < 2 {
            return Err(ProtocolError::malformed(format!(
                "declared length {declared} shorter than header remainder"
            ))
            .into());
        }
        let payload_len = declared - 2;
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(ProtocolError::OversizedFrame {
                declared: payload_len,
                max: MAX_PAYLOAD_LEN,
            }
            .into());
        }

        let total = HEADER_LEN + payload_len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let mut header = src.split_to(HEADER_LEN);
        let txn_id = header.get_u16();
        let _proto = header.get_u16();
        let _len = header.get_u16();
        let unit_id = header.get_u8();
        let raw_op = header.get_u8();
        let payload = src.split_to(payload_len).freeze();

        let (op, exception) = if raw_op & EXCEPTION_BIT != 0 {
            let base = OpCode::from_u8(raw_op & !EXCEPTION_BIT)?;
            let code = payload.first().copied().ok_or_else(|| {
                ProtocolError::malformed("exception frame with empty payload")
            })?;
            (base, Some(code))
        } else {
            (OpCode::from_u8(raw_op)?, None)
        };

        Ok(Some(Frame {
            txn_id,
            unit_id,
            op,
            exception,
            payload,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = GatewayError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), GatewayError> {
        if frame.payload.len() > MAX_PAYLOAD_LEN {
            return Err(ProtocolError::OversizedFrame {
                declared: frame.payload.len(),
                max: MAX_PAYLOAD_LEN,
            }
            .into());
        }
        let op = match frame.exception {
            Some(_) => frame.op.as_u8() | EXCEPTION_BIT,
            None => frame.op.as_u8(),
        };
        dst.reserve(HEADER_LEN + frame.payload.len());
        dst.put_u16(frame.txn_id);
        dst.put_u16(PROTOCOL_ID);
        dst.put_u16((frame.payload.len() + 2) as u16);
        dst.put_u8(frame.unit_id);
        dst.put_u8(op);
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}

/// Register address space a tag address resolves into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressSpace {
    Holding,
    Input,
}

impl AddressSpace {
    pub fn read_op(self) -> OpCode {
        match self {
            AddressSpace::Holding => OpCode::ReadHolding,
            AddressSpace::Input => OpCode::ReadInput,
        }
    }
}

/// Parses a `"40001"`-style tag address into an address space and a
/// zero-based register offset. Bare offsets default to the holding space.
pub fn parse_address(address: &str) -> Result<(AddressSpace, u16), ProtocolError> {
    let number: u32 = address
        .trim()
        .parse()
        .map_err(|_| ProtocolError::malformed(format!("invalid tag address '{address}'")))?;
    let (space, offset) = match number {
        30_001..=39_999 => (AddressSpace::Input, number - 30_001),
        40_001..=49_999 => (AddressSpace::Holding, number - 40_001),
        0..=9_999 => (AddressSpace::Holding, number),
        _ => {
            return Err(ProtocolError::malformed(format!(
                "tag address '{address}' outside supported ranges"
            )))
        }
    };
    Ok((space, offset as u16))
}

/// Number of 16-bit registers a value of the given type occupies.
pub fn register_count(data_type: DataType) -> u16 {
    match data_type {
        DataType::Bool => 1,
        DataType::Int => 2,
        DataType::Float => 2,
        // Strings are length-prefixed and padded into a fixed window
        DataType::String => 16,
    }
}

/// Encodes a typed value into big-endian register bytes.
pub fn encode_value(value: &TagValue, data_type: DataType) -> Result<Vec<u8>, ProtocolError> {
    match (data_type, value) {
        (DataType::Bool, TagValue::Bool(v)) => Ok(vec![0, u8::from(*v)]),
        (DataType::Int, TagValue::Int(v)) => {
            let clamped = i32::try_from(*v).map_err(|_| ProtocolError::ValueDecode {
                details: format!("integer {v} does not fit in 32 bits"),
            })?;
            Ok(clamped.to_be_bytes().to_vec())
        }
        (DataType::Float, TagValue::Float(v)) => Ok((*v as f32).to_be_bytes().to_vec()),
        (DataType::Float, TagValue::Int(v)) => Ok((*v as f32).to_be_bytes().to_vec()),
        (DataType::String, TagValue::Text(v)) => {
            let raw = v.as_bytes();
            let window = register_count(DataType::String) as usize * 2;
            if raw.len() > window - 1 {
                return Err(ProtocolError::ValueDecode {
                    details: format!("string of {} bytes exceeds the {window}-byte window", raw.len()),
                });
            }
            let mut out = vec![0u8; window];
            out[0] = raw.len() as u8;
            out[1..=raw.len()].copy_from_slice(raw);
            Ok(out)
        }
        (expected, actual) => Err(ProtocolError::ValueDecode {
            details: format!(
                "value type {:?} does not match declared type {expected:?}",
                actual.data_type()
            ),
        }),
    }
}

/// Decodes big-endian register bytes into a typed value.
pub fn decode_value(bytes: &[u8], data_type: DataType) -> Result<TagValue, ProtocolError> {
    let expected = register_count(data_type) as usize * 2;
    if bytes.len() != expected {
        return Err(ProtocolError::ValueDecode {
            details: format!(
                "expected {expected} bytes for {data_type:?}, got {}",
                bytes.len()
            ),
        });
    }
    match data_type {
        DataType::Bool => Ok(TagValue::Bool(bytes[1] != 0)),
        DataType::Int => Ok(TagValue::Int(i64::from(i32::from_be_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3],
        ])))),
        DataType::Float => Ok(TagValue::Float(f64::from(f32::from_be_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3],
        ])))),
        DataType::String => {
            let len = bytes[0] as usize;
            if len >= bytes.len() {
                return Err(ProtocolError::ValueDecode {
                    details: format!("string length {len} exceeds the payload window"),
                });
            }
            let text = std::str::from_utf8(&bytes[1..=len]).map_err(|e| {
                ProtocolError::ValueDecode {
                    details: format!("invalid UTF-8 in string value: {e}"),
                }
            })?;
            Ok(TagValue::Text(text.to_string()))
        }
    }
}
