//! BACnet/IP wire codec
//!
//! Encodes and decodes the three layers a BACnet/IP client needs: the BVLC
//! header (Annex J), the network layer (NPDU) and the application layer
//! (APDU) for Who-Is/I-Am, ReadProperty, ReadPropertyMultiple and
//! WriteProperty. Segmented messages are recognized but not reassembled.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use bytes::{BufMut, BytesMut};

use bms_types::ObjectType;

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

pub const BVLC_TYPE: u8 = 0x81;

pub mod bvlc_function {
    pub const FORWARDED_NPDU: u8 = 0x04;
    pub const ORIGINAL_UNICAST_NPDU: u8 = 0x0A;
    pub const ORIGINAL_BROADCAST_NPDU: u8 = 0x0B;
}

pub mod pdu_type {
    pub const CONFIRMED_REQUEST: u8 = 0x00;
    pub const UNCONFIRMED_REQUEST: u8 = 0x10;
    pub const SIMPLE_ACK: u8 = 0x20;
    pub const COMPLEX_ACK: u8 = 0x30;
    pub const SEGMENT_ACK: u8 = 0x40;
    pub const ERROR: u8 = 0x50;
    pub const REJECT: u8 = 0x60;
    pub const ABORT: u8 = 0x70;
}

pub mod service {
    pub const I_AM: u8 = 0;
    pub const WHO_IS: u8 = 8;
    pub const READ_PROPERTY: u8 = 12;
    pub const READ_PROPERTY_MULTIPLE: u8 = 14;
    pub const WRITE_PROPERTY: u8 = 15;
}

pub mod property {
    pub const OBJECT_LIST: u32 = 76;
    pub const OBJECT_NAME: u32 = 77;
    pub const PRESENT_VALUE: u32 = 85;
    pub const PRIORITY_ARRAY: u32 = 87;
    pub const UNITS: u32 = 117;
}

/// Max APDU length accepted, encoded in the confirmed request header (1476 bytes)
const MAX_APDU_1476: u8 = 0x05;

const NPDU_VERSION: u8 = 0x01;
const NPDU_NETWORK_MESSAGE: u8 = 0x80;
const NPDU_DNET_PRESENT: u8 = 0x20;
const NPDU_SNET_PRESENT: u8 = 0x08;
const NPDU_EXPECTING_REPLY: u8 = 0x04;

const SEGMENTED_MESSAGE: u8 = 0x08;

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Malformed or unsupported frame
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CodecError {
    #[error("frame truncated")]
    Truncated,

    #[error("invalid header: {0}")]
    InvalidHeader(String),

    #[error("unexpected tag: {0}")]
    UnexpectedTag(String),

    #[error("value not encodable: {0}")]
    Unencodable(String),
}

pub type CodecResult<T> = Result<T, CodecError>;

// ─────────────────────────────────────────────────────────────────────────────
// Values
// ─────────────────────────────────────────────────────────────────────────────

/// BACnet object identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId {
    pub object_type: ObjectType,
    pub instance: u32,
}

impl ObjectId {
    pub fn new(object_type: ObjectType, instance: u32) -> Self {
        Self {
            object_type,
            instance,
        }
    }

    pub fn device(instance: u32) -> Self {
        Self::new(ObjectType::Device, instance)
    }

    fn to_u32(self) -> u32 {
        (u32::from(self.object_type.code()) << 22) | (self.instance & 0x3F_FFFF)
    }

    fn from_u32(raw: u32) -> Self {
        Self {
            object_type: ObjectType::from_code((raw >> 22) as u16),
            instance: raw & 0x3F_FFFF,
        }
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.object_type, self.instance)
    }
}

/// Application-tagged value
#[derive(Debug, Clone, PartialEq)]
pub enum AppValue {
    Null,
    Boolean(bool),
    Unsigned(u64),
    Signed(i64),
    Real(f32),
    Double(f64),
    OctetString(Vec<u8>),
    CharacterString(String),
    BitString(Vec<bool>),
    Enumerated(u32),
    Date([u8; 4]),
    Time([u8; 4]),
    ObjectId(ObjectId),
}

mod app_tag {
    pub const NULL: u8 = 0;
    pub const BOOLEAN: u8 = 1;
    pub const UNSIGNED: u8 = 2;
    pub const SIGNED: u8 = 3;
    pub const REAL: u8 = 4;
    pub const DOUBLE: u8 = 5;
    pub const OCTET_STRING: u8 = 6;
    pub const CHARACTER_STRING: u8 = 7;
    pub const BIT_STRING: u8 = 8;
    pub const ENUMERATED: u8 = 9;
    pub const DATE: u8 = 10;
    pub const TIME: u8 = 11;
    pub const OBJECT_ID: u8 = 12;
}

// ─────────────────────────────────────────────────────────────────────────────
// Tag Encoding
// ─────────────────────────────────────────────────────────────────────────────

fn put_tag(buf: &mut BytesMut, number: u8, context: bool, len: u32) {
    let class = if context { 0x08 } else { 0x00 };
    let lvt = if len <= 4 { len as u8 } else { 5 };
    if number <= 14 {
        buf.put_u8((number << 4) | class | lvt);
    } else {
        buf.put_u8(0xF0 | class | lvt);
        buf.put_u8(number);
    }
    if len > 4 {
        if len <= 253 {
            buf.put_u8(len as u8);
        } else if len <= u32::from(u16::MAX) {
            buf.put_u8(254);
            buf.put_u16(len as u16);
        } else {
            buf.put_u8(255);
            buf.put_u32(len);
        }
    }
}

fn unsigned_bytes(value: u64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take(7).take_while(|b| **b == 0).count();
    bytes[skip..].to_vec()
}

fn signed_bytes(value: i64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let mut start = 0;
    while start < 7 {
        let (b, next) = (bytes[start], bytes[start + 1]);
        let redundant = (b == 0x00 && next & 0x80 == 0) || (b == 0xFF && next & 0x80 != 0);
        if !redundant {
            break;
        }
        start += 1;
    }
    bytes[start..].to_vec()
}

pub fn put_opening(buf: &mut BytesMut, number: u8) {
    buf.put_u8((number << 4) | 0x0E);
}

pub fn put_closing(buf: &mut BytesMut, number: u8) {
    buf.put_u8((number << 4) | 0x0F);
}

pub fn put_context_unsigned(buf: &mut BytesMut, number: u8, value: u64) {
    let bytes = unsigned_bytes(value);
    put_tag(buf, number, true, bytes.len() as u32);
    buf.put_slice(&bytes);
}

pub fn put_context_object_id(buf: &mut BytesMut, number: u8, oid: ObjectId) {
    put_tag(buf, number, true, 4);
    buf.put_u32(oid.to_u32());
}

/// Append an application-tagged value
pub fn put_app_value(buf: &mut BytesMut, value: &AppValue) {
    match value {
        AppValue::Null => put_tag(buf, app_tag::NULL, false, 0),
        AppValue::Boolean(b) => put_tag(buf, app_tag::BOOLEAN, false, u32::from(*b)),
        AppValue::Unsigned(n) => {
            let bytes = unsigned_bytes(*n);
            put_tag(buf, app_tag::UNSIGNED, false, bytes.len() as u32);
            buf.put_slice(&bytes);
        }
        AppValue::Signed(n) => {
            let bytes = signed_bytes(*n);
            put_tag(buf, app_tag::SIGNED, false, bytes.len() as u32);
            buf.put_slice(&bytes);
        }
        AppValue::Real(r) => {
            put_tag(buf, app_tag::REAL, false, 4);
            buf.put_f32(*r);
        }
        AppValue::Double(d) => {
            put_tag(buf, app_tag::DOUBLE, false, 8);
            buf.put_f64(*d);
        }
        AppValue::OctetString(bytes) => {
            put_tag(buf, app_tag::OCTET_STRING, false, bytes.len() as u32);
            buf.put_slice(bytes);
        }
        AppValue::CharacterString(s) => {
            // charset 0 = UTF-8
            put_tag(buf, app_tag::CHARACTER_STRING, false, s.len() as u32 + 1);
            buf.put_u8(0);
            buf.put_slice(s.as_bytes());
        }
        AppValue::BitString(bits) => {
            let byte_count = bits.len().div_ceil(8);
            let unused = (byte_count * 8 - bits.len()) as u8;
            put_tag(buf, app_tag::BIT_STRING, false, byte_count as u32 + 1);
            buf.put_u8(unused);
            for chunk in bits.chunks(8) {
                let mut byte = 0u8;
                for (i, bit) in chunk.iter().enumerate() {
                    if *bit {
                        byte |= 0x80 >> i;
                    }
                }
                buf.put_u8(byte);
            }
        }
        AppValue::Enumerated(n) => {
            let bytes = unsigned_bytes(u64::from(*n));
            put_tag(buf, app_tag::ENUMERATED, false, bytes.len() as u32);
            buf.put_slice(&bytes);
        }
        AppValue::Date(d) => {
            put_tag(buf, app_tag::DATE, false, 4);
            buf.put_slice(d);
        }
        AppValue::Time(t) => {
            put_tag(buf, app_tag::TIME, false, 4);
            buf.put_slice(t);
        }
        AppValue::ObjectId(oid) => {
            put_tag(buf, app_tag::OBJECT_ID, false, 4);
            buf.put_u32(oid.to_u32());
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tag Decoding
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TagClass {
    Application,
    Context,
    Opening,
    Closing,
}

#[derive(Debug, Clone, Copy)]
struct Tag {
    class: TagClass,
    number: u8,
    /// Content length, or the boolean value for application booleans
    len: u32,
}

/// Cursor over tagged APDU content
pub struct TagReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> TagReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn take(&mut self, n: usize) -> CodecResult<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or(CodecError::Truncated)?;
        let slice = self.buf.get(self.pos..end).ok_or(CodecError::Truncated)?;
        self.pos = end;
        Ok(slice)
    }

    fn byte(&mut self) -> CodecResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_tag(&mut self) -> CodecResult<Tag> {
        let first = self.byte()?;
        let mut number = first >> 4;
        if number == 0x0F {
            number = self.byte()?;
        }
        let context = first & 0x08 != 0;
        let lvt = first & 0x07;

        if context && lvt == 6 {
            return Ok(Tag {
                class: TagClass::Opening,
                number,
                len: 0,
            });
        }
        if context && lvt == 7 {
            return Ok(Tag {
                class: TagClass::Closing,
                number,
                len: 0,
            });
        }

        let len = if lvt < 5 {
            u32::from(lvt)
        } else {
            match self.byte()? {
                254 => {
                    let b = self.take(2)?;
                    u32::from(u16::from_be_bytes([b[0], b[1]]))
                }
                255 => {
                    let b = self.take(4)?;
                    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
                }
                n => u32::from(n),
            }
        };

        Ok(Tag {
            class: if context {
                TagClass::Context
            } else {
                TagClass::Application
            },
            number,
            len,
        })
    }

    fn peek_tag(&mut self) -> CodecResult<Tag> {
        let saved = self.pos;
        let tag = self.read_tag();
        self.pos = saved;
        tag
    }

    /// Whether the next tag is the given context tag (primitive or opening)
    pub fn next_is_context(&mut self, number: u8) -> bool {
        matches!(
            self.peek_tag(),
            Ok(Tag { class: TagClass::Context | TagClass::Opening, number: n, .. }) if n == number
        )
    }

    pub fn next_is_closing(&mut self, number: u8) -> bool {
        matches!(
            self.peek_tag(),
            Ok(Tag { class: TagClass::Closing, number: n, .. }) if n == number
        )
    }

    pub fn expect_opening(&mut self, number: u8) -> CodecResult<()> {
        match self.read_tag()? {
            Tag {
                class: TagClass::Opening,
                number: n,
                ..
            } if n == number => Ok(()),
            other => Err(CodecError::UnexpectedTag(format!(
                "expected opening tag {}, got {:?}",
                number, other
            ))),
        }
    }

    pub fn expect_closing(&mut self, number: u8) -> CodecResult<()> {
        match self.read_tag()? {
            Tag {
                class: TagClass::Closing,
                number: n,
                ..
            } if n == number => Ok(()),
            other => Err(CodecError::UnexpectedTag(format!(
                "expected closing tag {}, got {:?}",
                number, other
            ))),
        }
    }

    fn context_content(&mut self, number: u8) -> CodecResult<&'a [u8]> {
        match self.read_tag()? {
            Tag {
                class: TagClass::Context,
                number: n,
                len,
            } if n == number => self.take(len as usize),
            other => Err(CodecError::UnexpectedTag(format!(
                "expected context tag {}, got {:?}",
                number, other
            ))),
        }
    }

    pub fn context_unsigned(&mut self, number: u8) -> CodecResult<u64> {
        let content = self.context_content(number)?;
        decode_unsigned(content)
    }

    pub fn context_object_id(&mut self, number: u8) -> CodecResult<ObjectId> {
        let content = self.context_content(number)?;
        Ok(ObjectId::from_u32(decode_unsigned(content)? as u32))
    }

    /// Read one application-tagged value
    pub fn app_value(&mut self) -> CodecResult<AppValue> {
        let tag = self.read_tag()?;
        if tag.class != TagClass::Application {
            return Err(CodecError::UnexpectedTag(format!(
                "expected application tag, got {:?}",
                tag
            )));
        }
        if tag.number == app_tag::BOOLEAN {
            return Ok(AppValue::Boolean(tag.len != 0));
        }
        let content = self.take(tag.len as usize)?;
        Ok(match tag.number {
            app_tag::NULL => AppValue::Null,
            app_tag::UNSIGNED => AppValue::Unsigned(decode_unsigned(content)?),
            app_tag::SIGNED => AppValue::Signed(decode_signed(content)?),
            app_tag::REAL => {
                let b: [u8; 4] = content.try_into().map_err(|_| CodecError::Truncated)?;
                AppValue::Real(f32::from_be_bytes(b))
            }
            app_tag::DOUBLE => {
                let b: [u8; 8] = content.try_into().map_err(|_| CodecError::Truncated)?;
                AppValue::Double(f64::from_be_bytes(b))
            }
            app_tag::OCTET_STRING => AppValue::OctetString(content.to_vec()),
            app_tag::CHARACTER_STRING => {
                let (charset, text) = content.split_first().ok_or(CodecError::Truncated)?;
                let s = match charset {
                    0 => String::from_utf8_lossy(text).into_owned(),
                    // ISO 8859-1
                    5 => text.iter().map(|b| char::from(*b)).collect(),
                    other => {
                        return Err(CodecError::Unencodable(format!(
                            "character set {} not supported",
                            other
                        )));
                    }
                };
                AppValue::CharacterString(s)
            }
            app_tag::BIT_STRING => {
                let (unused, bytes) = content.split_first().ok_or(CodecError::Truncated)?;
                let total = (bytes.len() * 8).saturating_sub(*unused as usize);
                let bits = (0..total)
                    .map(|i| bytes[i / 8] & (0x80 >> (i % 8)) != 0)
                    .collect();
                AppValue::BitString(bits)
            }
            app_tag::ENUMERATED => AppValue::Enumerated(decode_unsigned(content)? as u32),
            app_tag::DATE => {
                AppValue::Date(content.try_into().map_err(|_| CodecError::Truncated)?)
            }
            app_tag::TIME => {
                AppValue::Time(content.try_into().map_err(|_| CodecError::Truncated)?)
            }
            app_tag::OBJECT_ID => {
                AppValue::ObjectId(ObjectId::from_u32(decode_unsigned(content)? as u32))
            }
            other => {
                return Err(CodecError::UnexpectedTag(format!(
                    "unknown application tag {}",
                    other
                )));
            }
        })
    }

    /// Read application values until the given closing tag (consumed)
    pub fn values_until_closing(&mut self, number: u8) -> CodecResult<Vec<AppValue>> {
        let mut values = Vec::new();
        while !self.next_is_closing(number) {
            if self.is_empty() {
                return Err(CodecError::Truncated);
            }
            values.push(self.app_value()?);
        }
        self.expect_closing(number)?;
        Ok(values)
    }
}

fn decode_unsigned(content: &[u8]) -> CodecResult<u64> {
    if content.is_empty() || content.len() > 8 {
        return Err(CodecError::InvalidHeader(format!(
            "unsigned of length {}",
            content.len()
        )));
    }
    Ok(content.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
}

fn decode_signed(content: &[u8]) -> CodecResult<i64> {
    if content.is_empty() || content.len() > 8 {
        return Err(CodecError::InvalidHeader(format!(
            "signed of length {}",
            content.len()
        )));
    }
    let negative = content[0] & 0x80 != 0;
    let init: i64 = if negative { -1 } else { 0 };
    Ok(content
        .iter()
        .fold(init, |acc, b| (acc << 8) | i64::from(*b)))
}

// ─────────────────────────────────────────────────────────────────────────────
// BVLC / NPDU
// ─────────────────────────────────────────────────────────────────────────────

/// Remote network routing for devices behind a BACnet router
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStation {
    pub network: u16,
    pub mac: Vec<u8>,
}

/// Wrap an APDU in NPDU and BVLC headers
pub fn encode_frame(
    apdu: &[u8],
    destination: Option<&RemoteStation>,
    expecting_reply: bool,
    broadcast: bool,
) -> BytesMut {
    let mut npdu = BytesMut::with_capacity(apdu.len() + 16);
    let mut control = 0u8;
    if destination.is_some() {
        control |= NPDU_DNET_PRESENT;
    }
    if expecting_reply {
        control |= NPDU_EXPECTING_REPLY;
    }
    npdu.put_u8(NPDU_VERSION);
    npdu.put_u8(control);
    if let Some(dest) = destination {
        npdu.put_u16(dest.network);
        npdu.put_u8(dest.mac.len() as u8);
        npdu.put_slice(&dest.mac);
        // hop count
        npdu.put_u8(0xFF);
    }
    npdu.put_slice(apdu);

    let function = if broadcast {
        bvlc_function::ORIGINAL_BROADCAST_NPDU
    } else {
        bvlc_function::ORIGINAL_UNICAST_NPDU
    };
    let mut frame = BytesMut::with_capacity(npdu.len() + 4);
    frame.put_u8(BVLC_TYPE);
    frame.put_u8(function);
    frame.put_u16((npdu.len() + 4) as u16);
    frame.put_slice(&npdu);
    frame
}

/// A decoded BACnet/IP datagram
#[derive(Debug, Clone, PartialEq)]
pub struct Frame<'a> {
    /// Original sender for forwarded NPDUs
    pub origin: Option<SocketAddr>,
    /// Source network and MAC when the message came through a router
    pub source: Option<RemoteStation>,
    pub apdu: &'a [u8],
}

/// Decode BVLC and NPDU headers. Returns `None` for network-layer messages
/// and BVLC functions that carry no NPDU.
pub fn decode_frame(datagram: &[u8]) -> CodecResult<Option<Frame<'_>>> {
    if datagram.len() < 4 {
        return Err(CodecError::Truncated);
    }
    if datagram[0] != BVLC_TYPE {
        return Err(CodecError::InvalidHeader(format!(
            "BVLC type 0x{:02X}",
            datagram[0]
        )));
    }
    let length = u16::from_be_bytes([datagram[2], datagram[3]]) as usize;
    if length < 4 || length > datagram.len() {
        return Err(CodecError::InvalidHeader(format!("BVLC length {}", length)));
    }
    let datagram = &datagram[..length];

    let (origin, npdu) = match datagram[1] {
        bvlc_function::ORIGINAL_UNICAST_NPDU | bvlc_function::ORIGINAL_BROADCAST_NPDU => {
            (None, &datagram[4..])
        }
        bvlc_function::FORWARDED_NPDU => {
            let b = datagram.get(4..10).ok_or(CodecError::Truncated)?;
            let ip = Ipv4Addr::new(b[0], b[1], b[2], b[3]);
            let port = u16::from_be_bytes([b[4], b[5]]);
            (
                Some(SocketAddr::V4(SocketAddrV4::new(ip, port))),
                &datagram[10..],
            )
        }
        _ => return Ok(None),
    };

    let mut reader = TagReader::new(npdu);
    let version = reader.byte()?;
    if version != NPDU_VERSION {
        return Err(CodecError::InvalidHeader(format!("NPDU version {}", version)));
    }
    let control = reader.byte()?;
    if control & NPDU_DNET_PRESENT != 0 {
        reader.take(2)?;
        let dlen = reader.byte()? as usize;
        reader.take(dlen)?;
    }
    let mut source = None;
    if control & NPDU_SNET_PRESENT != 0 {
        let net = reader.take(2)?;
        let slen = reader.byte()? as usize;
        let mac = reader.take(slen)?;
        source = Some(RemoteStation {
            network: u16::from_be_bytes([net[0], net[1]]),
            mac: mac.to_vec(),
        });
    }
    if control & NPDU_DNET_PRESENT != 0 {
        // hop count
        reader.take(1)?;
    }
    if control & NPDU_NETWORK_MESSAGE != 0 {
        return Ok(None);
    }

    Ok(Some(Frame {
        origin,
        source,
        apdu: &npdu[reader.pos..],
    }))
}

// ─────────────────────────────────────────────────────────────────────────────
// APDU
// ─────────────────────────────────────────────────────────────────────────────

/// Decoded APDU header with the service payload
#[derive(Debug, Clone, PartialEq)]
pub enum Apdu<'a> {
    ConfirmedRequest {
        invoke_id: u8,
        service: u8,
        payload: &'a [u8],
    },
    UnconfirmedRequest {
        service: u8,
        payload: &'a [u8],
    },
    SimpleAck {
        invoke_id: u8,
        service: u8,
    },
    ComplexAck {
        invoke_id: u8,
        service: u8,
        segmented: bool,
        payload: &'a [u8],
    },
    Error {
        invoke_id: u8,
        service: u8,
        class: u32,
        code: u32,
    },
    Reject {
        invoke_id: u8,
        reason: u8,
    },
    Abort {
        invoke_id: u8,
        reason: u8,
    },
    SegmentAck {
        invoke_id: u8,
    },
}

impl Apdu<'_> {
    /// Invoke id of a reply to a confirmed request
    pub fn reply_invoke_id(&self) -> Option<u8> {
        match self {
            Apdu::SimpleAck { invoke_id, .. }
            | Apdu::ComplexAck { invoke_id, .. }
            | Apdu::Error { invoke_id, .. }
            | Apdu::Reject { invoke_id, .. }
            | Apdu::Abort { invoke_id, .. }
            | Apdu::SegmentAck { invoke_id } => Some(*invoke_id),
            _ => None,
        }
    }
}

pub fn decode_apdu(apdu: &[u8]) -> CodecResult<Apdu<'_>> {
    let first = *apdu.first().ok_or(CodecError::Truncated)?;
    let byte = |i: usize| apdu.get(i).copied().ok_or(CodecError::Truncated);

    match first & 0xF0 {
        pdu_type::CONFIRMED_REQUEST => {
            let segmented = first & SEGMENTED_MESSAGE != 0;
            let service_at = if segmented { 5 } else { 3 };
            Ok(Apdu::ConfirmedRequest {
                invoke_id: byte(2)?,
                service: byte(service_at)?,
                payload: apdu.get(service_at + 1..).unwrap_or_default(),
            })
        }
        pdu_type::UNCONFIRMED_REQUEST => Ok(Apdu::UnconfirmedRequest {
            service: byte(1)?,
            payload: apdu.get(2..).unwrap_or_default(),
        }),
        pdu_type::SIMPLE_ACK => Ok(Apdu::SimpleAck {
            invoke_id: byte(1)?,
            service: byte(2)?,
        }),
        pdu_type::COMPLEX_ACK => {
            let segmented = first & SEGMENTED_MESSAGE != 0;
            let service_at = if segmented { 4 } else { 2 };
            Ok(Apdu::ComplexAck {
                invoke_id: byte(1)?,
                service: byte(service_at)?,
                segmented,
                payload: apdu.get(service_at + 1..).unwrap_or_default(),
            })
        }
        pdu_type::SEGMENT_ACK => Ok(Apdu::SegmentAck {
            invoke_id: byte(1)?,
        }),
        pdu_type::ERROR => {
            let invoke_id = byte(1)?;
            let service = byte(2)?;
            let mut reader = TagReader::new(apdu.get(3..).unwrap_or_default());
            let class = enumerated(reader.app_value()?)?;
            let code = enumerated(reader.app_value()?)?;
            Ok(Apdu::Error {
                invoke_id,
                service,
                class,
                code,
            })
        }
        pdu_type::REJECT => Ok(Apdu::Reject {
            invoke_id: byte(1)?,
            reason: byte(2)?,
        }),
        pdu_type::ABORT => Ok(Apdu::Abort {
            invoke_id: byte(1)?,
            reason: byte(2)?,
        }),
        other => Err(CodecError::InvalidHeader(format!("PDU type 0x{:02X}", other))),
    }
}

fn enumerated(value: AppValue) -> CodecResult<u32> {
    match value {
        AppValue::Enumerated(n) => Ok(n),
        AppValue::Unsigned(n) => Ok(n as u32),
        other => Err(CodecError::UnexpectedTag(format!(
            "expected enumerated, got {:?}",
            other
        ))),
    }
}

fn confirmed_header(buf: &mut BytesMut, invoke_id: u8, service: u8) {
    buf.put_u8(pdu_type::CONFIRMED_REQUEST);
    buf.put_u8(MAX_APDU_1476);
    buf.put_u8(invoke_id);
    buf.put_u8(service);
}

// ─────────────────────────────────────────────────────────────────────────────
// Services
// ─────────────────────────────────────────────────────────────────────────────

/// Who-Is, optionally limited to an instance range
pub fn encode_who_is(range: Option<(u32, u32)>) -> BytesMut {
    let mut buf = BytesMut::with_capacity(12);
    buf.put_u8(pdu_type::UNCONFIRMED_REQUEST);
    buf.put_u8(service::WHO_IS);
    if let Some((low, high)) = range {
        put_context_unsigned(&mut buf, 0, u64::from(low));
        put_context_unsigned(&mut buf, 1, u64::from(high));
    }
    buf
}

/// Instance range carried by a Who-Is payload
pub fn decode_who_is(payload: &[u8]) -> CodecResult<Option<(u32, u32)>> {
    if payload.is_empty() {
        return Ok(None);
    }
    let mut reader = TagReader::new(payload);
    let low = reader.context_unsigned(0)? as u32;
    let high = reader.context_unsigned(1)? as u32;
    Ok(Some((low, high)))
}

/// I-Am announcement
#[derive(Debug, Clone, PartialEq)]
pub struct IAm {
    pub device: ObjectId,
    pub max_apdu: u32,
    pub segmentation: u8,
    pub vendor_id: u16,
}

pub fn encode_i_am(i_am: &IAm) -> BytesMut {
    let mut buf = BytesMut::with_capacity(20);
    buf.put_u8(pdu_type::UNCONFIRMED_REQUEST);
    buf.put_u8(service::I_AM);
    put_app_value(&mut buf, &AppValue::ObjectId(i_am.device));
    put_app_value(&mut buf, &AppValue::Unsigned(u64::from(i_am.max_apdu)));
    put_app_value(&mut buf, &AppValue::Enumerated(u32::from(i_am.segmentation)));
    put_app_value(&mut buf, &AppValue::Unsigned(u64::from(i_am.vendor_id)));
    buf
}

pub fn decode_i_am(payload: &[u8]) -> CodecResult<IAm> {
    let mut reader = TagReader::new(payload);
    let device = match reader.app_value()? {
        AppValue::ObjectId(oid) => oid,
        other => {
            return Err(CodecError::UnexpectedTag(format!(
                "I-Am device identifier: {:?}",
                other
            )));
        }
    };
    let max_apdu = match reader.app_value()? {
        AppValue::Unsigned(n) => n as u32,
        other => {
            return Err(CodecError::UnexpectedTag(format!("I-Am max APDU: {:?}", other)));
        }
    };
    let segmentation = enumerated(reader.app_value()?)? as u8;
    let vendor_id = match reader.app_value()? {
        AppValue::Unsigned(n) => n as u16,
        other => {
            return Err(CodecError::UnexpectedTag(format!("I-Am vendor: {:?}", other)));
        }
    };
    Ok(IAm {
        device,
        max_apdu,
        segmentation,
        vendor_id,
    })
}

/// Property reference inside a read request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PropertyRef {
    pub property: u32,
    pub index: Option<u32>,
}

impl PropertyRef {
    pub fn new(property: u32) -> Self {
        Self {
            property,
            index: None,
        }
    }

    pub fn indexed(property: u32, index: u32) -> Self {
        Self {
            property,
            index: Some(index),
        }
    }
}

pub fn encode_read_property(invoke_id: u8, object: ObjectId, prop: PropertyRef) -> BytesMut {
    let mut buf = BytesMut::with_capacity(16);
    confirmed_header(&mut buf, invoke_id, service::READ_PROPERTY);
    put_context_object_id(&mut buf, 0, object);
    put_context_unsigned(&mut buf, 1, u64::from(prop.property));
    if let Some(index) = prop.index {
        put_context_unsigned(&mut buf, 2, u64::from(index));
    }
    buf
}

/// ReadProperty-ACK payload: echoed reference and the property value(s)
#[derive(Debug, Clone, PartialEq)]
pub struct ReadPropertyAck {
    pub object: ObjectId,
    pub prop: PropertyRef,
    pub values: Vec<AppValue>,
}

pub fn decode_read_property_ack(payload: &[u8]) -> CodecResult<ReadPropertyAck> {
    let mut reader = TagReader::new(payload);
    let object = reader.context_object_id(0)?;
    let property = reader.context_unsigned(1)? as u32;
    let index = if reader.next_is_context(2) {
        Some(reader.context_unsigned(2)? as u32)
    } else {
        None
    };
    reader.expect_opening(3)?;
    let values = reader.values_until_closing(3)?;
    Ok(ReadPropertyAck {
        object,
        prop: PropertyRef { property, index },
        values,
    })
}

pub fn encode_read_property_multiple(
    invoke_id: u8,
    requests: &[(ObjectId, Vec<PropertyRef>)],
) -> BytesMut {
    let mut buf = BytesMut::with_capacity(8 + requests.len() * 10);
    confirmed_header(&mut buf, invoke_id, service::READ_PROPERTY_MULTIPLE);
    for (object, props) in requests {
        put_context_object_id(&mut buf, 0, *object);
        put_opening(&mut buf, 1);
        for prop in props {
            put_context_unsigned(&mut buf, 0, u64::from(prop.property));
            if let Some(index) = prop.index {
                put_context_unsigned(&mut buf, 1, u64::from(index));
            }
        }
        put_closing(&mut buf, 1);
    }
    buf
}

/// Outcome of one property inside a ReadPropertyMultiple-ACK
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyResult {
    Value(Vec<AppValue>),
    Error { class: u32, code: u32 },
}

/// One entry of a ReadPropertyMultiple-ACK
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyAccess {
    pub object: ObjectId,
    pub prop: PropertyRef,
    pub result: PropertyResult,
}

pub fn decode_read_property_multiple_ack(payload: &[u8]) -> CodecResult<Vec<PropertyAccess>> {
    let mut reader = TagReader::new(payload);
    let mut results = Vec::new();
    while !reader.is_empty() {
        let object = reader.context_object_id(0)?;
        reader.expect_opening(1)?;
        while !reader.next_is_closing(1) {
            if reader.is_empty() {
                return Err(CodecError::Truncated);
            }
            let property = reader.context_unsigned(2)? as u32;
            let index = if reader.next_is_context(3) {
                Some(reader.context_unsigned(3)? as u32)
            } else {
                None
            };
            let result = if reader.next_is_context(4) {
                reader.expect_opening(4)?;
                PropertyResult::Value(reader.values_until_closing(4)?)
            } else {
                reader.expect_opening(5)?;
                let class = enumerated(reader.app_value()?)?;
                let code = enumerated(reader.app_value()?)?;
                reader.expect_closing(5)?;
                PropertyResult::Error { class, code }
            };
            results.push(PropertyAccess {
                object,
                prop: PropertyRef { property, index },
                result,
            });
        }
        reader.expect_closing(1)?;
    }
    Ok(results)
}

pub fn encode_write_property(
    invoke_id: u8,
    object: ObjectId,
    prop: PropertyRef,
    value: &AppValue,
    priority: Option<u8>,
) -> BytesMut {
    let mut buf = BytesMut::with_capacity(24);
    confirmed_header(&mut buf, invoke_id, service::WRITE_PROPERTY);
    put_context_object_id(&mut buf, 0, object);
    put_context_unsigned(&mut buf, 1, u64::from(prop.property));
    if let Some(index) = prop.index {
        put_context_unsigned(&mut buf, 2, u64::from(index));
    }
    put_opening(&mut buf, 3);
    put_app_value(&mut buf, value);
    put_closing(&mut buf, 3);
    if let Some(priority) = priority {
        put_context_unsigned(&mut buf, 4, u64::from(priority));
    }
    buf
}

/// Human-readable BACnet error class/code pair
pub fn describe_error(class: u32, code: u32) -> String {
    let class_name = match class {
        0 => "device",
        1 => "object",
        2 => "property",
        3 => "resources",
        4 => "security",
        5 => "services",
        7 => "communication",
        _ => "other",
    };
    let code_name = match code {
        9 => "invalid-data-type",
        31 => "unknown-object",
        32 => "unknown-property",
        37 => "value-out-of-range",
        40 => "write-access-denied",
        42 => "invalid-array-index",
        50 => "optional-functionality-not-supported",
        _ => "",
    };
    if code_name.is_empty() {
        format!("{}:{}", class_name, code)
    } else {
        format!("{}:{}", class_name, code_name)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
