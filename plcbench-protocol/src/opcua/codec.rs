//! OPC UA binary encoding for the handful of services the adapter uses, over a
//! secure channel with security policy None.
//!
//! Only what a benchmark client needs is modelled: connection handshake, channel
//! open/close, session create/activate/close, Read and Write of scalar and array
//! values. Response types are decoded just far enough to get at their results.

use bytes::{BufMut, BytesMut};
use plcbench_common::{BenchError, Result};
use std::time::{SystemTime, UNIX_EPOCH};

pub const HEADER_LEN: usize = 8;
pub const SECURITY_POLICY_NONE: &str = "http://opcfoundation.org/UA/SecurityPolicy#None";
pub const BUFFER_SIZE: u32 = 65_535;

/// Binary encoding ids of the structures exchanged with the server
pub mod type_id {
    pub const SERVICE_FAULT: u32 = 397;
    pub const ANONYMOUS_IDENTITY_TOKEN: u32 = 321;
    pub const OPEN_SECURE_CHANNEL_REQUEST: u32 = 446;
    pub const OPEN_SECURE_CHANNEL_RESPONSE: u32 = 449;
    pub const CLOSE_SECURE_CHANNEL_REQUEST: u32 = 452;
    pub const CREATE_SESSION_REQUEST: u32 = 461;
    pub const CREATE_SESSION_RESPONSE: u32 = 464;
    pub const ACTIVATE_SESSION_REQUEST: u32 = 467;
    pub const ACTIVATE_SESSION_RESPONSE: u32 = 470;
    pub const CLOSE_SESSION_REQUEST: u32 = 473;
    pub const CLOSE_SESSION_RESPONSE: u32 = 476;
    pub const READ_REQUEST: u32 = 631;
    pub const READ_RESPONSE: u32 = 634;
    pub const WRITE_REQUEST: u32 = 673;
    pub const WRITE_RESPONSE: u32 = 676;
}

const ATTRIBUTE_VALUE: u32 = 13;
const TIMESTAMPS_NEITHER: u32 = 3;
const SECURITY_MODE_NONE: u32 = 1;
const APPLICATION_TYPE_CLIENT: u32 = 1;
/// Ticks of 100 ns between 1601-01-01 and the Unix epoch
const EPOCH_OFFSET_TICKS: i64 = 116_444_736_000_000_000;

pub(crate) fn codec_error(message: impl Into<String>) -> BenchError {
    BenchError::operation("opc ua", message)
}

/// OPC UA status code; zero is Good
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusCode(pub u32);

impl StatusCode {
    pub fn is_good(&self) -> bool {
        self.0 & 0xC000_0000 == 0
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self.0 {
            0x8002_0000 => " BadInternalError",
            0x800A_0000 => " BadTimeout",
            0x8025_0000 => " BadSessionIdInvalid",
            0x8026_0000 => " BadSessionClosed",
            0x8027_0000 => " BadSessionNotActivated",
            0x8033_0000 => " BadNodeIdUnknown",
            0x8034_0000 => " BadNodeIdInvalid",
            0x8035_0000 => " BadAttributeIdInvalid",
            0x803B_0000 => " BadNotWritable",
            0x803A_0000 => " BadNotReadable",
            0x8074_0000 => " BadTypeMismatch",
            0x801F_0000 => " BadUserAccessDenied",
            0x8022_0000 => " BadSecureChannelIdInvalid",
            0x8021_0000 => " BadIdentityTokenInvalid",
            _ => "",
        };
        write!(f, "0x{:08X}{}", self.0, name)
    }
}

/// Node identifier in any of the binary encodings
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeId {
    Numeric { namespace: u16, id: u32 },
    String { namespace: u16, id: String },
    Guid { namespace: u16, id: [u8; 16] },
    Opaque { namespace: u16, id: Vec<u8> },
}

impl NodeId {
    pub fn null() -> Self {
        NodeId::Numeric { namespace: 0, id: 0 }
    }

    pub fn numeric(id: u32) -> Self {
        NodeId::Numeric { namespace: 0, id }
    }

    pub fn string(namespace: u16, id: impl Into<String>) -> Self {
        NodeId::String {
            namespace,
            id: id.into(),
        }
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeId::Numeric { namespace, id } => write!(f, "ns={};i={}", namespace, id),
            NodeId::String { namespace, id } => write!(f, "ns={};s={}", namespace, id),
            NodeId::Guid { namespace, .. } => write!(f, "ns={};g=<guid>", namespace),
            NodeId::Opaque { namespace, .. } => write!(f, "ns={};b=<opaque>", namespace),
        }
    }
}

/// Values this client writes and reads
#[derive(Debug, Clone, PartialEq)]
pub enum Variant {
    Empty,
    Boolean(bool),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Int64Array(Vec<i64>),
    /// A type the client does not interpret, identified by its type byte
    Other(u8),
}

impl Variant {
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Variant::Empty => serde_json::Value::Null,
            Variant::Boolean(v) => serde_json::Value::Bool(*v),
            Variant::Int16(v) => serde_json::Value::from(*v),
            Variant::Int32(v) => serde_json::Value::from(*v),
            Variant::Int64(v) => serde_json::Value::from(*v),
            Variant::Int64Array(v) => serde_json::Value::from(v.clone()),
            Variant::Other(t) => serde_json::Value::String(format!("<variant type {}>", t)),
        }
    }
}

/// Little-endian writer for UA binary
#[derive(Debug, Default)]
pub struct Encoder {
    buf: BytesMut,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_bytes(self) -> BytesMut {
        self.buf
    }

    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.put_u8(v);
        self
    }

    pub fn u16(&mut self, v: u16) -> &mut Self {
        self.buf.put_u16_le(v);
        self
    }

    pub fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.put_u32_le(v);
        self
    }

    pub fn i32(&mut self, v: i32) -> &mut Self {
        self.buf.put_i32_le(v);
        self
    }

    pub fn i64(&mut self, v: i64) -> &mut Self {
        self.buf.put_i64_le(v);
        self
    }

    pub fn f64(&mut self, v: f64) -> &mut Self {
        self.buf.put_f64_le(v);
        self
    }

    pub fn bytes(&mut self, v: &[u8]) -> &mut Self {
        self.buf.put_slice(v);
        self
    }

    pub fn string(&mut self, v: Option<&str>) -> &mut Self {
        match v {
            Some(s) => {
                self.i32(s.len() as i32);
                self.buf.put_slice(s.as_bytes());
            }
            None => {
                self.i32(-1);
            }
        }
        self
    }

    pub fn byte_string(&mut self, v: Option<&[u8]>) -> &mut Self {
        match v {
            Some(b) => {
                self.i32(b.len() as i32);
                self.buf.put_slice(b);
            }
            None => {
                self.i32(-1);
            }
        }
        self
    }

    pub fn node_id(&mut self, node: &NodeId) -> &mut Self {
        match node {
            NodeId::Numeric { namespace: 0, id } if *id <= 0xFF => {
                self.u8(0x00).u8(*id as u8);
            }
            NodeId::Numeric { namespace, id } if *namespace <= 0xFF && *id <= 0xFFFF => {
                self.u8(0x01).u8(*namespace as u8).u16(*id as u16);
            }
            NodeId::Numeric { namespace, id } => {
                self.u8(0x02).u16(*namespace).u32(*id);
            }
            NodeId::String { namespace, id } => {
                self.u8(0x03).u16(*namespace).string(Some(id.as_str()));
            }
            NodeId::Guid { namespace, id } => {
                self.u8(0x04).u16(*namespace).bytes(id);
            }
            NodeId::Opaque { namespace, id } => {
                self.u8(0x05).u16(*namespace).byte_string(Some(id.as_slice()));
            }
        }
        self
    }

    /// Extension object without a body
    pub fn empty_extension_object(&mut self) -> &mut Self {
        self.node_id(&NodeId::null()).u8(0x00)
    }

    pub fn variant(&mut self, value: &Variant) -> &mut Self {
        match value {
            Variant::Empty | Variant::Other(_) => {
                self.u8(0);
            }
            Variant::Boolean(v) => {
                self.u8(1).u8(u8::from(*v));
            }
            Variant::Int16(v) => {
                self.u8(4).u16(*v as u16);
            }
            Variant::Int32(v) => {
                self.u8(6).i32(*v);
            }
            Variant::Int64(v) => {
                self.u8(8).i64(*v);
            }
            Variant::Int64Array(values) => {
                self.u8(8 | 0x80).i32(values.len() as i32);
                for v in values {
                    self.i64(*v);
                }
            }
        }
        self
    }

    pub fn request_header(&mut self, header: &RequestHeader) -> &mut Self {
        self.node_id(&header.authentication_token)
            .i64(header.timestamp)
            .u32(header.request_handle)
            .u32(0) // return diagnostics
            .string(None) // audit entry id
            .u32(header.timeout_hint_ms)
            .empty_extension_object()
    }
}

/// Bounds-checked little-endian reader for UA binary
#[derive(Debug)]
pub struct Decoder<'a> {
    buf: &'a [u8],
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> &'a [u8] {
        self.buf
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() < n {
            return Err(codec_error(format!(
                "message truncated: needed {} bytes, {} left",
                n,
                self.buf.len()
            )));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    pub fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    pub fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.array()?))
    }

    pub fn f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.array()?))
    }

    pub fn byte_string(&mut self) -> Result<Option<Vec<u8>>> {
        let len = self.i32()?;
        if len < 0 {
            return Ok(None);
        }
        Ok(Some(self.take(len as usize)?.to_vec()))
    }

    pub fn string(&mut self) -> Result<Option<String>> {
        match self.byte_string()? {
            Some(raw) => String::from_utf8(raw)
                .map(Some)
                .map_err(|_| codec_error("string is not valid UTF-8")),
            None => Ok(None),
        }
    }

    /// Length prefix of an array; null arrays decode as empty
    pub fn array_len(&mut self) -> Result<usize> {
        let len = self.i32()?;
        Ok(len.max(0) as usize)
    }

    pub fn node_id(&mut self) -> Result<NodeId> {
        let encoding = self.u8()?;
        // namespace-uri and server-index flags only appear in expanded node ids
        match encoding & 0x3F {
            0x00 => Ok(NodeId::Numeric {
                namespace: 0,
                id: u32::from(self.u8()?),
            }),
            0x01 => {
                let namespace = u16::from(self.u8()?);
                let id = u32::from(self.u16()?);
                Ok(NodeId::Numeric { namespace, id })
            }
            0x02 => {
                let namespace = self.u16()?;
                let id = self.u32()?;
                Ok(NodeId::Numeric { namespace, id })
            }
            0x03 => {
                let namespace = self.u16()?;
                let id = self.string()?.unwrap_or_default();
                Ok(NodeId::String { namespace, id })
            }
            0x04 => {
                let namespace = self.u16()?;
                Ok(NodeId::Guid {
                    namespace,
                    id: self.array()?,
                })
            }
            0x05 => {
                let namespace = self.u16()?;
                let id = self.byte_string()?.unwrap_or_default();
                Ok(NodeId::Opaque { namespace, id })
            }
            other => Err(codec_error(format!("unknown NodeId encoding 0x{:02X}", other))),
        }
    }

    pub fn skip_extension_object(&mut self) -> Result<()> {
        self.node_id()?;
        match self.u8()? {
            0x00 => Ok(()),
            0x01 | 0x02 => self.byte_string().map(|_| ()),
            other => Err(codec_error(format!("bad extension object encoding 0x{:02X}", other))),
        }
    }

    pub fn skip_diagnostic_info(&mut self) -> Result<()> {
        let mask = self.u8()?;
        for bit in [0x01u8, 0x02, 0x04, 0x08] {
            if mask & bit != 0 {
                self.i32()?;
            }
        }
        if mask & 0x10 != 0 {
            self.string()?;
        }
        if mask & 0x20 != 0 {
            self.u32()?;
        }
        if mask & 0x40 != 0 {
            self.skip_diagnostic_info()?;
        }
        Ok(())
    }

    pub fn response_header(&mut self) -> Result<ResponseHeader> {
        let timestamp = self.i64()?;
        let request_handle = self.u32()?;
        let service_result = StatusCode(self.u32()?);
        self.skip_diagnostic_info()?;
        let strings = self.array_len()?;
        for _ in 0..strings {
            self.string()?;
        }
        self.skip_extension_object()?;
        Ok(ResponseHeader {
            timestamp,
            request_handle,
            service_result,
        })
    }

    pub fn variant(&mut self) -> Result<Variant> {
        let mask = self.u8()?;
        let type_id = mask & 0x3F;
        if mask & 0x80 != 0 {
            let len = self.array_len()?;
            let value = match type_id {
                8 => {
                    let mut values = Vec::with_capacity(len);
                    for _ in 0..len {
                        values.push(self.i64()?);
                    }
                    Variant::Int64Array(values)
                }
                other => {
                    for _ in 0..len {
                        self.skip_scalar(other)?;
                    }
                    Variant::Other(other)
                }
            };
            if mask & 0x40 != 0 {
                let dims = self.array_len()?;
                for _ in 0..dims {
                    self.i32()?;
                }
            }
            return Ok(value);
        }
        match type_id {
            0 => Ok(Variant::Empty),
            1 => Ok(Variant::Boolean(self.u8()? != 0)),
            4 => Ok(Variant::Int16(self.u16()? as i16)),
            6 => Ok(Variant::Int32(self.i32()?)),
            8 => Ok(Variant::Int64(self.i64()?)),
            other => {
                self.skip_scalar(other)?;
                Ok(Variant::Other(other))
            }
        }
    }

    fn skip_scalar(&mut self, type_id: u8) -> Result<()> {
        let width = match type_id {
            1 | 2 | 3 => 1,
            4 | 5 => 2,
            6 | 7 | 10 | 19 => 4,
            8 | 9 | 11 | 13 => 8,
            14 => 16,
            12 | 15 | 16 => {
                self.byte_string()?;
                return Ok(());
            }
            other => {
                return Err(codec_error(format!("cannot decode variant type {}", other)));
            }
        };
        self.take(width).map(|_| ())
    }

    pub fn data_value(&mut self) -> Result<DataValue> {
        let mask = self.u8()?;
        let value = if mask & 0x01 != 0 {
            self.variant()?
        } else {
            Variant::Empty
        };
        let status = if mask & 0x02 != 0 {
            StatusCode(self.u32()?)
        } else {
            StatusCode(0)
        };
        if mask & 0x04 != 0 {
            self.i64()?;
        }
        if mask & 0x10 != 0 {
            self.u16()?;
        }
        if mask & 0x08 != 0 {
            self.i64()?;
        }
        if mask & 0x20 != 0 {
            self.u16()?;
        }
        Ok(DataValue { value, status })
    }
}

#[derive(Debug, Clone)]
pub struct RequestHeader {
    pub authentication_token: NodeId,
    pub timestamp: i64,
    pub request_handle: u32,
    pub timeout_hint_ms: u32,
}

impl RequestHeader {
    pub fn new(authentication_token: NodeId, request_handle: u32, timeout_hint_ms: u32) -> Self {
        Self {
            authentication_token,
            timestamp: now_ticks(),
            request_handle,
            timeout_hint_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResponseHeader {
    pub timestamp: i64,
    pub request_handle: u32,
    pub service_result: StatusCode,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataValue {
    pub value: Variant,
    pub status: StatusCode,
}

/// Current time as a UA DateTime
pub fn now_ticks() -> i64 {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    EPOCH_OFFSET_TICKS + (since_epoch.as_nanos() / 100) as i64
}

/// Transport-level message header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub message_type: [u8; 3],
    pub chunk_type: u8,
    pub size: u32,
}

pub fn parse_header(raw: &[u8; HEADER_LEN]) -> Result<MessageHeader> {
    let message_type = [raw[0], raw[1], raw[2]];
    let size = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]);
    if (size as usize) < HEADER_LEN {
        return Err(codec_error(format!("message size {} below header length", size)));
    }
    Ok(MessageHeader {
        message_type,
        chunk_type: raw[3],
        size,
    })
}

fn frame(message_type: &[u8; 3], body: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + body.len());
    buf.put_slice(message_type);
    buf.put_u8(b'F');
    buf.put_u32_le((HEADER_LEN + body.len()) as u32);
    buf.put_slice(body);
    buf
}

pub fn hello(endpoint_url: &str) -> BytesMut {
    let mut body = Encoder::new();
    body.u32(0) // protocol version
        .u32(BUFFER_SIZE)
        .u32(BUFFER_SIZE)
        .u32(0) // max message size
        .u32(0) // max chunk count
        .string(Some(endpoint_url));
    frame(b"HEL", &body.into_bytes())
}

/// Negotiated limits from an ACK message body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acknowledge {
    pub receive_buffer_size: u32,
    pub send_buffer_size: u32,
    pub max_message_size: u32,
}

pub fn parse_acknowledge(body: &[u8]) -> Result<Acknowledge> {
    let mut d = Decoder::new(body);
    let _version = d.u32()?;
    Ok(Acknowledge {
        receive_buffer_size: d.u32()?,
        send_buffer_size: d.u32()?,
        max_message_size: d.u32()?,
    })
}

/// Status and reason carried by an ERR message
pub fn parse_error_message(body: &[u8]) -> (StatusCode, String) {
    let mut d = Decoder::new(body);
    let status = d.u32().map(StatusCode).unwrap_or(StatusCode(0));
    let reason = d.string().ok().flatten().unwrap_or_default();
    (status, reason)
}

pub fn open_secure_channel(sequence_number: u32, request_id: u32, header: &RequestHeader, lifetime_ms: u32) -> BytesMut {
    let mut e = Encoder::new();
    e.u32(0) // secure channel id
        .string(Some(SECURITY_POLICY_NONE))
        .byte_string(None)
        .byte_string(None)
        .u32(sequence_number)
        .u32(request_id)
        .node_id(&NodeId::numeric(type_id::OPEN_SECURE_CHANNEL_REQUEST))
        .request_header(header)
        .u32(0) // client protocol version
        .u32(0) // issue
        .u32(SECURITY_MODE_NONE)
        .i32(0) // empty client nonce
        .u32(lifetime_ms);
    frame(b"OPN", &e.into_bytes())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecureChannel {
    pub channel_id: u32,
    pub token_id: u32,
    pub revised_lifetime_ms: u32,
}

/// Decode an OPN response body (everything after the message header)
pub fn parse_open_secure_channel(body: &[u8]) -> Result<SecureChannel> {
    let mut d = Decoder::new(body);
    let _channel_id = d.u32()?;
    let policy = d.string()?.unwrap_or_default();
    if policy != SECURITY_POLICY_NONE {
        return Err(codec_error(format!("server answered with security policy {}", policy)));
    }
    d.byte_string()?;
    d.byte_string()?;
    let _sequence_number = d.u32()?;
    let _request_id = d.u32()?;
    let header = expect_response(&mut d, type_id::OPEN_SECURE_CHANNEL_RESPONSE)?;
    check_service_result(&header)?;
    let _server_protocol_version = d.u32()?;
    let channel_id = d.u32()?;
    let token_id = d.u32()?;
    let _created_at = d.i64()?;
    let revised_lifetime_ms = d.u32()?;
    Ok(SecureChannel {
        channel_id,
        token_id,
        revised_lifetime_ms,
    })
}

/// Wrap a service body into a symmetric (MSG or CLO) message
pub fn symmetric(message_type: &[u8; 3], channel: &SecureChannel, sequence_number: u32, request_id: u32, body: &[u8]) -> BytesMut {
    let mut e = Encoder::new();
    e.u32(channel.channel_id)
        .u32(channel.token_id)
        .u32(sequence_number)
        .u32(request_id)
        .bytes(body);
    frame(message_type, &e.into_bytes())
}

/// Security and sequence headers of a symmetric chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub channel_id: u32,
    pub token_id: u32,
    pub sequence_number: u32,
    pub request_id: u32,
}

pub fn parse_chunk(body: &[u8]) -> Result<(ChunkHeader, &[u8])> {
    let mut d = Decoder::new(body);
    let header = ChunkHeader {
        channel_id: d.u32()?,
        token_id: d.u32()?,
        sequence_number: d.u32()?,
        request_id: d.u32()?,
    };
    Ok((header, d.remaining()))
}

/// Read the type id and response header, turning a ServiceFault into an error
pub fn expect_response(d: &mut Decoder<'_>, expected: u32) -> Result<ResponseHeader> {
    let node = d.node_id()?;
    let header = d.response_header()?;
    match node {
        NodeId::Numeric { namespace: 0, id } if id == expected => Ok(header),
        NodeId::Numeric { namespace: 0, id: type_id::SERVICE_FAULT } => Err(codec_error(format!(
            "service fault {}",
            header.service_result
        ))),
        other => Err(codec_error(format!(
            "unexpected response type {} (wanted {})",
            other, expected
        ))),
    }
}

pub fn check_service_result(header: &ResponseHeader) -> Result<()> {
    if header.service_result.is_good() {
        Ok(())
    } else {
        Err(codec_error(format!("service result {}", header.service_result)))
    }
}

pub fn create_session(header: &RequestHeader, endpoint_url: &str, session_name: &str, timeout_ms: f64) -> BytesMut {
    let mut e = Encoder::new();
    e.node_id(&NodeId::numeric(type_id::CREATE_SESSION_REQUEST))
        .request_header(header)
        // client description
        .string(Some("urn:plcbench:client"))
        .string(Some("urn:plcbench"))
        .u8(0x02)
        .string(Some("plcbench"))
        .u32(APPLICATION_TYPE_CLIENT)
        .string(None)
        .string(None)
        .i32(-1)
        // server uri, endpoint, session name
        .string(None)
        .string(Some(endpoint_url))
        .string(Some(session_name))
        .byte_string(None) // client nonce
        .byte_string(None) // client certificate
        .f64(timeout_ms)
        .u32(0);
    e.into_bytes()
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreatedSession {
    pub session_id: NodeId,
    pub authentication_token: NodeId,
    pub revised_timeout_ms: f64,
}

pub fn parse_create_session(body: &[u8]) -> Result<CreatedSession> {
    let mut d = Decoder::new(body);
    let header = expect_response(&mut d, type_id::CREATE_SESSION_RESPONSE)?;
    check_service_result(&header)?;
    Ok(CreatedSession {
        session_id: d.node_id()?,
        authentication_token: d.node_id()?,
        revised_timeout_ms: d.f64()?,
    })
}

pub fn activate_session(header: &RequestHeader, anonymous_policy_id: &str) -> BytesMut {
    let mut token = Encoder::new();
    token.string(Some(anonymous_policy_id));
    let token = token.into_bytes();

    let mut e = Encoder::new();
    e.node_id(&NodeId::numeric(type_id::ACTIVATE_SESSION_REQUEST))
        .request_header(header)
        .string(None) // client signature algorithm
        .byte_string(None) // client signature
        .i32(-1) // client software certificates
        .i32(-1) // locale ids
        .node_id(&NodeId::numeric(type_id::ANONYMOUS_IDENTITY_TOKEN))
        .u8(0x01)
        .byte_string(Some(&token[..]))
        .string(None) // user token signature algorithm
        .byte_string(None);
    e.into_bytes()
}

pub fn parse_activate_session(body: &[u8]) -> Result<()> {
    let mut d = Decoder::new(body);
    let header = expect_response(&mut d, type_id::ACTIVATE_SESSION_RESPONSE)?;
    check_service_result(&header)
}

pub fn close_session(header: &RequestHeader) -> BytesMut {
    let mut e = Encoder::new();
    e.node_id(&NodeId::numeric(type_id::CLOSE_SESSION_REQUEST))
        .request_header(header)
        .u8(1); // delete subscriptions
    e.into_bytes()
}

pub fn parse_close_session(body: &[u8]) -> Result<()> {
    let mut d = Decoder::new(body);
    let header = expect_response(&mut d, type_id::CLOSE_SESSION_RESPONSE)?;
    check_service_result(&header)
}

pub fn close_secure_channel(header: &RequestHeader) -> BytesMut {
    let mut e = Encoder::new();
    e.node_id(&NodeId::numeric(type_id::CLOSE_SECURE_CHANNEL_REQUEST))
        .request_header(header);
    e.into_bytes()
}

pub fn write_request(header: &RequestHeader, items: &[(NodeId, Variant)]) -> BytesMut {
    let mut e = Encoder::new();
    e.node_id(&NodeId::numeric(type_id::WRITE_REQUEST))
        .request_header(header)
        .i32(items.len() as i32);
    for (node, value) in items {
        e.node_id(node)
            .u32(ATTRIBUTE_VALUE)
            .string(None) // index range
            .u8(0x01) // data value carries only a value
            .variant(value);
    }
    e.into_bytes()
}

pub fn parse_write_response(body: &[u8]) -> Result<Vec<StatusCode>> {
    let mut d = Decoder::new(body);
    let header = expect_response(&mut d, type_id::WRITE_RESPONSE)?;
    check_service_result(&header)?;
    let count = d.array_len()?;
    let mut results = Vec::with_capacity(count);
    for _ in 0..count {
        results.push(StatusCode(d.u32()?));
    }
    Ok(results)
}

pub fn read_request(header: &RequestHeader, nodes: &[NodeId]) -> BytesMut {
    let mut e = Encoder::new();
    e.node_id(&NodeId::numeric(type_id::READ_REQUEST))
        .request_header(header)
        .f64(0.0) // max age
        .u32(TIMESTAMPS_NEITHER)
        .i32(nodes.len() as i32);
    for node in nodes {
        e.node_id(node)
            .u32(ATTRIBUTE_VALUE)
            .string(None) // index range
            .u16(0) // data encoding
            .string(None);
    }
    e.into_bytes()
}

pub fn parse_read_response(body: &[u8]) -> Result<Vec<DataValue>> {
    let mut d = Decoder::new(body);
    let header = expect_response(&mut d, type_id::READ_RESPONSE)?;
    check_service_result(&header)?;
    let count = d.array_len()?;
    let mut results = Vec::with_capacity(count);
    for _ in 0..count {
        results.push(d.data_value()?);
    }
    Ok(results)
}
