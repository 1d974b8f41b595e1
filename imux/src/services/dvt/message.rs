//! DTX message format
//!
//! ```text
//! +---------------------+
//! |   MessageHeader     | 32 bytes
//! +---------------------+
//! |   PayloadHeader     | 16 bytes
//! +---------------------+
//! |   AuxHeader         | 16 bytes (if aux present)
//! |   Aux data          | variable length
//! +---------------------+
//! |   Payload data      | variable length (NSKeyedArchive)
//! +---------------------+
//! ```
//!
//! A logical message may be split into several wire fragments. The first fragment of a
//! multi-fragment message carries only a header; the following fragments carry slices of
//! the payload, see [`super::fragment`].

use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt};
use plist::Value;
use tokio::io::AsyncRead;

use crate::ImuxError;

use super::fragment::FragmentAssembler;

/// Magic number opening every message header
pub const DTX_MAGIC: u32 = 0x1F3D5B79;
pub const MESSAGE_HEADER_LEN: usize = 32;
pub const PAYLOAD_HEADER_LEN: usize = 16;
const AUX_HEADER_LEN: usize = 16;

/// Set in the payload flags when the sender wants an answer
pub const EXPECTS_REPLY_MASK: u32 = 0x1000;

/// Kind of message, the low bits of the payload flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Ack,
    MethodInvocation,
    Response,
    Error,
    Unknown(u32),
}

impl MessageKind {
    pub fn from_flags(flags: u32) -> Self {
        match flags & !EXPECTS_REPLY_MASK {
            0 => Self::Ack,
            2 => Self::MethodInvocation,
            3 => Self::Response,
            4 => Self::Error,
            other => Self::Unknown(other),
        }
    }

    fn flags(self) -> u32 {
        match self {
            Self::Ack => 0,
            Self::MethodInvocation => 2,
            Self::Response => 3,
            Self::Error => 4,
            Self::Unknown(f) => f,
        }
    }
}

/// Per-fragment header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub fragment_id: u16,
    pub fragment_count: u16,
    /// Bytes following this header in this fragment. For the header-only first
    /// fragment of a split message, the length of the whole payload.
    pub length: u32,
    /// Connection-wide message identifier
    pub identifier: u32,
    /// 0 for a new message, incremented by each reply in the conversation
    pub conversation_index: u32,
    pub channel: u32,
    pub expects_reply: bool,
}

/// 16-byte header at the start of every reassembled payload
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PayloadHeader {
    pub flags: u32,
    pub aux_length: u32,
    pub total_length: u64,
}

/// Typed auxiliary value
#[derive(PartialEq)]
pub enum AuxValue {
    /// UTF-8 string value (type 0x01)
    String(String),
    /// Raw bytes, usually an NSKeyedArchive (type 0x02)
    Array(Vec<u8>),
    /// 32-bit unsigned integer (type 0x03)
    U32(u32),
    /// 64-bit signed integer (type 0x06)
    I64(i64),
}

/// The ordered argument list of a method invocation
#[derive(Debug, Default, PartialEq)]
pub struct Aux {
    pub values: Vec<AuxValue>,
}

/// One logical message
#[derive(Debug, PartialEq)]
pub struct Message {
    pub message_header: MessageHeader,
    pub payload_header: PayloadHeader,
    pub aux: Option<Aux>,
    /// Decoded payload, the selector for invocations or the return value for responses
    pub data: Option<Value>,
}

fn truncated(_: std::io::Error) -> ImuxError {
    ImuxError::FramingError("aux value runs past the aux section".into())
}

fn le_u32(b: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

fn le_u64(b: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&b[at..at + 8]);
    u64::from_le_bytes(buf)
}

impl MessageHeader {
    pub fn new(
        fragment_id: u16,
        fragment_count: u16,
        identifier: u32,
        conversation_index: u32,
        channel: u32,
        expects_reply: bool,
    ) -> Self {
        Self {
            fragment_id,
            fragment_count,
            length: 0,
            identifier,
            conversation_index,
            channel,
            expects_reply,
        }
    }

    /// Parses and validates a wire header
    ///
    /// # Errors
    /// `FramingError` on a wrong magic, header length or fragment numbering
    pub fn from_bytes(buf: &[u8; MESSAGE_HEADER_LEN]) -> Result<Self, ImuxError> {
        let magic = le_u32(buf, 0);
        if magic != DTX_MAGIC {
            return Err(ImuxError::FramingError(format!(
                "bad DTX magic {magic:#010x}"
            )));
        }
        let header_len = le_u32(buf, 4);
        if header_len as usize != MESSAGE_HEADER_LEN {
            return Err(ImuxError::FramingError(format!(
                "bad DTX header length {header_len}"
            )));
        }
        let header = Self {
            fragment_id: u16::from_le_bytes([buf[8], buf[9]]),
            fragment_count: u16::from_le_bytes([buf[10], buf[11]]),
            length: le_u32(buf, 12),
            identifier: le_u32(buf, 16),
            conversation_index: le_u32(buf, 20),
            channel: le_u32(buf, 24),
            expects_reply: le_u32(buf, 28) == 1,
        };
        if header.fragment_count == 0 || header.fragment_id >= header.fragment_count {
            return Err(ImuxError::FramingError(format!(
                "bad DTX fragment {}/{}",
                header.fragment_id, header.fragment_count
            )));
        }
        Ok(header)
    }

    pub fn serialize(&self) -> [u8; MESSAGE_HEADER_LEN] {
        let mut res = [0u8; MESSAGE_HEADER_LEN];
        res[0..4].copy_from_slice(&DTX_MAGIC.to_le_bytes());
        res[4..8].copy_from_slice(&(MESSAGE_HEADER_LEN as u32).to_le_bytes());
        res[8..10].copy_from_slice(&self.fragment_id.to_le_bytes());
        res[10..12].copy_from_slice(&self.fragment_count.to_le_bytes());
        res[12..16].copy_from_slice(&self.length.to_le_bytes());
        res[16..20].copy_from_slice(&self.identifier.to_le_bytes());
        res[20..24].copy_from_slice(&self.conversation_index.to_le_bytes());
        res[24..28].copy_from_slice(&self.channel.to_le_bytes());
        res[28..32].copy_from_slice(&u32::from(self.expects_reply).to_le_bytes());
        res
    }

    /// The first fragment of a split message has no body on the wire
    pub fn is_header_only(&self) -> bool {
        self.fragment_count > 1 && self.fragment_id == 0
    }

    pub fn is_last_fragment(&self) -> bool {
        self.fragment_id + 1 == self.fragment_count
    }
}

impl PayloadHeader {
    pub fn new(kind: MessageKind) -> Self {
        Self {
            flags: kind.flags(),
            ..Default::default()
        }
    }

    pub fn method_invocation() -> Self {
        Self::new(MessageKind::MethodInvocation)
    }

    pub fn response() -> Self {
        Self::new(MessageKind::Response)
    }

    pub fn ack() -> Self {
        Self::new(MessageKind::Ack)
    }

    pub fn apply_expects_reply_map(&mut self) {
        self.flags |= EXPECTS_REPLY_MASK
    }

    pub fn kind(&self) -> MessageKind {
        MessageKind::from_flags(self.flags)
    }

    pub fn serialize(&self) -> [u8; PAYLOAD_HEADER_LEN] {
        let mut res = [0u8; PAYLOAD_HEADER_LEN];
        res[0..4].copy_from_slice(&self.flags.to_le_bytes());
        res[4..8].copy_from_slice(&self.aux_length.to_le_bytes());
        res[8..16].copy_from_slice(&self.total_length.to_le_bytes());
        res
    }
}

impl Aux {
    pub fn from_values(values: Vec<AuxValue>) -> Self {
        Self { values }
    }

    /// Parses an aux section including its 16-byte header
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ImuxError> {
        if bytes.len() < AUX_HEADER_LEN {
            return Err(ImuxError::NotEnoughBytes(bytes.len(), AUX_HEADER_LEN));
        }
        let aux_size = le_u32(bytes, 8) as usize;
        let body = &bytes[AUX_HEADER_LEN..];
        if body.len() < aux_size {
            return Err(ImuxError::NotEnoughBytes(body.len(), aux_size));
        }

        let mut cursor = Cursor::new(&body[..aux_size]);
        let mut values = Vec::new();
        while (cursor.position() as usize) < aux_size {
            let aux_type = cursor.read_u32::<LittleEndian>().map_err(truncated)?;
            match aux_type {
                // separator before every value
                0x0a => {}
                0x01 | 0x02 => {
                    let len = cursor.read_u32::<LittleEndian>().map_err(truncated)? as usize;
                    let remaining = aux_size - cursor.position() as usize;
                    if remaining < len {
                        return Err(ImuxError::NotEnoughBytes(remaining, len));
                    }
                    let mut raw = vec![0u8; len];
                    cursor.read_exact(&mut raw).map_err(truncated)?;
                    values.push(if aux_type == 0x01 {
                        AuxValue::String(String::from_utf8(raw)?)
                    } else {
                        AuxValue::Array(raw)
                    });
                }
                0x03 => values.push(AuxValue::U32(
                    cursor.read_u32::<LittleEndian>().map_err(truncated)?,
                )),
                0x06 => values.push(AuxValue::I64(
                    cursor.read_i64::<LittleEndian>().map_err(truncated)?,
                )),
                _ => return Err(ImuxError::UnknownAuxValueType(aux_type)),
            }
        }

        Ok(Self { values })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut values_payload = Vec::new();
        for v in self.values.iter() {
            values_payload.extend_from_slice(&0x0a_u32.to_le_bytes());
            match v {
                AuxValue::String(s) => {
                    values_payload.extend_from_slice(&0x01_u32.to_le_bytes());
                    values_payload.extend_from_slice(&(s.len() as u32).to_le_bytes());
                    values_payload.extend_from_slice(s.as_bytes());
                }
                AuxValue::Array(v) => {
                    values_payload.extend_from_slice(&0x02_u32.to_le_bytes());
                    values_payload.extend_from_slice(&(v.len() as u32).to_le_bytes());
                    values_payload.extend_from_slice(v);
                }
                AuxValue::U32(u) => {
                    values_payload.extend_from_slice(&0x03_u32.to_le_bytes());
                    values_payload.extend_from_slice(&u.to_le_bytes());
                }
                AuxValue::I64(i) => {
                    values_payload.extend_from_slice(&0x06_u32.to_le_bytes());
                    values_payload.extend_from_slice(&i.to_le_bytes());
                }
            }
        }

        let mut res = Vec::with_capacity(AUX_HEADER_LEN + values_payload.len());
        // Buffer size hint; every known peer sends 496 and nobody reads it
        res.extend_from_slice(&496_u32.to_le_bytes());
        res.extend_from_slice(&0_u32.to_le_bytes());
        res.extend_from_slice(&(values_payload.len() as u32).to_le_bytes());
        res.extend_from_slice(&0_u32.to_le_bytes());
        res.extend_from_slice(&values_payload);
        res
    }
}

impl AuxValue {
    /// Archives a plist value into an NSKeyedArchive byte argument
    pub fn archived_value(v: impl Into<Value>) -> Result<Self, ImuxError> {
        Ok(Self::Array(archive(v.into())?))
    }

    /// Unarchives a byte argument, leaving other kinds as they are
    pub fn to_value(&self) -> Result<Value, ImuxError> {
        Ok(match self {
            Self::String(s) => Value::String(s.clone()),
            Self::Array(a) => ns_keyed_archive::decode::from_bytes(a)?,
            Self::U32(u) => Value::Integer((*u as u64).into()),
            Self::I64(i) => Value::Integer((*i).into()),
        })
    }
}

fn archive(v: Value) -> Result<Vec<u8>, ImuxError> {
    ns_keyed_archive::encode::encode_to_bytes(v)
        .map_err(|e| ImuxError::NsKeyedArchiveEncode(format!("{e:?}")))
}

impl Message {
    pub fn new(
        message_header: MessageHeader,
        payload_header: PayloadHeader,
        aux: Option<Aux>,
        data: Option<Value>,
    ) -> Self {
        Self {
            message_header,
            payload_header,
            aux,
            data,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.payload_header.kind()
    }

    /// The selector of a method invocation
    pub fn selector(&self) -> Option<&str> {
        match self.kind() {
            MessageKind::MethodInvocation => self.data.as_ref().and_then(|d| d.as_string()),
            _ => None,
        }
    }

    /// Aux values with archived arguments decoded
    pub fn arguments(&self) -> Result<Vec<Value>, ImuxError> {
        match &self.aux {
            Some(aux) => aux.values.iter().map(|v| v.to_value()).collect(),
            None => Ok(Vec::new()),
        }
    }

    /// Builds a message from a reassembled payload
    ///
    /// # Errors
    /// `FramingError` if the payload header lengths disagree with the payload size
    pub fn from_payload(message_header: MessageHeader, payload: &[u8]) -> Result<Self, ImuxError> {
        if payload.len() < PAYLOAD_HEADER_LEN {
            return Err(ImuxError::FramingError(format!(
                "DTX payload of {} bytes has no payload header",
                payload.len()
            )));
        }
        let payload_header = PayloadHeader {
            flags: le_u32(payload, 0),
            aux_length: le_u32(payload, 4),
            total_length: le_u64(payload, 8),
        };
        let body = &payload[PAYLOAD_HEADER_LEN..];
        let aux_len = payload_header.aux_length as usize;
        if payload_header.total_length < aux_len as u64
            || payload_header.total_length > body.len() as u64
        {
            return Err(ImuxError::FramingError(format!(
                "DTX payload header claims {}/{} bytes, body has {}",
                payload_header.aux_length,
                payload_header.total_length,
                body.len()
            )));
        }
        let total_len = payload_header.total_length as usize;

        let aux = if aux_len > 0 {
            Some(Aux::from_bytes(&body[..aux_len])?)
        } else {
            None
        };
        let data_bytes = &body[aux_len..total_len];
        let data = if data_bytes.is_empty() {
            None
        } else {
            Some(ns_keyed_archive::decode::from_bytes(data_bytes)?)
        };

        Ok(Self {
            message_header,
            payload_header,
            aux,
            data,
        })
    }

    /// Reads one complete message, reassembling fragments
    pub async fn from_reader<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self, ImuxError> {
        let mut assembler = FragmentAssembler::default();
        loop {
            let (header, body) = read_fragment(reader).await?;
            if let Some((header, payload)) = assembler.push(header, body)? {
                return Self::from_payload(header, &payload);
            }
        }
    }

    /// Payload bytes: payload header, aux, archived data
    fn payload(&self) -> Result<Vec<u8>, ImuxError> {
        let aux = match &self.aux {
            Some(a) => a.serialize(),
            None => Vec::new(),
        };
        let data = match &self.data {
            Some(d) => archive(d.to_owned())?,
            None => Vec::new(),
        };

        let mut payload_header = self.payload_header.to_owned();
        payload_header.aux_length = aux.len() as u32;
        payload_header.total_length = (aux.len() + data.len()) as u64;

        let mut res = Vec::with_capacity(PAYLOAD_HEADER_LEN + aux.len() + data.len());
        res.extend_from_slice(&payload_header.serialize());
        res.extend_from_slice(&aux);
        res.extend_from_slice(&data);
        Ok(res)
    }

    /// Serializes as a single fragment
    pub fn serialize(&self) -> Result<Vec<u8>, ImuxError> {
        let payload = self.payload()?;
        let mut header = self.message_header.to_owned();
        header.fragment_id = 0;
        header.fragment_count = 1;
        header.length = payload.len() as u32;

        let mut res = Vec::with_capacity(MESSAGE_HEADER_LEN + payload.len());
        res.extend_from_slice(&header.serialize());
        res.extend_from_slice(&payload);
        Ok(res)
    }

    /// Serializes as `fragment_count` wire fragments
    ///
    /// With more than one fragment the first one is header-only and the payload is
    /// spread over the remaining `fragment_count - 1`.
    pub fn encode_fragments(&self, fragment_count: u16) -> Result<Vec<Vec<u8>>, ImuxError> {
        if fragment_count <= 1 {
            return Ok(vec![self.serialize()?]);
        }
        let payload = self.payload()?;
        let chunks = (fragment_count - 1) as usize;
        let chunk_len = payload.len().div_ceil(chunks).max(1);

        let mut first = self.message_header.to_owned();
        first.fragment_id = 0;
        first.fragment_count = fragment_count;
        first.length = payload.len() as u32;
        let mut res = vec![first.serialize().to_vec()];

        for i in 0..chunks {
            let start = (i * chunk_len).min(payload.len());
            let end = ((i + 1) * chunk_len).min(payload.len());
            let mut header = self.message_header.to_owned();
            header.fragment_id = (i + 1) as u16;
            header.fragment_count = fragment_count;
            header.length = (end - start) as u32;
            let mut frag = header.serialize().to_vec();
            frag.extend_from_slice(&payload[start..end]);
            res.push(frag);
        }
        Ok(res)
    }

    /// The 16-byte acknowledgement for this message
    pub fn ack(&self) -> Self {
        Self::new(
            MessageHeader::new(
                0,
                1,
                self.message_header.identifier,
                self.message_header.conversation_index + 1,
                self.message_header.channel,
                false,
            ),
            PayloadHeader::ack(),
            None,
            None,
        )
    }

    /// A response carrying `value` as return value
    pub fn reply(&self, value: Value) -> Self {
        Self::new(
            MessageHeader::new(
                0,
                1,
                self.message_header.identifier,
                self.message_header.conversation_index + 1,
                self.message_header.channel,
                false,
            ),
            PayloadHeader::response(),
            None,
            Some(value),
        )
    }
}

/// Reads one wire fragment: its header and, unless header-only, its body
pub(crate) async fn read_fragment<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<(MessageHeader, Vec<u8>), ImuxError> {
    use tokio::io::AsyncReadExt;

    let mut buf = [0u8; MESSAGE_HEADER_LEN];
    let mut got = 0;
    while got < MESSAGE_HEADER_LEN {
        let n = reader.read(&mut buf[got..]).await?;
        if n == 0 {
            return Err(if got == 0 {
                ImuxError::ConnectionClosed
            } else {
                ImuxError::FramingError(format!("stream closed inside DTX header ({got}/32)"))
            });
        }
        got += n;
    }
    let header = MessageHeader::from_bytes(&buf)?;
    if header.is_header_only() {
        return Ok((header, Vec::new()));
    }
    if header.length as usize > super::fragment::MAX_MESSAGE_LEN {
        return Err(ImuxError::FramingError(format!(
            "DTX fragment declares {} bytes",
            header.length
        )));
    }
    let mut body = vec![0u8; header.length as usize];
    if let Err(e) = reader.read_exact(&mut body).await {
        return Err(match e.kind() {
            std::io::ErrorKind::UnexpectedEof => {
                ImuxError::FramingError("stream closed inside DTX fragment".into())
            }
            _ => e.into(),
        });
    }
    Ok((header, body))
}

impl std::fmt::Debug for AuxValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuxValue::String(s) => write!(f, "String({s:?})"),
            AuxValue::Array(arr) => write!(
                f,
                "Array(len={}, first_bytes={:?})",
                arr.len(),
                &arr[..arr.len().min(10)]
            ),
            AuxValue::U32(n) => write!(f, "U32({n})"),
            AuxValue::I64(n) => write!(f, "I64({n})"),
        }
    }
}
