//! TFTP packet encoding and decoding (RFC 1350, options per RFC 2347).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use memchr::memchr;

use crate::error::PacketError;

const OP_RRQ: u16 = 1;
const OP_WRQ: u16 = 2;
const OP_DATA: u16 = 3;
const OP_ACK: u16 = 4;
const OP_ERROR: u16 = 5;
const OP_OACK: u16 = 6;

/// TFTP error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NotDefined,
    FileNotFound,
    AccessViolation,
    DiskFull,
    IllegalOperation,
    UnknownTransferId,
    FileExists,
    NoSuchUser,
    OptionNegotiation,
}

impl ErrorCode {
    fn to_u16(self) -> u16 {
        match self {
            ErrorCode::NotDefined => 0,
            ErrorCode::FileNotFound => 1,
            ErrorCode::AccessViolation => 2,
            ErrorCode::DiskFull => 3,
            ErrorCode::IllegalOperation => 4,
            ErrorCode::UnknownTransferId => 5,
            ErrorCode::FileExists => 6,
            ErrorCode::NoSuchUser => 7,
            ErrorCode::OptionNegotiation => 8,
        }
    }

    fn from_u16(code: u16) -> Self {
        match code {
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::IllegalOperation,
            5 => ErrorCode::UnknownTransferId,
            6 => ErrorCode::FileExists,
            7 => ErrorCode::NoSuchUser,
            8 => ErrorCode::OptionNegotiation,
            _ => ErrorCode::NotDefined,
        }
    }
}

/// A read or write request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Filename proposed by the client.
    pub filename: String,

    /// Transfer mode, lowercased (`octet` or `netascii`).
    pub mode: String,

    /// Requested options, names lowercased, in request order.
    pub options: Vec<(String, String)>,
}

impl Request {
    /// Create a request without options.
    pub fn new(filename: impl Into<String>, mode: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            mode: mode.into(),
            options: Vec::new(),
        }
    }

    /// Add an option.
    pub fn with_option(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.push((name.into(), value.into()));
        self
    }

    /// Value of a requested option.
    pub fn option(&self, name: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// A TFTP packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    ReadRequest(Request),
    WriteRequest(Request),
    Data { block: u16, data: Bytes },
    Ack(u16),
    Error { code: ErrorCode, message: String },
    OptionAck(Vec<(String, String)>),
}

impl Packet {
    /// Build an error packet.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Packet::Error {
            code,
            message: message.into(),
        }
    }

    /// Decode a datagram.
    pub fn decode(datagram: &[u8]) -> Result<Packet, PacketError> {
        if datagram.len() < 2 {
            return Err(PacketError::Truncated(datagram.len()));
        }
        let mut buf = datagram;
        let opcode = buf.get_u16();

        match opcode {
            OP_RRQ | OP_WRQ => {
                let request = decode_request(buf)?;
                Ok(if opcode == OP_RRQ {
                    Packet::ReadRequest(request)
                } else {
                    Packet::WriteRequest(request)
                })
            }
            OP_DATA => {
                if buf.remaining() < 2 {
                    return Err(PacketError::Truncated(datagram.len()));
                }
                let block = buf.get_u16();
                Ok(Packet::Data {
                    block,
                    data: Bytes::copy_from_slice(buf),
                })
            }
            OP_ACK => {
                if buf.remaining() < 2 {
                    return Err(PacketError::Truncated(datagram.len()));
                }
                Ok(Packet::Ack(buf.get_u16()))
            }
            OP_ERROR => {
                if buf.remaining() < 2 {
                    return Err(PacketError::Truncated(datagram.len()));
                }
                let code = ErrorCode::from_u16(buf.get_u16());
                // Some clients omit the terminator on error messages.
                let message = match memchr(0, buf) {
                    Some(end) => &buf[..end],
                    None => buf,
                };
                Ok(Packet::Error {
                    code,
                    message: String::from_utf8_lossy(message).into_owned(),
                })
            }
            OP_OACK => {
                let mut options = Vec::new();
                while buf.has_remaining() {
                    let name = take_cstr(&mut buf, "option name")?;
                    let value = take_cstr(&mut buf, "option value")?;
                    options.push((name.to_ascii_lowercase(), value));
                }
                Ok(Packet::OptionAck(options))
            }
            other => Err(PacketError::UnknownOpcode(other)),
        }
    }

    /// Encode into a datagram.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + self.payload_hint());
        match self {
            Packet::ReadRequest(request) | Packet::WriteRequest(request) => {
                let opcode = if matches!(self, Packet::ReadRequest(_)) {
                    OP_RRQ
                } else {
                    OP_WRQ
                };
                buf.put_u16(opcode);
                put_cstr(&mut buf, &request.filename);
                put_cstr(&mut buf, &request.mode);
                for (name, value) in &request.options {
                    put_cstr(&mut buf, name);
                    put_cstr(&mut buf, value);
                }
            }
            Packet::Data { block, data } => {
                buf.put_u16(OP_DATA);
                buf.put_u16(*block);
                buf.put_slice(data);
            }
            Packet::Ack(block) => {
                buf.put_u16(OP_ACK);
                buf.put_u16(*block);
            }
            Packet::Error { code, message } => {
                buf.put_u16(OP_ERROR);
                buf.put_u16(code.to_u16());
                put_cstr(&mut buf, message);
            }
            Packet::OptionAck(options) => {
                buf.put_u16(OP_OACK);
                for (name, value) in options {
                    put_cstr(&mut buf, name);
                    put_cstr(&mut buf, value);
                }
            }
        }
        buf.freeze()
    }

    fn payload_hint(&self) -> usize {
        match self {
            Packet::Data { data, .. } => data.len(),
            _ => 64,
        }
    }
}

fn decode_request(mut buf: &[u8]) -> Result<Request, PacketError> {
    let filename = take_cstr(&mut buf, "filename")?;
    let mode = take_cstr(&mut buf, "mode")?.to_ascii_lowercase();

    let mut options = Vec::new();
    while buf.has_remaining() {
        // Trailing padding some clients send after the last field.
        if buf.iter().all(|&b| b == 0) {
            break;
        }
        let name = take_cstr(&mut buf, "option name")?;
        let value = take_cstr(&mut buf, "option value")?;
        options.push((name.to_ascii_lowercase(), value));
    }

    Ok(Request {
        filename,
        mode,
        options,
    })
}

fn take_cstr(buf: &mut &[u8], field: &'static str) -> Result<String, PacketError> {
    let end = memchr(0, buf).ok_or(PacketError::Unterminated(field))?;
    let text = std::str::from_utf8(&buf[..end])
        .map_err(|_| PacketError::InvalidText(field))?
        .to_string();
    buf.advance(end + 1);
    Ok(text)
}

fn put_cstr(buf: &mut BytesMut, text: &str) {
    buf.put_slice(text.as_bytes());
    buf.put_u8(0);
}
