//! Wire codec for the device's framed binary protocol.
//!
//! Frame layout (big-endian):
//! - 1 byte: message type
//! - 2 bytes: frame length, header and CRC included
//! - N bytes: payload
//! - 2 bytes: CRC-16/CCITT of everything before the CRC field
//!
//! Message types with the high bit set are responses to the request type
//! with the high bit clear. Types below 0x80 arriving from the device are
//! unsolicited indications.

pub mod attributes;
pub mod crc;

use byteorder::{BigEndian, ByteOrder};

use self::attributes::Attribute;
use self::crc::crc16_ccitt;

/// Frame header length: type byte plus length field.
pub const HEADER_LEN: usize = 3;

/// Smallest legal frame: header plus CRC with an empty payload.
pub const MIN_FRAME_LEN: usize = 5;

/// Frames claiming more than this are treated as corrupt.
pub const MAX_FRAME_LEN: usize = 8192;

/// High bit of the type byte marks a response.
pub const RESPONSE_BIT: u8 = 0x80;

const MSG_HEARTBEAT: u8 = 0x01;
const MSG_SET_ATTRIBUTE: u8 = 0x11;
const MSG_GET_ATTRIBUTE: u8 = 0x12;
const MSG_ATTRIBUTE_CHANGED: u8 = 0x21;
const MSG_LIST_FILES: u8 = 0x41;
const MSG_GET_FILE: u8 = 0x42;
const MSG_FILE_DATA: u8 = 0x4A;

/// One entry of a `ListFilesResponse`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// File name as stored on the device.
    pub name: String,
    /// File size in bytes.
    pub size: u32,
}

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Liveness probe.
    Heartbeat,
    /// Response to [`Message::Heartbeat`].
    HeartbeatResponse,
    /// Write one attribute to the device.
    SetAttribute {
        /// Attribute to write.
        attribute: Attribute,
    },
    /// Response to [`Message::SetAttribute`].
    SetAttributeResponse {
        /// Whether the device accepted the write.
        accepted: bool,
    },
    /// Read one attribute from the device.
    GetAttribute {
        /// Wire id of the requested attribute.
        attribute_id: u8,
    },
    /// Response to [`Message::GetAttribute`].
    GetAttributeResponse {
        /// The requested attribute's current value.
        attribute: Attribute,
    },
    /// Unsolicited notification that an attribute value changed.
    AttributeChanged {
        /// The new attribute value.
        attribute: Attribute,
    },
    /// List the files stored on the device.
    ListFiles,
    /// Response to [`Message::ListFiles`].
    ListFilesResponse {
        /// Directory entries.
        entries: Vec<FileEntry>,
    },
    /// Ask the device to stream a file as [`Message::FileData`] chunks.
    GetFile {
        /// Name of the file to stream.
        name: String,
    },
    /// One chunk of a streamed file. Unsolicited file-chunk subcategory.
    FileData {
        /// Byte offset of this chunk within the file.
        offset: u32,
        /// Chunk payload.
        data: Vec<u8>,
    },
}

/// Outcome of one incremental [`decode`] attempt.
#[derive(Debug)]
pub enum DecodeResult {
    /// A complete frame was decoded; `consumed` bytes may be discarded.
    Complete {
        /// The decoded message.
        message: Message,
        /// Number of buffer bytes the frame occupied.
        consumed: usize,
    },
    /// The buffer holds only a partial frame; feed more bytes.
    NeedMore,
    /// The buffer prefix is not a valid frame; discard `skip` bytes and retry.
    Invalid {
        /// Number of bytes to discard before resuming.
        skip: usize,
    },
}

impl Message {
    /// The wire type byte of this message.
    pub fn msg_type(&self) -> u8 {
        match self {
            Message::Heartbeat => MSG_HEARTBEAT,
            Message::HeartbeatResponse => MSG_HEARTBEAT | RESPONSE_BIT,
            Message::SetAttribute { .. } => MSG_SET_ATTRIBUTE,
            Message::SetAttributeResponse { .. } => MSG_SET_ATTRIBUTE | RESPONSE_BIT,
            Message::GetAttribute { .. } => MSG_GET_ATTRIBUTE,
            Message::GetAttributeResponse { .. } => MSG_GET_ATTRIBUTE | RESPONSE_BIT,
            Message::AttributeChanged { .. } => MSG_ATTRIBUTE_CHANGED,
            Message::ListFiles => MSG_LIST_FILES,
            Message::ListFilesResponse { .. } => MSG_LIST_FILES | RESPONSE_BIT,
            Message::GetFile { .. } => MSG_GET_FILE,
            Message::FileData { .. } => MSG_FILE_DATA,
        }
    }

    /// Whether this message is a response to a request.
    pub fn is_response(&self) -> bool {
        self.msg_type() & RESPONSE_BIT != 0
    }

    /// Whether this message belongs to the file-chunk subcategory.
    pub fn is_file_chunk(&self) -> bool {
        matches!(self, Message::FileData { .. })
    }

    /// The type byte of the response that answers this request.
    pub fn response_type(&self) -> u8 {
        self.msg_type() | RESPONSE_BIT
    }

    fn encode_payload(&self, out: &mut Vec<u8>) {
        match self {
            Message::Heartbeat | Message::HeartbeatResponse | Message::ListFiles => {}
            Message::SetAttribute { attribute }
            | Message::GetAttributeResponse { attribute }
            | Message::AttributeChanged { attribute } => attribute.encode(out),
            Message::SetAttributeResponse { accepted } => out.push(u8::from(*accepted)),
            Message::GetAttribute { attribute_id } => out.push(*attribute_id),
            Message::ListFilesResponse { entries } => {
                for entry in entries {
                    out.push(entry.name.len() as u8);
                    out.extend_from_slice(entry.name.as_bytes());
                    let mut size = [0u8; 4];
                    BigEndian::write_u32(&mut size, entry.size);
                    out.extend_from_slice(&size);
                }
            }
            Message::GetFile { name } => {
                out.push(name.len() as u8);
                out.extend_from_slice(name.as_bytes());
            }
            Message::FileData { offset, data } => {
                let mut off = [0u8; 4];
                BigEndian::write_u32(&mut off, *offset);
                out.extend_from_slice(&off);
                out.extend_from_slice(data);
            }
        }
    }

    fn parse_payload(msg_type: u8, payload: &[u8]) -> Option<Message> {
        match msg_type {
            MSG_HEARTBEAT if payload.is_empty() => Some(Message::Heartbeat),
            t if t == MSG_HEARTBEAT | RESPONSE_BIT && payload.is_empty() => {
                Some(Message::HeartbeatResponse)
            }
            MSG_SET_ATTRIBUTE => {
                let (attribute, consumed) = Attribute::decode(payload)?;
                (consumed == payload.len()).then_some(Message::SetAttribute { attribute })
            }
            t if t == MSG_SET_ATTRIBUTE | RESPONSE_BIT && payload.len() == 1 => {
                Some(Message::SetAttributeResponse {
                    accepted: payload[0] != 0,
                })
            }
            MSG_GET_ATTRIBUTE if payload.len() == 1 => Some(Message::GetAttribute {
                attribute_id: payload[0],
            }),
            t if t == MSG_GET_ATTRIBUTE | RESPONSE_BIT => {
                let (attribute, consumed) = Attribute::decode(payload)?;
                (consumed == payload.len()).then_some(Message::GetAttributeResponse { attribute })
            }
            MSG_ATTRIBUTE_CHANGED => {
                let (attribute, consumed) = Attribute::decode(payload)?;
                (consumed == payload.len()).then_some(Message::AttributeChanged { attribute })
            }
            MSG_LIST_FILES if payload.is_empty() => Some(Message::ListFiles),
            t if t == MSG_LIST_FILES | RESPONSE_BIT => {
                let mut entries = Vec::new();
                let mut rest = payload;
                while let Some((&name_len, tail)) = rest.split_first() {
                    let name_len = name_len as usize;
                    if tail.len() < name_len + 4 {
                        return None;
                    }
                    let name = String::from_utf8(tail[..name_len].to_vec()).ok()?;
                    let size = BigEndian::read_u32(&tail[name_len..name_len + 4]);
                    entries.push(FileEntry { name, size });
                    rest = &tail[name_len + 4..];
                }
                Some(Message::ListFilesResponse { entries })
            }
            MSG_GET_FILE => {
                let (&name_len, tail) = payload.split_first()?;
                if tail.len() != name_len as usize {
                    return None;
                }
                let name = String::from_utf8(tail.to_vec()).ok()?;
                Some(Message::GetFile { name })
            }
            MSG_FILE_DATA if payload.len() >= 4 => Some(Message::FileData {
                offset: BigEndian::read_u32(&payload[..4]),
                data: payload[4..].to_vec(),
            }),
            _ => None,
        }
    }
}

/// Encode `message` into a complete wire frame.
pub fn encode(message: &Message) -> Vec<u8> {
    let mut payload = Vec::new();
    message.encode_payload(&mut payload);

    let total = HEADER_LEN + payload.len() + 2;
    let mut frame = Vec::with_capacity(total);
    frame.push(message.msg_type());

    let mut length = [0u8; 2];
    BigEndian::write_u16(&mut length, total as u16);
    frame.extend_from_slice(&length);
    frame.extend_from_slice(&payload);

    let mut checksum = [0u8; 2];
    BigEndian::write_u16(&mut checksum, crc16_ccitt(&frame));
    frame.extend_from_slice(&checksum);

    frame
}

/// Attempt to decode one frame from the front of `buf`.
pub fn decode(buf: &[u8]) -> DecodeResult {
    if buf.len() < HEADER_LEN {
        return DecodeResult::NeedMore;
    }

    let total = BigEndian::read_u16(&buf[1..3]) as usize;
    if !(MIN_FRAME_LEN..=MAX_FRAME_LEN).contains(&total) {
        return DecodeResult::Invalid { skip: 1 };
    }
    if buf.len() < total {
        return DecodeResult::NeedMore;
    }

    let received_crc = BigEndian::read_u16(&buf[total - 2..total]);
    if received_crc != crc16_ccitt(&buf[..total - 2]) {
        return DecodeResult::Invalid { skip: 1 };
    }

    match Message::parse_payload(buf[0], &buf[HEADER_LEN..total - 2]) {
        Some(message) => DecodeResult::Complete {
            message,
            consumed: total,
        },
        // Checksum was valid, so the frame boundary is trustworthy: skip
        // the whole frame (unknown type or malformed payload).
        None => DecodeResult::Invalid { skip: total },
    }
}
