//! Frame encoding, packet parsing and typed command codes.
//!
//! Uses `bytes::Bytes` for zero-copy payload sharing.
//!
//! # Example
//!
//! ```
//! use milterwire::protocol::{encode_frame, parse_packet, command};
//!
//! let frame = encode_frame(command::HELO, &[b"mx.example.com\0"]);
//! let packet = parse_packet(&frame).unwrap();
//!
//! assert_eq!(packet.commands.len(), 1);
//! assert_eq!(&packet.commands[0][..], b"Hmx.example.com\0");
//! assert_eq!(packet.remaining, 0);
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::wire_format::{command, decode_length, encode_length, LENGTH_PREFIX_SIZE};

/// Inbound command, decoded once from the leading payload byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    OptNeg,
    Connect,
    Helo,
    Mail,
    Rcpt,
    Data,
    Header,
    Eoh,
    Body,
    Eob,
    Abort,
    Quit,
    QuitNc,
    Macro,
    Unknown,
}

impl Command {
    /// Decode a command byte. Returns `None` for codes we do not speak.
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            command::OPTNEG => Command::OptNeg,
            command::CONNECT => Command::Connect,
            command::HELO => Command::Helo,
            command::MAIL => Command::Mail,
            command::RCPT => Command::Rcpt,
            command::DATA => Command::Data,
            command::HEADER => Command::Header,
            command::EOH => Command::Eoh,
            command::BODY => Command::Body,
            command::BODYEOB => Command::Eob,
            command::ABORT => Command::Abort,
            command::QUIT => Command::Quit,
            command::QUIT_NC => Command::QuitNc,
            command::MACRO => Command::Macro,
            command::UNKNOWN => Command::Unknown,
            _ => return None,
        })
    }

    /// The wire byte for this command.
    pub fn code(self) -> u8 {
        match self {
            Command::OptNeg => command::OPTNEG,
            Command::Connect => command::CONNECT,
            Command::Helo => command::HELO,
            Command::Mail => command::MAIL,
            Command::Rcpt => command::RCPT,
            Command::Data => command::DATA,
            Command::Header => command::HEADER,
            Command::Eoh => command::EOH,
            Command::Body => command::BODY,
            Command::Eob => command::BODYEOB,
            Command::Abort => command::ABORT,
            Command::Quit => command::QUIT,
            Command::QuitNc => command::QUIT_NC,
            Command::Macro => command::MACRO,
            Command::Unknown => command::UNKNOWN,
        }
    }

    /// Short name for log lines.
    pub fn name(self) -> &'static str {
        match self {
            Command::OptNeg => "optneg",
            Command::Connect => "connect",
            Command::Helo => "helo",
            Command::Mail => "mail",
            Command::Rcpt => "rcpt",
            Command::Data => "data",
            Command::Header => "header",
            Command::Eoh => "eoh",
            Command::Body => "body",
            Command::Eob => "eob",
            Command::Abort => "abort",
            Command::Quit => "quit",
            Command::QuitNc => "quit_nc",
            Command::Macro => "macro",
            Command::Unknown => "unknown",
        }
    }
}

/// Result of parsing a raw buffer into frames.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Packet {
    /// Payloads in arrival order. If `remaining > 0` the last one is incomplete.
    pub commands: Vec<Bytes>,
    /// Bytes still missing from the last payload (0 on a frame boundary).
    pub remaining: usize,
}

/// Fewer than 4 bytes were left to read a length prefix.
///
/// Recoverable: keep `header` and prepend it to the next read.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("partial length prefix ({} of 4 bytes)", header.len())]
pub struct PartialHeader {
    /// The prefix bytes collected so far.
    pub header: Bytes,
    /// Payloads parsed before the split prefix.
    pub commands: Vec<Bytes>,
}

/// Build a complete frame: length prefix, command code, then the fields.
///
/// Fields are concatenated as given; callers add NUL terminators or
/// fixed-width integers as the command requires.
pub fn encode_frame(code: u8, fields: &[&[u8]]) -> Bytes {
    let body_len: usize = fields.iter().map(|f| f.len()).sum();
    let length = 1 + body_len;

    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + length);
    buf.put_slice(&encode_length(length as u32));
    buf.put_u8(code);
    for field in fields {
        buf.put_slice(field);
    }
    buf.freeze()
}

/// Parse a buffer that may hold several frames and a trailing partial one.
///
/// Returns every payload found plus how many bytes the last one still
/// needs. Fails with [`PartialHeader`] when the buffer ends inside a
/// length prefix.
pub fn parse_packet(buf: &[u8]) -> std::result::Result<Packet, PartialHeader> {
    let mut commands = Vec::new();
    let mut offset = 0;

    while offset < buf.len() {
        let rest = &buf[offset..];
        let length = match decode_length(rest) {
            Some(length) => length as usize,
            None => {
                return Err(PartialHeader {
                    header: Bytes::copy_from_slice(rest),
                    commands,
                });
            }
        };

        let available = rest.len() - LENGTH_PREFIX_SIZE;
        let take = available.min(length);
        let start = offset + LENGTH_PREFIX_SIZE;
        commands.push(Bytes::copy_from_slice(&buf[start..start + take]));

        if take < length {
            return Ok(Packet {
                commands,
                remaining: length - take,
            });
        }
        offset = start + length;
    }

    Ok(Packet {
        commands,
        remaining: 0,
    })
}

/// Split a NUL separated payload body into its fields.
///
/// A trailing NUL does not produce an empty final field.
pub fn split_nul(body: &[u8]) -> Vec<Bytes> {
    let body = body.strip_suffix(b"\0").unwrap_or(body);
    if body.is_empty() {
        return Vec::new();
    }
    body.split(|b| *b == 0)
        .map(Bytes::copy_from_slice)
        .collect()
}
