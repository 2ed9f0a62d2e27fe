//! Wire format constants and length-prefix encoding.
//!
//! Every milter frame is a 4-byte length prefix followed by the payload:
//! ```text
//! ┌──────────┬──────┬─────────────────────┐
//! │ Length   │ Code │ Body                │
//! │ 4 bytes  │ 1 B  │ length - 1 bytes    │
//! │ uint32 BE│      │                     │
//! └──────────┴──────┴─────────────────────┘
//! ```
//!
//! The length counts the command code plus the body, never the prefix itself.

/// Length prefix size in bytes (fixed, exactly 4).
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Protocol version this side speaks.
pub const MILTER_VERSION: u32 = 6;

/// Largest body chunk the MTA sends, and the size we split replacement bodies into.
pub const MILTER_CHUNK_SIZE: usize = 65535;

/// Default upper bound for a single frame (16 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Size of the OPTNEG body: version, actions, protocol (3 x uint32 BE).
pub const OPTNEG_BODY_SIZE: usize = 12;

/// Inbound command codes (MTA to milter).
pub mod command {
    pub const ABORT: u8 = b'A';
    pub const BODY: u8 = b'B';
    pub const CONNECT: u8 = b'C';
    pub const MACRO: u8 = b'D';
    pub const BODYEOB: u8 = b'E';
    pub const HELO: u8 = b'H';
    pub const QUIT_NC: u8 = b'K';
    pub const HEADER: u8 = b'L';
    pub const MAIL: u8 = b'M';
    pub const EOH: u8 = b'N';
    pub const OPTNEG: u8 = b'O';
    pub const QUIT: u8 = b'Q';
    pub const RCPT: u8 = b'R';
    pub const DATA: u8 = b'T';
    pub const UNKNOWN: u8 = b'U';
}

/// Outbound reply and modification codes (milter to MTA).
pub mod reply {
    pub const ADDRCPT: u8 = b'+';
    pub const DELRCPT: u8 = b'-';
    pub const ADDRCPT_PAR: u8 = b'2';
    pub const SHUTDOWN: u8 = b'4';
    pub const ACCEPT: u8 = b'a';
    pub const REPLBODY: u8 = b'b';
    pub const CONTINUE: u8 = b'c';
    pub const DISCARD: u8 = b'd';
    pub const CHGFROM: u8 = b'e';
    pub const CONN_FAIL: u8 = b'f';
    pub const ADDHEADER: u8 = b'h';
    pub const INSHEADER: u8 = b'i';
    pub const CHGHEADER: u8 = b'm';
    pub const PROGRESS: u8 = b'p';
    pub const QUARANTINE: u8 = b'q';
    pub const REJECT: u8 = b'r';
    pub const SKIP: u8 = b's';
    pub const TEMPFAIL: u8 = b't';
    pub const REPLYCODE: u8 = b'y';
}

/// Action bits (SMFIF): which modifications a side is willing to perform.
pub mod actions {
    /// Add (and insert) headers.
    pub const ADDHDRS: u32 = 0x0000_0001;
    /// Replace the body.
    pub const CHGBODY: u32 = 0x0000_0002;
    /// Add envelope recipients.
    pub const ADDRCPT: u32 = 0x0000_0004;
    /// Delete envelope recipients.
    pub const DELRCPT: u32 = 0x0000_0008;
    /// Change or delete headers.
    pub const CHGHDRS: u32 = 0x0000_0010;
    /// Quarantine the message.
    pub const QUARANTINE: u32 = 0x0000_0020;
    /// Change the envelope sender.
    pub const CHGFROM: u32 = 0x0000_0040;
    /// Add recipients with ESMTP arguments.
    pub const ADDRCPT_PAR: u32 = 0x0000_0080;
    /// Request a macro list per stage.
    pub const SETSYMLIST: u32 = 0x0000_0100;

    /// Every modification this crate knows how to send.
    pub const ALL: u32 =
        ADDHDRS | CHGBODY | ADDRCPT | DELRCPT | CHGHDRS | QUARANTINE | CHGFROM | ADDRCPT_PAR;

    /// Check if a specific bit is set.
    #[inline]
    pub fn has(bits: u32, bit: u32) -> bool {
        bits & bit != 0
    }

    /// Human readable name of a single action bit, for log lines.
    pub fn name(bit: u32) -> &'static str {
        match bit {
            ADDHDRS => "ADDHDRS",
            CHGBODY => "CHGBODY",
            ADDRCPT => "ADDRCPT",
            DELRCPT => "DELRCPT",
            CHGHDRS => "CHGHDRS",
            QUARANTINE => "QUARANTINE",
            CHGFROM => "CHGFROM",
            ADDRCPT_PAR => "ADDRCPT_PAR",
            SETSYMLIST => "SETSYMLIST",
            _ => "UNKNOWN",
        }
    }
}

/// Protocol bits (SMFIP): phases without callback, or without reply.
pub mod protocol {
    pub const NOCONNECT: u32 = 0x0000_0001;
    pub const NOHELO: u32 = 0x0000_0002;
    pub const NOMAIL: u32 = 0x0000_0004;
    pub const NORCPT: u32 = 0x0000_0008;
    pub const NOBODY: u32 = 0x0000_0010;
    pub const NOHDRS: u32 = 0x0000_0020;
    pub const NOEOH: u32 = 0x0000_0040;
    pub const NR_HDR: u32 = 0x0000_0080;
    pub const NOUNKNOWN: u32 = 0x0000_0100;
    pub const NODATA: u32 = 0x0000_0200;
    /// The MTA understands SKIP replies to body chunks.
    pub const SKIP: u32 = 0x0000_0400;
    pub const RCPT_REJ: u32 = 0x0000_0800;
    pub const NR_CONN: u32 = 0x0000_1000;
    pub const NR_HELO: u32 = 0x0000_2000;
    pub const NR_MAIL: u32 = 0x0000_4000;
    pub const NR_RCPT: u32 = 0x0000_8000;
    pub const NR_DATA: u32 = 0x0001_0000;
    pub const NR_UNKN: u32 = 0x0002_0000;
    pub const NR_EOH: u32 = 0x0004_0000;
    pub const NR_BODY: u32 = 0x0008_0000;
    pub const HDR_LEADSPC: u32 = 0x0010_0000;

    /// Check if a specific bit is set.
    #[inline]
    pub fn has(bits: u32, bit: u32) -> bool {
        bits & bit != 0
    }
}

/// Encode a frame length as a big endian prefix.
#[inline]
pub fn encode_length(length: u32) -> [u8; LENGTH_PREFIX_SIZE] {
    length.to_be_bytes()
}

/// Decode a big endian length prefix.
///
/// Returns `None` if buffer is too short.
///
/// # Example
///
/// ```
/// use milterwire::protocol::decode_length;
///
/// assert_eq!(decode_length(&[0, 0, 1, 2]), Some(258));
/// assert_eq!(decode_length(&[0, 0]), None);
/// ```
#[inline]
pub fn decode_length(buf: &[u8]) -> Option<u32> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return None;
    }
    Some(u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]))
}
