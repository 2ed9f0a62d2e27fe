//! Option negotiation and per-command dispatch plans.
//!
//! Each side announces `(version, actions, protocol)` once per session. The
//! effective options are the intersection of what we asked for and what the
//! MTA offered; they decide whether a phase gets a callback at all, a callback
//! without reply, or a callback whose reply is written back.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::frame::{encode_frame, Command};
use super::wire_format::{actions, command, protocol, MILTER_VERSION, OPTNEG_BODY_SIZE};
use crate::error::{MilterError, Result};

/// One side's OPTNEG announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptNeg {
    /// Protocol version.
    pub version: u32,
    /// SMFIF action bits.
    pub actions: u32,
    /// SMFIP protocol bits.
    pub protocol: u32,
}

impl Default for OptNeg {
    fn default() -> Self {
        Self {
            version: MILTER_VERSION,
            actions: actions::ALL,
            protocol: 0,
        }
    }
}

impl OptNeg {
    /// Create a new announcement.
    pub fn new(version: u32, actions: u32, protocol: u32) -> Self {
        Self {
            version,
            actions,
            protocol,
        }
    }

    /// Parse the body of an OPTNEG payload (after the command byte).
    ///
    /// # Example
    ///
    /// ```
    /// use milterwire::protocol::OptNeg;
    ///
    /// let body = [0, 0, 0, 6, 0, 0, 0, 0x1f, 0, 0, 0, 0];
    /// let theirs = OptNeg::decode(&body).unwrap();
    /// assert_eq!(theirs.version, 6);
    /// assert_eq!(theirs.actions, 0x1f);
    /// ```
    pub fn decode(body: &[u8]) -> Result<Self> {
        if body.len() < OPTNEG_BODY_SIZE {
            return Err(MilterError::Protocol(format!(
                "OPTNEG body is {} bytes, expected {}",
                body.len(),
                OPTNEG_BODY_SIZE
            )));
        }
        let word = |i: usize| u32::from_be_bytes([body[i], body[i + 1], body[i + 2], body[i + 3]]);
        Ok(Self {
            version: word(0),
            actions: word(4),
            protocol: word(8),
        })
    }

    /// The 12-byte body: version, actions, protocol, all big-endian.
    pub fn encode_body(&self) -> Bytes {
        let mut body = Vec::with_capacity(OPTNEG_BODY_SIZE);
        body.extend_from_slice(&self.version.to_be_bytes());
        body.extend_from_slice(&self.actions.to_be_bytes());
        body.extend_from_slice(&self.protocol.to_be_bytes());
        Bytes::from(body)
    }

    /// Encode as a complete OPTNEG frame.
    pub fn encode(&self) -> Bytes {
        encode_frame(
            command::OPTNEG,
            &[
                &self.version.to_be_bytes(),
                &self.actions.to_be_bytes(),
                &self.protocol.to_be_bytes(),
            ],
        )
    }
}

/// Which side's options to consult.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// What this milter asked for.
    Ours,
    /// What the MTA offered.
    Theirs,
    /// Both must agree.
    Both,
}

/// Outcome of OPTNEG for one session: set once, read-only afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiated {
    /// Our announcement.
    pub ours: OptNeg,
    /// The MTA's announcement.
    pub theirs: OptNeg,
}

impl Negotiated {
    /// Combine both announcements.
    pub fn new(ours: OptNeg, theirs: OptNeg) -> Self {
        Self { ours, theirs }
    }

    /// Actions both sides agreed on.
    #[inline]
    pub fn actions(&self) -> u32 {
        self.ours.actions & self.theirs.actions
    }

    /// Protocol bits both sides agreed on.
    #[inline]
    pub fn protocol(&self) -> u32 {
        self.ours.protocol & self.theirs.protocol
    }

    /// Check if an action bit is available on the given side.
    pub fn has_option(&self, action: u32, side: Side) -> bool {
        match side {
            Side::Ours => actions::has(self.ours.actions, action),
            Side::Theirs => actions::has(self.theirs.actions, action),
            Side::Both => actions::has(self.actions(), action),
        }
    }

    /// Check if a protocol bit is in effect.
    #[inline]
    pub fn has_protocol(&self, bit: u32) -> bool {
        protocol::has(self.protocol(), bit)
    }

    /// Decide, before invoking anything, how a command is handled.
    pub fn plan(&self, command: Command) -> Dispatch {
        let Some((no_callback, no_reply)) = phase_bits(command) else {
            return Dispatch::AwaitAndReply;
        };
        if self.has_protocol(no_callback) {
            Dispatch::Skip
        } else if self.has_protocol(no_reply) {
            Dispatch::FireAndForget
        } else {
            Dispatch::AwaitAndReply
        }
    }
}

/// How the dispatcher treats one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Do not call the handler, send nothing.
    Skip,
    /// Call the handler, discard its reply.
    FireAndForget,
    /// Call the handler and write its reply back.
    AwaitAndReply,
}

/// `(no callback, no reply)` protocol bits for each phase.
fn phase_bits(command: Command) -> Option<(u32, u32)> {
    Some(match command {
        Command::Connect => (protocol::NOCONNECT, protocol::NR_CONN),
        Command::Helo => (protocol::NOHELO, protocol::NR_HELO),
        Command::Mail => (protocol::NOMAIL, protocol::NR_MAIL),
        Command::Rcpt => (protocol::NORCPT, protocol::NR_RCPT),
        Command::Data => (protocol::NODATA, protocol::NR_DATA),
        Command::Header => (protocol::NOHDRS, protocol::NR_HDR),
        Command::Eoh => (protocol::NOEOH, protocol::NR_EOH),
        Command::Body => (protocol::NOBODY, protocol::NR_BODY),
        Command::Unknown => (protocol::NOUNKNOWN, protocol::NR_UNKN),
        _ => return None,
    })
}
