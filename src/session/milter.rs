//! The callback surface a filter implements, and the replies it returns.
//!
//! # Example
//!
//! ```
//! use async_trait::async_trait;
//! use milterwire::session::{Header, MacroDict, Milter, Reply};
//!
//! struct NoSpamSubject;
//!
//! #[async_trait]
//! impl Milter for NoSpamSubject {
//!     async fn header(&mut self, header: Header, _macros: &MacroDict) -> Reply {
//!         if header.name.eq_ignore_ascii_case(b"subject") && header.value.starts_with(b"SPAM") {
//!             return Reply::custom(550, "", "no thanks");
//!         }
//!         Reply::Continue
//!     }
//! }
//! ```

use async_trait::async_trait;
use bytes::Bytes;

use super::args::{Connect, Envelope, Header};
use super::macros::MacroDict;
use super::modifier::Modifier;
use crate::protocol::reply;
use crate::writer::OutboundFrame;

/// Verdict a callback hands back to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Proceed to the next phase.
    Continue,
    /// Accept the message without further callbacks.
    Accept,
    /// Reject the message (or recipient).
    Reject,
    /// Accept and silently drop the message.
    Discard,
    /// Temporary failure.
    Tempfail,
    /// Stop sending body chunks. Only meaningful from `body`.
    Skip,
    /// Fail the SMTP connection.
    ConnFail,
    /// Ask the MTA to shut this milter connection down.
    Shutdown,
    /// Explicit SMTP reply text.
    Custom {
        /// Three-digit SMTP code.
        rcode: u16,
        /// Enhanced status code, may be empty.
        xcode: String,
        /// Free text.
        message: String,
    },
    /// Write nothing; the handler already answered through the [`Modifier`].
    NoReply,
}

impl Reply {
    /// Build a [`Reply::Custom`].
    pub fn custom(rcode: u16, xcode: impl Into<String>, message: impl Into<String>) -> Self {
        Reply::Custom {
            rcode,
            xcode: xcode.into(),
            message: message.into(),
        }
    }

    /// Encode for the wire. `None` for [`Reply::NoReply`].
    pub fn to_frame(&self) -> Option<OutboundFrame> {
        let code = match self {
            Reply::Continue => reply::CONTINUE,
            Reply::Accept => reply::ACCEPT,
            Reply::Reject => reply::REJECT,
            Reply::Discard => reply::DISCARD,
            Reply::Tempfail => reply::TEMPFAIL,
            Reply::Skip => reply::SKIP,
            Reply::ConnFail => reply::CONN_FAIL,
            Reply::Shutdown => reply::SHUTDOWN,
            Reply::Custom {
                rcode,
                xcode,
                message,
            } => return Some(replycode_frame(*rcode, xcode, message)),
            Reply::NoReply => return None,
        };
        Some(OutboundFrame::empty(code))
    }

    /// Short name for log lines.
    pub fn name(&self) -> &'static str {
        match self {
            Reply::Continue => "continue",
            Reply::Accept => "accept",
            Reply::Reject => "reject",
            Reply::Discard => "discard",
            Reply::Tempfail => "tempfail",
            Reply::Skip => "skip",
            Reply::ConnFail => "conn_fail",
            Reply::Shutdown => "shutdown",
            Reply::Custom { .. } => "custom",
            Reply::NoReply => "no_reply",
        }
    }
}

/// A REPLYCODE frame: `rcode xcode message\0`.
pub(crate) fn replycode_frame(rcode: u16, xcode: &str, message: &str) -> OutboundFrame {
    let mut text = reply_text(rcode, xcode, message).into_bytes();
    text.push(0);
    OutboundFrame::new(reply::REPLYCODE, Bytes::from(text))
}

/// Render the SMTP reply line.
///
/// Without an explicit `xcode`, 4xx and 5xx replies get `4.7.1` / `5.7.1`,
/// unless the message already begins with an enhanced code of the same
/// class, in which case that leading word is used.
pub fn reply_text(rcode: u16, xcode: &str, message: &str) -> String {
    if !xcode.is_empty() {
        return format!("{} {} {}", rcode, xcode, message);
    }

    let default = match rcode / 100 {
        5 => "5.7.1",
        4 => "4.7.1",
        _ => return format!("{} {}", rcode, message),
    };

    if message.starts_with(&default[..2]) {
        match message.split_once(' ') {
            Some((code, rest)) => format!("{} {} {}", rcode, code, rest),
            None => format!("{} {}", rcode, message),
        }
    } else {
        format!("{} {} {}", rcode, default, message)
    }
}

/// Per-connection filter callbacks.
///
/// One value is created per MTA connection and driven by a single
/// [`Session`](crate::session::Session); callbacks for a connection never
/// overlap. Every phase callback defaults to [`Reply::Continue`].
#[async_trait]
pub trait Milter: Send {
    /// SMTP client connected.
    async fn connect(&mut self, _connect: Connect, _macros: &MacroDict) -> Reply {
        Reply::Continue
    }

    /// HELO/EHLO.
    async fn helo(&mut self, _helo: Bytes, _macros: &MacroDict) -> Reply {
        Reply::Continue
    }

    /// MAIL FROM.
    async fn mail_from(&mut self, _sender: Envelope, _macros: &MacroDict) -> Reply {
        Reply::Continue
    }

    /// RCPT TO, once per recipient.
    async fn rcpt(&mut self, _recipient: Envelope, _macros: &MacroDict) -> Reply {
        Reply::Continue
    }

    /// DATA.
    async fn data(&mut self, _macros: &MacroDict) -> Reply {
        Reply::Continue
    }

    /// One message header.
    async fn header(&mut self, _header: Header, _macros: &MacroDict) -> Reply {
        Reply::Continue
    }

    /// End of headers.
    async fn eoh(&mut self, _macros: &MacroDict) -> Reply {
        Reply::Continue
    }

    /// A body chunk of at most 65535 bytes.
    async fn body(&mut self, _chunk: Bytes, _macros: &MacroDict) -> Reply {
        Reply::Continue
    }

    /// End of message. The only place message modifications may be sent.
    async fn eob(&mut self, _modifier: &mut Modifier<'_>, _macros: &MacroDict) -> Reply {
        Reply::Continue
    }

    /// Unrecognized SMTP command.
    async fn unknown(&mut self, _command: Bytes, _macros: &MacroDict) -> Reply {
        Reply::Continue
    }

    /// The MTA aborted the current message. No reply is sent.
    async fn abort(&mut self) {}

    /// The session ended. Called exactly once.
    async fn close(&mut self) {}
}
