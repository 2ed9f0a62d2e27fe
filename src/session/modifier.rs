//! Message modifications sent from the end-of-message callback.
//!
//! Every modification is gated by the SMFIF action bit it needs. When the
//! bit was not negotiated on both sides the call logs a warning naming which
//! side lacks it and writes nothing. Write failures are logged, not raised:
//! the session notices a dead transport on its next read.

use bytes::Bytes;
use tracing::{debug, warn};

use super::milter::replycode_frame;
use crate::protocol::{actions, reply, Negotiated, Side, MILTER_CHUNK_SIZE};
use crate::writer::{FrameWriter, OutboundFrame};

/// Handle passed to [`Milter::eob`](crate::session::Milter::eob).
pub struct Modifier<'a> {
    writer: &'a mut FrameWriter,
    negotiated: Option<&'a Negotiated>,
    qid: Option<&'a str>,
    sent: usize,
}

impl<'a> Modifier<'a> {
    pub(crate) fn new(
        writer: &'a mut FrameWriter,
        negotiated: Option<&'a Negotiated>,
        qid: Option<&'a str>,
    ) -> Self {
        Self {
            writer,
            negotiated,
            qid,
            sent: 0,
        }
    }

    /// Queue id of the current message, if the MTA sent one.
    pub fn qid(&self) -> Option<&str> {
        self.qid
    }

    /// Check an action bit on one side of the negotiation.
    pub fn has_option(&self, action: u32, side: Side) -> bool {
        self.negotiated
            .map(|n| n.has_option(action, side))
            .unwrap_or(false)
    }

    /// Frames written through this handle.
    pub fn frames_sent(&self) -> usize {
        self.sent
    }

    /// Append a header.
    pub async fn add_header(&mut self, name: &str, value: &str) {
        if self.allowed(actions::ADDHDRS, "add_header") {
            self.send(reply::ADDHEADER, fields(&[name.as_bytes(), value.as_bytes()]))
                .await;
        }
    }

    /// Insert a header at `index` (0 is the top).
    pub async fn insert_header(&mut self, index: u32, name: &str, value: &str) {
        if self.allowed(actions::ADDHDRS, "insert_header") {
            self.send(reply::INSHEADER, indexed(index, name, value)).await;
        }
    }

    /// Replace the `index`-th occurrence (1-based) of header `name`.
    /// An empty value deletes it.
    pub async fn change_header(&mut self, index: u32, name: &str, value: &str) {
        if self.allowed(actions::CHGHDRS, "change_header") {
            self.send(reply::CHGHEADER, indexed(index, name, value)).await;
        }
    }

    /// Remove the `index`-th occurrence of header `name`.
    pub async fn delete_header(&mut self, index: u32, name: &str) {
        self.change_header(index, name, "").await;
    }

    /// Add an envelope recipient.
    pub async fn add_rcpt(&mut self, rcpt: &str) {
        if self.allowed(actions::ADDRCPT, "add_rcpt") {
            self.send(reply::ADDRCPT, fields(&[rcpt.as_bytes()])).await;
        }
    }

    /// Add an envelope recipient with ESMTP arguments.
    pub async fn add_rcpt_with_args(&mut self, rcpt: &str, args: &str) {
        if self.allowed(actions::ADDRCPT_PAR, "add_rcpt_with_args") {
            self.send(reply::ADDRCPT_PAR, fields(&[rcpt.as_bytes(), args.as_bytes()]))
                .await;
        }
    }

    /// Remove an envelope recipient.
    pub async fn del_rcpt(&mut self, rcpt: &str) {
        if self.allowed(actions::DELRCPT, "del_rcpt") {
            self.send(reply::DELRCPT, fields(&[rcpt.as_bytes()])).await;
        }
    }

    /// Replace the message body, split into 65535-byte REPLBODY frames.
    pub async fn replace_body(&mut self, body: &[u8]) {
        if !self.allowed(actions::CHGBODY, "replace_body") {
            return;
        }
        if body.is_empty() {
            self.send(reply::REPLBODY, Bytes::new()).await;
            return;
        }
        for chunk in body.chunks(MILTER_CHUNK_SIZE) {
            self.send(reply::REPLBODY, Bytes::copy_from_slice(chunk)).await;
        }
    }

    /// Put the message into the MTA's quarantine.
    pub async fn quarantine(&mut self, reason: &str) {
        if self.allowed(actions::QUARANTINE, "quarantine") {
            self.send(reply::QUARANTINE, fields(&[reason.as_bytes()])).await;
        }
    }

    /// Change the envelope sender.
    pub async fn change_from(&mut self, sender: &str, args: Option<&str>) {
        if !self.allowed(actions::CHGFROM, "change_from") {
            return;
        }
        let body = match args {
            Some(args) => fields(&[sender.as_bytes(), args.as_bytes()]),
            None => fields(&[sender.as_bytes()]),
        };
        self.send(reply::CHGFROM, body).await;
    }

    /// Send an explicit SMTP reply as the final answer. Return
    /// [`Reply::NoReply`](crate::session::Reply::NoReply) afterwards.
    pub async fn send_reply(&mut self, rcode: u16, xcode: &str, message: &str) {
        self.write(replycode_frame(rcode, xcode, message)).await;
    }

    /// Ask the MTA to extend its timeout.
    pub async fn progress(&mut self) {
        self.write(OutboundFrame::empty(reply::PROGRESS)).await;
    }

    fn allowed(&self, action: u32, operation: &str) -> bool {
        let qid = self.qid.unwrap_or("-");
        let Some(negotiated) = self.negotiated else {
            warn!(qid, operation, "modification before option negotiation, ignored");
            return false;
        };
        if negotiated.has_option(action, Side::Both) {
            return true;
        }
        warn!(
            qid,
            operation,
            action = actions::name(action),
            milter = negotiated.has_option(action, Side::Ours),
            mta = negotiated.has_option(action, Side::Theirs),
            "action not negotiated, modification ignored"
        );
        false
    }

    async fn send(&mut self, code: u8, body: Bytes) {
        self.write(OutboundFrame::new(code, body)).await;
    }

    async fn write(&mut self, frame: OutboundFrame) {
        let code = frame.code();
        match self.writer.send(frame).await {
            Ok(()) => {
                self.sent += 1;
                debug!(qid = self.qid.unwrap_or("-"), code = %(code as char), "modification sent");
            }
            Err(e) => {
                warn!(qid = self.qid.unwrap_or("-"), error = %e, "failed to send modification");
            }
        }
    }
}

/// NUL-terminate and concatenate fields.
fn fields(parts: &[&[u8]]) -> Bytes {
    let mut buf = Vec::with_capacity(parts.iter().map(|p| p.len() + 1).sum());
    for part in parts {
        buf.extend_from_slice(part);
        buf.push(0);
    }
    Bytes::from(buf)
}

/// `index(u32 BE) name\0 value\0`.
fn indexed(index: u32, name: &str, value: &str) -> Bytes {
    let mut buf = index.to_be_bytes().to_vec();
    buf.extend_from_slice(&fields(&[name.as_bytes(), value.as_bytes()]));
    Bytes::from(buf)
}
