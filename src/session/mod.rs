//! Session module - one MTA connection from OPTNEG to QUIT.
//!
//! Provides:
//! - [`Session`] - reassembles frames and dispatches them to a [`Milter`]
//! - [`Milter`] and [`Reply`] - the callback surface
//! - [`Modifier`] - message modifications during end-of-message
//! - typed command arguments and the macro store
//!
//! Commands are handled strictly in arrival order. A command's reply is
//! written and flushed before the next command is dispatched, so replies
//! reach the MTA in the order it expects them.
//!
//! # Example
//!
//! ```
//! use async_trait::async_trait;
//! use milterwire::config::SessionConfig;
//! use milterwire::session::{Milter, Session};
//!
//! struct PassThrough;
//!
//! #[async_trait]
//! impl Milter for PassThrough {}
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let (mta, milter_side) = tokio::io::duplex(4096);
//! let (reader, writer) = tokio::io::split(milter_side);
//! let mut session = Session::new(PassThrough, writer, &SessionConfig::default());
//! drop(mta);
//! session.run(reader).await.unwrap();
//! assert!(session.is_closed());
//! # }
//! ```

mod args;
mod macros;
mod milter;
mod modifier;

pub use args::{decode_helo, decode_unknown, Connect, Envelope, Family, Header};
pub use macros::{MacroDict, MacroRecord, MacroStore, QUEUE_ID_MACRO};
pub use milter::{reply_text, Milter, Reply};
pub use modifier::Modifier;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tracing::{debug, error, trace, warn};

use crate::config::SessionConfig;
use crate::error::{MilterError, Result};
use crate::protocol::{command, protocol, Command, Dispatch, FrameBuffer, Negotiated, OptNeg};
use crate::writer::{FrameWriter, OutboundFrame};

/// Whether the session keeps reading after a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep going.
    Continue,
    /// QUIT received; the session is closed.
    Quit,
}

/// State of one MTA connection.
pub struct Session<M: Milter> {
    milter: M,
    writer: FrameWriter,
    buffer: FrameBuffer,
    ours: OptNeg,
    negotiated: Option<Negotiated>,
    macros: MacroStore,
    qid: Option<String>,
    read_chunk_size: usize,
    closed: bool,
}

impl<M: Milter> Session<M> {
    /// Create a session writing replies to `writer`.
    pub fn new<W>(milter: M, writer: W, config: &SessionConfig) -> Self
    where
        W: AsyncWrite + Send + 'static,
    {
        Self {
            milter,
            writer: FrameWriter::new(writer),
            buffer: FrameBuffer::with_max_frame(config.max_frame_size),
            ours: config.optneg(),
            negotiated: None,
            macros: MacroStore::new(),
            qid: None,
            read_chunk_size: config.read_chunk_size.max(1),
            closed: false,
        }
    }

    /// The filter driven by this session.
    pub fn milter(&self) -> &M {
        &self.milter
    }

    /// Mutable access to the filter.
    pub fn milter_mut(&mut self) -> &mut M {
        &mut self.milter
    }

    /// Negotiated options, once OPTNEG has been handled.
    pub fn negotiated(&self) -> Option<&Negotiated> {
        self.negotiated.as_ref()
    }

    /// Queue id of the current message, if known.
    pub fn qid(&self) -> Option<&str> {
        self.qid.as_deref()
    }

    /// True once [`Session::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Frames written to the MTA so far.
    pub fn frames_written(&self) -> u64 {
        self.writer.frames_written()
    }

    /// Read from `reader` until QUIT, EOF or a fatal error.
    ///
    /// The session is closed on every exit path.
    pub async fn run<R>(&mut self, mut reader: R) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut buf = vec![0u8; self.read_chunk_size];

        while !self.closed {
            let n = match reader.read(&mut buf).await {
                Ok(0) => {
                    debug!(qid = self.qid_str(), "MTA closed the connection");
                    self.connection_lost().await;
                    return Ok(());
                }
                Ok(n) => n,
                Err(e) => {
                    warn!(qid = self.qid_str(), error = %e, "read failed");
                    self.connection_lost().await;
                    return Err(MilterError::Io(e));
                }
            };

            match self.data_received(&buf[..n]).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Quit) => return Ok(()),
                Err(e) => {
                    error!(qid = self.qid_str(), error = %e, "session aborted");
                    self.connection_lost().await;
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    /// Feed one chunk of bytes from the transport and dispatch every
    /// complete frame in it, in order.
    ///
    /// Stops at QUIT; frames after it in the same chunk are not dispatched.
    /// Frames that precede an oversized one are dispatched before the
    /// error is returned.
    ///
    /// # Errors
    ///
    /// Oversized frames, malformed payloads and unknown command codes.
    pub async fn data_received(&mut self, chunk: &[u8]) -> Result<Flow> {
        let payloads = self.buffer.push(chunk)?;
        trace!(bytes = chunk.len(), frames = payloads.len(), "chunk received");

        for payload in payloads {
            if self.dispatch(payload).await? == Flow::Quit {
                return Ok(Flow::Quit);
            }
        }
        self.buffer.check()?;
        Ok(Flow::Continue)
    }

    /// Handle one complete payload (command byte first).
    pub async fn dispatch(&mut self, payload: Bytes) -> Result<Flow> {
        let Some(&code) = payload.first() else {
            warn!(qid = self.qid_str(), "empty frame skipped");
            return Ok(Flow::Continue);
        };

        let command = Command::from_code(code).ok_or_else(|| MilterError::Unsupported {
            code: code as char,
            qid: self.qid.clone(),
        })?;
        let body = payload.slice(1..);

        match command {
            Command::OptNeg => {
                let frame = self.negotiate(&body)?;
                self.write_back(frame).await;
            }
            Command::Macro => {
                self.macros.store(MacroRecord::from_payload(payload)?);
            }
            Command::Abort => {
                debug!(qid = self.qid_str(), "message aborted");
                self.qid = None;
                self.macros.clear();
                self.milter.abort().await;
            }
            Command::Quit | Command::QuitNc => {
                debug!(qid = self.qid_str(), command = command.name(), "quit");
                self.close().await;
                return Ok(Flow::Quit);
            }
            _ => {
                let result = self.dispatch_phase(command, body).await;
                self.macros.clear();
                result?;
            }
        }

        Ok(Flow::Continue)
    }

    /// Close the session: notify the filter once and shut the write half.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.milter.close().await;
        if let Err(e) = self.writer.shutdown().await {
            debug!(qid = self.qid_str(), error = %e, "shutdown of write half failed");
        }
    }

    /// The transport went away. Same as [`Session::close`].
    pub async fn connection_lost(&mut self) {
        self.close().await;
    }

    fn negotiate(&mut self, body: &[u8]) -> Result<OutboundFrame> {
        if self.negotiated.is_some() {
            return Err(MilterError::Protocol("OPTNEG received twice".to_string()));
        }
        let theirs = OptNeg::decode(body)?;
        let negotiated = Negotiated::new(self.ours, theirs);
        debug!(
            version = theirs.version,
            actions = negotiated.actions(),
            protocol = negotiated.protocol(),
            "options negotiated"
        );
        self.negotiated = Some(negotiated);
        Ok(OutboundFrame::new(command::OPTNEG, self.ours.encode_body()))
    }

    async fn dispatch_phase(&mut self, command: Command, body: Bytes) -> Result<()> {
        let macros = self.macros.dict_for(command);
        if let Some(qid) = macros.get(QUEUE_ID_MACRO) {
            self.qid = Some(qid.clone());
        }

        let plan = self
            .negotiated
            .map(|n| n.plan(command))
            .unwrap_or(Dispatch::AwaitAndReply);

        if plan == Dispatch::Skip {
            trace!(qid = self.qid_str(), command = command.name(), "no callback negotiated");
            return Ok(());
        }

        let reply = self.invoke(command, body, &macros).await?;
        let reply = self.check_skip(command, reply);

        if plan == Dispatch::FireAndForget {
            trace!(qid = self.qid_str(), command = command.name(), reply = reply.name(), "reply discarded");
            return Ok(());
        }

        if let Some(frame) = reply.to_frame() {
            self.write_back(frame).await;
        }
        Ok(())
    }

    async fn invoke(&mut self, command: Command, body: Bytes, macros: &MacroDict) -> Result<Reply> {
        let reply = match command {
            Command::Connect => self.milter.connect(Connect::decode(&body)?, macros).await,
            Command::Helo => self.milter.helo(decode_helo(&body)?, macros).await,
            Command::Mail => self.milter.mail_from(Envelope::decode(&body)?, macros).await,
            Command::Rcpt => self.milter.rcpt(Envelope::decode(&body)?, macros).await,
            Command::Data => self.milter.data(macros).await,
            Command::Header => self.milter.header(Header::decode(&body)?, macros).await,
            Command::Eoh => self.milter.eoh(macros).await,
            Command::Body => self.milter.body(body, macros).await,
            Command::Eob => {
                let mut modifier =
                    Modifier::new(&mut self.writer, self.negotiated.as_ref(), self.qid.as_deref());
                self.milter.eob(&mut modifier, macros).await
            }
            Command::Unknown => self.milter.unknown(decode_unknown(&body), macros).await,
            Command::OptNeg
            | Command::Macro
            | Command::Abort
            | Command::Quit
            | Command::QuitNc => {
                return Err(MilterError::Unsupported {
                    code: command.code() as char,
                    qid: self.qid.clone(),
                })
            }
        };
        Ok(reply)
    }

    /// SKIP is only valid from `body` and only when negotiated.
    fn check_skip(&self, command: Command, reply: Reply) -> Reply {
        if reply != Reply::Skip {
            return reply;
        }
        let negotiated = self
            .negotiated
            .map(|n| n.has_protocol(protocol::SKIP))
            .unwrap_or(false);
        if command == Command::Body && negotiated {
            return reply;
        }
        warn!(
            qid = self.qid_str(),
            command = command.name(),
            "skip not allowed here, sending continue"
        );
        Reply::Continue
    }

    async fn write_back(&mut self, frame: OutboundFrame) {
        let code = frame.code();
        if let Err(e) = self.writer.send(frame).await {
            warn!(qid = self.qid_str(), code = %(code as char), error = %e, "failed to write reply");
        }
    }

    fn qid_str(&self) -> &str {
        self.qid.as_deref().unwrap_or("-")
    }
}
