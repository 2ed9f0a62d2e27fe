//! # milterwire
//!
//! Async server side of the sendmail/postfix milter protocol.
//!
//! An MTA connects, negotiates options, then streams one command per SMTP
//! event (connect, HELO, MAIL, RCPT, headers, body chunks, end of message).
//! This crate reassembles those length-prefixed frames from arbitrary TCP
//! reads, hands each command to a [`Milter`](session::Milter) callback and
//! writes the verdict back in order.
//!
//! ## Layers
//!
//! - [`protocol`]: wire constants, frame parsing and reassembly, OPTNEG
//! - [`session`]: per-connection dispatcher, callbacks, message modifications
//! - [`writer`]: ordered, flushed reply writer
//! - [`transport`] and [`server`]: listening sockets and the accept loop
//!
//! ## Example
//!
//! ```no_run
//! use async_trait::async_trait;
//! use milterwire::protocol::actions;
//! use milterwire::session::{MacroDict, Milter, Modifier, Reply};
//! use milterwire::Server;
//!
//! struct Tagger;
//!
//! #[async_trait]
//! impl Milter for Tagger {
//!     async fn eob(&mut self, modifier: &mut Modifier<'_>, _macros: &MacroDict) -> Reply {
//!         modifier.add_header("X-Filtered", "yes").await;
//!         Reply::Continue
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> milterwire::Result<()> {
//!     Server::builder()
//!         .listen("inet:127.0.0.1:10025")
//!         .actions(actions::ADDHDRS)
//!         .bind(|| Tagger)
//!         .await?
//!         .serve()
//!         .await
//! }
//! ```

pub mod config;
pub mod error;
pub mod protocol;
pub mod server;
pub mod session;
pub mod transport;
pub mod writer;

pub use config::{ServerConfig, SessionConfig};
pub use error::{MilterError, Result};
pub use server::{Server, ServerBuilder};
pub use session::{Milter, Modifier, Reply, Session};
