//! Tagging milter - adds a header to every message and rejects one sender.
//!
//! This example demonstrates:
//! - Building a server with the fluent API or from a JSON config file
//! - Reading macros and envelope arguments in callbacks
//! - Modifying the message at end of body
//!
//! # Running with postfix
//!
//! ```text
//! cargo run --example tag_header -- inet:127.0.0.1:10025
//!
//! # main.cf
//! smtpd_milters = inet:127.0.0.1:10025
//! ```
//!
//! Set `RUST_LOG=milterwire=debug` to watch the protocol.

use async_trait::async_trait;
use milterwire::protocol::actions;
use milterwire::session::{Envelope, MacroDict, Milter, Modifier, Reply};
use milterwire::{Server, ServerBuilder, ServerConfig};
use tracing_subscriber::EnvFilter;

/// Per-connection state.
#[derive(Default)]
struct Tagger {
    sender: String,
    recipients: usize,
}

#[async_trait]
impl Milter for Tagger {
    async fn mail_from(&mut self, sender: Envelope, macros: &MacroDict) -> Reply {
        self.sender = String::from_utf8_lossy(&sender.address).into_owned();
        self.recipients = 0;

        if self.sender.eq_ignore_ascii_case("<spammer@example.com>") {
            return Reply::custom(550, "", "sender blocked");
        }
        if let Some(auth) = macros.get("{auth_authen}") {
            tracing::info!(auth = %auth, "authenticated sender");
        }
        Reply::Continue
    }

    async fn rcpt(&mut self, _recipient: Envelope, _macros: &MacroDict) -> Reply {
        self.recipients += 1;
        Reply::Continue
    }

    async fn eob(&mut self, modifier: &mut Modifier<'_>, _macros: &MacroDict) -> Reply {
        let value = format!("{} for {} recipient(s)", self.sender, self.recipients);
        modifier.add_header("X-Tagged-By", &value).await;
        Reply::Continue
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Either a listen address or a path to a JSON config file.
    let builder = match std::env::args().nth(1) {
        Some(arg) if arg.ends_with(".json") => {
            ServerBuilder::from_config(ServerConfig::from_json_file(&arg)?)
        }
        Some(addr) => Server::builder().listen(&addr),
        None => Server::builder(),
    };

    let server = builder
        .actions(actions::ADDHDRS)
        .bind(Tagger::default)
        .await?;

    server.serve_until(tokio::signal::ctrl_c()).await?;
    Ok(())
}
