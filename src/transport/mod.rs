//! Transport module - listening sockets for MTA connections.
//!
//! Addresses use the notation MTAs are configured with:
//! - `inet:host:port` (also `inet6:[::1]:port` and bare `host:port`)
//! - `unix:/path/to/socket` (also `local:` and bare absolute paths)

mod listener;

pub use listener::{BoxedReader, Connection, ListenAddr, MilterListener};
