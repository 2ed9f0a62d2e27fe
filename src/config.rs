//! Session and server configuration.
//!
//! Both structs deserialize from JSON with every field optional:
//!
//! ```
//! use milterwire::config::ServerConfig;
//!
//! let config = ServerConfig::from_json_str(r#"{
//!     "listen": "inet:127.0.0.1:10025",
//!     "session": { "actions": 1, "protocol": 128 }
//! }"#).unwrap();
//!
//! assert_eq!(config.session.actions, 1);
//! assert_eq!(config.session.version, 6);
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::protocol::{actions, OptNeg, DEFAULT_MAX_FRAME_SIZE, MILTER_CHUNK_SIZE, MILTER_VERSION};

/// Default address for [`ServerConfig::listen`].
pub const DEFAULT_LISTEN: &str = "inet:127.0.0.1:10025";

/// Default maximum concurrent MTA connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 256;

/// Options for one milter session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Protocol version we announce.
    pub version: u32,
    /// SMFIF action bits we ask for.
    pub actions: u32,
    /// SMFIP protocol bits we ask for.
    pub protocol: u32,
    /// Largest frame accepted from the MTA.
    pub max_frame_size: usize,
    /// Bytes requested per socket read.
    pub read_chunk_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            version: MILTER_VERSION,
            actions: actions::ALL,
            protocol: 0,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            read_chunk_size: MILTER_CHUNK_SIZE,
        }
    }
}

impl SessionConfig {
    /// Our OPTNEG announcement.
    pub fn optneg(&self) -> OptNeg {
        OptNeg::new(self.version, self.actions, self.protocol)
    }
}

/// Options for [`Server`](crate::server::Server).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// `inet:host:port` or `unix:/path`.
    pub listen: String,
    /// Connections served at once; further accepts wait.
    pub max_connections: usize,
    /// Per-session options.
    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            session: SessionConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Parse from a JSON string.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }
}
