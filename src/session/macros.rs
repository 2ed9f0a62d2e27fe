//! Macro frames and the per-session "last macro" slot.
//!
//! The MTA sends a MACRO frame (`D`) right before the command it annotates.
//! Its first body byte names that command; the rest is `name\0value\0` pairs.
//! The session keeps only the latest record, merges it into the next command
//! whose code matches, and drops it once that command has been handled.

use std::collections::HashMap;

use bytes::Bytes;
use tracing::debug;

use crate::error::{MilterError, Result};
use crate::protocol::{split_nul, Command};

/// Macro name to value, as handed to callbacks.
pub type MacroDict = HashMap<String, String>;

/// Macro name carrying the MTA queue id.
pub const QUEUE_ID_MACRO: &str = "i";

/// The payload of one MACRO frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacroRecord {
    /// Full payload, starting with the `D` code.
    payload: Bytes,
}

impl MacroRecord {
    /// Wrap a MACRO payload (code byte included).
    ///
    /// # Errors
    ///
    /// Fails if the payload has no stage byte.
    pub fn from_payload(payload: Bytes) -> Result<Self> {
        if payload.len() < 2 {
            return Err(MilterError::Protocol(
                "MACRO frame without command stage".to_string(),
            ));
        }
        Ok(Self { payload })
    }

    /// Code of the command these macros belong to.
    #[inline]
    pub fn stage(&self) -> u8 {
        self.payload[1]
    }

    /// True if this record annotates `command`.
    #[inline]
    pub fn applies_to(&self, command: Command) -> bool {
        self.stage() == command.code()
    }

    /// Decode the `name\0value\0` pairs. A dangling name without value is dropped.
    pub fn dict(&self) -> MacroDict {
        let fields = split_nul(&self.payload[2..]);
        fields
            .chunks_exact(2)
            .map(|pair| {
                (
                    String::from_utf8_lossy(&pair[0]).into_owned(),
                    String::from_utf8_lossy(&pair[1]).into_owned(),
                )
            })
            .collect()
    }
}

/// Holds the most recently received macro record.
#[derive(Debug, Default)]
pub struct MacroStore {
    last: Option<MacroRecord>,
}

impl MacroStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the held record.
    pub fn store(&mut self, record: MacroRecord) {
        self.last = Some(record);
    }

    /// The held record, if any.
    pub fn peek(&self) -> Option<&MacroRecord> {
        self.last.as_ref()
    }

    /// Macros for `command`: the held record's pairs if its stage matches,
    /// otherwise an empty dict. Does not consume the record.
    pub fn dict_for(&self, command: Command) -> MacroDict {
        match &self.last {
            Some(record) if record.applies_to(command) => record.dict(),
            Some(record) => {
                debug!(
                    stage = %(record.stage() as char),
                    command = command.name(),
                    "ignoring macros for another stage"
                );
                MacroDict::new()
            }
            None => MacroDict::new(),
        }
    }

    /// Drop the held record.
    pub fn clear(&mut self) {
        self.last = None;
    }
}
