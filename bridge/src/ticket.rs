//! Address tokens.
//!
//! A blob ticket is an opaque string naming a blob and its provider. The
//! cheap structural check here never errors; full decoding is a native call
//! (see [`Bridge::validate_ticket`](crate::Bridge::validate_ticket)).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};
use crate::types::TicketInfo;

pub const BLOB_TICKET_PREFIX: &str = "blob";

/// Shortest string that can be a ticket at all.
pub const MIN_TICKET_LEN: usize = 10;

fn has_ticket_shape(token: &str) -> bool {
    token.starts_with(BLOB_TICKET_PREFIX) && token.len() >= MIN_TICKET_LEN
}

/// Check the shape of a blob ticket without decoding it.
///
/// Never fails. Only `is_valid` is filled in: hash and provider need the
/// native decoder.
pub fn validate_structure(token: &str) -> TicketInfo {
    TicketInfo {
        is_valid: has_ticket_shape(token),
        ..TicketInfo::invalid()
    }
}

/// A string that passed the structural check.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BlobTicket(String);

impl BlobTicket {
    pub fn parse(token: impl Into<String>) -> Result<Self> {
        let token = token.into();
        if !has_ticket_shape(&token) {
            return Err(BridgeError::DecodingFailed(format!(
                "not a blob ticket: {}",
                preview(&token)
            )));
        }
        Ok(Self(token))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Short prefix of a possibly long token, for messages.
fn preview(token: &str) -> String {
    let mut shown: String = token.chars().take(16).collect();
    if shown.len() < token.len() {
        shown.push_str("...");
    }
    shown
}

impl fmt::Display for BlobTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for BlobTicket {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for BlobTicket {
    type Error = BridgeError;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(s)
    }
}

impl From<BlobTicket> for String {
    fn from(ticket: BlobTicket) -> Self {
        ticket.0
    }
}

impl AsRef<str> for BlobTicket {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structure_needs_prefix_and_length() {
        assert!(validate_structure("blobabcdef").is_valid);
        assert!(!validate_structure("blobabcde").is_valid);
        assert!(!validate_structure("docabcdefghij").is_valid);
        assert!(!validate_structure("").is_valid);
        assert!(!validate_structure("BLOBABCDEFGH").is_valid);
    }

    #[test]
    fn structural_check_decodes_nothing() {
        let info = validate_structure(&format!("blob{}", "ab".repeat(64)));
        assert_eq!(
            info,
            TicketInfo {
                is_valid: true,
                hash: None,
                node_id: None,
                is_recursive: false,
            }
        );
        assert_eq!(validate_structure("blob"), TicketInfo::invalid());
    }

    #[test]
    fn parse_reports_a_short_preview() {
        let err = BlobTicket::parse("x".repeat(100)).unwrap_err();
        assert_eq!(
            err.to_string(),
            format!("Decoding failed: not a blob ticket: {}...", "x".repeat(16))
        );
        let ticket: BlobTicket = "blob0123456789".parse().unwrap();
        assert_eq!(ticket.as_str(), "blob0123456789");
    }

    #[test]
    fn serde_checks_structure() {
        let ticket: BlobTicket = serde_json::from_str("\"blob0123456789\"").unwrap();
        assert_eq!(serde_json::to_string(&ticket).unwrap(), "\"blob0123456789\"");
        assert!(serde_json::from_str::<BlobTicket>("\"nope\"").is_err());
    }
}
