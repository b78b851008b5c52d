//! Ticket formats.
//!
//! A blob ticket names a blob and the node providing it:
//!
//! ```text
//! blob<node id: 64 hex><hash: 64 hex><format: '0' raw | '1' hash sequence>
//! ```
//!
//! A document ticket names a namespace, the node to sync with and the
//! capability granted:
//!
//! ```text
//! doc<namespace: 64 hex><node id: 64 hex><mode: 'r' | 'w'>
//! ```

use std::fmt;
use std::str::FromStr;

use crate::abi::{BlobFormat, DocShareMode};
use crate::error::{Error, Result};

pub const BLOB_PREFIX: &str = "blob";
pub const DOC_PREFIX: &str = "doc";

/// A 32-byte identifier rendered as lowercase hex.
pub type Id32 = [u8; 32];

const ID_HEX_LEN: usize = 64;

pub fn encode_id(id: &Id32) -> String {
    hex::encode(id)
}

pub fn decode_id(s: &str) -> Result<Id32> {
    let bytes = hex::decode(s).map_err(|e| Error::InvalidHash(format!("{s}: {e}")))?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| Error::InvalidHash(format!("expected 32 bytes, got {}", b.len())))
}

/// Parsed blob ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobTicket {
    pub node_id: Id32,
    pub hash: Id32,
    pub format: BlobFormat,
}

impl BlobTicket {
    pub fn new(node_id: Id32, hash: Id32, format: BlobFormat) -> Self {
        Self {
            node_id,
            hash,
            format,
        }
    }

    /// Whether the ticket names a collection rather than a single blob.
    pub fn recursive(&self) -> bool {
        self.format == BlobFormat::HashSeq
    }
}

impl fmt::Display for BlobTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = match self.format {
            BlobFormat::Raw => '0',
            BlobFormat::HashSeq => '1',
        };
        write!(
            f,
            "{BLOB_PREFIX}{}{}{flag}",
            encode_id(&self.node_id),
            encode_id(&self.hash)
        )
    }
}

impl FromStr for BlobTicket {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let body = s
            .strip_prefix(BLOB_PREFIX)
            .ok_or_else(|| Error::InvalidTicket("missing blob prefix".into()))?;
        if body.len() != ID_HEX_LEN * 2 + 1 || !body.is_ascii() {
            return Err(Error::InvalidTicket(format!(
                "unexpected ticket length {}",
                s.len()
            )));
        }
        let node_id = decode_id(&body[..ID_HEX_LEN])
            .map_err(|e| Error::InvalidTicket(e.to_string()))?;
        let hash = decode_id(&body[ID_HEX_LEN..ID_HEX_LEN * 2])
            .map_err(|e| Error::InvalidTicket(e.to_string()))?;
        let format = match &body[ID_HEX_LEN * 2..] {
            "0" => BlobFormat::Raw,
            "1" => BlobFormat::HashSeq,
            other => return Err(Error::InvalidTicket(format!("unknown format flag {other}"))),
        };
        Ok(Self::new(node_id, hash, format))
    }
}

/// Parsed document ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DocTicket {
    pub namespace: Id32,
    pub node_id: Id32,
    pub mode: DocShareMode,
}

impl fmt::Display for DocTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = match self.mode {
            DocShareMode::Read => 'r',
            DocShareMode::Write => 'w',
        };
        write!(
            f,
            "{DOC_PREFIX}{}{}{flag}",
            encode_id(&self.namespace),
            encode_id(&self.node_id)
        )
    }
}

impl FromStr for DocTicket {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let body = s
            .strip_prefix(DOC_PREFIX)
            .ok_or_else(|| Error::InvalidTicket("missing doc prefix".into()))?;
        if body.len() != ID_HEX_LEN * 2 + 1 || !body.is_ascii() {
            return Err(Error::InvalidTicket(format!(
                "unexpected ticket length {}",
                s.len()
            )));
        }
        let namespace = decode_id(&body[..ID_HEX_LEN])
            .map_err(|e| Error::InvalidTicket(e.to_string()))?;
        let node_id = decode_id(&body[ID_HEX_LEN..ID_HEX_LEN * 2])
            .map_err(|e| Error::InvalidTicket(e.to_string()))?;
        let mode = match &body[ID_HEX_LEN * 2..] {
            "r" => DocShareMode::Read,
            "w" => DocShareMode::Write,
            other => return Err(Error::InvalidTicket(format!("unknown mode flag {other}"))),
        };
        Ok(Self {
            namespace,
            node_id,
            mode,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_ticket_parses_what_it_prints() {
        let ticket = BlobTicket::new([1; 32], [2; 32], BlobFormat::HashSeq);
        let text = ticket.to_string();
        assert!(text.starts_with("blob"));
        assert_eq!(text.len(), 4 + 129);

        let parsed: BlobTicket = text.parse().unwrap();
        assert_eq!(parsed, ticket);
        assert!(parsed.recursive());
    }

    #[test]
    fn blob_ticket_rejects_garbage() {
        assert!("".parse::<BlobTicket>().is_err());
        assert!("blobAAAAAAAAAA".parse::<BlobTicket>().is_err());
        let mut text = BlobTicket::new([1; 32], [2; 32], BlobFormat::Raw).to_string();
        text.pop();
        text.push('7');
        assert!(text.parse::<BlobTicket>().is_err());
    }

    #[test]
    fn doc_ticket_parses_what_it_prints() {
        let ticket = DocTicket {
            namespace: [9; 32],
            node_id: [3; 32],
            mode: DocShareMode::Write,
        };
        let parsed: DocTicket = ticket.to_string().parse().unwrap();
        assert_eq!(parsed, ticket);
        assert!(ticket.to_string().parse::<BlobTicket>().is_err());
    }

    #[test]
    fn decode_id_checks_length() {
        assert!(decode_id("abcd").is_err());
        assert!(decode_id(&"zz".repeat(32)).is_err());
        assert_eq!(decode_id(&"ab".repeat(32)).unwrap(), [0xab; 32]);
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn parsing_never_panics(input in "(blob|doc)?\\PC{0,140}") {
                let _ = input.parse::<BlobTicket>();
                let _ = input.parse::<DocTicket>();
            }

            #[test]
            fn accepted_tickets_are_canonical(input in "blob[0-9a-fA-F]{128}[0-2]") {
                if let Ok(ticket) = input.parse::<BlobTicket>() {
                    prop_assert_eq!(ticket.to_string(), input.to_ascii_lowercase());
                } else {
                    prop_assert!(input.ends_with('2'));
                }
            }
        }
    }
}
