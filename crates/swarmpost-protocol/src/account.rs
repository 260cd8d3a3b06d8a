//! Account ids: 33-byte public keys rendered as 66 hex chars, where the first
//! byte tags the key kind.

use crate::ProtocolError;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccountKind {
    /// `05`: a standard user account (X25519 key).
    Standard,
    /// `15`: community-blinded id (legacy blinding).
    Blinded15,
    /// `25`: community-blinded id.
    Blinded25,
    /// `03`: new-style group (Ed25519 key).
    Group,
    /// `00`: unblinded community server key.
    Unblinded,
}

impl AccountKind {
    pub fn prefix(self) -> &'static str {
        match self {
            AccountKind::Standard => "05",
            AccountKind::Blinded15 => "15",
            AccountKind::Blinded25 => "25",
            AccountKind::Group => "03",
            AccountKind::Unblinded => "00",
        }
    }

    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "05" => Some(AccountKind::Standard),
            "15" => Some(AccountKind::Blinded15),
            "25" => Some(AccountKind::Blinded25),
            "03" => Some(AccountKind::Group),
            "00" => Some(AccountKind::Unblinded),
            _ => None,
        }
    }

    pub fn is_blinded(self) -> bool {
        matches!(self, AccountKind::Blinded15 | AccountKind::Blinded25)
    }
}

/// A validated account id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountId {
    hex: String,
    kind: AccountKind,
}

impl AccountId {
    pub const HEX_LEN: usize = 66;

    pub fn parse(s: &str) -> Result<Self, ProtocolError> {
        let invalid = || ProtocolError::InvalidAccountId(s.to_string());
        if s.len() != Self::HEX_LEN || hex::decode(s).is_err() {
            return Err(invalid());
        }
        let kind = AccountKind::from_prefix(&s[..2]).ok_or_else(invalid)?;
        Ok(Self {
            hex: s.to_ascii_lowercase(),
            kind,
        })
    }

    /// Classify `id` without keeping it. `None` for anything that is not a
    /// well-formed account id.
    pub fn kind_of(id: &str) -> Option<AccountKind> {
        Self::parse(id).ok().map(|a| a.kind)
    }

    pub fn kind(&self) -> AccountKind {
        self.kind
    }

    pub fn as_str(&self) -> &str {
        &self.hex
    }

    /// The 32-byte key without the kind prefix.
    pub fn key_bytes(&self) -> Vec<u8> {
        // Validated as hex in parse().
        hex::decode(&self.hex[2..]).unwrap_or_default()
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex)
    }
}
