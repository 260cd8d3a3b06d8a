//! Namespace catalog -- logical partitions of the messages a swarm stores.
//!
//! The integer codes are part of the storage-server protocol and must
//! round-trip exactly. Every policy value below is derived statically from
//! the variant.

use crate::ProtocolError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum Namespace {
    /// One-to-one messages and sync messages.
    Default,
    ConfigUserProfile,
    ConfigContacts,
    ConfigConvoInfoVolatile,
    ConfigUserGroups,
    ConfigClosedGroupInfo,
    LegacyClosedGroup,
    /// Sentinel addressing every namespace at once (deletions only).
    All,
}

impl Namespace {
    /// Every concrete namespace, excluding the `All` sentinel.
    pub const CONCRETE: [Namespace; 7] = [
        Namespace::Default,
        Namespace::ConfigUserProfile,
        Namespace::ConfigContacts,
        Namespace::ConfigConvoInfoVolatile,
        Namespace::ConfigUserGroups,
        Namespace::ConfigClosedGroupInfo,
        Namespace::LegacyClosedGroup,
    ];

    /// Namespaces the current user's poller retrieves from their own swarm.
    pub const USER: [Namespace; 5] = [
        Namespace::Default,
        Namespace::ConfigUserProfile,
        Namespace::ConfigContacts,
        Namespace::ConfigConvoInfoVolatile,
        Namespace::ConfigUserGroups,
    ];

    pub fn code(self) -> i32 {
        match self {
            Namespace::Default => 0,
            Namespace::ConfigUserProfile => 2,
            Namespace::ConfigContacts => 3,
            Namespace::ConfigConvoInfoVolatile => 4,
            Namespace::ConfigUserGroups => 5,
            Namespace::ConfigClosedGroupInfo => 11,
            Namespace::LegacyClosedGroup => -10,
            Namespace::All => -9_999_990,
        }
    }

    pub fn from_code(code: i32) -> Result<Self, ProtocolError> {
        match code {
            0 => Ok(Namespace::Default),
            2 => Ok(Namespace::ConfigUserProfile),
            3 => Ok(Namespace::ConfigContacts),
            4 => Ok(Namespace::ConfigConvoInfoVolatile),
            5 => Ok(Namespace::ConfigUserGroups),
            11 => Ok(Namespace::ConfigClosedGroupInfo),
            -10 => Ok(Namespace::LegacyClosedGroup),
            -9_999_990 => Ok(Namespace::All),
            other => Err(ProtocolError::UnknownNamespace(other)),
        }
    }

    pub fn is_config(self) -> bool {
        matches!(
            self,
            Namespace::ConfigUserProfile
                | Namespace::ConfigContacts
                | Namespace::ConfigConvoInfoVolatile
                | Namespace::ConfigUserGroups
                | Namespace::ConfigClosedGroupInfo
        )
    }

    /// Legacy groups predate signed retrieval; their swarm is readable by anyone
    /// holding the group key.
    pub fn requires_read_authentication(self) -> bool {
        !matches!(self, Namespace::LegacyClosedGroup)
    }

    pub fn requires_write_authentication(self) -> bool {
        !matches!(self, Namespace::Default | Namespace::LegacyClosedGroup)
    }

    /// Message namespaces keep a local record of every hash seen so a message
    /// is never processed twice. Config namespaces are idempotent merges.
    pub fn requires_deduplication(self) -> bool {
        matches!(self, Namespace::Default | Namespace::LegacyClosedGroup)
    }

    /// Deduplicated namespaces retrieve the full stored set and filter
    /// locally; the rest ask the node for messages after the last hash.
    pub fn should_fetch_since_last_hash(self) -> bool {
        !self.requires_deduplication()
    }

    /// Lower values receive a larger share of a batched response.
    pub fn batch_request_size_priority(self) -> i64 {
        match self {
            Namespace::Default | Namespace::LegacyClosedGroup => 10,
            _ => 1,
        }
    }

    /// Fragment included in the signed string of a retrieve request.
    pub fn verification_string(self) -> String {
        match self {
            Namespace::Default => String::new(),
            other => other.code().to_string(),
        }
    }

    /// Whether payloads stored here carry the outer websocket request frame.
    pub fn wraps_in_websocket_message(self) -> bool {
        matches!(self, Namespace::Default | Namespace::LegacyClosedGroup)
    }

    /// Response-size weights for a batched retrieve over `namespaces`.
    ///
    /// Namespaces are grouped by priority and walked from the highest numeric
    /// priority down. A running split is multiplied by each group's size,
    /// plus one for every group except the lowest-priority one, and every
    /// namespace in the group is assigned the negated split. The node reads a
    /// negative `max_size` as "1/n of the response budget", so a smaller
    /// magnitude is a larger share.
    pub fn max_size_map(namespaces: &[Namespace]) -> HashMap<Namespace, i64> {
        let mut groups: BTreeMap<i64, Vec<Namespace>> = BTreeMap::new();
        for ns in namespaces {
            let group = groups.entry(ns.batch_request_size_priority()).or_default();
            if !group.contains(ns) {
                group.push(*ns);
            }
        }

        let lowest_priority = groups.keys().next().copied().unwrap_or(1);
        let mut last_split: i64 = 1;
        let mut map = HashMap::with_capacity(namespaces.len());

        for (priority, group) in groups.iter().rev() {
            let extra = if *priority == lowest_priority { 0 } else { 1 };
            last_split *= group.len() as i64 + extra;
            for ns in group {
                map.insert(*ns, -last_split);
            }
        }
        map
    }
}

impl TryFrom<i32> for Namespace {
    type Error = ProtocolError;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        Namespace::from_code(code)
    }
}

impl From<Namespace> for i32 {
    fn from(ns: Namespace) -> i32 {
        ns.code()
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}
