//! Message destinations -- where an outgoing message for a thread is sent.

use swarmpost_protocol::{AccountId, AccountKind, Namespace};
use swarmpost_storage::{Storage, StorageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadVariant {
    Contact,
    LegacyGroup,
    Group,
    Community,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Contact {
        public_key: String,
    },
    /// Copy of an outgoing message stored in our own swarm.
    SyncMessage {
        original_recipient: String,
    },
    /// A legacy (`05`) or new-style (`03`) group.
    ClosedGroup {
        group_public_key: String,
    },
    Community {
        room: String,
        server: String,
        whisper_to: Option<String>,
        whisper_mods: bool,
    },
    /// Direct message to a blinded id met in a community.
    CommunityInbox {
        server: String,
        server_public_key: String,
        blinded_public_key: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum DestinationError {
    #[error("missing community info for {0}")]
    MissingCommunityInfo(String),
    #[error("invalid thread id: {0}")]
    InvalidThreadId(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

fn is_new_group(id: &str) -> bool {
    AccountId::kind_of(id) == Some(AccountKind::Group)
}

impl Destination {
    /// Resolve the destination for a thread. Blinded contacts and
    /// communities need their lookup records in storage.
    pub fn from_thread(
        variant: ThreadVariant,
        thread_id: &str,
        storage: &dyn Storage,
    ) -> Result<Self, DestinationError> {
        match variant {
            ThreadVariant::Contact => {
                let blinded = AccountId::kind_of(thread_id).is_some_and(AccountKind::is_blinded);
                if !blinded {
                    return Ok(Destination::Contact {
                        public_key: thread_id.to_string(),
                    });
                }
                let lookup = storage
                    .read_blinded_lookup(thread_id)?
                    .ok_or_else(|| DestinationError::MissingCommunityInfo(thread_id.to_string()))?;
                Ok(Destination::CommunityInbox {
                    server: lookup.server,
                    server_public_key: lookup.server_public_key,
                    blinded_public_key: thread_id.to_string(),
                })
            }
            ThreadVariant::LegacyGroup | ThreadVariant::Group => Ok(Destination::ClosedGroup {
                group_public_key: thread_id.to_string(),
            }),
            ThreadVariant::Community => {
                let (server, room) = thread_id
                    .rsplit_once('.')
                    .filter(|(server, room)| !server.is_empty() && !room.is_empty())
                    .ok_or_else(|| DestinationError::InvalidThreadId(thread_id.to_string()))?;
                let open_group = storage
                    .read_open_group(server, room)?
                    .ok_or_else(|| DestinationError::MissingCommunityInfo(thread_id.to_string()))?;
                Ok(Destination::Community {
                    room: open_group.room,
                    server: open_group.server,
                    whisper_to: None,
                    whisper_mods: false,
                })
            }
        }
    }

    pub fn thread_variant(&self) -> ThreadVariant {
        match self {
            Destination::Contact { .. }
            | Destination::SyncMessage { .. }
            | Destination::CommunityInbox { .. } => ThreadVariant::Contact,
            Destination::ClosedGroup { group_public_key } => {
                if is_new_group(group_public_key) {
                    ThreadVariant::Group
                } else {
                    ThreadVariant::LegacyGroup
                }
            }
            Destination::Community { .. } => ThreadVariant::Community,
        }
    }

    /// Swarm namespace the message is stored in; `None` for server targets.
    pub fn default_namespace(&self) -> Option<Namespace> {
        match self {
            Destination::Contact { .. } | Destination::SyncMessage { .. } => {
                Some(Namespace::Default)
            }
            Destination::ClosedGroup { group_public_key } => {
                if is_new_group(group_public_key) {
                    Some(Namespace::Default)
                } else {
                    Some(Namespace::LegacyClosedGroup)
                }
            }
            Destination::Community { .. } | Destination::CommunityInbox { .. } => None,
        }
    }
}
