use std::{fmt, str::FromStr};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(ConversationId);
id_newtype!(MessageId);
id_newtype!(GroupId);
id_newtype!(GroupMessageId);
id_newtype!(CallId);

/// Typing records older than this are read as "not typing".
pub const TYPING_FRESHNESS_SECS: i64 = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {} '{}'", self.kind, self.value)
    }
}

impl std::error::Error for UnknownVariant {}

macro_rules! text_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value {
                    $($text => Ok(Self::$variant),)+
                    other => Err(UnknownVariant {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

/// Identity of a one-to-one conversation as seen by the client.
///
/// A conversation created while the backing store is unreachable carries a
/// client-minted provisional id until the store assigns a canonical one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ConversationRef {
    Provisional(String),
    Remote(ConversationId),
}

impl ConversationRef {
    pub fn provisional(pair: ParticipantPair, minted_at: DateTime<Utc>) -> Self {
        Self::Provisional(format!(
            "provisional-{}-{}-{}",
            pair.low(),
            pair.high(),
            minted_at.timestamp_millis()
        ))
    }

    pub fn is_provisional(&self) -> bool {
        matches!(self, Self::Provisional(_))
    }

    pub fn remote_id(&self) -> Option<ConversationId> {
        match self {
            Self::Remote(id) => Some(*id),
            Self::Provisional(_) => None,
        }
    }
}

impl From<ConversationId> for ConversationRef {
    fn from(value: ConversationId) -> Self {
        Self::Remote(value)
    }
}

impl fmt::Display for ConversationRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Provisional(id) => f.write_str(id),
            Self::Remote(id) => write!(f, "{id}"),
        }
    }
}

/// Identity of a message: client-minted until the store assigns one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum MessageRef<T> {
    Provisional(String),
    Remote(T),
}

impl<T: Copy> MessageRef<T> {
    pub fn remote_id(&self) -> Option<T> {
        match self {
            Self::Remote(id) => Some(*id),
            Self::Provisional(_) => None,
        }
    }

    pub fn is_provisional(&self) -> bool {
        matches!(self, Self::Provisional(_))
    }
}

impl<T: fmt::Display> fmt::Display for MessageRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Provisional(id) => f.write_str(id),
            Self::Remote(id) => write!(f, "{id}"),
        }
    }
}

/// An unordered pair of distinct users, stored as (low, high).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawParticipantPair")]
pub struct ParticipantPair {
    low: UserId,
    high: UserId,
}

#[derive(Deserialize)]
struct RawParticipantPair {
    low: UserId,
    high: UserId,
}

impl TryFrom<RawParticipantPair> for ParticipantPair {
    type Error = String;

    fn try_from(raw: RawParticipantPair) -> Result<Self, Self::Error> {
        if raw.low < raw.high {
            Ok(Self {
                low: raw.low,
                high: raw.high,
            })
        } else {
            Err(format!(
                "participant pair must be ordered and distinct, got ({}, {})",
                raw.low, raw.high
            ))
        }
    }
}

impl ParticipantPair {
    pub fn new(a: UserId, b: UserId) -> Option<Self> {
        match a.cmp(&b) {
            std::cmp::Ordering::Less => Some(Self { low: a, high: b }),
            std::cmp::Ordering::Greater => Some(Self { low: b, high: a }),
            std::cmp::Ordering::Equal => None,
        }
    }

    pub fn low(&self) -> UserId {
        self.low
    }

    pub fn high(&self) -> UserId {
        self.high
    }

    pub fn contains(&self, user_id: UserId) -> bool {
        self.low == user_id || self.high == user_id
    }

    pub fn other(&self, user_id: UserId) -> Option<UserId> {
        if self.low == user_id {
            Some(self.high)
        } else if self.high == user_id {
            Some(self.low)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    Snap,
    Audio,
}

text_enum!(MessageKind, "message kind", {
    Text => "text",
    Image => "image",
    Snap => "snap",
    Audio => "audio",
});

/// Delivery progression of a message. Ordering follows the lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Sending,
    Sent,
    Delivered,
    Read,
}

text_enum!(MessageStatus, "message status", {
    Sending => "sending",
    Sent => "sent",
    Delivered => "delivered",
    Read => "read",
});

impl MessageStatus {
    /// Moves forward to `next`; never regresses. Returns whether it moved.
    pub fn advance(&mut self, next: MessageStatus) -> bool {
        if next > *self {
            *self = next;
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastMessage {
    pub content: String,
    pub kind: MessageKind,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: UserId,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

impl UserProfile {
    /// Stand-in used when the counterpart's profile cannot be fetched.
    pub fn placeholder(user_id: UserId) -> Self {
        Self {
            user_id,
            username: format!("User {}", user_id.0),
            display_name: None,
            avatar_url: None,
        }
    }

    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.username)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum TypingScope {
    Conversation(ConversationId),
    Group(GroupId),
}

impl TypingScope {
    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::Conversation(_) => "conversation",
            Self::Group(_) => "group",
        }
    }

    pub fn raw_id(&self) -> i64 {
        match self {
            Self::Conversation(id) => id.0,
            Self::Group(id) => id.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingStatus {
    pub scope: TypingScope,
    pub user_id: UserId,
    pub is_typing: bool,
    pub updated_at: DateTime<Utc>,
}

impl TypingStatus {
    /// A stored `true` only counts while the record is fresh.
    pub fn is_typing_at(&self, now: DateTime<Utc>) -> bool {
        self.is_typing && now - self.updated_at <= Duration::seconds(TYPING_FRESHNESS_SECS)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupRole {
    Member,
    Moderator,
    Admin,
}

text_enum!(GroupRole, "group role", {
    Member => "member",
    Moderator => "moderator",
    Admin => "admin",
});

impl GroupRole {
    pub fn is_elevated(&self) -> bool {
        matches!(self, Self::Moderator | Self::Admin)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Voice,
    Video,
}

text_enum!(CallKind, "call kind", {
    Voice => "voice",
    Video => "video",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Calling,
    Answered,
    Declined,
    Ended,
    Missed,
}

text_enum!(CallStatus, "call status", {
    Calling => "calling",
    Answered => "answered",
    Declined => "declined",
    Ended => "ended",
    Missed => "missed",
});

impl CallStatus {
    pub fn can_transition_to(self, next: CallStatus) -> bool {
        use CallStatus::*;
        matches!(
            (self, next),
            (Calling, Answered)
                | (Calling, Declined)
                | (Calling, Ended)
                | (Calling, Missed)
                | (Answered, Ended)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Declined | Self::Ended | Self::Missed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantStatus {
    Invited,
    Joined,
    Declined,
}

text_enum!(ParticipantStatus, "participant status", {
    Invited => "invited",
    Joined => "joined",
    Declined => "declined",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CallTarget {
    Direct { receiver_id: UserId },
    Group { group_id: GroupId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTargetError {
    Missing,
    Ambiguous,
    GroupFlagMismatch,
}

impl fmt::Display for CallTargetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing => f.write_str("a call needs either a receiver or a group"),
            Self::Ambiguous => f.write_str("a call cannot target both a receiver and a group"),
            Self::GroupFlagMismatch => f.write_str("is_group_call does not match the call target"),
        }
    }
}

impl std::error::Error for CallTargetError {}

impl CallTarget {
    pub fn from_parts(
        receiver_id: Option<UserId>,
        group_id: Option<GroupId>,
    ) -> Result<Self, CallTargetError> {
        match (receiver_id, group_id) {
            (Some(receiver_id), None) => Ok(Self::Direct { receiver_id }),
            (None, Some(group_id)) => Ok(Self::Group { group_id }),
            (Some(_), Some(_)) => Err(CallTargetError::Ambiguous),
            (None, None) => Err(CallTargetError::Missing),
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self, Self::Group { .. })
    }

    pub fn receiver_id(&self) -> Option<UserId> {
        match self {
            Self::Direct { receiver_id } => Some(*receiver_id),
            Self::Group { .. } => None,
        }
    }

    pub fn group_id(&self) -> Option<GroupId> {
        match self {
            Self::Group { group_id } => Some(*group_id),
            Self::Direct { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallParticipant {
    pub call_id: CallId,
    pub user_id: UserId,
    pub status: ParticipantStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSession {
    pub call_id: CallId,
    pub caller_id: UserId,
    pub target: CallTarget,
    pub call_type: CallKind,
    pub status: CallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<i64>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub participants: Vec<CallParticipant>,
}

impl CallSession {
    pub fn is_group_call(&self) -> bool {
        self.target.is_group()
    }

    /// Whether this call is ringing for `user_id` (receiver or invited member).
    pub fn is_incoming_for(&self, user_id: UserId) -> bool {
        if self.status != CallStatus::Calling || self.caller_id == user_id {
            return false;
        }
        match self.target {
            CallTarget::Direct { receiver_id } => receiver_id == user_id,
            CallTarget::Group { .. } => self
                .participants
                .iter()
                .any(|p| p.user_id == user_id && p.status == ParticipantStatus::Invited),
        }
    }

    pub fn involves(&self, user_id: UserId) -> bool {
        self.caller_id == user_id
            || self.target.receiver_id() == Some(user_id)
            || self.participants.iter().any(|p| p.user_id == user_id)
    }
}

/// Whole seconds between connect and hang-up, never negative.
pub fn call_duration_seconds(started_at: DateTime<Utc>, ended_at: DateTime<Utc>) -> i64 {
    (ended_at - started_at).num_seconds().max(0)
}

#[cfg(test)]
#[path = "tests/domain_tests.rs"]
mod tests;
