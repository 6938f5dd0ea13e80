use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(MeetingId);
id_newtype!(MessageId);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Host,
    #[default]
    Member,
    Guest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantStatus {
    Online,
    Away,
    Offline,
    Blocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeetingStatus {
    Upcoming,
    Active,
    Past,
}

/// One entry of a meeting's `participants` array. The whole array is
/// replaced on every remote write, so this is a plain value type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: UserId,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lng: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ParticipantStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub joined_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeetingLocation {
    pub lat: f64,
    pub lng: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// A meeting document. `id` is the document id, carried outside the
/// body, which is why it is skipped by serde and patched in by
/// [`Meeting::from_document`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Meeting {
    #[serde(skip)]
    pub id: MeetingId,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub group_code: String,
    pub host_id: UserId,
    #[serde(default)]
    pub participant_ids: Vec<UserId>,
    #[serde(default)]
    pub participants: Vec<Participant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<MeetingStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meeting_location: Option<MeetingLocation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl Meeting {
    pub fn from_document(
        id: MeetingId,
        data: serde_json::Value,
    ) -> Result<Self, serde_json::Error> {
        let mut meeting: Meeting = serde_json::from_value(data)?;
        meeting.id = id;
        Ok(meeting)
    }

    /// Membership check across both the id index and the participant
    /// array, since older documents only carry one of the two.
    pub fn has_participant(&self, user_id: &UserId) -> bool {
        let wanted = crate::ids::normalize_id(user_id.as_str());
        self.participant_ids
            .iter()
            .any(|id| crate::ids::normalize_id(id.as_str()) == wanted)
            || self
                .participants
                .iter()
                .any(|p| crate::ids::normalize_id(p.id.as_str()) == wanted)
    }

    pub fn participant(&self, user_id: &UserId) -> Option<&Participant> {
        let wanted = crate::ids::normalize_id(user_id.as_str());
        self.participants
            .iter()
            .find(|p| crate::ids::normalize_id(p.id.as_str()) == wanted)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    User,
    System,
}

impl MessageKind {
    pub fn is_user(&self) -> bool {
        matches!(self, MessageKind::User)
    }
}

/// Local delivery state of a message. Never persisted: a message that
/// exists remotely is by definition `Sent`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum MessageStatus {
    Sending,
    #[default]
    Sent,
    Error {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(skip)]
    pub id: MessageId,
    pub sender_id: UserId,
    #[serde(default)]
    pub sender_name: Option<String>,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_msg_id: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "MessageKind::is_user")]
    pub kind: MessageKind,
    #[serde(skip)]
    pub status: MessageStatus,
}

impl Message {
    pub fn from_document(
        id: MessageId,
        data: serde_json::Value,
    ) -> Result<Self, serde_json::Error> {
        let mut message: Message = serde_json::from_value(data)?;
        message.id = id;
        Ok(message)
    }

    /// Sort key for transcript ordering; timestamp-less messages
    /// (server timestamp still pending) sort first.
    pub fn sort_key(&self) -> DateTime<Utc> {
        self.timestamp.unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

/// A participant as shown in the roster: self excluded, block state
/// applied. Derived, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Friend {
    pub id: UserId,
    pub nickname: String,
    pub avatar: String,
    pub role: Role,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub address: Option<String>,
    pub status: ParticipantStatus,
    pub is_blocked: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub nickname: String,
    #[serde(default)]
    pub avatar: Option<String>,
}

impl UserProfile {
    pub fn new(nickname: impl Into<String>) -> Self {
        Self {
            nickname: nickname.into(),
            avatar: None,
        }
    }

    pub fn avatar_or_initial(&self) -> String {
        match &self.avatar {
            Some(avatar) if !avatar.is_empty() => avatar.clone(),
            _ => self
                .nickname
                .chars()
                .next()
                .map(|c| c.to_uppercase().to_string())
                .unwrap_or_else(|| "?".to_string()),
        }
    }
}

/// Body of a `users/{id}` profile document. Block entries are kept as
/// raw JSON values because historical writes stored ids with
/// inconsistent casing and typing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    #[serde(default)]
    pub blocked_users: Vec<serde_json::Value>,
}

/// Body of a per-(meeting, user) read-status document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadStatus {
    #[serde(default)]
    pub last_read_message_id: Option<MessageId>,
}
