//! Interfaces of the external collaborators.
//!
//! The relay never owns business records. It reads a [`ProfileFacts`] snapshot,
//! and every mutation goes through one of these traits.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::RelayError;

/// Read-only profile snapshot, fetched fresh for every turn.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileFacts {
    pub specialization: Option<String>,
    pub city: Option<String>,
    pub region: Option<String>,
    pub group_id: Option<String>,
}

impl ProfileFacts {
    pub fn has_specialization(&self) -> bool {
        is_set(&self.specialization)
    }

    pub fn has_city(&self) -> bool {
        is_set(&self.city)
    }

    pub fn has_group(&self) -> bool {
        is_set(&self.group_id)
    }
}

fn is_set(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.trim().is_empty())
}

/// Entry of the controlled specialization vocabulary.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Specialization {
    pub id: i64,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub city: String,
    pub region: Option<String>,
}

/// Allow-listed profile fields. Only set fields are written.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileUpdate {
    pub specialization: Option<Specialization>,
    pub location: Option<Location>,
}

impl ProfileUpdate {
    pub fn is_empty(&self) -> bool {
        self.specialization.is_none() && self.location.is_none()
    }
}

/// A member holding a specialization seat in a group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeatHolder {
    pub user_id: String,
    pub specialization: String,
}

/// A ranked group candidate. Ranking itself belongs to the directory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupCandidate {
    pub id: String,
    pub name: String,
    pub location: String,
    pub seats: Vec<SeatHolder>,
}

impl GroupCandidate {
    /// The member already holding `specialization` here, if any.
    pub fn incumbent_for(&self, specialization: &str) -> Option<&SeatHolder> {
        self.seats
            .iter()
            .find(|s| s.specialization.eq_ignore_ascii_case(specialization))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "system" => Some(Role::System),
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSession {
    pub id: String,
    pub user_id: String,
    pub last_updated: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
    pub created_at: i64,
}

/// One message of the outbound generation request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn get_facts(&self, user_id: &str) -> Result<ProfileFacts>;

    async fn apply_update(&self, user_id: &str, update: &ProfileUpdate) -> Result<()>;

    /// Case-insensitive lookup in the controlled vocabulary.
    async fn find_specialization(&self, name: &str) -> Result<Option<Specialization>>;

    async fn list_specializations(&self) -> Result<Vec<String>>;
}

#[async_trait]
pub trait GroupDirectory: Send + Sync {
    async fn find_candidates(&self, location_hint: &str) -> Result<Vec<GroupCandidate>>;

    async fn assign(&self, user_id: &str, group_id: &str) -> Result<()>;

    /// Returns the new group's id.
    async fn create(&self, name: &str, location_hint: Option<&str>) -> Result<String>;

    /// Returns the case id. Does not assign the group.
    async fn open_conflict_case(
        &self,
        requester_id: &str,
        group_id: &str,
        incumbent_id: &str,
        proposed_specialization: &str,
    ) -> Result<String>;
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Resume `session_id` (or the user's latest session), creating one if absent.
    async fn ensure_session(
        &self,
        user_id: &str,
        session_id: Option<&str>,
    ) -> Result<ConversationSession>;

    async fn append_turn(&self, session_id: &str, role: Role, text: &str) -> Result<()>;

    /// The last `limit` turns, oldest first.
    async fn recent_history(&self, session_id: &str, limit: usize)
    -> Result<Vec<ConversationTurn>>;
}

/// Raw upstream bytes, chunked however the transport delivers them.
pub type ByteStream = BoxStream<'static, Result<Bytes, RelayError>>;

#[async_trait]
pub trait GenerationBackend: Send + Sync {
    async fn open_stream(&self, messages: &[ChatMessage]) -> Result<ByteStream, RelayError>;
}
