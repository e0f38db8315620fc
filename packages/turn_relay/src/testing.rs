//! In-memory collaborators for unit tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use anyhow::{Result, bail};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;

use crate::collaborators::{
    ByteStream, ChatMessage, ConversationSession, ConversationStore, ConversationTurn,
    GenerationBackend, GroupCandidate, GroupDirectory, ProfileFacts, ProfileStore, ProfileUpdate,
    Role, Specialization,
};
use crate::error::RelayError;

#[derive(Default)]
pub struct MemoryProfiles {
    facts: Mutex<HashMap<String, ProfileFacts>>,
    catalog: Vec<Specialization>,
    updates: Mutex<Vec<(String, ProfileUpdate)>>,
    failing: AtomicBool,
}

impl MemoryProfiles {
    pub fn with_specializations(names: &[&str]) -> Self {
        Self {
            catalog: names
                .iter()
                .enumerate()
                .map(|(i, n)| Specialization {
                    id: i as i64 + 1,
                    name: n.to_string(),
                })
                .collect(),
            ..Default::default()
        }
    }

    pub fn set_facts(&self, user_id: &str, facts: ProfileFacts) {
        self.facts.lock().unwrap().insert(user_id.to_string(), facts);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn updates(&self) -> Vec<(String, ProfileUpdate)> {
        self.updates.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProfileStore for MemoryProfiles {
    async fn get_facts(&self, user_id: &str) -> Result<ProfileFacts> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("profile store unavailable");
        }
        Ok(self
            .facts
            .lock()
            .unwrap()
            .get(user_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn apply_update(&self, user_id: &str, update: &ProfileUpdate) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("profile store unavailable");
        }
        let mut facts = self.facts.lock().unwrap();
        let entry = facts.entry(user_id.to_string()).or_default();
        if let Some(spec) = &update.specialization {
            entry.specialization = Some(spec.name.clone());
        }
        if let Some(loc) = &update.location {
            entry.city = Some(loc.city.clone());
            entry.region = loc.region.clone();
        }
        self.updates
            .lock()
            .unwrap()
            .push((user_id.to_string(), update.clone()));
        Ok(())
    }

    async fn find_specialization(&self, name: &str) -> Result<Option<Specialization>> {
        Ok(self
            .catalog
            .iter()
            .find(|s| s.name.eq_ignore_ascii_case(name.trim()))
            .cloned())
    }

    async fn list_specializations(&self) -> Result<Vec<String>> {
        Ok(self.catalog.iter().map(|s| s.name.clone()).collect())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GroupCall {
    Assign {
        user_id: String,
        group_id: String,
    },
    Create {
        name: String,
        location: Option<String>,
    },
    Conflict {
        requester_id: String,
        group_id: String,
        incumbent_id: String,
        specialization: String,
    },
}

#[derive(Default)]
pub struct MemoryGroups {
    pub candidates: Vec<GroupCandidate>,
    calls: Mutex<Vec<GroupCall>>,
    next_id: AtomicU64,
    failing: AtomicBool,
}

impl MemoryGroups {
    pub fn with_candidates(candidates: Vec<GroupCandidate>) -> Self {
        Self {
            candidates,
            ..Default::default()
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<GroupCall> {
        self.calls.lock().unwrap().clone()
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("group directory unavailable");
        }
        Ok(())
    }
}

#[async_trait]
impl GroupDirectory for MemoryGroups {
    async fn find_candidates(&self, location_hint: &str) -> Result<Vec<GroupCandidate>> {
        self.check()?;
        Ok(self
            .candidates
            .iter()
            .filter(|c| c.location.eq_ignore_ascii_case(location_hint))
            .cloned()
            .collect())
    }

    async fn assign(&self, user_id: &str, group_id: &str) -> Result<()> {
        self.check()?;
        self.calls.lock().unwrap().push(GroupCall::Assign {
            user_id: user_id.to_string(),
            group_id: group_id.to_string(),
        });
        Ok(())
    }

    async fn create(&self, name: &str, location_hint: Option<&str>) -> Result<String> {
        self.check()?;
        let id = format!("new-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.calls.lock().unwrap().push(GroupCall::Create {
            name: name.to_string(),
            location: location_hint.map(str::to_string),
        });
        Ok(id)
    }

    async fn open_conflict_case(
        &self,
        requester_id: &str,
        group_id: &str,
        incumbent_id: &str,
        proposed_specialization: &str,
    ) -> Result<String> {
        self.check()?;
        self.calls.lock().unwrap().push(GroupCall::Conflict {
            requester_id: requester_id.to_string(),
            group_id: group_id.to_string(),
            incumbent_id: incumbent_id.to_string(),
            specialization: proposed_specialization.to_string(),
        });
        Ok("case-1".to_string())
    }
}

#[derive(Default)]
pub struct MemoryConversations {
    sessions: Mutex<HashMap<String, (String, Vec<ConversationTurn>)>>,
    next_id: AtomicU64,
}

impl MemoryConversations {
    pub fn transcript(&self, session_id: &str) -> Vec<(Role, String)> {
        self.sessions
            .lock()
            .unwrap()
            .get(session_id)
            .map(|(_, turns)| turns.iter().map(|t| (t.role, t.content.clone())).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ConversationStore for MemoryConversations {
    async fn ensure_session(
        &self,
        user_id: &str,
        session_id: Option<&str>,
    ) -> Result<ConversationSession> {
        let mut sessions = self.sessions.lock().unwrap();
        let owned = session_id.filter(|id| {
            sessions
                .get(*id)
                .is_some_and(|(owner, _)| owner == user_id)
        });
        if let Some(id) = owned {
            return Ok(ConversationSession {
                id: id.to_string(),
                user_id: user_id.to_string(),
                last_updated: 0,
            });
        }
        let id = format!("s-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        sessions.insert(id.clone(), (user_id.to_string(), Vec::new()));
        Ok(ConversationSession {
            id,
            user_id: user_id.to_string(),
            last_updated: 0,
        })
    }

    async fn append_turn(&self, session_id: &str, role: Role, text: &str) -> Result<()> {
        let mut sessions = self.sessions.lock().unwrap();
        let Some((_, turns)) = sessions.get_mut(session_id) else {
            bail!("unknown session {}", session_id);
        };
        let created_at = turns.len() as i64;
        turns.push(ConversationTurn {
            role,
            content: text.to_string(),
            created_at,
        });
        Ok(())
    }

    async fn recent_history(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<ConversationTurn>> {
        let sessions = self.sessions.lock().unwrap();
        let turns = sessions
            .get(session_id)
            .map(|(_, t)| t.clone())
            .unwrap_or_default();
        let skip = turns.len().saturating_sub(limit);
        Ok(turns.into_iter().skip(skip).collect())
    }
}

/// Replays fixed chunks, then either ends or stays open forever.
pub struct ScriptedBackend {
    chunks: Vec<Result<Bytes, RelayError>>,
    hang: bool,
    requests: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedBackend {
    pub fn new<S: AsRef<str>>(chunks: &[S]) -> Self {
        Self {
            chunks: chunks
                .iter()
                .map(|c| Ok(Bytes::copy_from_slice(c.as_ref().as_bytes())))
                .collect(),
            hang: false,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Keep the stream open after the scripted chunks.
    pub fn hanging(mut self) -> Self {
        self.hang = true;
        self
    }

    /// Fail the read after the scripted chunks.
    pub fn then_fail(mut self, err: RelayError) -> Self {
        self.chunks.push(Err(err));
        self
    }

    pub fn requests(&self) -> Vec<Vec<ChatMessage>> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl GenerationBackend for ScriptedBackend {
    async fn open_stream(&self, messages: &[ChatMessage]) -> Result<ByteStream, RelayError> {
        self.requests.lock().unwrap().push(messages.to_vec());
        let chunks = futures::stream::iter(self.chunks.clone());
        if self.hang {
            Ok(chunks.chain(futures::stream::pending()).boxed())
        } else {
            Ok(chunks.boxed())
        }
    }
}

/// One SSE data frame carrying `content` as a chat-completion delta.
pub fn sse_delta(content: &str) -> String {
    let record = serde_json::json!({
        "choices": [{ "index": 0, "delta": { "content": content }, "finish_reason": null }]
    });
    format!("data: {}\n\n", record)
}

pub fn sse_finish() -> String {
    "data: {\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\ndata: [DONE]\n\n"
        .to_string()
}
