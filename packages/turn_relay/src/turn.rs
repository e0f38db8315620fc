//! One conversational turn, end to end.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::collaborators::{
    ChatMessage, ConversationStore, GenerationBackend, GroupDirectory, ProfileStore, Role,
};
use crate::dispatcher::{DispatchContext, DispatchReport, MarkerDispatcher, spawn_dispatcher};
use crate::error::{APOLOGY_MESSAGE, ClientError, RelayError};
use crate::orchestrator::{Orchestrator, TurnPlan, TurnStage};
use crate::relay::{RelayConfig, RelayEvent, RelayStats, relay_stream};

#[derive(Clone, Debug)]
pub struct TurnConfig {
    pub system_prompt: String,
    /// Transcript turns sent back to the backend
    pub history_turns: usize,
    pub max_candidates: usize,
    pub relay: RelayConfig,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            system_prompt: String::new(),
            history_turns: 20,
            max_candidates: 5,
            relay: RelayConfig::default(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct TurnRequest {
    pub user_id: String,
    pub session_id: Option<String>,
    pub message: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnOutcome {
    Completed,
    Cancelled,
    Failed,
}

#[derive(Clone, Debug, Serialize)]
pub struct TurnReport {
    pub session_id: Option<String>,
    pub stage: Option<TurnStage>,
    pub clean_text: String,
    pub outcome: TurnOutcome,
    /// Stable code of the error that ended the turn
    pub error_code: Option<String>,
    pub relay: RelayStats,
    pub dispatch: DispatchReport,
}

impl TurnReport {
    fn new(session_id: Option<String>) -> Self {
        Self {
            session_id,
            stage: None,
            clean_text: String::new(),
            outcome: TurnOutcome::Completed,
            error_code: None,
            relay: RelayStats::default(),
            dispatch: DispatchReport::default(),
        }
    }
}

/// Runs turns against one set of collaborators. Cheap to share.
pub struct TurnDriver {
    profiles: Arc<dyn ProfileStore>,
    groups: Arc<dyn GroupDirectory>,
    conversations: Arc<dyn ConversationStore>,
    backend: Arc<dyn GenerationBackend>,
    orchestrator: Orchestrator,
    config: TurnConfig,
}

impl TurnDriver {
    pub fn new(
        profiles: Arc<dyn ProfileStore>,
        groups: Arc<dyn GroupDirectory>,
        conversations: Arc<dyn ConversationStore>,
        backend: Arc<dyn GenerationBackend>,
        config: TurnConfig,
    ) -> Self {
        let orchestrator =
            Orchestrator::new(profiles.clone(), groups.clone(), config.max_candidates);
        Self {
            profiles,
            groups,
            conversations,
            backend,
            orchestrator,
            config,
        }
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Run one turn, streaming [`RelayEvent`]s into `events`.
    ///
    /// `events` is dropped on return, which closes the client channel. The
    /// last event is `Done` on success and a single `Error` on failure; nothing
    /// follows a cancellation.
    pub async fn run(
        &self,
        request: TurnRequest,
        events: mpsc::Sender<RelayEvent>,
        cancel: CancellationToken,
    ) -> TurnReport {
        let user_id = request.user_id.as_str();

        let session = match self
            .conversations
            .ensure_session(user_id, request.session_id.as_deref())
            .await
        {
            Ok(session) => session,
            Err(e) => {
                let mut report = TurnReport::new(None);
                self.fail(&mut report, RelayError::store(e), &events).await;
                return report;
            }
        };
        let mut report = TurnReport::new(Some(session.id.clone()));
        let session_id = session.id.as_str();

        if events
            .send(RelayEvent::Session(session.id.clone()))
            .await
            .is_err()
        {
            report.outcome = TurnOutcome::Cancelled;
            return report;
        }

        let plan = match self.orchestrator.plan(user_id).await {
            Ok(plan) => plan,
            Err(e) => {
                self.fail(&mut report, e, &events).await;
                return report;
            }
        };
        report.stage = Some(plan.stage);

        let messages = match self.prepare_messages(session_id, &request.message, &plan).await {
            Ok(messages) => messages,
            Err(e) => {
                self.fail(&mut report, e, &events).await;
                return report;
            }
        };

        let upstream = match self.backend.open_stream(&messages).await {
            Ok(upstream) => upstream,
            Err(e) => {
                self.fail(&mut report, e, &events).await;
                return report;
            }
        };

        let dispatcher = MarkerDispatcher::new(
            DispatchContext {
                user_id: user_id.to_string(),
                fallback_location: plan.facts.city.clone(),
            },
            self.profiles.clone(),
            self.groups.clone(),
        );
        let (marker_tx, marker_rx) = mpsc::unbounded_channel();
        let dispatch = spawn_dispatcher(dispatcher, marker_rx, cancel.clone());

        let relayed = relay_stream(upstream, &events, &marker_tx, &cancel, &self.config.relay).await;
        drop(marker_tx);
        report.clean_text = relayed.clean_text;
        report.relay = relayed.stats;

        match relayed.result {
            Ok(()) => {
                self.record(session_id, Role::Assistant, &report.clean_text).await;
                report.dispatch = join_dispatcher(dispatch).await;
                let _ = events.send(RelayEvent::Done).await;
                info!(
                    user_id,
                    session_id,
                    stage = %plan.stage,
                    finish_reason = relayed.finish_reason.as_deref(),
                    markers = report.relay.markers_completed,
                    applied = report.dispatch.applied(),
                    "turn completed"
                );
            }
            Err(RelayError::Cancelled) => {
                // Also covers a closed client channel, which never fires the token
                cancel.cancel();
                report.outcome = TurnOutcome::Cancelled;
                report.error_code = Some(RelayError::Cancelled.error_code().to_string());
                if !report.clean_text.is_empty() {
                    self.record(session_id, Role::Assistant, &report.clean_text).await;
                }
                report.dispatch = join_dispatcher(dispatch).await;
                info!(
                    user_id,
                    session_id,
                    delivered_bytes = report.clean_text.len(),
                    dropped_markers = report.dispatch.dropped_on_cancel,
                    "turn cancelled"
                );
            }
            Err(e) => {
                report.dispatch = join_dispatcher(dispatch).await;
                self.fail(&mut report, e, &events).await;
            }
        }

        report
    }

    async fn prepare_messages(
        &self,
        session_id: &str,
        message: &str,
        plan: &TurnPlan,
    ) -> Result<Vec<ChatMessage>, RelayError> {
        self.conversations
            .append_turn(session_id, Role::User, message)
            .await
            .map_err(RelayError::store)?;
        let history = self
            .conversations
            .recent_history(session_id, self.config.history_turns)
            .await
            .map_err(RelayError::store)?;

        let mut messages = Vec::with_capacity(history.len() + 2);
        if !self.config.system_prompt.is_empty() {
            messages.push(ChatMessage::new(Role::System, &self.config.system_prompt));
        }
        if let Some(directive) = &plan.directive {
            messages.push(ChatMessage::new(Role::System, directive));
        }
        messages.extend(
            history
                .into_iter()
                .map(|turn| ChatMessage::new(turn.role, turn.content)),
        );
        Ok(messages)
    }

    /// Fatal path: one apology in the transcript, one error frame to the client.
    async fn fail(&self, report: &mut TurnReport, err: RelayError, events: &mpsc::Sender<RelayEvent>) {
        error!(
            session_id = report.session_id.as_deref(),
            code = err.error_code(),
            error = %err,
            "turn failed"
        );
        report.outcome = TurnOutcome::Failed;
        report.error_code = Some(err.error_code().to_string());
        if let Some(session_id) = report.session_id.clone() {
            self.record(&session_id, Role::Assistant, APOLOGY_MESSAGE).await;
        }
        let _ = events.send(RelayEvent::Error(ClientError::from(&err))).await;
    }

    async fn record(&self, session_id: &str, role: Role, text: &str) {
        if let Err(e) = self.conversations.append_turn(session_id, role, text).await {
            warn!(session_id, error = format!("{:#}", e), "failed to append to transcript");
        }
    }
}

async fn join_dispatcher(handle: tokio::task::JoinHandle<DispatchReport>) -> DispatchReport {
    handle.await.unwrap_or_else(|e| {
        error!(error = %e, "dispatcher task failed");
        DispatchReport::default()
    })
}
