//! Marker dispatcher.
//!
//! Turns completed markers into collaborator calls, one call (or one
//! create+assign pair) per marker. Markers arrive over a per-turn channel and are
//! handled sequentially in detection order by a task that runs independently of
//! the text path. Failures are logged and never retried within the turn; the
//! next turn's facts snapshot shows what actually landed.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::collaborators::{GroupDirectory, Location, ProfileStore, ProfileUpdate};
use crate::marker::{Command, MarkerKind, RawMarker};

const KEY_SPECIALIZATION: &str = "profession_specialization";
const KEY_CITY: &str = "city";
const KEY_REGION: &str = "region";

/// Who the markers of this turn act on.
#[derive(Clone, Debug)]
pub struct DispatchContext {
    pub user_id: String,
    /// Used when `GroupCreate` carries no location
    pub fallback_location: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// Collaborator call succeeded
    Applied,
    /// Nothing to call (hint token, or no valid field left)
    NoCall,
    /// Grammar error or turn-level exclusivity; no side effect
    Rejected(String),
    /// Collaborator call failed
    Failed(String),
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct DispatchReport {
    /// Every marker seen, in dispatch order
    pub outcomes: Vec<(MarkerKind, DispatchOutcome)>,
    /// Markers still queued when the turn was cancelled
    pub dropped_on_cancel: u64,
}

impl DispatchReport {
    pub fn count(&self, pred: impl Fn(&DispatchOutcome) -> bool) -> u64 {
        self.outcomes.iter().filter(|(_, o)| pred(o)).count() as u64
    }

    pub fn applied(&self) -> u64 {
        self.count(|o| matches!(o, DispatchOutcome::Applied))
    }

    pub fn failed(&self) -> u64 {
        self.count(|o| matches!(o, DispatchOutcome::Failed(_)))
    }

    pub fn rejected(&self) -> u64 {
        self.count(|o| matches!(o, DispatchOutcome::Rejected(_)))
    }
}

/// Group placement and conflict cases exclude each other within one turn.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum GroupIntent {
    Placement,
    Conflict,
}

pub struct MarkerDispatcher {
    ctx: DispatchContext,
    profiles: Arc<dyn ProfileStore>,
    groups: Arc<dyn GroupDirectory>,
    intent: Option<GroupIntent>,
    report: DispatchReport,
}

impl MarkerDispatcher {
    pub fn new(
        ctx: DispatchContext,
        profiles: Arc<dyn ProfileStore>,
        groups: Arc<dyn GroupDirectory>,
    ) -> Self {
        Self {
            ctx,
            profiles,
            groups,
            intent: None,
            report: DispatchReport::default(),
        }
    }

    /// Dispatch one completed marker.
    pub async fn dispatch(&mut self, marker: &RawMarker) -> DispatchOutcome {
        let outcome = match Command::from_marker(marker) {
            Ok(command) => self.execute(command).await,
            Err(e) => {
                warn!(
                    marker = marker.kind.name(),
                    code = e.error_code(),
                    error = %e,
                    "dropping marker with unparseable arguments"
                );
                DispatchOutcome::Rejected(e.to_string())
            }
        };
        self.report.outcomes.push((marker.kind, outcome.clone()));
        outcome
    }

    pub fn into_report(self) -> DispatchReport {
        self.report
    }

    async fn execute(&mut self, command: Command) -> DispatchOutcome {
        let user_id = self.ctx.user_id.clone();
        match command {
            Command::UiHint => DispatchOutcome::NoCall,

            Command::ProfileUpdate(pairs) => {
                let update = self.validate_profile_update(&pairs).await;
                if update.is_empty() {
                    debug!(user_id = %user_id, "profile marker carried no valid field");
                    return DispatchOutcome::NoCall;
                }
                match self.profiles.apply_update(&user_id, &update).await {
                    Ok(()) => {
                        info!(
                            user_id = %user_id,
                            specialization = update.specialization.as_ref().map(|s| s.name.as_str()),
                            city = update.location.as_ref().map(|l| l.city.as_str()),
                            "profile updated"
                        );
                        DispatchOutcome::Applied
                    }
                    Err(e) => failed("apply_update", e),
                }
            }

            Command::GroupAssign { group_id } => {
                if let Some(rejected) = self.claim(GroupIntent::Placement) {
                    return rejected;
                }
                match self.groups.assign(&user_id, &group_id).await {
                    Ok(()) => {
                        info!(user_id = %user_id, group_id = %group_id, "user assigned to group");
                        DispatchOutcome::Applied
                    }
                    Err(e) => failed("assign", e),
                }
            }

            Command::GroupCreate { name, location } => {
                if let Some(rejected) = self.claim(GroupIntent::Placement) {
                    return rejected;
                }
                let location = location.or_else(|| self.ctx.fallback_location.clone());
                let group_id = match self.groups.create(&name, location.as_deref()).await {
                    Ok(id) => id,
                    Err(e) => return failed("create", e),
                };
                match self.groups.assign(&user_id, &group_id).await {
                    Ok(()) => {
                        info!(user_id = %user_id, group_id = %group_id, name = %name, "group created and assigned");
                        DispatchOutcome::Applied
                    }
                    Err(e) => failed("assign", e),
                }
            }

            Command::ConflictCaseOpen {
                group_id,
                incumbent_id,
                specialization,
            } => {
                if let Some(rejected) = self.claim(GroupIntent::Conflict) {
                    return rejected;
                }
                match self
                    .groups
                    .open_conflict_case(&user_id, &group_id, &incumbent_id, &specialization)
                    .await
                {
                    Ok(case_id) => {
                        info!(
                            user_id = %user_id,
                            group_id = %group_id,
                            case_id = %case_id,
                            "conflict case opened"
                        );
                        DispatchOutcome::Applied
                    }
                    Err(e) => failed("open_conflict_case", e),
                }
            }
        }
    }

    /// The first group-family marker of the turn fixes its intent.
    fn claim(&mut self, wanted: GroupIntent) -> Option<DispatchOutcome> {
        match self.intent {
            None => {
                self.intent = Some(wanted);
                None
            }
            Some(current) if current == wanted => None,
            Some(current) => {
                warn!(
                    user_id = %self.ctx.user_id,
                    current = ?current,
                    wanted = ?wanted,
                    "group placement and conflict case are exclusive within a turn"
                );
                Some(DispatchOutcome::Rejected(format!(
                    "turn already committed to {:?}",
                    current
                )))
            }
        }
    }

    /// Apply the allow-list key by key. Unknown or unresolvable keys are dropped
    /// individually.
    async fn validate_profile_update(&self, pairs: &[(String, String)]) -> ProfileUpdate {
        let mut specialization = None;
        let mut city = None;
        let mut region = None;

        for (key, value) in pairs {
            match key.as_str() {
                KEY_SPECIALIZATION => specialization = Some(value.as_str()),
                KEY_CITY => city = Some(value.as_str()),
                KEY_REGION => region = Some(value.as_str()),
                other => warn!(key = other, "dropping profile key outside the allow-list"),
            }
        }

        let mut update = ProfileUpdate::default();

        if let Some(name) = specialization.filter(|n| !n.is_empty()) {
            match self.profiles.find_specialization(name).await {
                Ok(Some(found)) => update.specialization = Some(found),
                Ok(None) => warn!(name, "specialization not in the controlled vocabulary"),
                Err(e) => warn!(name, error = format!("{:#}", e), "specialization lookup failed"),
            }
        }

        match city.filter(|c| !c.is_empty()) {
            Some(city) => {
                update.location = Some(Location {
                    city: city.to_string(),
                    region: region.filter(|r| !r.is_empty()).map(str::to_string),
                })
            }
            None if region.is_some() => warn!("dropping region without a city"),
            None => {}
        }

        update
    }
}

fn failed(call: &str, err: anyhow::Error) -> DispatchOutcome {
    warn!(call, error = format!("{:#}", err), "collaborator call failed, not retrying");
    DispatchOutcome::Failed(format!("{}: {:#}", call, err))
}

/// Run the dispatcher over a marker queue until the queue closes or the turn is
/// cancelled. On cancellation, queued markers are dropped undispatched.
pub fn spawn_dispatcher(
    mut dispatcher: MarkerDispatcher,
    mut markers: mpsc::UnboundedReceiver<RawMarker>,
    cancel: CancellationToken,
) -> JoinHandle<DispatchReport> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    markers.close();
                    let mut dropped = 0;
                    while markers.try_recv().is_ok() {
                        dropped += 1;
                    }
                    if dropped > 0 {
                        warn!(dropped, "turn cancelled, dropping undispatched markers");
                    }
                    dispatcher.report.dropped_on_cancel = dropped;
                    break;
                }
                marker = markers.recv() => match marker {
                    Some(marker) => {
                        dispatcher.dispatch(&marker).await;
                    }
                    None => break,
                },
            }
        }
        dispatcher.into_report()
    })
}
