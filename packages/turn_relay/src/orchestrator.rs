//! Turn orchestration.
//!
//! The onboarding stage is never stored. It is derived from a fresh
//! [`ProfileFacts`] snapshot at the start of every turn, so edits made outside
//! the conversation show up on the very next turn.

use std::fmt::Write as _;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::collaborators::{GroupCandidate, GroupDirectory, ProfileFacts, ProfileStore};
use crate::error::RelayError;
use crate::marker::MarkerKind;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TurnStage {
    NeedsSpecialization,
    NeedsLocation,
    NeedsGroup,
    /// Onboarding complete; free conversation
    Ready,
}

impl TurnStage {
    pub fn from_facts(facts: &ProfileFacts) -> Self {
        if !facts.has_specialization() {
            TurnStage::NeedsSpecialization
        } else if !facts.has_city() {
            TurnStage::NeedsLocation
        } else if !facts.has_group() {
            TurnStage::NeedsGroup
        } else {
            TurnStage::Ready
        }
    }

    /// The marker the generator is nudged towards in this stage.
    pub fn expected_marker(self) -> Option<MarkerKind> {
        match self {
            TurnStage::NeedsSpecialization | TurnStage::NeedsLocation => {
                Some(MarkerKind::ProfileFieldUpdate)
            }
            TurnStage::NeedsGroup => Some(MarkerKind::GroupAssign),
            TurnStage::Ready => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TurnStage::NeedsSpecialization => "NEEDS_SPECIALIZATION",
            TurnStage::NeedsLocation => "NEEDS_LOCATION",
            TurnStage::NeedsGroup => "NEEDS_GROUP",
            TurnStage::Ready => "READY",
        }
    }
}

impl std::fmt::Display for TurnStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

const ESCAPE_REMINDER: &str = "Si un valor contiene `,` `]` `=` o `\\`, escríbelo precedido de `\\` \
     (por ejemplo `name=Norte\\, Centro`). Los marcadores son invisibles para el usuario: \
     no los menciones ni los expliques.";

/// Build the directive for `stage`. `None` once onboarding is complete.
pub fn build_directive(
    stage: TurnStage,
    facts: &ProfileFacts,
    specializations: &[String],
    candidates: &[GroupCandidate],
) -> Option<String> {
    let mut out = String::new();
    match stage {
        TurnStage::Ready => return None,

        TurnStage::NeedsSpecialization => {
            out.push_str(
                "Averigua a qué se dedica el usuario. Cuando lo describa con sus propias \
                 palabras, asígnale la especialidad más cercana de esta lista cerrada:\n",
            );
            for name in specializations {
                let _ = writeln!(out, "- {}", name);
            }
            let _ = writeln!(
                out,
                "Cuando la tengas clara, emite exactamente `{}profession_specialization=<especialidad>]` \
                 usando el nombre tal y como aparece en la lista.",
                MarkerKind::ProfileFieldUpdate.opener()
            );
        }

        TurnStage::NeedsLocation => {
            let _ = writeln!(
                out,
                "Pregunta en qué ciudad ejerce el usuario. Cuando lo sepas, emite \
                 `{}city=<ciudad>,region=<región>]`; incluye la región solo si es evidente.",
                MarkerKind::ProfileFieldUpdate.opener()
            );
        }

        TurnStage::NeedsGroup => {
            let specialization = facts.specialization.as_deref().unwrap_or_default();
            if candidates.is_empty() {
                out.push_str("No hay grupos disponibles en su zona.\n");
            } else {
                out.push_str("Grupos disponibles, por orden de preferencia:\n");
                for c in candidates {
                    let _ = write!(out, "- id={} «{}» ({})", c.id, c.name, c.location);
                    if let Some(holder) = c.incumbent_for(specialization) {
                        let _ = write!(
                            out,
                            ". La plaza de {} ya está ocupada por el miembro {}",
                            specialization, holder.user_id
                        );
                    }
                    out.push('\n');
                }
            }
            let _ = writeln!(
                out,
                "Ayuda al usuario a elegir. Para unirse a un grupo emite `{}id=<id>]`. \
                 Si ninguno le encaja, propón crear uno y emite `{}name=<nombre>,location=<ciudad>]`.",
                MarkerKind::GroupAssign.opener(),
                MarkerKind::GroupCreate.opener()
            );
            if candidates
                .iter()
                .any(|c| c.incumbent_for(specialization).is_some())
            {
                let _ = writeln!(
                    out,
                    "Si elige un grupo cuya plaza ya está ocupada, no lo asignes: emite \
                     `{}group=<id>,incumbent=<miembro>,specialization=<especialidad>]` \
                     para abrir un caso de conflicto.",
                    MarkerKind::ConflictCaseOpen.opener()
                );
            }
        }
    }

    let _ = writeln!(
        out,
        "Puedes emitir `{}` para mostrar respuestas sugeridas.",
        MarkerKind::UiHintToken.opener()
    );
    out.push_str(ESCAPE_REMINDER);
    Some(out)
}

/// Everything decided before the upstream request is sent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TurnPlan {
    pub facts: ProfileFacts,
    pub stage: TurnStage,
    pub directive: Option<String>,
}

pub struct Orchestrator {
    profiles: Arc<dyn ProfileStore>,
    groups: Arc<dyn GroupDirectory>,
    max_candidates: usize,
}

impl Orchestrator {
    pub fn new(
        profiles: Arc<dyn ProfileStore>,
        groups: Arc<dyn GroupDirectory>,
        max_candidates: usize,
    ) -> Self {
        Self {
            profiles,
            groups,
            max_candidates,
        }
    }

    /// Snapshot the user's facts and decide the directive for this turn.
    ///
    /// Only the facts fetch is fatal. Vocabulary and candidate lookups degrade to
    /// an empty list.
    pub async fn plan(&self, user_id: &str) -> Result<TurnPlan, RelayError> {
        let facts = self
            .profiles
            .get_facts(user_id)
            .await
            .map_err(RelayError::store)?;
        let stage = TurnStage::from_facts(&facts);

        let mut specializations = Vec::new();
        let mut candidates = Vec::new();
        match stage {
            TurnStage::NeedsSpecialization => {
                specializations = self.profiles.list_specializations().await.unwrap_or_else(|e| {
                    warn!(error = format!("{:#}", e), "could not list specializations");
                    Vec::new()
                });
            }
            TurnStage::NeedsGroup => {
                let hint = facts.city.as_deref().unwrap_or_default();
                candidates = self.groups.find_candidates(hint).await.unwrap_or_else(|e| {
                    warn!(error = format!("{:#}", e), location = hint, "candidate lookup failed");
                    Vec::new()
                });
                candidates.truncate(self.max_candidates);
            }
            TurnStage::NeedsLocation | TurnStage::Ready => {}
        }

        let directive = build_directive(stage, &facts, &specializations, &candidates);
        debug!(user_id, stage = %stage, candidates = candidates.len(), "turn planned");

        Ok(TurnPlan {
            facts,
            stage,
            directive,
        })
    }
}
