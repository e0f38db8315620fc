//! Streaming relay for guided onboarding conversations.
//!
//! A generation backend answers with a chunked event stream whose text may
//! carry invisible command markers such as `[PERFIL:city=Madrid]`. This crate
//! turns that stream into:
//!
//! - a live, marker-free text feed for the client, and
//! - typed commands dispatched once each to the profile and group stores.
//!
//! Pipeline, leaves first: [`framer`] → [`reassembler`] → [`scanner`] →
//! [`dispatcher`]. The [`orchestrator`] decides before each turn which marker
//! the generator should be nudged towards, and [`turn`] ties it all together.

pub mod collaborators;
pub mod dispatcher;
pub mod error;
pub mod framer;
pub mod marker;
pub mod orchestrator;
pub mod reassembler;
pub mod relay;
pub mod scanner;
pub mod turn;

#[cfg(test)]
mod testing;

pub use collaborators::{
    ByteStream, ChatMessage, ConversationSession, ConversationStore, ConversationTurn,
    GenerationBackend, GroupCandidate, GroupDirectory, Location, ProfileFacts, ProfileStore,
    ProfileUpdate, Role, SeatHolder, Specialization,
};
pub use error::{APOLOGY_MESSAGE, ClientError, RelayError};
pub use orchestrator::{Orchestrator, TurnPlan, TurnStage};
pub use relay::{RelayConfig, RelayEvent, RelayStats, StreamDecoder};
pub use turn::{TurnConfig, TurnDriver, TurnOutcome, TurnReport, TurnRequest};
