use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde::Serialize;
use tracing::error;
use turn_relay::TurnPlan;

use crate::AppState;

#[derive(Debug, Serialize)]
pub struct StageResponse {
    pub user_id: String,
    #[serde(flatten)]
    pub plan: TurnPlan,
}

/// Current onboarding stage, facts and directive for a user.
pub async fn get_stage_handler(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<StageResponse>, (StatusCode, String)> {
    let plan = state
        .driver
        .orchestrator()
        .plan(&user_id)
        .await
        .map_err(|e| {
            error!(user_id = %user_id, "Failed to plan stage: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to load profile".to_string(),
            )
        })?;

    Ok(Json(StageResponse { user_id, plan }))
}
