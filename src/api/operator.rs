use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use serde_json::Value;

use crate::api::server::AppState;

use super::handler_utils::{map_service_error, parse_run_path, validation_error, ApiObject};
use super::runs::reaction_response;
use crate::pipeline::coordinator::OperatorAction;
use crate::worker::CompletionEvent;

#[derive(Debug, Clone, Deserialize)]
pub struct StageActionPath {
    #[serde(rename = "runType")]
    pub run_type: String,
    pub date: String,
    #[serde(rename = "stageKey")]
    pub stage_key: String,
    pub action: String,
}

pub async fn completion_handler(
    State(state): State<AppState>,
    payload: Result<Json<CompletionEvent>, JsonRejection>,
) -> ApiObject<Value> {
    let event = match payload {
        Ok(Json(event)) => event,
        Err(rejection) => {
            return validation_error(format!(
                "Invalid completion event: {}",
                rejection.body_text()
            ))
        }
    };
    if event.stage_key.trim().is_empty() {
        return validation_error("Field 'stage_key' must not be empty");
    }
    if event.attempt == 0 {
        return validation_error("Field 'attempt' must be >= 1");
    }
    match state.service.handle_completion(event).await {
        Ok(reaction) => reaction_response(reaction),
        Err(error) => map_service_error(error),
    }
}

pub async fn operator_action_handler(
    State(state): State<AppState>,
    Path(path): Path<StageActionPath>,
) -> ApiObject<Value> {
    let run_id = match parse_run_path(path.run_type.as_str(), path.date.as_str()) {
        Ok(run_id) => run_id,
        Err(response) => return response,
    };
    let Some(action) = OperatorAction::parse(path.action.as_str()) else {
        return validation_error("Operator action must be one of: abandon, retry, skip");
    };
    match state
        .service
        .apply_operator_action(run_id, path.stage_key, action)
        .await
    {
        Ok(reaction) => reaction_response(reaction),
        Err(error) => map_service_error(error),
    }
}
