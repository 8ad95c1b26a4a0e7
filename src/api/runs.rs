use axum::extract::{Path, State};
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::api::server::AppState;

use super::handler_utils::{into_json, map_service_error, parse_run_path, ApiObject};
use crate::pipeline::checklist::Checklist;
use crate::pipeline::coordinator::Reaction;
use crate::pipeline::RunId;

#[derive(Debug, Clone, Deserialize)]
pub struct RunPath {
    #[serde(rename = "runType")]
    pub run_type: String,
    pub date: String,
}

#[derive(Debug, Clone, Serialize)]
struct ListRunsResponse {
    ok: bool,
    count: usize,
    runs: Vec<RunId>,
}

#[derive(Debug, Clone, Serialize)]
struct ChecklistResponse {
    ok: bool,
    checklist: Checklist,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct ReactionResponse {
    ok: bool,
    reaction: Reaction,
}

pub(crate) fn reaction_response(reaction: Reaction) -> ApiObject<Value> {
    (
        StatusCode::OK,
        into_json(ReactionResponse { ok: true, reaction }),
    )
}

pub async fn list_runs_handler(State(state): State<AppState>) -> ApiObject<Value> {
    match state.service.list_runs().await {
        Ok(runs) => (
            StatusCode::OK,
            into_json(ListRunsResponse {
                ok: true,
                count: runs.len(),
                runs,
            }),
        ),
        Err(error) => map_service_error(error),
    }
}

pub async fn get_run_handler(
    State(state): State<AppState>,
    Path(path): Path<RunPath>,
) -> ApiObject<Value> {
    let run_id = match parse_run_path(path.run_type.as_str(), path.date.as_str()) {
        Ok(run_id) => run_id,
        Err(response) => return response,
    };
    match state.service.checklist(run_id).await {
        Ok(checklist) => (
            StatusCode::OK,
            into_json(ChecklistResponse {
                ok: true,
                checklist,
            }),
        ),
        Err(error) => map_service_error(error),
    }
}

pub async fn start_run_handler(
    State(state): State<AppState>,
    Path(path): Path<RunPath>,
) -> ApiObject<Value> {
    let run_id = match parse_run_path(path.run_type.as_str(), path.date.as_str()) {
        Ok(run_id) => run_id,
        Err(response) => return response,
    };
    match state.service.start_run(run_id).await {
        Ok(reaction) => reaction_response(reaction),
        Err(error) => map_service_error(error),
    }
}
