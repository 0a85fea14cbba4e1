use crate::error::{EngineError, EngineResult};
use crate::ipc::error::{engine_err, no_workspace, ok};
use crate::ipc::helpers::parse_params;
use crate::ipc::types::{AppState, Request};
use crate::store::{ScoreQuery, ScoreStore, ScoreUpdate, SqliteStore};
use serde_json::json;

const SCORES_BULK_UPDATE_MAX: usize = 5000;

fn handle_scores_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return no_workspace(&req.id);
    };
    let run = || -> EngineResult<serde_json::Value> {
        let query: ScoreQuery = parse_params(&req.params)?;
        let scores = SqliteStore::new(conn).get_scores(&query)?;
        Ok(json!({ "scores": scores }))
    };
    match run() {
        Ok(v) => ok(&req.id, v),
        Err(e) => engine_err(&req.id, &e),
    }
}

fn handle_scores_bulk_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return no_workspace(&req.id);
    };
    let run = || -> EngineResult<serde_json::Value> {
        let Some(raw) = req.params.get("updates") else {
            return Err(EngineError::BadParams("missing updates[]".to_string()));
        };
        let updates: Vec<ScoreUpdate> = parse_params(raw)?;
        if updates.len() > SCORES_BULK_UPDATE_MAX {
            return Err(EngineError::BadParams(format!(
                "bulk payload exceeds max updates: {} > {}",
                updates.len(),
                SCORES_BULK_UPDATE_MAX
            )));
        }
        let outcome = SqliteStore::new(conn).bulk_update_scores(&updates)?;
        Ok(json!(outcome))
    };
    match run() {
        Ok(v) => ok(&req.id, v),
        Err(e) => engine_err(&req.id, &e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "scores.get" => Some(handle_scores_get(state, req)),
        "scores.bulkUpdate" => Some(handle_scores_bulk_update(state, req)),
        _ => None,
    }
}
