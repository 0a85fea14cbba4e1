use crate::error::EngineResult;
use crate::ipc::error::{engine_err, no_workspace, ok};
use crate::ipc::helpers::{parse_params, req_i64};
use crate::ipc::types::{AppState, Request};
use crate::store::{ApplyRequest, NewTemplate, ScoreStore, SqliteStore, TemplateFilter, TemplatePatch};
use serde_json::json;

fn handle_templates_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return no_workspace(&req.id);
    };
    let run = || -> EngineResult<serde_json::Value> {
        let new: NewTemplate = parse_params(&req.params)?;
        let template = SqliteStore::new(conn).create_template(&new)?;
        Ok(json!({ "template": template }))
    };
    match run() {
        Ok(v) => ok(&req.id, v),
        Err(e) => engine_err(&req.id, &e),
    }
}

// A gradeLevel in the params is ignored: TemplatePatch has no such field.
fn handle_templates_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return no_workspace(&req.id);
    };
    let run = || -> EngineResult<serde_json::Value> {
        let id = req_i64(&req.params, "id")?;
        let patch: TemplatePatch = parse_params(&req.params)?;
        let template = SqliteStore::new(conn).update_template(id, &patch)?;
        Ok(json!({ "template": template }))
    };
    match run() {
        Ok(v) => ok(&req.id, v),
        Err(e) => engine_err(&req.id, &e),
    }
}

fn handle_templates_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "templates": [] }));
    };
    let run = || -> EngineResult<serde_json::Value> {
        let filter: TemplateFilter = if req.params.is_null() {
            TemplateFilter::default()
        } else {
            parse_params(&req.params)?
        };
        let templates = SqliteStore::new(conn).list_templates(&filter)?;
        Ok(json!({ "templates": templates }))
    };
    match run() {
        Ok(v) => ok(&req.id, v),
        Err(e) => engine_err(&req.id, &e),
    }
}

fn handle_templates_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return no_workspace(&req.id);
    };
    let run = || -> EngineResult<serde_json::Value> {
        let id = req_i64(&req.params, "id")?;
        SqliteStore::new(conn).delete_template(id)?;
        Ok(json!({ "ok": true }))
    };
    match run() {
        Ok(v) => ok(&req.id, v),
        Err(e) => engine_err(&req.id, &e),
    }
}

fn handle_templates_apply(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return no_workspace(&req.id);
    };
    let run = || -> EngineResult<serde_json::Value> {
        let apply: ApplyRequest = parse_params(&req.params)?;
        let outcome = SqliteStore::new(conn).apply_template(&apply)?;
        Ok(json!(outcome))
    };
    match run() {
        Ok(v) => ok(&req.id, v),
        Err(e) => engine_err(&req.id, &e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "templates.create" => Some(handle_templates_create(state, req)),
        "templates.update" => Some(handle_templates_update(state, req)),
        "templates.list" => Some(handle_templates_list(state, req)),
        "templates.delete" => Some(handle_templates_delete(state, req)),
        "templates.apply" => Some(handle_templates_apply(state, req)),
        _ => None,
    }
}
