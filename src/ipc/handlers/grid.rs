use crate::columns::Column;
use crate::error::{EngineError, EngineResult};
use crate::grid::{GridContext, GridSession, SaveScope};
use crate::ipc::error::{engine_err, no_workspace, ok};
use crate::ipc::helpers::{opt_i64, req_i64, req_month, req_year};
use crate::ipc::types::{AppState, Request};
use crate::store::{Roster, SqliteStore, SubSubjectCache};
use crate::template::StructureKey;
use serde_json::json;
use std::collections::HashMap;
use tracing::info;

fn session_mut<'a>(
    grid: &'a mut Option<GridSession>,
    params: &serde_json::Value,
) -> EngineResult<&'a mut GridSession> {
    let session_id = params
        .get("sessionId")
        .and_then(|v| v.as_str())
        .ok_or_else(|| EngineError::BadParams("missing sessionId".to_string()))?;
    match grid.as_mut() {
        Some(g) if g.id.to_string() == session_id => Ok(g),
        _ => Err(EngineError::not_found("grid session", session_id)),
    }
}

/// "Subject" or "Subject / Sub-subject" per column.
fn column_labels(
    store: &SqliteStore<'_>,
    cache: &mut SubSubjectCache,
    columns: &[Column],
) -> EngineResult<Vec<String>> {
    let subjects: HashMap<i64, String> = store
        .subjects()?
        .into_iter()
        .map(|s| (s.id, s.name))
        .collect();
    let mut labels = Vec::with_capacity(columns.len());
    for c in columns {
        let subject = subjects
            .get(&c.subject_id)
            .cloned()
            .unwrap_or_else(|| format!("#{}", c.subject_id));
        let label = match c.sub_subject_id {
            None => subject,
            Some(sub_id) => {
                let sub = cache
                    .sub_subjects_of(store, c.subject_id)?
                    .iter()
                    .find(|s| s.id == sub_id)
                    .map(|s| s.name.clone())
                    .unwrap_or_else(|| format!("#{}", sub_id));
                format!("{} / {}", subject, sub)
            }
        };
        labels.push(label);
    }
    Ok(labels)
}

fn render(
    store: &SqliteStore<'_>,
    cache: &mut SubSubjectCache,
    grid: &GridSession,
) -> EngineResult<serde_json::Value> {
    let view = grid.view();
    let labels = column_labels(store, cache, &view.columns)?;
    let mut v = json!(view);
    v["columnLabels"] = json!(labels);
    Ok(v)
}

fn handle_grid_open(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return no_workspace(&req.id);
    };
    let store = SqliteStore::new(conn);
    let run = |grid: &mut Option<GridSession>, cache: &mut SubSubjectCache| -> EngineResult<serde_json::Value> {
        let ctx = GridContext {
            teacher_id: req_i64(&req.params, "teacherId")?,
            class_id: req_i64(&req.params, "classId")?,
            month: req_month(&req.params)?,
            year: req_year(&req.params)?,
            template_id: opt_i64(&req.params, "templateId")?,
        };
        let session = GridSession::open(&store, ctx)?;
        info!(
            session_id = %session.id,
            class_id = ctx.class_id,
            status = ?session.status(),
            template_id = session.template().map(|t| t.id),
            columns = session.columns().len(),
            "grid opened"
        );
        let v = render(&store, cache, &session)?;
        *grid = Some(session);
        Ok(v)
    };
    match run(&mut state.grid, &mut state.sub_subjects) {
        Ok(v) => ok(&req.id, v),
        Err(e) => engine_err(&req.id, &e),
    }
}

fn handle_grid_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return no_workspace(&req.id);
    };
    let store = SqliteStore::new(conn);
    let res = session_mut(&mut state.grid, &req.params)
        .and_then(|g| render(&store, &mut state.sub_subjects, g));
    match res {
        Ok(v) => ok(&req.id, v),
        Err(e) => engine_err(&req.id, &e),
    }
}

fn handle_grid_set_cell(state: &mut AppState, req: &Request) -> serde_json::Value {
    let mut run = || -> EngineResult<serde_json::Value> {
        let grid = session_mut(&mut state.grid, &req.params)?;
        let student_id = req_i64(&req.params, "studentId")?;
        let column = StructureKey::new(
            req_i64(&req.params, "subjectId")?,
            opt_i64(&req.params, "subSubjectId")?,
        );
        // Numbers are accepted too, but text is the native form ("" clears).
        let value = match req.params.get("value") {
            None | Some(serde_json::Value::Null) => String::new(),
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(serde_json::Value::Number(n)) => n.to_string(),
            Some(other) => {
                return Err(EngineError::BadParams(format!("invalid value {}", other)));
            }
        };
        grid.set_input(student_id, column, &value)?;
        let cell = grid
            .cell(student_id, column)
            .ok_or_else(|| EngineError::not_found("grid cell", column))?;
        Ok(json!({ "key": cell.key, "input": cell.input, "dirty": cell.dirty }))
    };
    match run() {
        Ok(v) => ok(&req.id, v),
        Err(e) => engine_err(&req.id, &e),
    }
}

/// Saves, then reloads the session so freshly materialized rows are bound
/// by real id. A failed save keeps the session and its inputs as they were.
fn handle_grid_save(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return no_workspace(&req.id);
    };
    let store = SqliteStore::new(conn);
    let grid = match session_mut(&mut state.grid, &req.params) {
        Ok(g) => g,
        Err(e) => return engine_err(&req.id, &e),
    };
    let scope = match opt_i64(&req.params, "studentId") {
        Ok(Some(student_id)) => SaveScope::Student(student_id),
        Ok(None) => SaveScope::All,
        Err(e) => return engine_err(&req.id, &e),
    };

    let outcome = match grid.save(&store, scope) {
        Ok(o) => o,
        Err(e) => return engine_err(&req.id, &e),
    };
    let mut result = json!(outcome);
    result["summary"] = json!(outcome.summary());

    if grid.is_stale() {
        match grid
            .reload(&store)
            .and_then(|()| render(&store, &mut state.sub_subjects, grid))
        {
            Ok(view) => result["grid"] = view,
            Err(e) => {
                result["reloadError"] = json!({ "code": e.code(), "message": e.to_string() });
            }
        }
    }
    ok(&req.id, result)
}

fn handle_grid_reload(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return no_workspace(&req.id);
    };
    let store = SqliteStore::new(conn);
    let res = session_mut(&mut state.grid, &req.params).and_then(|g| {
        g.reload(&store)?;
        render(&store, &mut state.sub_subjects, g)
    });
    match res {
        Ok(v) => ok(&req.id, v),
        Err(e) => engine_err(&req.id, &e),
    }
}

fn handle_grid_close(state: &mut AppState, req: &Request) -> serde_json::Value {
    match session_mut(&mut state.grid, &req.params) {
        Ok(g) => {
            let ctx = *g.context();
            state.grid = None;
            info!(class_id = ctx.class_id, month = ctx.month, year = ctx.year, "grid closed");
            ok(&req.id, json!({ "ok": true }))
        }
        Err(e) => engine_err(&req.id, &e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grid.open" => Some(handle_grid_open(state, req)),
        "grid.get" => Some(handle_grid_get(state, req)),
        "grid.setCell" => Some(handle_grid_set_cell(state, req)),
        "grid.save" => Some(handle_grid_save(state, req)),
        "grid.reload" => Some(handle_grid_reload(state, req)),
        "grid.close" => Some(handle_grid_close(state, req)),
        _ => None,
    }
}
