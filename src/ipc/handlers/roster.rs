use crate::error::EngineResult;
use crate::ipc::error::{engine_err, no_workspace, ok};
use crate::ipc::helpers::{opt_i64, req_i64, req_str};
use crate::ipc::types::{AppState, Request};
use crate::store::{Roster, SqliteStore};
use serde_json::json;

fn handle_classes_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return no_workspace(&req.id);
    };
    let run = || -> EngineResult<serde_json::Value> {
        let name = req_str(&req.params, "name")?;
        let teacher_id = req_i64(&req.params, "teacherId")?;
        let grade_level = opt_i64(&req.params, "gradeLevel")?;
        let class = SqliteStore::new(conn).create_class(name, teacher_id, grade_level)?;
        Ok(json!({ "class": class }))
    };
    match run() {
        Ok(v) => ok(&req.id, v),
        Err(e) => engine_err(&req.id, &e),
    }
}

fn handle_classes_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "classes": [] }));
    };
    let run = || -> EngineResult<serde_json::Value> {
        let teacher_id = opt_i64(&req.params, "teacherId")?;
        let classes = SqliteStore::new(conn).list_classes(teacher_id)?;
        Ok(json!({ "classes": classes }))
    };
    match run() {
        Ok(v) => ok(&req.id, v),
        Err(e) => engine_err(&req.id, &e),
    }
}

fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return no_workspace(&req.id);
    };
    let run = || -> EngineResult<serde_json::Value> {
        let class_id = req_i64(&req.params, "classId")?;
        let name = req_str(&req.params, "name")?;
        let student = SqliteStore::new(conn).create_student(class_id, name)?;
        Ok(json!({ "student": student }))
    };
    match run() {
        Ok(v) => ok(&req.id, v),
        Err(e) => engine_err(&req.id, &e),
    }
}

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return no_workspace(&req.id);
    };
    let run = || -> EngineResult<serde_json::Value> {
        let class_id = req_i64(&req.params, "classId")?;
        let students = SqliteStore::new(conn).class_students(class_id)?;
        Ok(json!({ "students": students }))
    };
    match run() {
        Ok(v) => ok(&req.id, v),
        Err(e) => engine_err(&req.id, &e),
    }
}

fn handle_subjects_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return no_workspace(&req.id);
    };
    let run = || -> EngineResult<serde_json::Value> {
        let name = req_str(&req.params, "name")?;
        let subject = SqliteStore::new(conn).create_subject(name)?;
        Ok(json!({ "subject": subject }))
    };
    match run() {
        Ok(v) => ok(&req.id, v),
        Err(e) => engine_err(&req.id, &e),
    }
}

fn handle_subjects_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "subjects": [] }));
    };
    match SqliteStore::new(conn).subjects() {
        Ok(subjects) => ok(&req.id, json!({ "subjects": subjects })),
        Err(e) => engine_err(&req.id, &e),
    }
}

fn handle_sub_subjects_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return no_workspace(&req.id);
    };
    let run = || -> EngineResult<serde_json::Value> {
        let subject_id = req_i64(&req.params, "subjectId")?;
        let name = req_str(&req.params, "name")?;
        let sub_subject = SqliteStore::new(conn).create_sub_subject(subject_id, name)?;
        Ok(json!({ "subSubject": sub_subject }))
    };
    match run() {
        Ok(v) => {
            if let Some(subject_id) = v["subSubject"]["subjectId"].as_i64() {
                state.sub_subjects.forget(subject_id);
            }
            ok(&req.id, v)
        }
        Err(e) => engine_err(&req.id, &e),
    }
}

fn handle_sub_subjects_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return no_workspace(&req.id);
    };
    let subject_id = match req_i64(&req.params, "subjectId") {
        Ok(v) => v,
        Err(e) => return engine_err(&req.id, &e),
    };
    let store = SqliteStore::new(conn);
    match state.sub_subjects.sub_subjects_of(&store, subject_id) {
        Ok(subs) => ok(&req.id, json!({ "subSubjects": subs })),
        Err(e) => engine_err(&req.id, &e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "classes.create" => Some(handle_classes_create(state, req)),
        "classes.list" => Some(handle_classes_list(state, req)),
        "students.create" => Some(handle_students_create(state, req)),
        "students.list" => Some(handle_students_list(state, req)),
        "subjects.create" => Some(handle_subjects_create(state, req)),
        "subjects.list" => Some(handle_subjects_list(state, req)),
        "subSubjects.create" => Some(handle_sub_subjects_create(state, req)),
        "subSubjects.list" => Some(handle_sub_subjects_list(state, req)),
        _ => None,
    }
}
