use crate::auth::Role;
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::helpers::{
    db_conn, insert_err, now_timestamp, optional_str, require_role, require_session, required_str,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::json;
use uuid::Uuid;

pub(super) const SUBJECT_SELECT: &str = "SELECT s.id, s.title, s.description, s.code, s.teacher_id, u.name, s.created_at
     FROM subjects s
     LEFT JOIN users u ON u.id = s.teacher_id";

pub(super) fn subject_from_row(row: &Row<'_>) -> rusqlite::Result<serde_json::Value> {
    let id: String = row.get(0)?;
    let title: String = row.get(1)?;
    let description: String = row.get(2)?;
    let code: String = row.get(3)?;
    let teacher_id: String = row.get(4)?;
    let teacher_name: Option<String> = row.get(5)?;
    let created_at: String = row.get(6)?;
    Ok(json!({
        "id": id,
        "title": title,
        "description": description,
        "code": code,
        "teacherId": teacher_id,
        "teacherName": teacher_name,
        "createdAt": created_at
    }))
}

pub(super) fn load_subject(
    conn: &Connection,
    subject_id: &str,
) -> Result<serde_json::Value, HandlerErr> {
    conn.query_row(
        &format!("{SUBJECT_SELECT} WHERE s.id = ?"),
        [subject_id],
        subject_from_row,
    )
    .optional()?
    .ok_or_else(|| HandlerErr::not_found("subject not found"))
}

/// Owner teacher id of a subject, or `not_found`.
pub(super) fn subject_owner(conn: &Connection, subject_id: &str) -> Result<String, HandlerErr> {
    conn.query_row(
        "SELECT teacher_id FROM subjects WHERE id = ?",
        [subject_id],
        |r| r.get(0),
    )
    .optional()?
    .ok_or_else(|| HandlerErr::not_found("subject not found"))
}

fn handle_subjects_list(state: &mut AppState, _req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_session(state)?;
    let conn = db_conn(state)?;
    let mut stmt = conn.prepare(&format!("{SUBJECT_SELECT} ORDER BY s.created_at DESC"))?;
    let subjects = stmt
        .query_map([], subject_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "subjects": subjects }))
}

fn handle_subjects_get(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_session(state)?;
    let conn = db_conn(state)?;
    let subject_id = required_str(req, "subjectId")?;
    Ok(json!({ "subject": load_subject(conn, &subject_id)? }))
}

fn handle_subjects_by_teacher(
    state: &mut AppState,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    require_session(state)?;
    let conn = db_conn(state)?;
    let teacher_id = required_str(req, "teacherId")?;
    let mut stmt = conn.prepare(&format!(
        "{SUBJECT_SELECT} WHERE s.teacher_id = ? ORDER BY s.created_at DESC"
    ))?;
    let subjects = stmt
        .query_map([&teacher_id], subject_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "subjects": subjects }))
}

fn handle_subjects_create(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let teacher_id = require_role(state, &[Role::Teacher])?.id.clone();
    let conn = db_conn(state)?;
    let title = required_str(req, "title")?;
    let description = required_str(req, "description")?;
    let code = required_str(req, "code")?;

    let subject_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO subjects(id, title, description, code, teacher_id, created_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&subject_id, &title, &description, &code, &teacher_id, now_timestamp()),
    )
    .map_err(|e| {
        insert_err(e, "subject code").with_details(json!({ "table": "subjects" }))
    })?;

    Ok(json!({ "subject": load_subject(conn, &subject_id)? }))
}

fn handle_subjects_update(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let teacher_id = require_role(state, &[Role::Teacher])?.id.clone();
    let conn = db_conn(state)?;
    let subject_id = required_str(req, "subjectId")?;

    if subject_owner(conn, &subject_id)? != teacher_id {
        return Err(HandlerErr::forbidden("you can only update your own subjects"));
    }

    let title = optional_str(req, "title")?.filter(|s| !s.is_empty());
    let description = optional_str(req, "description")?.filter(|s| !s.is_empty());
    let code = optional_str(req, "code")?.filter(|s| !s.is_empty());
    conn.execute(
        "UPDATE subjects SET
           title = COALESCE(?, title),
           description = COALESCE(?, description),
           code = COALESCE(?, code)
         WHERE id = ?",
        (&title, &description, &code, &subject_id),
    )
    .map_err(|e| insert_err(e, "subject code"))?;

    Ok(json!({ "subject": load_subject(conn, &subject_id)? }))
}

fn handle_subjects_delete(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let user = require_role(state, &[Role::Teacher, Role::Admin])?.clone();
    let conn = db_conn(state)?;
    let subject_id = required_str(req, "subjectId")?;

    let owner = subject_owner(conn, &subject_id)?;
    if user.role == Role::Teacher && owner != user.id {
        return Err(HandlerErr::forbidden("you can only delete your own subjects"));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    // Explicit dependency order (no ON DELETE CASCADE).
    for (table, sql) in [
        (
            "feedback_responses",
            "DELETE FROM feedback_responses WHERE subject_id = ?",
        ),
        (
            "course_subjects",
            "DELETE FROM course_subjects WHERE subject_id = ?",
        ),
        ("subjects", "DELETE FROM subjects WHERE id = ?"),
    ] {
        tx.execute(sql, [&subject_id]).map_err(|e| {
            HandlerErr::new("db_delete_failed", e.to_string()).with_details(json!({ "table": table }))
        })?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    tracing::info!(subject_id = %subject_id, by = %user.id, "subject deleted");
    Ok(json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "subjects.list" => handle_subjects_list(state, req),
        "subjects.get" => handle_subjects_get(state, req),
        "subjects.byTeacher" => handle_subjects_by_teacher(state, req),
        "subjects.create" => handle_subjects_create(state, req),
        "subjects.update" => handle_subjects_update(state, req),
        "subjects.delete" => handle_subjects_delete(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
