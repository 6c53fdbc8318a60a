use crate::auth::Role;
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::helpers::{db_conn, now_timestamp, require_role, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

pub(super) fn is_enrolled(
    conn: &Connection,
    student_id: &str,
    course_id: &str,
) -> Result<bool, HandlerErr> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM enrollments WHERE student_id = ? AND course_id = ?",
            (student_id, course_id),
            |r| r.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn handle_enroll(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let student = require_role(state, &[Role::Student])?.clone();
    let conn = db_conn(state)?;
    let course_id = required_str(req, "courseId")?;

    let cohort: Option<(String, String)> = conn
        .query_row(
            "SELECT semester, department FROM courses WHERE id = ?",
            [&course_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let Some((semester, department)) = cohort else {
        return Err(HandlerErr::not_found("course not found"));
    };
    if !student.matches_cohort(&semester, &department) {
        return Err(HandlerErr::forbidden(
            "you can only enroll in courses matching your semester and department",
        ));
    }
    if is_enrolled(conn, &student.id, &course_id)? {
        return Err(HandlerErr::conflict("already enrolled in this course"));
    }

    let enrolled_at = now_timestamp();
    conn.execute(
        "INSERT INTO enrollments(student_id, course_id, enrolled_at) VALUES(?, ?, ?)",
        (&student.id, &course_id, &enrolled_at),
    )?;

    tracing::info!(student_id = %student.id, course_id = %course_id, "enrolled");
    Ok(json!({ "courseId": course_id, "enrolledAt": enrolled_at }))
}

fn handle_unenroll(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let student_id = require_role(state, &[Role::Student])?.id.clone();
    let conn = db_conn(state)?;
    let course_id = required_str(req, "courseId")?;

    let removed = conn.execute(
        "DELETE FROM enrollments WHERE student_id = ? AND course_id = ?",
        (&student_id, &course_id),
    )?;
    if removed == 0 {
        return Err(HandlerErr::not_found("enrollment not found"));
    }
    Ok(json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "enrollments.create" => handle_enroll(state, req),
        "enrollments.delete" => handle_unenroll(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
