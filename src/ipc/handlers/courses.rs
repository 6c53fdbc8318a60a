use crate::auth::{Role, SessionUser};
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::helpers::{
    db_conn, insert_err, now_timestamp, optional_str, optional_str_list, require_role,
    require_session, required_str,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::json;
use uuid::Uuid;

use super::subjects::{subject_from_row, SUBJECT_SELECT};

const COURSE_COLUMNS: &str = "c.id, c.title, c.description, c.code, c.semester, c.department, c.created_at";

struct CourseRow {
    id: String,
    semester: String,
    department: String,
    json: serde_json::Value,
}

fn course_from_row(row: &Row<'_>) -> rusqlite::Result<CourseRow> {
    let id: String = row.get(0)?;
    let title: String = row.get(1)?;
    let description: String = row.get(2)?;
    let code: String = row.get(3)?;
    let semester: String = row.get(4)?;
    let department: String = row.get(5)?;
    let created_at: String = row.get(6)?;
    Ok(CourseRow {
        json: json!({
            "id": id,
            "title": title,
            "description": description,
            "code": code,
            "semester": semester,
            "department": department,
            "createdAt": created_at
        }),
        id,
        semester,
        department,
    })
}

fn course_subjects(
    conn: &Connection,
    course_id: &str,
) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let mut stmt = conn.prepare(&format!(
        "{SUBJECT_SELECT}
         JOIN course_subjects cs ON cs.subject_id = s.id
         WHERE cs.course_id = ?
         ORDER BY s.created_at"
    ))?;
    let subjects = stmt
        .query_map([course_id], subject_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(subjects)
}

fn with_subjects(conn: &Connection, course: CourseRow) -> Result<serde_json::Value, HandlerErr> {
    let mut v = course.json;
    v["subjects"] = json!(course_subjects(conn, &course.id)?);
    Ok(v)
}

fn load_course(conn: &Connection, course_id: &str) -> Result<CourseRow, HandlerErr> {
    conn.query_row(
        &format!("SELECT {COURSE_COLUMNS} FROM courses c WHERE c.id = ?"),
        [course_id],
        course_from_row,
    )
    .optional()?
    .ok_or_else(|| HandlerErr::not_found("course not found"))
}

fn ensure_subjects_exist(conn: &Connection, subject_ids: &[String]) -> Result<(), HandlerErr> {
    for subject_id in subject_ids {
        let exists: Option<i64> = conn
            .query_row("SELECT 1 FROM subjects WHERE id = ?", [subject_id], |r| {
                r.get(0)
            })
            .optional()?;
        if exists.is_none() {
            return Err(HandlerErr::not_found("subject not found")
                .with_details(json!({ "subjectId": subject_id })));
        }
    }
    Ok(())
}

fn student_cohort_guard(user: &SessionUser, course: &CourseRow) -> Result<(), HandlerErr> {
    if user.role == Role::Student && !user.matches_cohort(&course.semester, &course.department) {
        return Err(HandlerErr::forbidden("you cannot access this course"));
    }
    Ok(())
}

fn handle_courses_list(state: &mut AppState, _req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let user = require_session(state)?.clone();
    let conn = db_conn(state)?;

    let mut stmt = conn.prepare(&format!(
        "SELECT {COURSE_COLUMNS} FROM courses c ORDER BY c.created_at DESC"
    ))?;
    let rows = stmt
        .query_map([], course_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    let mut courses = Vec::new();
    for course in rows {
        if user.role == Role::Student && !user.matches_cohort(&course.semester, &course.department) {
            continue;
        }
        courses.push(with_subjects(conn, course)?);
    }
    Ok(json!({ "courses": courses }))
}

fn handle_courses_get(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let user = require_session(state)?.clone();
    let conn = db_conn(state)?;
    let course_id = required_str(req, "courseId")?;

    let course = load_course(conn, &course_id)?;
    student_cohort_guard(&user, &course)?;
    Ok(json!({ "course": with_subjects(conn, course)? }))
}

fn handle_courses_create(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_role(state, &[Role::Admin])?;
    let conn = db_conn(state)?;
    let title = required_str(req, "title")?;
    let description = required_str(req, "description")?;
    let code = required_str(req, "code")?;
    let semester = required_str(req, "semester")?;
    let department = required_str(req, "department")?;
    let subject_ids = optional_str_list(req, "subjectIds")?.unwrap_or_default();
    ensure_subjects_exist(conn, &subject_ids)?;

    let course_id = Uuid::new_v4().to_string();
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tx.execute(
        "INSERT INTO courses(id, title, description, code, semester, department, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &course_id,
            &title,
            &description,
            &code,
            &semester,
            &department,
            now_timestamp(),
        ),
    )
    .map_err(|e| insert_err(e, "course code"))?;
    for subject_id in &subject_ids {
        tx.execute(
            "INSERT OR IGNORE INTO course_subjects(course_id, subject_id) VALUES(?, ?)",
            (&course_id, subject_id),
        )?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    let course = load_course(conn, &course_id)?;
    Ok(json!({ "course": with_subjects(conn, course)? }))
}

fn handle_courses_update(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_role(state, &[Role::Admin])?;
    let conn = db_conn(state)?;
    let course_id = required_str(req, "courseId")?;
    load_course(conn, &course_id)?;

    let field = |key: &str| -> Result<Option<String>, HandlerErr> {
        Ok(optional_str(req, key)?.filter(|s| !s.is_empty()))
    };
    let title = field("title")?;
    let description = field("description")?;
    let code = field("code")?;
    let semester = field("semester")?;
    let department = field("department")?;
    let subject_ids = optional_str_list(req, "subjectIds")?;
    if let Some(ids) = &subject_ids {
        ensure_subjects_exist(conn, ids)?;
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tx.execute(
        "UPDATE courses SET
           title = COALESCE(?, title),
           description = COALESCE(?, description),
           code = COALESCE(?, code),
           semester = COALESCE(?, semester),
           department = COALESCE(?, department)
         WHERE id = ?",
        (&title, &description, &code, &semester, &department, &course_id),
    )
    .map_err(|e| insert_err(e, "course code"))?;
    if let Some(ids) = &subject_ids {
        tx.execute("DELETE FROM course_subjects WHERE course_id = ?", [&course_id])?;
        for subject_id in ids {
            tx.execute(
                "INSERT OR IGNORE INTO course_subjects(course_id, subject_id) VALUES(?, ?)",
                (&course_id, subject_id),
            )?;
        }
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    let course = load_course(conn, &course_id)?;
    Ok(json!({ "course": with_subjects(conn, course)? }))
}

fn handle_courses_delete(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_role(state, &[Role::Admin])?;
    let conn = db_conn(state)?;
    let course_id = required_str(req, "courseId")?;
    load_course(conn, &course_id)?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    // Explicit dependency order (no ON DELETE CASCADE).
    for (table, sql) in [
        (
            "feedback_responses",
            "DELETE FROM feedback_responses
             WHERE form_id IN (SELECT id FROM feedback_forms WHERE course_id = ?)",
        ),
        (
            "feedback_form_questions",
            "DELETE FROM feedback_form_questions
             WHERE form_id IN (SELECT id FROM feedback_forms WHERE course_id = ?)",
        ),
        (
            "feedback_forms",
            "DELETE FROM feedback_forms WHERE course_id = ?",
        ),
        ("enrollments", "DELETE FROM enrollments WHERE course_id = ?"),
        (
            "course_subjects",
            "DELETE FROM course_subjects WHERE course_id = ?",
        ),
        ("courses", "DELETE FROM courses WHERE id = ?"),
    ] {
        tx.execute(sql, [&course_id]).map_err(|e| {
            HandlerErr::new("db_delete_failed", e.to_string()).with_details(json!({ "table": table }))
        })?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    tracing::info!(course_id = %course_id, "course deleted");
    Ok(json!({ "deleted": true }))
}

fn handle_courses_enrolled(state: &mut AppState, _req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let user = require_role(state, &[Role::Student])?.clone();
    let conn = db_conn(state)?;

    let mut stmt = conn.prepare(&format!(
        "SELECT {COURSE_COLUMNS}, e.enrolled_at
         FROM enrollments e
         JOIN courses c ON c.id = e.course_id
         WHERE e.student_id = ? AND c.semester = ? AND c.department = ?
         ORDER BY e.enrolled_at DESC"
    ))?;
    let rows = stmt
        .query_map((&user.id, &user.semester, &user.department), |row| {
            let mut course = course_from_row(row)?;
            let enrolled_at: String = row.get(7)?;
            course.json["enrolledAt"] = json!(enrolled_at);
            Ok(course)
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let courses = rows
        .into_iter()
        .map(|course| with_subjects(conn, course))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "courses": courses }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "courses.list" => handle_courses_list(state, req),
        "courses.get" => handle_courses_get(state, req),
        "courses.create" => handle_courses_create(state, req),
        "courses.update" => handle_courses_update(state, req),
        "courses.delete" => handle_courses_delete(state, req),
        "courses.enrolled" => handle_courses_enrolled(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
