use crate::aggregate::{rating_statistics, subject_report, ReportSubject, SubjectReport};
use crate::auth::Role;
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::helpers::{db_conn, now_timestamp, optional_str, require_role, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

use super::feedback::{flat_statistics, load_rows, RowScope};

const DEFAULT_MESSAGE: &str = "Feedback report for your subject";

fn load_report_subject(conn: &Connection, subject_id: &str) -> Result<ReportSubject, HandlerErr> {
    conn.query_row(
        "SELECT s.id, s.title, s.code, s.description, s.teacher_id,
                COALESCE(t.name, ''), COALESCE(t.email, '')
         FROM subjects s
         LEFT JOIN users t ON t.id = s.teacher_id
         WHERE s.id = ?",
        [subject_id],
        |r| {
            Ok(ReportSubject {
                id: r.get(0)?,
                title: r.get(1)?,
                code: r.get(2)?,
                description: r.get(3)?,
                teacher_id: r.get(4)?,
                teacher_name: r.get(5)?,
                teacher_email: r.get(6)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| HandlerErr::not_found("subject not found"))
}

fn build_subject_report(conn: &Connection, subject_id: &str) -> Result<SubjectReport, HandlerErr> {
    let subject = load_report_subject(conn, subject_id)?;
    let rows = load_rows(conn, RowScope::Report(subject_id))?;
    Ok(subject_report(subject, &rows)?)
}

fn handle_reports_subject(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_role(state, &[Role::Admin])?;
    let conn = db_conn(state)?;
    let subject_id = required_str(req, "subjectId")?;
    let report = build_subject_report(conn, &subject_id)?;
    Ok(json!({ "report": report }))
}

fn handle_reports_send_to_teacher(
    state: &mut AppState,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    let admin_id = require_role(state, &[Role::Admin])?.id.clone();
    let conn = db_conn(state)?;
    let subject_id = required_str(req, "subjectId")?;
    let message = optional_str(req, "message")?
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| DEFAULT_MESSAGE.to_string());

    let subject = load_report_subject(conn, &subject_id)?;
    let rows = load_rows(conn, RowScope::Subject(&subject_id))?;
    let stats = rating_statistics(&rows)?;

    let envelope = json!({
        "subject": { "title": subject.title, "code": subject.code },
        "teacher": { "name": subject.teacher_name, "email": subject.teacher_email },
        "statistics": flat_statistics(&stats),
        "message": message,
        "generatedAt": now_timestamp()
    });

    // No mail transport; the hand-off is recorded in the log only.
    tracing::info!(
        subject_id = %subject.id,
        to = %subject.teacher_email,
        by = %admin_id,
        "feedback report handed off to teacher"
    );
    Ok(json!({ "report": envelope }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "reports.subject" => handle_reports_subject(state, req),
        "reports.sendToTeacher" => handle_reports_send_to_teacher(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
