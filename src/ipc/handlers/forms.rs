use crate::aggregate::QuestionType;
use crate::auth::Role;
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::helpers::{
    db_conn, now_timestamp, optional_bool, optional_str, require_role, require_session,
    required_str,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension, Row};
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use super::enrollments::is_enrolled;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct QuestionDef {
    pub id: String,
    pub form_id: String,
    pub text: String,
    #[serde(rename = "type")]
    pub question_type: QuestionType,
    pub order: i64,
    pub options: Option<Vec<String>>,
}

/// Question as submitted to `forms.create` / `forms.update`.
struct NewQuestion {
    text: String,
    question_type: QuestionType,
    options: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct FormHeader {
    id: String,
    course_id: String,
    title: String,
    description: Option<String>,
    is_active: bool,
    created_at: String,
}

const FORM_COLUMNS: &str = "id, course_id, title, description, is_active, created_at";

fn form_from_row(row: &Row<'_>) -> rusqlite::Result<FormHeader> {
    Ok(FormHeader {
        id: row.get(0)?,
        course_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        is_active: row.get::<_, i64>(4)? != 0,
        created_at: row.get(5)?,
    })
}

pub(super) fn load_questions(
    conn: &Connection,
    form_id: &str,
) -> Result<Vec<QuestionDef>, HandlerErr> {
    let mut stmt = conn.prepare(
        "SELECT id, form_id, question_text, question_type, question_order, options
         FROM feedback_form_questions
         WHERE form_id = ?
         ORDER BY question_order ASC",
    )?;
    let raw = stmt
        .query_map([form_id], |row| {
            Ok((
                QuestionDef {
                    id: row.get(0)?,
                    form_id: row.get(1)?,
                    text: row.get(2)?,
                    question_type: row.get(3)?,
                    order: row.get(4)?,
                    options: None,
                },
                row.get::<_, Option<String>>(5)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    raw.into_iter()
        .map(|(mut q, options)| {
            if let Some(text) = options {
                let parsed: Vec<String> = serde_json::from_str(&text).map_err(|e| {
                    HandlerErr::new("bad_data", format!("question options are not a JSON list: {e}"))
                        .with_details(json!({ "questionId": q.id }))
                })?;
                q.options = Some(parsed);
            }
            Ok(q)
        })
        .collect()
}

fn form_json(conn: &Connection, form: FormHeader) -> Result<serde_json::Value, HandlerErr> {
    let questions = load_questions(conn, &form.id)?;
    let mut v = json!(form);
    v["questions"] = json!(questions);
    Ok(v)
}

fn load_form(conn: &Connection, form_id: &str) -> Result<FormHeader, HandlerErr> {
    conn.query_row(
        &format!("SELECT {FORM_COLUMNS} FROM feedback_forms WHERE id = ?"),
        [form_id],
        form_from_row,
    )
    .optional()?
    .ok_or_else(|| HandlerErr::not_found("feedback form not found"))
}

fn parse_questions(raw: &serde_json::Value) -> Result<Vec<NewQuestion>, HandlerErr> {
    let Some(items) = raw.as_array() else {
        return Err(HandlerErr::bad_params("questions must be an array"));
    };
    let mut out = Vec::with_capacity(items.len());
    for (idx, item) in items.iter().enumerate() {
        let bad = |msg: &str| HandlerErr::bad_params(msg).with_details(json!({ "index": idx }));

        let text = item
            .get("text")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| bad("question text is required"))?;
        let question_type = match item.get("type").and_then(|v| v.as_str()) {
            None => QuestionType::Rating,
            Some(t) => t
                .parse::<QuestionType>()
                .map_err(|_| bad("question type must be one of: rating, text, choice"))?,
        };
        let options = if question_type == QuestionType::Choice {
            let opts: Vec<String> = item
                .get("options")
                .and_then(|v| v.as_array())
                .map(|a| {
                    a.iter()
                        .filter_map(|o| o.as_str())
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default();
            if opts.is_empty() {
                return Err(bad("choice questions need at least one option"));
            }
            Some(opts)
        } else {
            None
        };
        out.push(NewQuestion {
            text,
            question_type,
            options,
        });
    }
    Ok(out)
}

fn insert_questions(
    conn: &Connection,
    form_id: &str,
    questions: &[NewQuestion],
) -> Result<(), HandlerErr> {
    for (order, q) in questions.iter().enumerate() {
        let options = q.options.as_ref().map(|o| json!(o).to_string());
        conn.execute(
            "INSERT INTO feedback_form_questions(id, form_id, question_text, question_type, question_order, options)
             VALUES(?, ?, ?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                form_id,
                &q.text,
                q.question_type,
                order as i64,
                options,
            ),
        )?;
    }
    Ok(())
}

fn handle_forms_list_by_course(
    state: &mut AppState,
    req: &Request,
) -> Result<serde_json::Value, HandlerErr> {
    require_session(state)?;
    let conn = db_conn(state)?;
    let course_id = required_str(req, "courseId")?;

    let mut stmt = conn.prepare(&format!(
        "SELECT {FORM_COLUMNS} FROM feedback_forms WHERE course_id = ? ORDER BY created_at DESC"
    ))?;
    let headers = stmt
        .query_map([&course_id], form_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    let forms = headers
        .into_iter()
        .map(|f| form_json(conn, f))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "forms": forms }))
}

fn handle_forms_active(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let student_id = require_role(state, &[Role::Student])?.id.clone();
    let conn = db_conn(state)?;
    let course_id = required_str(req, "courseId")?;

    if !is_enrolled(conn, &student_id, &course_id)? {
        return Err(HandlerErr::forbidden(
            "you must be enrolled in this course to access feedback forms",
        ));
    }

    let form = conn
        .query_row(
            &format!(
                "SELECT {FORM_COLUMNS} FROM feedback_forms
                 WHERE course_id = ? AND is_active = 1
                 ORDER BY created_at DESC
                 LIMIT 1"
            ),
            [&course_id],
            form_from_row,
        )
        .optional()?
        .ok_or_else(|| HandlerErr::not_found("no active feedback form for this course"))?;

    let questions = load_questions(conn, &form.id)?;
    if questions.is_empty() {
        return Err(HandlerErr::not_found("feedback form has no questions"));
    }
    let mut v = json!(form);
    v["questions"] = json!(questions);
    Ok(json!({ "form": v }))
}

fn handle_forms_get(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_session(state)?;
    let conn = db_conn(state)?;
    let form_id = required_str(req, "formId")?;
    let form = load_form(conn, &form_id)?;
    Ok(json!({ "form": form_json(conn, form)? }))
}

fn handle_forms_create(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_role(state, &[Role::Admin])?;
    let conn = db_conn(state)?;
    let course_id = required_str(req, "courseId")?;
    let title = required_str(req, "title")?;
    let description = optional_str(req, "description")?;
    let questions = parse_questions(req.params.get("questions").unwrap_or(&json!(null)))?;
    if questions.is_empty() {
        return Err(HandlerErr::bad_params("at least one question is required"));
    }

    let course: Option<i64> = conn
        .query_row("SELECT 1 FROM courses WHERE id = ?", [&course_id], |r| {
            r.get(0)
        })
        .optional()?;
    if course.is_none() {
        return Err(HandlerErr::not_found("course not found"));
    }

    let form_id = Uuid::new_v4().to_string();
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tx.execute(
        "INSERT INTO feedback_forms(id, course_id, title, description, is_active, created_at)
         VALUES(?, ?, ?, ?, 1, ?)",
        (&form_id, &course_id, &title, &description, now_timestamp()),
    )?;
    insert_questions(&tx, &form_id, &questions)?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    let form = load_form(conn, &form_id)?;
    Ok(json!({ "form": form_json(conn, form)? }))
}

fn handle_forms_update(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_role(state, &[Role::Admin])?;
    let conn = db_conn(state)?;
    let form_id = required_str(req, "formId")?;
    let current = load_form(conn, &form_id)?;

    let title = optional_str(req, "title")?
        .filter(|s| !s.is_empty())
        .unwrap_or(current.title);
    let description = match req.params.get("description") {
        None => current.description,
        Some(_) => optional_str(req, "description")?,
    };
    let is_active = optional_bool(req, "isActive")?.unwrap_or(current.is_active);
    let questions = match req.params.get("questions").filter(|v| !v.is_null()) {
        None => None,
        Some(raw) => {
            let parsed = parse_questions(raw)?;
            if parsed.is_empty() {
                return Err(HandlerErr::bad_params("at least one question is required"));
            }
            Some(parsed)
        }
    };

    if questions.is_some() {
        // Existing answers reference the current questions.
        let answered: i64 = conn.query_row(
            "SELECT COUNT(*) FROM feedback_responses WHERE form_id = ?",
            [&form_id],
            |r| r.get(0),
        )?;
        if answered > 0 {
            return Err(HandlerErr::conflict(
                "questions cannot be replaced on a form that already has responses",
            )
            .with_details(json!({ "responseCount": answered })));
        }
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tx.execute(
        "UPDATE feedback_forms SET title = ?, description = ?, is_active = ? WHERE id = ?",
        (&title, &description, is_active as i64, &form_id),
    )?;
    if let Some(questions) = &questions {
        tx.execute(
            "DELETE FROM feedback_form_questions WHERE form_id = ?",
            [&form_id],
        )?;
        insert_questions(&tx, &form_id, questions)?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    let form = load_form(conn, &form_id)?;
    Ok(json!({ "form": form_json(conn, form)? }))
}

fn handle_forms_delete(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_role(state, &[Role::Admin])?;
    let conn = db_conn(state)?;
    let form_id = required_str(req, "formId")?;
    load_form(conn, &form_id)?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    for (table, sql) in [
        (
            "feedback_responses",
            "DELETE FROM feedback_responses WHERE form_id = ?",
        ),
        (
            "feedback_form_questions",
            "DELETE FROM feedback_form_questions WHERE form_id = ?",
        ),
        ("feedback_forms", "DELETE FROM feedback_forms WHERE id = ?"),
    ] {
        tx.execute(sql, [&form_id]).map_err(|e| {
            HandlerErr::new("db_delete_failed", e.to_string()).with_details(json!({ "table": table }))
        })?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "forms.listByCourse" => handle_forms_list_by_course(state, req),
        "forms.active" => handle_forms_active(state, req),
        "forms.get" => handle_forms_get(state, req),
        "forms.create" => handle_forms_create(state, req),
        "forms.update" => handle_forms_update(state, req),
        "forms.delete" => handle_forms_delete(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_questions_defaults_to_rating() {
        let parsed = parse_questions(&json!([
            { "text": "Pace of lectures" },
            { "text": "Anything else?", "type": "text", "options": ["ignored"] },
            { "text": "Preferred slot", "type": "choice", "options": ["Morning", " ", "Evening"] }
        ]))
        .expect("parse");
        assert_eq!(parsed[0].question_type, QuestionType::Rating);
        assert_eq!(parsed[1].options, None);
        assert_eq!(
            parsed[2].options,
            Some(vec!["Morning".to_string(), "Evening".to_string()])
        );
    }

    #[test]
    fn parse_questions_rejects_bad_items() {
        let e = parse_questions(&json!([{ "text": "ok" }, { "text": "x", "type": "slider" }]))
            .err()
            .expect("unknown type");
        assert_eq!(e.code, "bad_params");
        assert_eq!(e.details, Some(json!({ "index": 1 })));

        let e = parse_questions(&json!([{ "text": "Slot", "type": "choice" }]))
            .err()
            .expect("choice without options");
        assert_eq!(e.code, "bad_params");

        let e = parse_questions(&json!([{ "type": "text" }]))
            .err()
            .expect("missing text");
        assert_eq!(e.code, "bad_params");
    }
}
