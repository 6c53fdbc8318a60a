use crate::aggregate::{
    group_submissions, rating_statistics, Audience, GroupContext, QuestionType, RatingStatistics,
    ResponseRow,
};
use crate::auth::Role;
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::helpers::{db_conn, now_timestamp, require_role, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use super::enrollments::is_enrolled;
use super::forms::{load_questions, QuestionDef};
use super::subjects::subject_owner;

/// Which responses a view reads, and which context columns it carries.
#[derive(Debug, Clone, Copy)]
pub(super) enum RowScope<'a> {
    Subject(&'a str),
    All,
    Student(&'a str),
    Report(&'a str),
}

impl RowScope<'_> {
    fn filter(&self) -> (&'static str, Vec<&str>) {
        match *self {
            RowScope::Subject(id) | RowScope::Report(id) => ("r.subject_id = ?", vec![id]),
            RowScope::Student(id) => ("r.student_id = ?", vec![id]),
            RowScope::All => ("1 = 1", Vec::new()),
        }
    }

    fn context(&self, ctx: GroupContext) -> GroupContext {
        match self {
            RowScope::Subject(_) => GroupContext::default(),
            RowScope::All => GroupContext {
                teacher_id: ctx.teacher_id,
                teacher_name: ctx.teacher_name,
                course_title: ctx.course_title,
                ..GroupContext::default()
            },
            RowScope::Student(_) => GroupContext {
                subject_code: ctx.subject_code,
                teacher_name: ctx.teacher_name,
                course_title: ctx.course_title,
                course_code: ctx.course_code,
                ..GroupContext::default()
            },
            RowScope::Report(_) => GroupContext {
                course_title: ctx.course_title,
                semester: ctx.semester,
                department: ctx.department,
                ..GroupContext::default()
            },
        }
    }
}

pub(super) fn load_rows(
    conn: &Connection,
    scope: RowScope<'_>,
) -> Result<Vec<ResponseRow>, HandlerErr> {
    let (filter, params) = scope.filter();
    let sql = format!(
        "SELECT r.submission_id, r.student_id, u.name, r.form_id, ff.title,
                r.subject_id, s.title, r.question_id, fq.question_text, fq.question_type,
                r.rating, r.response_value, r.created_at,
                s.code, s.teacher_id, t.name, c.title, c.code, c.semester, c.department
         FROM feedback_responses r
         JOIN users u ON u.id = r.student_id
         JOIN feedback_form_questions fq ON fq.id = r.question_id
         JOIN subjects s ON s.id = r.subject_id
         JOIN feedback_forms ff ON ff.id = r.form_id
         JOIN courses c ON c.id = ff.course_id
         LEFT JOIN users t ON t.id = s.teacher_id
         WHERE {filter}
         ORDER BY r.created_at DESC, r.submission_id, fq.question_order"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(params), |row| {
            let ctx = GroupContext {
                subject_code: row.get(13)?,
                teacher_id: row.get(14)?,
                teacher_name: row.get(15)?,
                course_title: row.get(16)?,
                course_code: row.get(17)?,
                semester: row.get(18)?,
                department: row.get(19)?,
            };
            Ok(ResponseRow {
                submission_id: row.get(0)?,
                student_id: row.get(1)?,
                student_name: row.get(2)?,
                form_id: row.get(3)?,
                form_title: row.get(4)?,
                subject_id: row.get(5)?,
                subject_title: row.get(6)?,
                question_id: row.get(7)?,
                question_text: row.get(8)?,
                question_type: row.get(9)?,
                rating: row.get(10)?,
                response_value: row.get(11)?,
                created_at: row.get(12)?,
                context: scope.context(ctx),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Flat stats shape shared by `feedback.stats` and the report hand-off.
pub(super) fn flat_statistics(stats: &RatingStatistics) -> serde_json::Value {
    let d = &stats.rating_distribution;
    json!({
        "totalResponses": stats.total_responses,
        "totalAnswers": stats.total_answers,
        "averageRating": stats.average_rating,
        "rating5": d.count(5),
        "rating4": d.count(4),
        "rating3": d.count(3),
        "rating2": d.count(2),
        "rating1": d.count(1)
    })
}

/// One validated answer ready to be written.
#[derive(Debug, PartialEq)]
struct NewAnswer {
    question_id: String,
    rating: Option<i64>,
    response_value: Option<String>,
}

/// Integer value of a JSON number, accepting floats with no fractional part.
fn whole_number(v: &serde_json::Value) -> Option<i64> {
    v.as_i64().or_else(|| {
        v.as_f64()
            .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
            .map(|f| f as i64)
    })
}

/// Validates submitted answers against the form's questions. Blank answers
/// are dropped; the field that does not apply to a question type is ignored.
fn parse_answers(
    raw: Option<&serde_json::Value>,
    questions: &[QuestionDef],
) -> Result<Vec<NewAnswer>, HandlerErr> {
    let Some(items) = raw.and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("responses must be an array"));
    };
    let by_id: HashMap<&str, &QuestionDef> =
        questions.iter().map(|q| (q.id.as_str(), q)).collect();

    let mut seen: HashSet<&str> = HashSet::new();
    let mut out = Vec::new();
    for item in items {
        let question_id = item
            .get("questionId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| HandlerErr::bad_params("each response needs a questionId"))?;
        let Some(question) = by_id.get(question_id) else {
            return Err(HandlerErr::bad_params("question does not belong to this form")
                .with_details(json!({ "questionId": question_id })));
        };
        if !seen.insert(question_id) {
            return Err(HandlerErr::bad_params("question answered more than once")
                .with_details(json!({ "questionId": question_id })));
        }
        let bad = |msg: &str| {
            HandlerErr::bad_params(msg).with_details(json!({ "questionId": question_id }))
        };

        let answer = match question.question_type {
            QuestionType::Rating => match item.get("rating").filter(|v| !v.is_null()) {
                None => None,
                Some(v) => {
                    let rating = whole_number(v)
                        .filter(|r| (1..=5).contains(r))
                        .ok_or_else(|| bad("rating must be an integer from 1 to 5"))?;
                    Some(NewAnswer {
                        question_id: question_id.to_string(),
                        rating: Some(rating),
                        response_value: None,
                    })
                }
            },
            QuestionType::Text | QuestionType::Choice => {
                let value = match item.get("responseValue").filter(|v| !v.is_null()) {
                    None => String::new(),
                    Some(v) => v
                        .as_str()
                        .map(|s| s.trim().to_string())
                        .ok_or_else(|| bad("responseValue must be a string"))?,
                };
                if value.is_empty() {
                    None
                } else {
                    if question.question_type == QuestionType::Choice {
                        let allowed = question.options.as_deref().unwrap_or_default();
                        if !allowed.iter().any(|o| o == &value) {
                            return Err(bad("answer is not one of the question's options"));
                        }
                    }
                    Some(NewAnswer {
                        question_id: question_id.to_string(),
                        rating: None,
                        response_value: Some(value),
                    })
                }
            }
        };
        out.extend(answer);
    }
    Ok(out)
}

fn handle_feedback_submit(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let student_id = require_role(state, &[Role::Student])?.id.clone();
    let conn = db_conn(state)?;
    let form_id = required_str(req, "formId")?;
    let subject_id = required_str(req, "subjectId")?;

    let form: Option<(String, bool)> = conn
        .query_row(
            "SELECT course_id, is_active FROM feedback_forms WHERE id = ?",
            [&form_id],
            |r| Ok((r.get(0)?, r.get::<_, i64>(1)? != 0)),
        )
        .optional()?;
    let course_id = match form {
        Some((course_id, true)) => course_id,
        _ => return Err(HandlerErr::not_found("feedback form not found or inactive")),
    };
    if !is_enrolled(conn, &student_id, &course_id)? {
        return Err(HandlerErr::forbidden(
            "you must be enrolled in this course to submit feedback",
        ));
    }
    let in_course: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM course_subjects WHERE course_id = ? AND subject_id = ?",
            (&course_id, &subject_id),
            |r| r.get(0),
        )
        .optional()?;
    if in_course.is_none() {
        return Err(HandlerErr::bad_params("subject is not part of this course")
            .with_details(json!({ "subjectId": subject_id })));
    }

    let questions = load_questions(conn, &form_id)?;
    let answers = parse_answers(req.params.get("responses"), &questions)?;
    if answers.is_empty() {
        return Err(HandlerErr::bad_params("at least one answer is required"));
    }

    let submission_id = Uuid::new_v4().to_string();
    let created_at = now_timestamp();
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let replaced = tx
        .execute(
            "DELETE FROM feedback_responses
             WHERE student_id = ? AND form_id = ? AND subject_id = ?",
            (&student_id, &form_id, &subject_id),
        )
        .map_err(|e| HandlerErr::new("db_delete_failed", e.to_string()))?;
    for answer in &answers {
        tx.execute(
            "INSERT INTO feedback_responses(
                id, submission_id, student_id, form_id, subject_id, question_id,
                rating, response_value, created_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                &submission_id,
                &student_id,
                &form_id,
                &subject_id,
                &answer.question_id,
                answer.rating,
                &answer.response_value,
                &created_at,
            ),
        )
        .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    tracing::info!(
        submission_id = %submission_id,
        form_id = %form_id,
        subject_id = %subject_id,
        answers = answers.len(),
        replaced_rows = replaced,
        "feedback submitted"
    );
    Ok(json!({
        "submissionId": submission_id,
        "answerCount": answers.len(),
        "replaced": replaced > 0
    }))
}

fn handle_feedback_subject(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let user = require_role(state, &[Role::Teacher, Role::Admin])?.clone();
    let conn = db_conn(state)?;
    let subject_id = required_str(req, "subjectId")?;

    let owner = subject_owner(conn, &subject_id)?;
    if user.role == Role::Teacher && owner != user.id {
        return Err(HandlerErr::forbidden(
            "you can only view feedback for subjects you teach",
        ));
    }

    let rows = load_rows(conn, RowScope::Subject(&subject_id))?;
    Ok(json!({ "feedback": group_submissions(&rows, user.audience()) }))
}

fn handle_feedback_all(state: &mut AppState, _req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_role(state, &[Role::Admin])?;
    let conn = db_conn(state)?;
    let rows = load_rows(conn, RowScope::All)?;
    Ok(json!({ "feedback": group_submissions(&rows, Audience::Identified) }))
}

fn handle_feedback_my(state: &mut AppState, _req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let student_id = require_role(state, &[Role::Student])?.id.clone();
    let conn = db_conn(state)?;
    let rows = load_rows(conn, RowScope::Student(&student_id))?;
    Ok(json!({ "feedback": group_submissions(&rows, Audience::Identified) }))
}

fn handle_feedback_stats(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let user = require_role(state, &[Role::Teacher, Role::Admin])?.clone();
    let conn = db_conn(state)?;
    let subject_id = required_str(req, "subjectId")?;

    let owner = subject_owner(conn, &subject_id)?;
    if user.role == Role::Teacher && owner != user.id {
        return Err(HandlerErr::forbidden(
            "you can only view stats for subjects you teach",
        ));
    }

    let rows = load_rows(conn, RowScope::Subject(&subject_id))?;
    let stats = rating_statistics(&rows)?;
    Ok(flat_statistics(&stats))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "feedback.submit" => handle_feedback_submit(state, req),
        "feedback.subject" => handle_feedback_subject(state, req),
        "feedback.all" => handle_feedback_all(state, req),
        "feedback.my" => handle_feedback_my(state, req),
        "feedback.stats" => handle_feedback_stats(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn question(id: &str, question_type: QuestionType, options: Option<&[&str]>) -> QuestionDef {
        QuestionDef {
            id: id.to_string(),
            form_id: "f1".to_string(),
            text: format!("Question {id}"),
            question_type,
            order: 0,
            options: options.map(|o| o.iter().map(|s| s.to_string()).collect()),
        }
    }

    fn form_questions() -> Vec<QuestionDef> {
        vec![
            question("q1", QuestionType::Rating, None),
            question("q2", QuestionType::Text, None),
            question("q3", QuestionType::Choice, Some(&["Morning", "Evening"][..])),
        ]
    }

    #[test]
    fn blank_answers_are_skipped() {
        let answers = parse_answers(
            Some(&json!([
                { "questionId": "q1", "rating": null },
                { "questionId": "q2", "responseValue": "   " },
                { "questionId": "q3", "responseValue": "Evening", "rating": 9 }
            ])),
            &form_questions(),
        )
        .expect("answers");
        assert_eq!(
            answers,
            vec![NewAnswer {
                question_id: "q3".to_string(),
                rating: None,
                response_value: Some("Evening".to_string()),
            }]
        );
    }

    #[test]
    fn invalid_answers_are_rejected() {
        let qs = form_questions();
        for bad in [
            json!([{ "questionId": "q1", "rating": 6 }]),
            json!([{ "questionId": "q1", "rating": 4.5 }]),
            json!([{ "questionId": "q3", "responseValue": "Noon" }]),
            json!([{ "questionId": "q9", "rating": 3 }]),
            json!([{ "questionId": "q1", "rating": 3 }, { "questionId": "q1", "rating": 4 }]),
            json!({ "questionId": "q1" }),
        ] {
            let e = parse_answers(Some(&bad), &qs).expect_err("rejected");
            assert_eq!(e.code, "bad_params", "{bad}");
        }
    }

    #[test]
    fn whole_float_ratings_are_accepted() {
        let answers = parse_answers(
            Some(&json!([{ "questionId": "q1", "rating": 4.0 }])),
            &form_questions(),
        )
        .expect("answers");
        assert_eq!(answers[0].rating, Some(4));
        assert_eq!(whole_number(&json!(2.5)), None);
        assert_eq!(whole_number(&json!("4")), None);
    }

    #[test]
    fn flat_statistics_shape() {
        let stats = rating_statistics(&[]).expect("stats");
        assert_eq!(
            flat_statistics(&stats),
            json!({
                "totalResponses": 0,
                "totalAnswers": 0,
                "averageRating": null,
                "rating5": 0, "rating4": 0, "rating3": 0, "rating2": 0, "rating1": 0
            })
        );
    }
}
