use crate::aggregate::QuestionType;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::Connection;
use std::path::Path;
use uuid::Uuid;

pub const DB_FILE_NAME: &str = "feedback.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id TEXT PRIMARY KEY,
            username TEXT NOT NULL UNIQUE,
            email TEXT NOT NULL UNIQUE,
            role TEXT NOT NULL,
            name TEXT NOT NULL,
            semester TEXT,
            department TEXT,
            password_salt TEXT NOT NULL,
            password_hash TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_users_role ON users(role)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            description TEXT NOT NULL,
            code TEXT NOT NULL UNIQUE,
            teacher_id TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(teacher_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subjects_teacher ON subjects(teacher_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS courses(
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            description TEXT NOT NULL,
            code TEXT NOT NULL UNIQUE,
            semester TEXT NOT NULL,
            department TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_courses_cohort ON courses(semester, department)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS course_subjects(
            course_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            PRIMARY KEY(course_id, subject_id),
            FOREIGN KEY(course_id) REFERENCES courses(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_course_subjects_subject ON course_subjects(subject_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS enrollments(
            student_id TEXT NOT NULL,
            course_id TEXT NOT NULL,
            enrolled_at TEXT NOT NULL,
            PRIMARY KEY(student_id, course_id),
            FOREIGN KEY(student_id) REFERENCES users(id),
            FOREIGN KEY(course_id) REFERENCES courses(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_course ON enrollments(course_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS feedback_forms(
            id TEXT PRIMARY KEY,
            course_id TEXT NOT NULL,
            title TEXT NOT NULL,
            description TEXT,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            FOREIGN KEY(course_id) REFERENCES courses(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_feedback_forms_course ON feedback_forms(course_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS feedback_form_questions(
            id TEXT PRIMARY KEY,
            form_id TEXT NOT NULL,
            question_text TEXT NOT NULL,
            question_type TEXT NOT NULL,
            question_order INTEGER NOT NULL,
            FOREIGN KEY(form_id) REFERENCES feedback_forms(id)
        )",
        [],
    )?;
    // Choice options arrived after the first schema; older workspaces lack the column.
    ensure_questions_options(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_questions_form_order ON feedback_form_questions(form_id, question_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS feedback_responses(
            id TEXT PRIMARY KEY,
            submission_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            form_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            question_id TEXT NOT NULL,
            rating INTEGER,
            response_value TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES users(id),
            FOREIGN KEY(form_id) REFERENCES feedback_forms(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(question_id) REFERENCES feedback_form_questions(id)
        )",
        [],
    )?;
    ensure_responses_submission_id(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_responses_submission ON feedback_responses(submission_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_responses_subject ON feedback_responses(subject_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_responses_student_form_subject
         ON feedback_responses(student_id, form_id, subject_id)",
        [],
    )?;

    Ok(conn)
}

fn ensure_questions_options(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "feedback_form_questions", "options")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE feedback_form_questions ADD COLUMN options TEXT", [])?;
    Ok(())
}

fn ensure_responses_submission_id(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "feedback_responses", "submission_id")? {
        conn.execute(
            "ALTER TABLE feedback_responses ADD COLUMN submission_id TEXT",
            [],
        )?;
    }

    // Rows written before submissions had their own id are keyed by
    // (student, form, subject); give each such triple one fresh id.
    let mut stmt = conn.prepare(
        "SELECT DISTINCT student_id, form_id, subject_id
         FROM feedback_responses
         WHERE submission_id IS NULL",
    )?;
    let triples = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    if triples.is_empty() {
        return Ok(());
    }

    let tx = conn.unchecked_transaction()?;
    for (student_id, form_id, subject_id) in &triples {
        tx.execute(
            "UPDATE feedback_responses SET submission_id = ?
             WHERE submission_id IS NULL AND student_id = ? AND form_id = ? AND subject_id = ?",
            (
                Uuid::new_v4().to_string(),
                student_id,
                form_id,
                subject_id,
            ),
        )?;
    }
    tx.commit()?;
    tracing::info!(
        submissions = triples.len(),
        "backfilled submission ids for existing feedback"
    );
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

impl FromSql for QuestionType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

impl ToSql for QuestionType {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_db_is_idempotent() {
        let dir = tempfile::tempdir().expect("temp dir");
        drop(open_db(dir.path()).expect("first open"));
        let conn = open_db(dir.path()).expect("second open");
        assert!(table_has_column(&conn, "feedback_responses", "submission_id").expect("probe"));
        assert!(table_has_column(&conn, "feedback_form_questions", "options").expect("probe"));
    }

    #[test]
    fn legacy_responses_get_one_submission_id_per_triple() {
        let dir = tempfile::tempdir().expect("temp dir");
        {
            let conn = Connection::open(dir.path().join(DB_FILE_NAME)).expect("open raw");
            conn.execute(
                "CREATE TABLE feedback_form_questions(
                    id TEXT PRIMARY KEY,
                    form_id TEXT NOT NULL,
                    question_text TEXT NOT NULL,
                    question_type TEXT NOT NULL,
                    question_order INTEGER NOT NULL
                )",
                [],
            )
            .expect("create questions");
            conn.execute(
                "CREATE TABLE feedback_responses(
                    id TEXT PRIMARY KEY,
                    student_id TEXT NOT NULL,
                    form_id TEXT NOT NULL,
                    subject_id TEXT NOT NULL,
                    question_id TEXT NOT NULL,
                    rating INTEGER,
                    response_value TEXT,
                    created_at TEXT NOT NULL
                )",
                [],
            )
            .expect("create responses");
            for (id, student, question) in [("r1", "s1", "q1"), ("r2", "s1", "q2"), ("r3", "s2", "q1")] {
                conn.execute(
                    "INSERT INTO feedback_responses(id, student_id, form_id, subject_id, question_id, rating, created_at)
                     VALUES(?, ?, 'f1', 'sub1', ?, 4, '2025-01-01T00:00:00Z')",
                    (id, student, question),
                )
                .expect("insert legacy row");
            }
        }

        let conn = open_db(dir.path()).expect("migrate");
        assert!(table_has_column(&conn, "feedback_form_questions", "options").expect("probe"));

        let missing: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM feedback_responses WHERE submission_id IS NULL",
                [],
                |r| r.get(0),
            )
            .expect("count missing");
        assert_eq!(missing, 0);

        let per_student: Vec<(String, i64)> = conn
            .prepare(
                "SELECT student_id, COUNT(DISTINCT submission_id)
                 FROM feedback_responses GROUP BY student_id ORDER BY student_id",
            )
            .expect("prepare")
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))
            .expect("query")
            .collect::<Result<_, _>>()
            .expect("collect");
        assert_eq!(per_student, vec![("s1".to_string(), 1), ("s2".to_string(), 1)]);

        let distinct: i64 = conn
            .query_row(
                "SELECT COUNT(DISTINCT submission_id) FROM feedback_responses",
                [],
                |r| r.get(0),
            )
            .expect("count distinct");
        assert_eq!(distinct, 2);
    }

    #[test]
    fn question_type_round_trips_through_sqlite() {
        let conn = Connection::open_in_memory().expect("memory db");
        let stored: QuestionType = conn
            .query_row("SELECT ?", [QuestionType::Choice], |r| r.get(0))
            .expect("select");
        assert_eq!(stored, QuestionType::Choice);

        let bad: rusqlite::Result<QuestionType> =
            conn.query_row("SELECT 'slider'", [], |r| r.get(0));
        assert!(bad.is_err());
    }
}
