use crate::aggregate::Audience;
use rusqlite::{Connection, OptionalExtension, Row};
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Teacher,
    Student,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Teacher => "teacher",
            Role::Student => "student",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "admin" => Some(Role::Admin),
            "teacher" => Some(Role::Teacher),
            "student" => Some(Role::Student),
            _ => None,
        }
    }
}

/// The authenticated caller of this sidecar.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionUser {
    pub id: String,
    pub username: String,
    pub email: String,
    pub role: Role,
    pub name: String,
    pub semester: Option<String>,
    pub department: Option<String>,
}

impl SessionUser {
    /// Teachers only ever see anonymized feedback.
    pub fn audience(&self) -> Audience {
        match self.role {
            Role::Teacher => Audience::Anonymous,
            Role::Admin | Role::Student => Audience::Identified,
        }
    }

    /// Students see courses of their own semester and department only.
    pub fn matches_cohort(&self, semester: &str, department: &str) -> bool {
        self.semester.as_deref() == Some(semester) && self.department.as_deref() == Some(department)
    }
}

pub const USER_COLUMNS: &str = "id, username, email, role, name, semester, department";

/// Maps a row selected with [`USER_COLUMNS`]. An unknown stored role fails the row.
pub fn user_from_row(row: &Row<'_>) -> rusqlite::Result<SessionUser> {
    let role: String = row.get(3)?;
    let role = Role::parse(&role).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            format!("unknown role {role:?}").into(),
        )
    })?;
    Ok(SessionUser {
        id: row.get(0)?,
        username: row.get(1)?,
        email: row.get(2)?,
        role,
        name: row.get(4)?,
        semester: row.get(5)?,
        department: row.get(6)?,
    })
}

pub fn find_user(conn: &Connection, user_id: &str) -> rusqlite::Result<Option<SessionUser>> {
    conn.query_row(
        &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?"),
        [user_id],
        user_from_row,
    )
    .optional()
}

pub fn new_salt() -> String {
    Uuid::new_v4().simple().to_string()
}

pub fn password_digest(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub fn verify_password(salt: &str, password: &str, expected_digest: &str) -> bool {
    password_digest(salt, password) == expected_digest
}
