use crate::auth::{self, Role, SessionUser};
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::helpers::{db_conn, insert_err, now_timestamp, optional_str, require_session, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_register(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;

    let username = required_str(req, "username")?;
    let email = required_str(req, "email")?.to_ascii_lowercase();
    let name = required_str(req, "name")?;
    let role_raw = required_str(req, "role")?;
    let password = req
        .params
        .get("password")
        .and_then(|v| v.as_str())
        .filter(|p| !p.is_empty())
        .ok_or_else(|| HandlerErr::bad_params("missing password"))?;

    let Some(role) = Role::parse(&role_raw) else {
        return Err(HandlerErr::bad_params("role must be one of: admin, teacher, student")
            .with_details(json!({ "role": role_raw })));
    };

    let (semester, department) = if role == Role::Student {
        let semester = optional_str(req, "semester")?.filter(|s| !s.is_empty());
        let department = optional_str(req, "department")?.filter(|s| !s.is_empty());
        match (semester, department) {
            (Some(s), Some(d)) => (Some(s), Some(d)),
            _ => {
                return Err(HandlerErr::bad_params(
                    "semester and department are required for students",
                ))
            }
        }
    } else {
        (None, None)
    };

    let existing: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM users WHERE email = ? OR username = ?",
            (&email, &username),
            |r| r.get(0),
        )
        .optional()?;
    if existing.is_some() {
        return Err(HandlerErr::conflict("user already exists"));
    }

    let user = SessionUser {
        id: Uuid::new_v4().to_string(),
        username,
        email,
        role,
        name,
        semester,
        department,
    };
    let salt = auth::new_salt();
    conn.execute(
        "INSERT INTO users(id, username, email, role, name, semester, department, password_salt, password_hash, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &user.id,
            &user.username,
            &user.email,
            user.role.as_str(),
            &user.name,
            &user.semester,
            &user.department,
            &salt,
            auth::password_digest(&salt, password),
            now_timestamp(),
        ),
    )
    .map_err(|e| insert_err(e, "user"))?;

    tracing::info!(user_id = %user.id, role = user.role.as_str(), "user registered");
    state.session = Some(user.clone());
    Ok(json!({ "user": user }))
}

fn handle_login(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let email = required_str(req, "email")?.to_ascii_lowercase();
    let password = req
        .params
        .get("password")
        .and_then(|v| v.as_str())
        .filter(|p| !p.is_empty())
        .ok_or_else(|| HandlerErr::bad_params("missing password"))?;

    let row: Option<(String, String, String)> = conn
        .query_row(
            "SELECT id, password_salt, password_hash FROM users WHERE email = ?",
            [&email],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()?;

    let invalid = || HandlerErr::new("invalid_credentials", "invalid credentials");
    let Some((user_id, salt, digest)) = row else {
        return Err(invalid());
    };
    if !auth::verify_password(&salt, password, &digest) {
        tracing::warn!(user_id = %user_id, "login rejected");
        return Err(invalid());
    }
    let user = auth::find_user(conn, &user_id)?.ok_or_else(invalid)?;

    tracing::info!(user_id = %user.id, role = user.role.as_str(), "session started");
    state.session = Some(user.clone());
    Ok(json!({ "user": user }))
}

fn handle_logout(state: &mut AppState, _req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let previous = state.session.take();
    if let Some(user) = &previous {
        tracing::info!(user_id = %user.id, "session ended");
    }
    Ok(json!({ "loggedOut": previous.is_some() }))
}

fn handle_me(state: &mut AppState, _req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let session_id = require_session(state)?.id.clone();
    let conn = db_conn(state)?;
    let user = auth::find_user(conn, &session_id)?
        .ok_or_else(|| HandlerErr::not_found("user not found"))?;
    state.session = Some(user.clone());
    Ok(json!({ "user": user }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "auth.register" => handle_register(state, req),
        "auth.login" => handle_login(state, req),
        "auth.logout" => handle_logout(state, req),
        "auth.me" => handle_me(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
