use crate::auth::{Role, SessionUser};
use crate::ipc::error::HandlerErr;
use crate::ipc::types::{AppState, Request};
use chrono::{SecondsFormat, Utc};
use rusqlite::{Connection, ErrorCode};

pub fn db_conn(state: &AppState) -> Result<&Connection, HandlerErr> {
    state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

pub fn require_session(state: &AppState) -> Result<&SessionUser, HandlerErr> {
    state
        .session
        .as_ref()
        .ok_or_else(|| HandlerErr::new("unauthenticated", "log in first"))
}

pub fn require_role<'a>(state: &'a AppState, roles: &[Role]) -> Result<&'a SessionUser, HandlerErr> {
    let user = require_session(state)?;
    if !roles.contains(&user.role) {
        let allowed: Vec<&str> = roles.iter().map(|r| r.as_str()).collect();
        return Err(HandlerErr::forbidden(format!(
            "method requires role: {}",
            allowed.join(" or ")
        )));
    }
    Ok(user)
}

pub fn required_str(req: &Request, key: &str) -> Result<String, HandlerErr> {
    match optional_str(req, key)? {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(HandlerErr::bad_params(format!("missing {}", key))),
    }
}

/// Trimmed string param; absent or null is `None`, any other non-string is rejected.
pub fn optional_str(req: &Request, key: &str) -> Result<Option<String>, HandlerErr> {
    match req.params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v
            .as_str()
            .map(|s| Some(s.trim().to_string()))
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be a string", key))),
    }
}

pub fn optional_bool(req: &Request, key: &str) -> Result<Option<bool>, HandlerErr> {
    match req.params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v
            .as_bool()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be a boolean", key))),
    }
}

pub fn optional_str_list(req: &Request, key: &str) -> Result<Option<Vec<String>>, HandlerErr> {
    let Some(v) = req.params.get(key).filter(|v| !v.is_null()) else {
        return Ok(None);
    };
    let Some(items) = v.as_array() else {
        return Err(HandlerErr::bad_params(format!("{} must be an array", key)));
    };
    items
        .iter()
        .map(|item| {
            item.as_str()
                .map(|s| s.to_string())
                .ok_or_else(|| HandlerErr::bad_params(format!("{} must contain strings", key)))
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}

pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _) if f.code == ErrorCode::ConstraintViolation
            && f.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

/// Maps a unique-constraint failure to `conflict`, anything else to a db error.
pub fn insert_err(e: rusqlite::Error, what: &str) -> HandlerErr {
    if is_unique_violation(&e) {
        HandlerErr::conflict(format!("{} already exists", what))
    } else {
        HandlerErr::new("db_insert_failed", e.to_string())
    }
}
