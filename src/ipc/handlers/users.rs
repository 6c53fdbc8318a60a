use crate::auth::{user_from_row, Role, USER_COLUMNS};
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::helpers::{db_conn, optional_str, require_role};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

fn handle_users_list(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    require_role(state, &[Role::Admin])?;
    let conn = db_conn(state)?;

    let role = match optional_str(req, "role")? {
        None => None,
        Some(r) => Some(Role::parse(&r).ok_or_else(|| {
            HandlerErr::bad_params("role must be one of: admin, teacher, student")
                .with_details(json!({ "role": r }))
        })?),
    };

    // Password material is never selected.
    let sql = format!(
        "SELECT {USER_COLUMNS}, created_at
         FROM users
         WHERE (?1 IS NULL OR role = ?1)
         ORDER BY created_at DESC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let users = stmt
        .query_map([role.map(|r| r.as_str())], |row| {
            let user = user_from_row(row)?;
            let created_at: String = row.get(7)?;
            let mut v = json!(user);
            v["createdAt"] = json!(created_at);
            Ok(v)
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(json!({ "users": users }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "users.list" => handle_users_list(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
