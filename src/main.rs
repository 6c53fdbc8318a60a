mod aggregate;
mod auth;
mod config;
mod db;
mod ipc;

use clap::Parser;
use serde_json::json;
use std::io::{self, BufRead, Write};
use tracing_subscriber::EnvFilter;

use config::Args;

fn init_logging(level: &str) {
    // stdout carries the protocol; logs must stay on stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn main() {
    let args = Args::parse();
    init_logging(&args.log_level);

    let mut state = ipc::AppState::new();
    if let Some(path) = args.workspace {
        match db::open_db(&path) {
            Ok(conn) => {
                tracing::info!(workspace = %path.display(), "workspace opened");
                state.workspace = Some(path);
                state.db = Some(conn);
            }
            Err(e) => tracing::error!(workspace = %path.display(), "failed to open workspace: {e:?}"),
        }
    }

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(e) => {
                tracing::error!("stdin read failed: {e}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let resp = match serde_json::from_str::<ipc::Request>(&line) {
            Ok(req) => ipc::handle_request(&mut state, req),
            Err(e) => {
                // No id to echo back.
                tracing::warn!("rejected request line: {e}");
                json!({ "ok": false, "error": { "code": "bad_json", "message": e.to_string() } })
            }
        };

        let out = serde_json::to_string(&resp)
            .unwrap_or_else(|_| "{\"ok\":false}".to_string());
        if writeln!(stdout, "{out}").and_then(|_| stdout.flush()).is_err() {
            tracing::error!("stdout closed; shutting down");
            break;
        }
    }
}
