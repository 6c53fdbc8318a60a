mod common;

use common::Sidecar;
use serde_json::json;

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let mut sc = Sidecar::spawn();

    let health = sc.ok("health", json!({}));
    assert_eq!(health["version"], json!(env!("CARGO_PKG_VERSION")));
    assert!(health["workspacePath"].is_string());
    assert_eq!(health["user"], json!(null));

    let seed = common::seed(&mut sc);
    sc.login("dean");

    // Every family answers with something other than not_implemented.
    for (method, params) in [
        ("auth.me", json!({})),
        ("users.list", json!({})),
        ("subjects.list", json!({})),
        ("courses.list", json!({})),
        ("forms.listByCourse", json!({ "courseId": seed.course_id })),
        ("feedback.all", json!({})),
        ("feedback.stats", json!({ "subjectId": seed.subject_id })),
        ("reports.subject", json!({ "subjectId": seed.subject_id })),
    ] {
        let value = sc.request(method, params);
        assert_eq!(value["ok"], json!(true), "{method}: {value}");
    }

    let value = sc.request("grades.compute", json!({}));
    assert_eq!(value["ok"], json!(false));
    assert_eq!(value["error"]["code"], json!("not_implemented"));
}

#[test]
fn malformed_lines_get_bad_json_and_the_loop_continues() {
    let mut sc = Sidecar::spawn();

    let value = sc.send_line("{ not json");
    assert_eq!(value["ok"], json!(false));
    assert_eq!(value["error"]["code"], json!("bad_json"));

    let health = sc.ok("health", json!({}));
    assert!(health["version"].is_string());
}

#[test]
fn methods_need_a_workspace_then_a_session() {
    let mut sc = Sidecar::start(&[]);
    assert_eq!(sc.err_code("subjects.list", json!({})), "unauthenticated");
    assert_eq!(
        sc.err_code(
            "auth.login",
            json!({ "email": "x@institute.edu", "password": "pw" })
        ),
        "no_workspace"
    );

    let path = sc.workspace.path().to_string_lossy().to_string();
    sc.ok("workspace.select", json!({ "path": path }));
    assert_eq!(sc.err_code("subjects.list", json!({})), "unauthenticated");
    assert_eq!(sc.err_code("workspace.select", json!({})), "bad_params");
}

#[test]
fn workspace_flag_opens_database_at_startup() {
    let dir = tempfile::tempdir().expect("workspace");
    let path = dir.path().to_string_lossy().to_string();
    let mut sc = Sidecar::start(&["--workspace", &path]);

    let health = sc.ok("health", json!({}));
    assert_eq!(health["workspacePath"], json!(path));
    sc.register_admin("dean");
    assert!(dir.path().join("feedback.sqlite3").exists());
}
