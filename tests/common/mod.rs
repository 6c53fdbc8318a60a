#![allow(dead_code)]

use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use tempfile::TempDir;

pub const PASSWORD: &str = "correct horse";

/// A running sidecar bound to a fresh temporary workspace.
pub struct Sidecar {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    next_id: u64,
    pub workspace: TempDir,
}

impl Sidecar {
    /// Spawns and selects the temporary workspace over IPC.
    pub fn spawn() -> Self {
        let mut sc = Self::start(&[]);
        let path = sc.workspace.path().to_string_lossy().to_string();
        sc.ok("workspace.select", json!({ "path": path }));
        sc
    }

    /// Spawns with extra command-line args and no workspace selected.
    pub fn start(args: &[&str]) -> Self {
        let workspace = tempfile::tempdir().expect("temp workspace");
        let exe = env!("CARGO_BIN_EXE_feedbackd");
        let mut child = Command::new(exe)
            .args(args)
            .env_remove("FEEDBACKD_WORKSPACE")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn feedbackd");
        let stdin = child.stdin.take().expect("child stdin");
        let stdout = child.stdout.take().expect("child stdout");
        Sidecar {
            child,
            stdin,
            reader: BufReader::new(stdout),
            next_id: 0,
            workspace,
        }
    }

    pub fn send_line(&mut self, line: &str) -> serde_json::Value {
        writeln!(self.stdin, "{}", line).expect("write request");
        self.stdin.flush().expect("flush request");
        let mut out = String::new();
        self.reader.read_line(&mut out).expect("read response line");
        assert!(!out.trim().is_empty(), "empty response for {}", line);
        serde_json::from_str(out.trim()).expect("parse response json")
    }

    pub fn request(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        self.next_id += 1;
        let id = self.next_id.to_string();
        let payload = json!({ "id": id, "method": method, "params": params });
        let value = self.send_line(&payload.to_string());
        assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id.as_str()));
        value
    }

    /// Sends a request that must succeed and returns its `result`.
    pub fn ok(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        let value = self.request(method, params);
        assert_eq!(
            value.get("ok").and_then(|v| v.as_bool()),
            Some(true),
            "{} failed: {}",
            method,
            value
        );
        value["result"].clone()
    }

    /// Sends a request that must fail and returns its error code.
    pub fn err_code(&mut self, method: &str, params: serde_json::Value) -> String {
        let value = self.request(method, params);
        assert_eq!(
            value.get("ok").and_then(|v| v.as_bool()),
            Some(false),
            "{} unexpectedly succeeded: {}",
            method,
            value
        );
        value["error"]["code"]
            .as_str()
            .expect("error code")
            .to_string()
    }

    pub fn register_admin(&mut self, username: &str) -> String {
        self.register(json!({
            "username": username,
            "email": format!("{username}@institute.edu"),
            "name": format!("Admin {username}"),
            "role": "admin",
            "password": PASSWORD
        }))
    }

    pub fn register_teacher(&mut self, username: &str) -> String {
        self.register(json!({
            "username": username,
            "email": format!("{username}@institute.edu"),
            "name": format!("Teacher {username}"),
            "role": "teacher",
            "password": PASSWORD
        }))
    }

    pub fn register_student(&mut self, username: &str, semester: &str, department: &str) -> String {
        self.register(json!({
            "username": username,
            "email": format!("{username}@institute.edu"),
            "name": format!("Student {username}"),
            "role": "student",
            "password": PASSWORD,
            "semester": semester,
            "department": department
        }))
    }

    fn register(&mut self, params: serde_json::Value) -> String {
        let result = self.ok("auth.register", params);
        result["user"]["id"].as_str().expect("user id").to_string()
    }

    pub fn login(&mut self, username: &str) {
        self.ok(
            "auth.login",
            json!({ "email": format!("{username}@institute.edu"), "password": PASSWORD }),
        );
    }
}

impl Drop for Sidecar {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Ids of a seeded course with one subject, one active form and enrolled students.
pub struct Seed {
    pub teacher_id: String,
    pub subject_id: String,
    pub course_id: String,
    pub form_id: String,
    /// Rating, rating, text, choice.
    pub question_ids: Vec<String>,
    pub student_ids: Vec<String>,
}

/// Users: admin `dean`, teacher `turing`, students `ada` and `grace`
/// (semester 3, CS), both enrolled in course CS-3.
pub fn seed(sc: &mut Sidecar) -> Seed {
    sc.register_admin("dean");
    let teacher_id = sc.register_teacher("turing");
    let subject = sc.ok(
        "subjects.create",
        json!({ "title": "Computability", "description": "Machines and limits", "code": "CS301" }),
    );
    let subject_id = subject["subject"]["id"].as_str().expect("subject id").to_string();

    sc.login("dean");
    let course = sc.ok(
        "courses.create",
        json!({
            "title": "Computer Science Year 2",
            "description": "Third semester core",
            "code": "CS-3",
            "semester": "3",
            "department": "CS",
            "subjectIds": [subject_id]
        }),
    );
    let course_id = course["course"]["id"].as_str().expect("course id").to_string();

    let form = sc.ok(
        "forms.create",
        json!({
            "courseId": course_id,
            "title": "Midterm feedback",
            "questions": [
                { "text": "Clarity of lectures" },
                { "text": "Pace of the course", "type": "rating" },
                { "text": "What should change?", "type": "text" },
                { "text": "Preferred lab slot", "type": "choice", "options": ["Morning", "Evening"] }
            ]
        }),
    );
    let form_id = form["form"]["id"].as_str().expect("form id").to_string();
    let question_ids = form["form"]["questions"]
        .as_array()
        .expect("questions")
        .iter()
        .map(|q| q["id"].as_str().expect("question id").to_string())
        .collect();

    let mut student_ids = Vec::new();
    for name in ["ada", "grace"] {
        student_ids.push(sc.register_student(name, "3", "CS"));
        sc.ok("enrollments.create", json!({ "courseId": course_id }));
    }

    Seed {
        teacher_id,
        subject_id,
        course_id,
        form_id,
        question_ids,
        student_ids,
    }
}

/// Submits ratings for the two rating questions as the current student.
pub fn submit_ratings(sc: &mut Sidecar, seed: &Seed, clarity: i64, pace: i64) -> serde_json::Value {
    sc.ok(
        "feedback.submit",
        json!({
            "formId": seed.form_id,
            "subjectId": seed.subject_id,
            "responses": [
                { "questionId": seed.question_ids[0], "rating": clarity },
                { "questionId": seed.question_ids[1], "rating": pace }
            ]
        }),
    )
}
