mod common;

use common::{submit_ratings, Sidecar};
use serde_json::json;

fn seeded_with_two_submissions() -> (Sidecar, common::Seed) {
    let mut sc = Sidecar::spawn();
    let seed = common::seed(&mut sc);
    sc.login("ada");
    submit_ratings(&mut sc, &seed, 5, 3);
    sc.login("grace");
    submit_ratings(&mut sc, &seed, 4, 4);
    (sc, seed)
}

#[test]
fn teacher_view_is_anonymous_and_keeps_submissions_apart() {
    let (mut sc, seed) = seeded_with_two_submissions();

    sc.login("turing");
    let view = sc.ok("feedback.subject", json!({ "subjectId": seed.subject_id }));
    let groups = view["feedback"].as_array().expect("groups");
    assert_eq!(groups.len(), 2);
    for g in groups {
        assert_eq!(g["visibility"], json!("anonymous"));
        assert!(g.get("studentId").is_none(), "leaked identity: {g}");
        assert!(g.get("studentName").is_none(), "leaked identity: {g}");
        assert_eq!(g["responses"].as_array().map(|a| a.len()), Some(2));
    }
    assert_ne!(groups[0]["submissionId"], groups[1]["submissionId"]);

    let text = view.to_string();
    for id in &seed.student_ids {
        assert!(!text.contains(id.as_str()), "student id in teacher view");
    }
}

#[test]
fn admin_views_are_identified() {
    let (mut sc, seed) = seeded_with_two_submissions();

    sc.login("dean");
    let view = sc.ok("feedback.subject", json!({ "subjectId": seed.subject_id }));
    let mut students: Vec<String> = view["feedback"]
        .as_array()
        .expect("groups")
        .iter()
        .map(|g| {
            assert_eq!(g["visibility"], json!("identified"));
            g["studentId"].as_str().expect("student id").to_string()
        })
        .collect();
    students.sort();
    let mut expected = seed.student_ids.clone();
    expected.sort();
    assert_eq!(students, expected);

    let all = sc.ok("feedback.all", json!({}));
    let groups = all["feedback"].as_array().expect("groups");
    assert_eq!(groups.len(), 2);
    assert_eq!(groups[0]["teacherId"], json!(seed.teacher_id));
    assert_eq!(groups[0]["teacherName"], json!("Teacher turing"));
    assert_eq!(groups[0]["courseTitle"], json!("Computer Science Year 2"));
    for g in groups {
        assert!(g["studentName"].as_str().is_some_and(|n| n.starts_with("Student ")));
    }
}

#[test]
fn subject_access_rules() {
    let (mut sc, seed) = seeded_with_two_submissions();

    sc.register_teacher("hopper");
    assert_eq!(
        sc.err_code("feedback.subject", json!({ "subjectId": seed.subject_id })),
        "forbidden"
    );
    assert_eq!(
        sc.err_code("feedback.stats", json!({ "subjectId": seed.subject_id })),
        "forbidden"
    );
    assert_eq!(
        sc.err_code("feedback.subject", json!({ "subjectId": "missing" })),
        "not_found"
    );

    sc.login("ada");
    assert_eq!(
        sc.err_code("feedback.subject", json!({ "subjectId": seed.subject_id })),
        "forbidden"
    );
    assert_eq!(sc.err_code("feedback.all", json!({})), "forbidden");
    let mine = sc.ok("feedback.my", json!({}));
    let groups = mine["feedback"].as_array().expect("groups");
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0]["studentId"], json!(seed.student_ids[0]));
}

#[test]
fn stats_over_two_students() {
    let (mut sc, seed) = seeded_with_two_submissions();

    sc.login("turing");
    let stats = sc.ok("feedback.stats", json!({ "subjectId": seed.subject_id }));
    assert_eq!(
        stats,
        json!({
            "totalResponses": 2,
            "totalAnswers": 4,
            "averageRating": 4.0,
            "rating5": 1,
            "rating4": 2,
            "rating3": 1,
            "rating2": 0,
            "rating1": 0
        })
    );
}
