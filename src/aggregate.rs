//! Feedback aggregation: collates flat joined response rows into per-submission
//! groups and computes rating statistics for the views and the subject report.
//!
//! Everything here is pure and operates on an already-fetched snapshot of rows.

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AggregateError {
    #[error("unknown question type: {0:?}")]
    UnknownQuestionType(String),
    #[error("rating {rating} for question {question_id} is outside 1-5")]
    RatingOutOfRange { question_id: String, rating: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QuestionType {
    Rating,
    Text,
    Choice,
}

impl QuestionType {
    pub fn as_str(self) -> &'static str {
        match self {
            QuestionType::Rating => "rating",
            QuestionType::Text => "text",
            QuestionType::Choice => "choice",
        }
    }
}

impl fmt::Display for QuestionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QuestionType {
    type Err = AggregateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rating" => Ok(QuestionType::Rating),
            "text" => Ok(QuestionType::Text),
            "choice" => Ok(QuestionType::Choice),
            other => Err(AggregateError::UnknownQuestionType(other.to_string())),
        }
    }
}

/// Who is looking at the grouped output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    /// Student identity is included (admins, or a student viewing their own).
    Identified,
    /// Student identity is stripped (teachers).
    Anonymous,
}

/// Per-view extra columns copied onto each group from its first row.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub teacher_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub teacher_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub course_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub course_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub semester: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub department: Option<String>,
}

/// One answer row of the responses/questions/forms/subjects/users join.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseRow {
    pub submission_id: String,
    pub student_id: String,
    pub student_name: String,
    pub form_id: String,
    pub form_title: String,
    pub subject_id: String,
    pub subject_title: String,
    pub question_id: String,
    pub question_text: String,
    pub question_type: QuestionType,
    pub rating: Option<i64>,
    pub response_value: Option<String>,
    pub created_at: String,
    pub context: GroupContext,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Answer {
    pub question_id: String,
    pub question_text: String,
    pub question_type: QuestionType,
    pub rating: Option<i64>,
    pub response_value: Option<String>,
}

impl From<&ResponseRow> for Answer {
    fn from(row: &ResponseRow) -> Self {
        Answer {
            question_id: row.question_id.clone(),
            question_text: row.question_text.clone(),
            question_type: row.question_type,
            rating: row.rating,
            response_value: row.response_value.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub submission_id: String,
    pub form_id: String,
    pub form_title: String,
    pub subject_id: String,
    pub subject_title: String,
    pub created_at: String,
    #[serde(flatten)]
    pub context: GroupContext,
    pub responses: Vec<Answer>,
}

/// A grouped submission, shaped by the audience it was built for.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "visibility", rename_all = "lowercase")]
pub enum SubmissionGroup {
    Identified {
        #[serde(rename = "studentId")]
        student_id: String,
        #[serde(rename = "studentName")]
        student_name: String,
        #[serde(flatten)]
        submission: Submission,
    },
    Anonymous {
        #[serde(flatten)]
        submission: Submission,
    },
}

/// Partition rows by submission id. Groups keep first-seen order and rows
/// keep their input order inside a group.
pub fn group_submissions(rows: &[ResponseRow], audience: Audience) -> Vec<SubmissionGroup> {
    let mut slots: Vec<(&ResponseRow, Vec<Answer>)> = Vec::new();
    let mut by_submission: HashMap<&str, usize> = HashMap::new();

    for row in rows {
        let slot = *by_submission
            .entry(row.submission_id.as_str())
            .or_insert_with(|| {
                slots.push((row, Vec::new()));
                slots.len() - 1
            });
        slots[slot].1.push(Answer::from(row));
    }

    slots
        .into_iter()
        .map(|(first, responses)| {
            let submission = Submission {
                submission_id: first.submission_id.clone(),
                form_id: first.form_id.clone(),
                form_title: first.form_title.clone(),
                subject_id: first.subject_id.clone(),
                subject_title: first.subject_title.clone(),
                created_at: first.created_at.clone(),
                context: first.context.clone(),
                responses,
            };
            match audience {
                Audience::Identified => SubmissionGroup::Identified {
                    student_id: first.student_id.clone(),
                    student_name: first.student_name.clone(),
                    submission,
                },
                Audience::Anonymous => SubmissionGroup::Anonymous { submission },
            }
        })
        .collect()
}

/// Rounds half away from zero to two decimals, as shown on reports.
pub fn round_2_decimals(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Counts of ratings 1 through 5. Serializes as `{"5": n, "4": n, ... "1": n}`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RatingDistribution {
    counts: [usize; 5],
}

impl RatingDistribution {
    pub fn record(&mut self, question_id: &str, rating: i64) -> Result<(), AggregateError> {
        if !(1..=5).contains(&rating) {
            return Err(AggregateError::RatingOutOfRange {
                question_id: question_id.to_string(),
                rating,
            });
        }
        self.counts[(rating - 1) as usize] += 1;
        Ok(())
    }

    pub fn count(&self, rating: i64) -> usize {
        if (1..=5).contains(&rating) {
            self.counts[(rating - 1) as usize]
        } else {
            0
        }
    }

    pub fn total(&self) -> usize {
        self.counts.iter().sum()
    }
}

impl Serialize for RatingDistribution {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(5))?;
        for rating in (1..=5).rev() {
            map.serialize_entry(&rating.to_string(), &self.count(rating))?;
        }
        map.end()
    }
}

#[derive(Debug, Default)]
struct RatingTally {
    distribution: RatingDistribution,
    sum: i64,
}

impl RatingTally {
    fn add(&mut self, row: &ResponseRow) -> Result<(), AggregateError> {
        if let Some(rating) = row.rating {
            self.distribution.record(&row.question_id, rating)?;
            self.sum += rating;
        }
        Ok(())
    }

    fn average(&self) -> Option<f64> {
        let n = self.distribution.total();
        if n == 0 {
            return None;
        }
        Some(round_2_decimals(self.sum as f64 / n as f64))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RatingStatistics {
    pub total_responses: usize,
    pub total_answers: usize,
    pub average_rating: Option<f64>,
    pub rating_distribution: RatingDistribution,
}

/// Statistics over the rating-question rows: distinct students, answer count,
/// mean rating and the 5..1 histogram.
pub fn rating_statistics(rows: &[ResponseRow]) -> Result<RatingStatistics, AggregateError> {
    let mut students: HashSet<&str> = HashSet::new();
    let mut tally = RatingTally::default();
    let mut total_answers = 0;

    for row in rows
        .iter()
        .filter(|r| r.question_type == QuestionType::Rating)
    {
        students.insert(row.student_id.as_str());
        total_answers += 1;
        tally.add(row)?;
    }

    Ok(RatingStatistics {
        total_responses: students.len(),
        total_answers,
        average_rating: tally.average(),
        rating_distribution: tally.distribution,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextResponse {
    pub question: String,
    pub response: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportStatistics {
    pub total_responses: usize,
    pub total_answers: usize,
    pub average_rating: Option<f64>,
    pub rating_distribution: RatingDistribution,
    pub text_responses: Vec<TextResponse>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportSubject {
    pub id: String,
    pub title: String,
    pub code: String,
    pub description: String,
    pub teacher_id: String,
    pub teacher_name: String,
    pub teacher_email: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubjectReport {
    pub subject: ReportSubject,
    pub statistics: ReportStatistics,
    pub feedback: Vec<SubmissionGroup>,
}

/// Builds the per-subject report model consumed by the PDF renderer.
pub fn subject_report(
    subject: ReportSubject,
    rows: &[ResponseRow],
) -> Result<SubjectReport, AggregateError> {
    let feedback = group_submissions(rows, Audience::Identified);

    let mut tally = RatingTally::default();
    let mut text_responses = Vec::new();
    for row in rows {
        match row.question_type {
            QuestionType::Rating => tally.add(row)?,
            QuestionType::Text => {
                if let Some(value) = row.response_value.as_deref().filter(|v| !v.is_empty()) {
                    text_responses.push(TextResponse {
                        question: row.question_text.clone(),
                        response: value.to_string(),
                    });
                }
            }
            QuestionType::Choice => {}
        }
    }

    let statistics = ReportStatistics {
        total_responses: feedback.len(),
        total_answers: rows.len(),
        average_rating: tally.average(),
        rating_distribution: tally.distribution,
        text_responses,
    };

    Ok(SubjectReport {
        subject,
        statistics,
        feedback,
    })
}
