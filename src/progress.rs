use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::Serialize;
use tracing::info;

use crate::db;
use crate::errors::{Result, ScoringError};
use crate::models::{AbsenceKind, CriteriaKey, Score, Student, Teacher};
use crate::store::DocumentStore;

const MIN_PHONE_DIGITS: usize = 9;

/// Strips everything but digits and rewrites local Saudi mobile numbers
/// (`05xxxxxxxx` or `5xxxxxxxx`) to the `966` international form.
pub fn normalize_phone(raw: &str) -> String {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() == 10 && digits.starts_with("05") {
        format!("966{}", &digits[1..])
    } else if digits.len() == 9 && digits.starts_with('5') {
        format!("966{digits}")
    } else {
        digits
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AbsenceRecord {
    pub date: NaiveDate,
    pub points: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CriterionStats {
    pub positive: i64,
    pub negative: i64,
    pub count: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScoreSummary {
    pub total_points: i64,
    /// Newest first.
    pub excused_absences: Vec<AbsenceRecord>,
    pub unexcused_absences: Vec<AbsenceRecord>,
    /// Keyed by criterion name.
    pub criteria: BTreeMap<String, CriterionStats>,
}

impl ScoreSummary {
    pub fn absence_days(&self) -> usize {
        self.excused_absences.len() + self.unexcused_absences.len()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StudentProgress {
    pub student: Student,
    #[serde(flatten)]
    pub summary: ScoreSummary,
    pub group_name: Option<String>,
    pub teachers: Vec<Teacher>,
}

/// Finds the students registered under a parent's phone number.
pub async fn find_children(store: &dyn DocumentStore, raw_phone: &str) -> Result<Vec<Student>> {
    let phone = normalize_phone(raw_phone);
    if phone.len() < MIN_PHONE_DIGITS {
        return Err(ScoringError::Validation(format!(
            "phone number {raw_phone:?} is too short"
        )));
    }

    let children = db::students_by_parent_phone(store, &phone).await?;
    if children.is_empty() {
        return Err(ScoringError::NotFound(format!("students for phone {phone}")));
    }
    info!(phone = %phone, count = children.len(), "parent lookup");
    Ok(children)
}

pub fn summarize_scores(scores: &[Score]) -> ScoreSummary {
    let mut summary = ScoreSummary::default();

    for score in scores {
        summary.total_points += score.points;

        if score.criteria_id == CriteriaKey::Absence {
            let record = AbsenceRecord {
                date: score.date,
                points: score.points,
            };
            match AbsenceKind::from_label(&score.criteria_name) {
                AbsenceKind::Excused => summary.excused_absences.push(record),
                AbsenceKind::Unexcused => summary.unexcused_absences.push(record),
            }
            continue;
        }

        let name = if score.criteria_name.is_empty() {
            "Other".to_string()
        } else {
            score.criteria_name.clone()
        };
        let stats = summary.criteria.entry(name).or_default();
        stats.count += 1;
        if score.points > 0 {
            stats.positive += score.points;
        } else {
            stats.negative += score.points;
        }
    }

    summary.excused_absences.sort_by(|a, b| b.date.cmp(&a.date));
    summary.unexcused_absences.sort_by(|a, b| b.date.cmp(&a.date));
    summary
}

pub async fn student_progress(store: &dyn DocumentStore, student_id: &str) -> Result<StudentProgress> {
    let student = db::get_student(store, student_id)
        .await?
        .ok_or_else(|| ScoringError::NotFound(format!("student {student_id}")))?;

    let scores = db::scores_for_student(store, student_id).await?;
    let summary = summarize_scores(&scores);

    let group_name = db::groups_containing(store, student_id)
        .await?
        .into_iter()
        .next()
        .map(|group| group.name);
    let teachers = db::teachers_by_level(store, student.level).await?;

    Ok(StudentProgress {
        student,
        summary,
        group_name,
        teachers,
    })
}
