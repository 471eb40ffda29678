use std::fmt::Write;

use chrono::{Datelike, Duration, NaiveDate};
use serde::Serialize;

use crate::db;
use crate::errors::{Result, ScoringError};
use crate::models::{ActivityDay, Competition, CriteriaKey, Group, Score};
use crate::store::DocumentStore;

/// Sunday through Thursday.
pub const REPORT_DAYS: i64 = 5;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CriterionLine {
    pub criterion_id: String,
    pub name: String,
    pub earned: i64,
    pub possible: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivityLine {
    pub days: usize,
    pub earned: i64,
    pub possible: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AbsenceItem {
    pub student_id: String,
    pub date: NaiveDate,
    pub label: String,
    pub points: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportTotals {
    pub week: Vec<NaiveDate>,
    pub member_count: usize,
    pub criteria: Vec<CriterionLine>,
    pub activity: Option<ActivityLine>,
    pub absences: Vec<AbsenceItem>,
    pub earned: i64,
    pub possible: i64,
}

/// Most recent Sunday on or before `today`.
pub fn week_start(today: NaiveDate) -> NaiveDate {
    today - Duration::days(i64::from(today.weekday().num_days_from_sunday()))
}

pub fn week_dates(start: NaiveDate) -> Vec<NaiveDate> {
    (0..REPORT_DAYS)
        .map(|offset| start + Duration::days(offset))
        .collect()
}

fn compute(
    members: &[String],
    competition: &Competition,
    scores: &[Score],
    activity_days: &[ActivityDay],
    start: NaiveDate,
) -> ReportTotals {
    let week = week_dates(start);
    let scores: Vec<&Score> = scores
        .iter()
        .filter(|score| score.competition_id == competition.id)
        .filter(|score| week.contains(&score.date))
        .filter(|score| members.contains(&score.student_id))
        .collect();

    // One marker per date counts, even if duplicates slipped in.
    let mut activity_dates: Vec<NaiveDate> = Vec::new();
    let mut activity_possible = 0i64;
    for day in activity_days {
        if day.competition_id != competition.id
            || !week.contains(&day.date)
            || activity_dates.contains(&day.date)
        {
            continue;
        }
        activity_dates.push(day.date);
        activity_possible += day.points;
    }

    let member_count = members.len() as i64;
    let normal_days = (REPORT_DAYS - activity_dates.len() as i64).max(0);

    let criteria: Vec<CriterionLine> = competition
        .criteria
        .iter()
        .map(|criterion| CriterionLine {
            criterion_id: criterion.id.clone(),
            name: criterion.name.clone(),
            earned: scores
                .iter()
                .filter(|score| {
                    matches!(&score.criteria_id, CriteriaKey::Criterion(id) if *id == criterion.id)
                })
                .map(|score| score.points)
                .sum(),
            possible: criterion.positive_points * normal_days * member_count,
        })
        .collect();

    let activity = (!activity_dates.is_empty()).then(|| ActivityLine {
        days: activity_dates.len(),
        earned: scores
            .iter()
            .filter(|score| score.criteria_id == CriteriaKey::Activity)
            .map(|score| score.points)
            .sum(),
        possible: activity_possible * member_count,
    });

    let mut absences: Vec<AbsenceItem> = scores
        .iter()
        .filter(|score| score.criteria_id == CriteriaKey::Absence)
        .map(|score| AbsenceItem {
            student_id: score.student_id.clone(),
            date: score.date,
            label: score.criteria_name.clone(),
            points: score.points.saturating_abs().saturating_neg(),
        })
        .collect();
    absences.sort_by(|a, b| a.date.cmp(&b.date));

    let earned = criteria.iter().map(|line| line.earned).sum::<i64>()
        + activity.as_ref().map_or(0, |line| line.earned)
        + absences.iter().map(|item| item.points).sum::<i64>();
    let possible = criteria.iter().map(|line| line.possible).sum::<i64>()
        + activity.as_ref().map_or(0, |line| line.possible);

    ReportTotals {
        week,
        member_count: members.len(),
        criteria,
        activity,
        absences,
        earned,
        possible,
    }
}

pub fn compute_student_report(
    student_id: &str,
    competition: &Competition,
    scores: &[Score],
    activity_days: &[ActivityDay],
    start: NaiveDate,
) -> ReportTotals {
    compute(
        &[student_id.to_string()],
        competition,
        scores,
        activity_days,
        start,
    )
}

/// Group report: possible points scale with the number of current members.
pub fn compute_group_report(
    group: &Group,
    competition: &Competition,
    scores: &[Score],
    activity_days: &[ActivityDay],
    start: NaiveDate,
) -> Result<ReportTotals> {
    if group.members.is_empty() {
        return Err(ScoringError::Validation(format!(
            "group {} has no members",
            group.name
        )));
    }
    Ok(compute(
        &group.members,
        competition,
        scores,
        activity_days,
        start,
    ))
}

pub async fn student_weekly_report(
    store: &dyn DocumentStore,
    student_id: &str,
    competition: &Competition,
    today: NaiveDate,
) -> Result<ReportTotals> {
    let start = week_start(today);
    let week = week_dates(start);
    let scores = db::scores_in_window(store, &competition.id, &week).await?;
    let activity_days = db::activity_days_in_window(store, &competition.id, &week).await?;
    Ok(compute_student_report(
        student_id,
        competition,
        &scores,
        &activity_days,
        start,
    ))
}

pub async fn group_weekly_report(
    store: &dyn DocumentStore,
    group: &Group,
    competition: &Competition,
    today: NaiveDate,
) -> Result<ReportTotals> {
    let start = week_start(today);
    let week = week_dates(start);
    let scores = db::scores_in_window(store, &competition.id, &week).await?;
    let activity_days = db::activity_days_in_window(store, &competition.id, &week).await?;
    compute_group_report(group, competition, &scores, &activity_days, start)
}

pub fn render_markdown(title: &str, report: &ReportTotals) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Weekly Report: {title}");
    if let (Some(first), Some(last)) = (report.week.first(), report.week.last()) {
        let _ = writeln!(output, "Week of {first} to {last}");
    }
    if report.member_count > 1 {
        let _ = writeln!(output, "Students: {}", report.member_count);
    }
    let _ = writeln!(output);
    let _ = writeln!(output, "## Criteria");

    if report.criteria.is_empty() {
        let _ = writeln!(output, "No criteria defined for this competition.");
    } else {
        for line in &report.criteria {
            let _ = writeln!(output, "- {}: {} / {}", line.name, line.earned, line.possible);
        }
    }

    if let Some(activity) = &report.activity {
        let _ = writeln!(output);
        let _ = writeln!(output, "## Activity Days");
        let _ = writeln!(
            output,
            "- {} day(s): {} / {}",
            activity.days, activity.earned, activity.possible
        );
    }

    if !report.absences.is_empty() {
        let deduction: i64 = report.absences.iter().map(|item| item.points).sum();
        let _ = writeln!(output);
        let _ = writeln!(output, "## Absences ({deduction})");
        for item in &report.absences {
            let label = if item.label.is_empty() {
                "Absence"
            } else {
                item.label.as_str()
            };
            let _ = writeln!(output, "- {} ({}): {}", item.date, label, item.points);
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "**Total: {} / {}**", report.earned, report.possible);

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Criterion, Level, ScoreKind};

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, d).unwrap_or_default()
    }

    fn competition(criteria: &[(&str, i64)]) -> Competition {
        Competition {
            id: "comp".to_string(),
            name: "Autumn".to_string(),
            level: Some(Level::Middle),
            icon: String::new(),
            criteria: criteria
                .iter()
                .map(|(id, points)| Criterion {
                    id: id.to_string(),
                    name: id.to_uppercase(),
                    positive_points: *points,
                    negative_points: 1,
                })
                .collect(),
            absent_excuse: 1,
            absent_no_excuse: 4,
            activity_points: 10,
            activity_absent_points: 5,
            active: true,
            created_at: None,
            updated_at: None,
        }
    }

    fn score(student_id: &str, criteria: &str, points: i64, date: NaiveDate) -> Score {
        Score {
            id: String::new(),
            student_id: student_id.to_string(),
            competition_id: "comp".to_string(),
            group_id: None,
            criteria_id: CriteriaKey::from(criteria),
            criteria_name: criteria.to_string(),
            points,
            kind: ScoreKind::Positive,
            date,
            level: None,
            created_at: None,
            updated_at: None,
        }
    }

    fn activity_day(date: NaiveDate, points: i64) -> ActivityDay {
        ActivityDay {
            id: date.to_string(),
            competition_id: "comp".to_string(),
            date,
            points,
        }
    }

    #[test]
    fn week_starts_on_the_latest_sunday() {
        // 2026-10-18 is a Sunday.
        assert_eq!(week_start(day(18)), day(18));
        assert_eq!(week_start(day(21)), day(18));
        assert_eq!(week_start(day(24)), day(18));
        assert_eq!(week_start(day(25)), day(25));

        let week = week_dates(day(18));
        assert_eq!(week, vec![day(18), day(19), day(20), day(21), day(22)]);
    }

    #[test]
    fn full_week_without_activity_days_is_five_times_the_criterion() {
        let competition = competition(&[("x", 5)]);
        let report = compute_student_report("s1", &competition, &[], &[], day(18));
        assert_eq!(report.possible, 25);
        assert_eq!(report.earned, 0);
        assert!(report.activity.is_none());
    }

    #[test]
    fn activity_day_replaces_a_normal_day_in_possible_points() {
        let competition = competition(&[("x", 5)]);
        let scores = vec![score("s1", "ACTIVITY_DAY", 10, day(20))];
        let days = vec![activity_day(day(20), 10)];

        let report = compute_student_report("s1", &competition, &scores, &days, day(18));
        assert_eq!(report.criteria[0].possible, 20);
        let activity = report.activity.expect("activity line present");
        assert_eq!(activity.possible, 10);
        assert_eq!(activity.earned, 10);
        assert_eq!(report.possible, 30);
        assert_eq!(report.earned, 10);
    }

    #[test]
    fn absences_are_dated_deductions() {
        let competition = competition(&[("x", 5)]);
        let scores = vec![
            score("s1", "x", 5, day(19)),
            score("s1", "x", -2, day(20)),
            score("s1", "ABSENCE_RECORD", -4, day(21)),
            // Stored with the wrong sign; still a deduction.
            score("s1", "ABSENCE_RECORD", 1, day(22)),
        ];

        let report = compute_student_report("s1", &competition, &scores, &[], day(18));
        assert_eq!(report.criteria[0].earned, 3);
        let points: Vec<_> = report.absences.iter().map(|a| (a.date, a.points)).collect();
        assert_eq!(points, vec![(day(21), -4), (day(22), -1)]);
        assert_eq!(report.earned, 3 - 5);
        assert_eq!(report.possible, 25);
    }

    #[test]
    fn scores_outside_the_window_or_student_are_ignored() {
        let competition = competition(&[("x", 5)]);
        let mut other_competition = score("s1", "x", 50, day(19));
        other_competition.competition_id = "other".to_string();
        let scores = vec![
            score("s1", "x", 5, day(19)),
            score("s1", "x", 5, day(23)),
            score("s2", "x", 5, day(19)),
            other_competition,
        ];

        let report = compute_student_report("s1", &competition, &scores, &[], day(18));
        assert_eq!(report.earned, 5);
    }

    #[test]
    fn group_report_scales_possible_by_members() {
        let competition = competition(&[("x", 5), ("y", 2)]);
        let group = Group {
            id: "g1".to_string(),
            name: "Falcons".to_string(),
            level: Some(Level::Middle),
            competition_id: "comp".to_string(),
            icon: String::new(),
            leader: None,
            deputy: None,
            members: vec!["s1".to_string(), "s2".to_string()],
            created_at: None,
            updated_at: None,
        };
        let scores = vec![
            score("s1", "x", 5, day(19)),
            score("s2", "y", 2, day(19)),
            score("s3", "x", 5, day(19)),
        ];
        let days = vec![activity_day(day(22), 10)];

        let report = compute_group_report(&group, &competition, &scores, &days, day(18))
            .expect("group has members");
        assert_eq!(report.member_count, 2);
        assert_eq!(report.criteria[0].possible, 5 * 4 * 2);
        assert_eq!(report.criteria[1].possible, 2 * 4 * 2);
        assert_eq!(report.activity.as_ref().map(|a| a.possible), Some(20));
        assert_eq!(report.possible, 40 + 16 + 20);
        assert_eq!(report.earned, 7);

        let empty = Group {
            members: Vec::new(),
            ..group
        };
        assert!(matches!(
            compute_group_report(&empty, &competition, &scores, &days, day(18)),
            Err(ScoringError::Validation(_))
        ));
    }

    #[test]
    fn markdown_lists_lines_and_totals() {
        let competition = competition(&[("x", 5)]);
        let scores = vec![
            score("s1", "x", 5, day(19)),
            score("s1", "ABSENCE_RECORD", -4, day(21)),
        ];
        let report = compute_student_report("s1", &competition, &scores, &[], day(18));
        let text = render_markdown("Omar", &report);

        assert!(text.contains("# Weekly Report: Omar"));
        assert!(text.contains("Week of 2026-10-18 to 2026-10-22"));
        assert!(text.contains("- X: 5 / 25"));
        assert!(text.contains("## Absences (-4)"));
        assert!(text.contains("**Total: 1 / 25**"));
    }
}
