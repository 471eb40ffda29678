use std::collections::HashMap;

use serde::Serialize;

use crate::models::{Competition, Group, Level, Score, Student};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LeaderboardLimits {
    pub top_students: usize,
    pub top_groups: usize,
}

impl Default for LeaderboardLimits {
    fn default() -> Self {
        Self {
            top_students: 3,
            top_groups: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StudentStanding {
    pub student_id: String,
    pub name: String,
    pub icon: String,
    pub total: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupStanding {
    pub group_id: String,
    pub name: String,
    pub icon: String,
    pub member_count: usize,
    pub total: i64,
}

/// Ranked standings, highest total first. The full lists are kept; the
/// `top_*` accessors apply the configured limits.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Leaderboard {
    pub students: Vec<StudentStanding>,
    pub groups: Vec<GroupStanding>,
    pub limits: LeaderboardLimits,
}

impl Leaderboard {
    pub fn top_students(&self) -> &[StudentStanding] {
        let end = self.limits.top_students.min(self.students.len());
        &self.students[..end]
    }

    pub fn top_groups(&self) -> &[GroupStanding] {
        let end = self.limits.top_groups.min(self.groups.len());
        &self.groups[..end]
    }
}

/// The competition driving the leaderboard filter for `level`. General
/// competitions (no level) qualify for every level.
pub fn active_competition(competitions: &[Competition], level: Level) -> Option<&Competition> {
    competitions.iter().find(|competition| {
        competition.active && competition.level.map_or(true, |own| own == level)
    })
}

pub fn compute_leaderboard(
    students: &[Student],
    scores: &[Score],
    groups: &[Group],
    active: Option<&Competition>,
    level: Level,
    limits: LeaderboardLimits,
) -> Leaderboard {
    let mut by_student: HashMap<&str, i64> = HashMap::new();
    for score in scores {
        if let Some(competition) = active {
            if score.competition_id != competition.id {
                continue;
            }
        }
        *by_student.entry(score.student_id.as_str()).or_insert(0) += score.points;
    }

    let mut standings: Vec<StudentStanding> = students
        .iter()
        .map(|student| StudentStanding {
            student_id: student.id.clone(),
            name: student.name.clone(),
            icon: student.icon.clone(),
            total: by_student.get(student.id.as_str()).copied().unwrap_or(0),
        })
        .collect();
    standings.sort_by(|a, b| b.total.cmp(&a.total));

    let totals: HashMap<&str, i64> = standings
        .iter()
        .map(|standing| (standing.student_id.as_str(), standing.total))
        .collect();

    let mut group_standings: Vec<GroupStanding> = groups
        .iter()
        .filter(|group| group.level.map_or(true, |own| own == level))
        .filter(|group| active.map_or(true, |competition| group.competition_id == competition.id))
        .map(|group| GroupStanding {
            group_id: group.id.clone(),
            name: group.name.clone(),
            icon: group.icon.clone(),
            member_count: group.members.len(),
            total: group
                .members
                .iter()
                .map(|member| totals.get(member.as_str()).copied().unwrap_or(0))
                .sum(),
        })
        .collect();
    group_standings.sort_by(|a, b| b.total.cmp(&a.total));

    Leaderboard {
        students: standings,
        groups: group_standings,
        limits,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CriteriaKey, ScoreKind};
    use chrono::NaiveDate;

    fn student(id: &str) -> Student {
        Student {
            id: id.to_string(),
            name: id.to_uppercase(),
            level: Level::Middle,
            icon: String::new(),
            student_number: None,
            parent_phone: None,
            memorization_plan: String::new(),
            review_plan: String::new(),
            password: None,
            created_at: None,
            updated_at: None,
        }
    }

    fn competition(id: &str, active: bool) -> Competition {
        Competition {
            id: id.to_string(),
            name: id.to_string(),
            level: Some(Level::Middle),
            icon: String::new(),
            criteria: Vec::new(),
            absent_excuse: 1,
            absent_no_excuse: 4,
            activity_points: 0,
            activity_absent_points: 0,
            active,
            created_at: None,
            updated_at: None,
        }
    }

    fn score(student_id: &str, competition_id: &str, criteria: &str, points: i64, day: u32) -> Score {
        Score {
            id: format!("{student_id}-{criteria}-{day}"),
            student_id: student_id.to_string(),
            competition_id: competition_id.to_string(),
            group_id: None,
            criteria_id: CriteriaKey::from(criteria),
            criteria_name: criteria.to_string(),
            points,
            kind: if points >= 0 {
                ScoreKind::Positive
            } else {
                ScoreKind::Negative
            },
            date: NaiveDate::from_ymd_opt(2026, 10, day).unwrap_or_default(),
            level: Some(Level::Middle),
            created_at: None,
            updated_at: None,
        }
    }

    fn group(id: &str, competition_id: &str, members: &[&str]) -> Group {
        Group {
            id: id.to_string(),
            name: id.to_string(),
            level: Some(Level::Middle),
            competition_id: competition_id.to_string(),
            icon: String::new(),
            leader: None,
            deputy: None,
            members: members.iter().map(|m| m.to_string()).collect(),
            created_at: None,
            updated_at: None,
        }
    }

    #[test]
    fn active_competition_ranks_students_by_filtered_total() {
        let students = vec![student("a"), student("b")];
        let scores = vec![
            score("a", "c", "x", 3, 19),
            score("a", "c", "ABSENCE_RECORD", -4, 21),
            score("b", "c", "x", 5, 19),
        ];
        let active = competition("c", true);

        let board = compute_leaderboard(
            &students,
            &scores,
            &[],
            Some(&active),
            Level::Middle,
            LeaderboardLimits::default(),
        );

        let ranked: Vec<_> = board
            .students
            .iter()
            .map(|s| (s.student_id.as_str(), s.total))
            .collect();
        assert_eq!(ranked, vec![("b", 5), ("a", -1)]);
    }

    #[test]
    fn totals_only_count_scores_of_the_active_competition() {
        let students = vec![student("a")];
        let scores = vec![score("a", "c1", "x", 3, 19), score("a", "c2", "x", 10, 19)];

        let active = competition("c1", true);
        let filtered = compute_leaderboard(
            &students,
            &scores,
            &[],
            Some(&active),
            Level::Middle,
            LeaderboardLimits::default(),
        );
        assert_eq!(filtered.students[0].total, 3);

        let unfiltered = compute_leaderboard(
            &students,
            &scores,
            &[],
            None,
            Level::Middle,
            LeaderboardLimits::default(),
        );
        assert_eq!(unfiltered.students[0].total, 13);
    }

    #[test]
    fn group_total_follows_current_membership() {
        let students = vec![student("a"), student("b"), student("c")];
        let mut scores = vec![
            score("a", "comp", "x", 4, 19),
            score("b", "comp", "x", 6, 19),
            score("c", "comp", "x", 1, 19),
        ];
        // Still tagged with the group, but "c" is no longer a member.
        for score in scores.iter_mut() {
            score.group_id = Some("g1".to_string());
        }
        let groups = vec![group("g1", "comp", &["a", "b"]), group("g2", "comp", &[])];
        let active = competition("comp", true);

        let board = compute_leaderboard(
            &students,
            &scores,
            &groups,
            Some(&active),
            Level::Middle,
            LeaderboardLimits::default(),
        );

        assert_eq!(board.groups[0].group_id, "g1");
        assert_eq!(board.groups[0].total, 10);
        assert_eq!(board.groups[1].total, 0);
    }

    #[test]
    fn groups_are_filtered_by_level_and_competition() {
        let students = vec![student("a")];
        let scores = vec![score("a", "comp", "x", 2, 19)];
        let mut other_level = group("g-other-level", "comp", &["a"]);
        other_level.level = Some(Level::Secondary);
        let groups = vec![
            group("g-match", "comp", &["a"]),
            group("g-other-comp", "old", &["a"]),
            other_level,
        ];
        let active = competition("comp", true);

        let board = compute_leaderboard(
            &students,
            &scores,
            &groups,
            Some(&active),
            Level::Middle,
            LeaderboardLimits::default(),
        );
        let ids: Vec<_> = board.groups.iter().map(|g| g.group_id.as_str()).collect();
        assert_eq!(ids, vec!["g-match"]);
    }

    #[test]
    fn limits_cut_the_top_lists_and_empty_input_is_fine() {
        let students: Vec<_> = ["a", "b", "c", "d"].iter().map(|id| student(id)).collect();
        let scores = vec![
            score("a", "c", "x", 1, 19),
            score("b", "c", "x", 2, 19),
            score("c", "c", "x", 3, 19),
            score("d", "c", "x", 4, 19),
        ];
        let limits = LeaderboardLimits {
            top_students: 2,
            top_groups: 1,
        };
        let board = compute_leaderboard(&students, &scores, &[], None, Level::Middle, limits);
        let top: Vec<_> = board.top_students().iter().map(|s| s.total).collect();
        assert_eq!(top, vec![4, 3]);
        assert!(board.top_groups().is_empty());

        let empty = compute_leaderboard(&[], &[], &[], None, Level::Middle, limits);
        assert!(empty.students.is_empty());
        assert!(empty.groups.is_empty());
    }

    #[test]
    fn first_active_competition_of_the_level_wins() {
        let mut secondary = competition("sec", true);
        secondary.level = Some(Level::Secondary);
        let competitions = vec![competition("idle", false), secondary, competition("live", true)];

        let active = active_competition(&competitions, Level::Middle);
        assert_eq!(active.map(|c| c.id.as_str()), Some("live"));
    }
}
