use chrono::{NaiveDate, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::db;
use crate::errors::{Result, ScoringError};
use crate::models::{
    AbsenceKind, ActivityDay, Competition, CriteriaKey, Group, Level, Score, ScoreKind,
};
use crate::store::{collection, doc, encode, BatchOp, DocumentStore, ACTIVITY_DAYS, SCORES};

const ID_NAMESPACE: Uuid = Uuid::from_u128(0x8d3f_52c1_4a7e_4b0f_9c61_2e5a_d4b7_13f0);

pub const ACTIVITY_PRESENT_LABEL: &str = "Attended activity day";
pub const ACTIVITY_ABSENT_LABEL: &str = "Absent on activity day";

/// Everything about a score except its points.
#[derive(Debug, Clone)]
pub struct ScoreEntry {
    pub student_id: String,
    pub competition_id: String,
    pub group_id: Option<String>,
    pub criteria: CriteriaKey,
    pub criteria_name: String,
    pub kind: ScoreKind,
    pub date: NaiveDate,
    pub level: Option<Level>,
}

#[derive(Debug, Clone)]
pub struct ActivityDayOutcome {
    pub activity_day: ActivityDay,
    pub present: usize,
    pub absent: usize,
}

pub fn activity_day_id(competition_id: &str, date: NaiveDate) -> String {
    Uuid::new_v5(
        &ID_NAMESPACE,
        format!("activity-day|{competition_id}|{date}").as_bytes(),
    )
    .to_string()
}

pub fn activity_score_id(competition_id: &str, date: NaiveDate, student_id: &str) -> String {
    Uuid::new_v5(
        &ID_NAMESPACE,
        format!("activity-score|{competition_id}|{date}|{student_id}").as_bytes(),
    )
    .to_string()
}

/// Records `points` for a (student, date, criterion) key, updating the
/// existing score in place when there is one.
pub async fn record_score(
    store: &dyn DocumentStore,
    entry: ScoreEntry,
    points: i64,
) -> Result<Score> {
    if entry.student_id.is_empty() || entry.competition_id.is_empty() {
        return Err(ScoringError::Validation(
            "a score needs a student and a competition".to_string(),
        ));
    }

    let existing = db::scores_for_student_on(store, &entry.student_id, entry.date)
        .await?
        .into_iter()
        .find(|score| score.criteria_id == entry.criteria);

    let now = Utc::now();
    match existing {
        Some(mut score) => {
            score.competition_id = entry.competition_id;
            score.group_id = entry.group_id;
            score.criteria_name = entry.criteria_name;
            score.kind = entry.kind;
            score.level = entry.level;
            score.points = points;
            score.updated_at = Some(now);

            store
                .update_doc(&doc(SCORES, score.id.clone()), encode(&score)?)
                .await?;
            info!(
                score_id = %score.id,
                student_id = %score.student_id,
                criteria = %score.criteria_id,
                date = %score.date,
                points,
                "score updated"
            );
            Ok(score)
        }
        None => {
            let mut score = Score {
                id: String::new(),
                student_id: entry.student_id,
                competition_id: entry.competition_id,
                group_id: entry.group_id,
                criteria_id: entry.criteria,
                criteria_name: entry.criteria_name,
                points,
                kind: entry.kind,
                date: entry.date,
                level: entry.level,
                created_at: Some(now),
                updated_at: Some(now),
            };
            let created = store.add_doc(&collection(SCORES), encode(&score)?).await?;
            score.id = created.id;
            info!(
                score_id = %score.id,
                student_id = %score.student_id,
                criteria = %score.criteria_id,
                date = %score.date,
                points,
                "score recorded"
            );
            Ok(score)
        }
    }
}

/// Records an absence using the competition's deduction for `kind`.
pub async fn record_absence(
    store: &dyn DocumentStore,
    mut entry: ScoreEntry,
    competition: &Competition,
    kind: AbsenceKind,
) -> Result<Score> {
    entry.criteria = CriteriaKey::Absence;
    entry.criteria_name = kind.label().to_string();
    entry.kind = ScoreKind::Negative;
    record_score(store, entry, competition.absence_points(kind)).await
}

/// Gives every member of `group` either the activity points or the activity
/// absence deduction for `date`, then writes the activity-day marker.
///
/// Member scores use ids derived from (competition, date, student) and the
/// marker is written last, so a failed attempt can simply be repeated.
pub async fn record_activity_day(
    store: &dyn DocumentStore,
    competition: &Competition,
    group: &Group,
    date: NaiveDate,
    absent_student_ids: &[String],
    level: Option<Level>,
) -> Result<ActivityDayOutcome> {
    if group.competition_id != competition.id {
        return Err(ScoringError::Validation(format!(
            "group {} does not belong to competition {}",
            group.name, competition.name
        )));
    }

    if !db::activity_days_on(store, &competition.id, date)
        .await?
        .is_empty()
    {
        warn!(competition_id = %competition.id, %date, "activity day already recorded");
        return Err(ScoringError::DuplicateActivityDay {
            competition_id: competition.id.clone(),
            date,
        });
    }

    let now = Utc::now();
    let present_points = competition.activity_points;
    let absent_points = competition.activity_absent_deduction();
    let mut ops = Vec::with_capacity(group.members.len());
    let mut absent = 0usize;

    for member in &group.members {
        let is_absent = absent_student_ids.contains(member);
        if is_absent {
            absent += 1;
        }
        let score = Score {
            id: String::new(),
            student_id: member.clone(),
            competition_id: competition.id.clone(),
            group_id: Some(group.id.clone()),
            criteria_id: if is_absent {
                CriteriaKey::Absence
            } else {
                CriteriaKey::Activity
            },
            criteria_name: if is_absent {
                ACTIVITY_ABSENT_LABEL
            } else {
                ACTIVITY_PRESENT_LABEL
            }
            .to_string(),
            points: if is_absent { absent_points } else { present_points },
            kind: if is_absent {
                ScoreKind::Absence
            } else {
                ScoreKind::Activity
            },
            date,
            level,
            created_at: Some(now),
            updated_at: Some(now),
        };
        ops.push(BatchOp::Set(
            doc(SCORES, activity_score_id(&competition.id, date, member)),
            encode(&score)?,
        ));
    }

    store.write_batch(ops).await?;

    let activity_day = ActivityDay {
        id: activity_day_id(&competition.id, date),
        competition_id: competition.id.clone(),
        date,
        points: present_points,
    };
    store
        .set_doc(&doc(ACTIVITY_DAYS, activity_day.id.clone()), encode(&activity_day)?)
        .await?;

    let present = group.members.len() - absent;
    info!(
        competition_id = %competition.id,
        group_id = %group.id,
        %date,
        present,
        absent,
        "activity day recorded"
    );

    Ok(ActivityDayOutcome {
        activity_day,
        present,
        absent,
    })
}

/// Deletes every score of a competition. Groups and activity days stay.
pub async fn reset_competition(store: &dyn DocumentStore, competition_id: &str) -> Result<usize> {
    let refs = db::score_refs_for_competition(store, competition_id).await?;
    let count = refs.len();
    store
        .write_batch(refs.into_iter().map(BatchOp::Delete).collect())
        .await?;
    info!(competition_id, deleted = count, "competition scores reset");
    Ok(count)
}
