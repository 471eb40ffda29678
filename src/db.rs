use anyhow::Context;
use chrono::{Duration, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::warn;

use crate::models::{
    ActivityDay, Competition, Criterion, Group, Level, Score, Student, Teacher,
};
use crate::report;
use crate::store::{
    collection, doc, encode, query, DocRef, Document, DocumentStore, Op, Query, StoreError,
    ACTIVITY_DAYS, COMPETITIONS, GROUPS, SCORES, STUDENTS, TEACHERS,
};

/// Decodes documents of `collection`. Malformed documents are logged and
/// skipped so one bad record cannot blank a whole view.
pub fn decode_documents<T: DeserializeOwned>(collection: &str, docs: &[Document]) -> Vec<T> {
    let mut records = Vec::with_capacity(docs.len());
    for document in docs {
        match document.decode::<T>() {
            Ok(record) => records.push(record),
            Err(err) => warn!(
                collection,
                id = %document.id,
                error = %err,
                "skipping malformed document"
            ),
        }
    }
    records
}

pub async fn fetch_all<T: DeserializeOwned>(
    store: &dyn DocumentStore,
    query: &Query,
) -> Result<Vec<T>, StoreError> {
    let docs = store.get_docs(query).await?;
    Ok(decode_documents(&query.collection, &docs))
}

pub async fn fetch_one<T: DeserializeOwned>(
    store: &dyn DocumentStore,
    target: &DocRef,
) -> Result<Option<T>, StoreError> {
    store
        .get_doc(target)
        .await?
        .map(|document| document.decode())
        .transpose()
}

fn date_values(dates: &[NaiveDate]) -> Value {
    Value::Array(
        dates
            .iter()
            .map(|date| Value::String(date.to_string()))
            .collect(),
    )
}

pub async fn get_student(store: &dyn DocumentStore, id: &str) -> Result<Option<Student>, StoreError> {
    fetch_one(store, &doc(STUDENTS, id)).await
}

pub fn students_query(level: Level) -> Query {
    query(&collection(STUDENTS)).filter("level", Op::Eq, level.as_str())
}

pub async fn students_by_level(
    store: &dyn DocumentStore,
    level: Level,
) -> Result<Vec<Student>, StoreError> {
    fetch_all(store, &students_query(level)).await
}

pub async fn students_by_parent_phone(
    store: &dyn DocumentStore,
    phone: &str,
) -> Result<Vec<Student>, StoreError> {
    fetch_all(store, &query(&collection(STUDENTS)).filter("parentPhone", Op::Eq, phone)).await
}

pub async fn get_competition(
    store: &dyn DocumentStore,
    id: &str,
) -> Result<Option<Competition>, StoreError> {
    fetch_one(store, &doc(COMPETITIONS, id)).await
}

/// Competitions visible at `level`: its own plus the general ones stored
/// with a null level.
pub fn competitions_query(level: Level) -> Query {
    query(&collection(COMPETITIONS)).filter(
        "level",
        Op::In,
        Value::Array(vec![Value::String(level.as_str().to_string()), Value::Null]),
    )
}

pub async fn competitions_by_level(
    store: &dyn DocumentStore,
    level: Level,
) -> Result<Vec<Competition>, StoreError> {
    fetch_all(store, &competitions_query(level)).await
}

pub async fn get_group(store: &dyn DocumentStore, id: &str) -> Result<Option<Group>, StoreError> {
    fetch_one(store, &doc(GROUPS, id)).await
}

pub async fn all_groups(store: &dyn DocumentStore) -> Result<Vec<Group>, StoreError> {
    fetch_all(store, &query(&collection(GROUPS))).await
}

pub async fn groups_for_competition(
    store: &dyn DocumentStore,
    competition_id: &str,
) -> Result<Vec<Group>, StoreError> {
    fetch_all(
        store,
        &query(&collection(GROUPS)).filter("competitionId", Op::Eq, competition_id),
    )
    .await
}

pub async fn groups_containing(
    store: &dyn DocumentStore,
    student_id: &str,
) -> Result<Vec<Group>, StoreError> {
    fetch_all(
        store,
        &query(&collection(GROUPS)).filter("members", Op::ArrayContains, student_id),
    )
    .await
}

pub async fn all_scores(store: &dyn DocumentStore) -> Result<Vec<Score>, StoreError> {
    fetch_all(store, &query(&collection(SCORES))).await
}

pub async fn scores_for_student(
    store: &dyn DocumentStore,
    student_id: &str,
) -> Result<Vec<Score>, StoreError> {
    fetch_all(store, &query(&collection(SCORES)).filter("studentId", Op::Eq, student_id)).await
}

/// Scores of one student on one day. Narrowing to a criterion happens in
/// memory so the backend needs no three-field index.
pub async fn scores_for_student_on(
    store: &dyn DocumentStore,
    student_id: &str,
    date: NaiveDate,
) -> Result<Vec<Score>, StoreError> {
    fetch_all(
        store,
        &query(&collection(SCORES))
            .filter("studentId", Op::Eq, student_id)
            .filter("date", Op::Eq, date.to_string()),
    )
    .await
}

pub async fn score_refs_for_competition(
    store: &dyn DocumentStore,
    competition_id: &str,
) -> Result<Vec<DocRef>, StoreError> {
    let docs = store
        .get_docs(&query(&collection(SCORES)).filter("competitionId", Op::Eq, competition_id))
        .await?;
    Ok(docs
        .into_iter()
        .map(|document| doc(SCORES, document.id))
        .collect())
}

pub async fn scores_in_window(
    store: &dyn DocumentStore,
    competition_id: &str,
    dates: &[NaiveDate],
) -> Result<Vec<Score>, StoreError> {
    fetch_all(
        store,
        &query(&collection(SCORES))
            .filter("competitionId", Op::Eq, competition_id)
            .filter("date", Op::In, date_values(dates)),
    )
    .await
}

pub async fn activity_days_in_window(
    store: &dyn DocumentStore,
    competition_id: &str,
    dates: &[NaiveDate],
) -> Result<Vec<ActivityDay>, StoreError> {
    fetch_all(
        store,
        &query(&collection(ACTIVITY_DAYS))
            .filter("competitionId", Op::Eq, competition_id)
            .filter("date", Op::In, date_values(dates)),
    )
    .await
}

pub async fn activity_days_on(
    store: &dyn DocumentStore,
    competition_id: &str,
    date: NaiveDate,
) -> Result<Vec<ActivityDay>, StoreError> {
    fetch_all(
        store,
        &query(&collection(ACTIVITY_DAYS))
            .filter("competitionId", Op::Eq, competition_id)
            .filter("date", Op::Eq, date.to_string()),
    )
    .await
}

pub async fn teachers_by_level(
    store: &dyn DocumentStore,
    level: Level,
) -> Result<Vec<Teacher>, StoreError> {
    fetch_all(store, &query(&collection(TEACHERS)).filter("level", Op::Eq, level.as_str())).await
}

/// Loads a small demo school: one level, one active competition, one group
/// and a few days of scores in the current week.
pub async fn seed(store: &dyn DocumentStore) -> anyhow::Result<()> {
    let level = Level::Middle;
    let students = [
        ("Omar Saleh", "0551234567"),
        ("Yousef Ali", "0557654321"),
        ("Hamza Nasser", "0559988776"),
    ];

    let mut student_ids = Vec::new();
    for (name, phone) in students {
        let student = Student {
            id: String::new(),
            name: name.to_string(),
            level,
            icon: String::new(),
            student_number: Some(crate::progress::normalize_phone(phone)),
            parent_phone: Some(crate::progress::normalize_phone(phone)),
            memorization_plan: "Juz 30".to_string(),
            review_plan: "Juz 29".to_string(),
            password: None,
            created_at: None,
            updated_at: None,
        };
        let created = store.add_doc(&collection(STUDENTS), encode(&student)?).await?;
        student_ids.push(created.id);
    }

    let competition = Competition {
        id: String::new(),
        name: "Autumn Recitation".to_string(),
        level: Some(level),
        icon: String::new(),
        criteria: vec![
            Criterion {
                id: "memorization".to_string(),
                name: "Memorization".to_string(),
                positive_points: 5,
                negative_points: 2,
            },
            Criterion {
                id: "review".to_string(),
                name: "Review".to_string(),
                positive_points: 3,
                negative_points: 1,
            },
        ],
        absent_excuse: 1,
        absent_no_excuse: 4,
        activity_points: 10,
        activity_absent_points: 5,
        active: true,
        created_at: None,
        updated_at: None,
    };
    let competition_ref = store
        .add_doc(&collection(COMPETITIONS), encode(&competition)?)
        .await?;

    let group = Group {
        id: String::new(),
        name: "Falcons".to_string(),
        level: Some(level),
        competition_id: competition_ref.id.clone(),
        icon: String::new(),
        leader: student_ids.first().cloned(),
        deputy: None,
        members: student_ids.clone(),
        created_at: None,
        updated_at: None,
    };
    let group_ref = store.add_doc(&collection(GROUPS), encode(&group)?).await?;

    let sunday = report::week_start(Utc::now().date_naive());
    let monday = sunday + Duration::days(1);
    let samples = [(0usize, "memorization", 5), (1, "memorization", 3), (2, "review", 3)];
    for (index, criterion_id, points) in samples {
        let student_id = student_ids
            .get(index)
            .context("seed student missing")?
            .clone();
        let entry = crate::scoring::ScoreEntry {
            student_id,
            competition_id: competition_ref.id.clone(),
            group_id: Some(group_ref.id.clone()),
            criteria: criterion_id.into(),
            criteria_name: competition
                .criterion(criterion_id)
                .map(|criterion| criterion.name.clone())
                .unwrap_or_default(),
            kind: crate::models::ScoreKind::Positive,
            date: monday,
            level: Some(level),
        };
        crate::scoring::record_score(store, entry, points).await?;
    }

    Ok(())
}
