use std::collections::HashSet;
use std::path::Path;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::db;
use crate::errors::{Result, ScoringError};
use crate::models::{
    Competition, Criterion, Group, Level, Student, Teacher, DEFAULT_ABSENT_EXCUSE,
    DEFAULT_ABSENT_NO_EXCUSE,
};
use crate::progress::normalize_phone;
use crate::store::{
    collection, doc, encode, DocRef, DocumentStore, Fields, COMPETITIONS, GROUPS, STUDENTS,
    TEACHERS,
};

fn required(value: &str, what: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(ScoringError::Validation(format!("{what} is required")));
    }
    Ok(())
}

async fn ensure_exists(store: &dyn DocumentStore, target: &DocRef, what: &str) -> Result<()> {
    if store.get_doc(target).await?.is_none() {
        return Err(ScoringError::NotFound(format!("{what} {}", target.id)));
    }
    Ok(())
}

fn single_field(name: &str, value: Value) -> Fields {
    let mut fields = Fields::new();
    fields.insert(name.to_string(), value);
    fields
}

/// Parses a criterion written as `name:positive:negative`. Missing or
/// non-numeric point values count as 0.
pub fn parse_criterion(raw: &str) -> Result<Criterion> {
    let mut parts = raw.split(':');
    let name = parts.next().unwrap_or_default().trim();
    required(name, "criterion name")?;
    let mut points = parts.map(|part| part.trim().parse::<i64>().unwrap_or(0));
    Ok(Criterion {
        id: String::new(),
        name: name.to_string(),
        positive_points: points.next().unwrap_or(0),
        negative_points: points.next().unwrap_or(0),
    })
}

#[derive(Debug, Clone, Default)]
pub struct CompetitionDraft {
    pub id: Option<String>,
    pub name: String,
    pub level: Option<Level>,
    pub icon: String,
    pub criteria: Vec<Criterion>,
    pub absent_excuse: Option<i64>,
    pub absent_no_excuse: Option<i64>,
    pub activity_points: Option<i64>,
    pub activity_absent_points: Option<i64>,
}

/// Creates a competition, or updates it when the draft carries an id. The
/// active flag is never changed here.
pub async fn save_competition(
    store: &dyn DocumentStore,
    draft: CompetitionDraft,
) -> Result<Competition> {
    required(&draft.name, "competition name")?;
    if draft.criteria.is_empty() {
        return Err(ScoringError::Validation(
            "a competition needs at least one criterion".to_string(),
        ));
    }
    for criterion in &draft.criteria {
        required(&criterion.name, "criterion name")?;
    }

    let criteria = draft
        .criteria
        .into_iter()
        .map(|mut criterion| {
            if criterion.id.is_empty() {
                criterion.id = Uuid::new_v4().simple().to_string();
            }
            criterion
        })
        .collect();

    let existing = match &draft.id {
        Some(id) => Some(
            db::get_competition(store, id)
                .await?
                .ok_or_else(|| ScoringError::NotFound(format!("competition {id}")))?,
        ),
        None => None,
    };

    let now = Utc::now();
    let mut competition = Competition {
        id: draft.id.clone().unwrap_or_default(),
        name: draft.name.trim().to_string(),
        level: draft.level,
        icon: draft.icon,
        criteria,
        absent_excuse: draft
            .absent_excuse
            .filter(|points| *points != 0)
            .unwrap_or(DEFAULT_ABSENT_EXCUSE),
        absent_no_excuse: draft
            .absent_no_excuse
            .filter(|points| *points != 0)
            .unwrap_or(DEFAULT_ABSENT_NO_EXCUSE),
        activity_points: draft.activity_points.unwrap_or(0),
        activity_absent_points: draft.activity_absent_points.unwrap_or(0),
        active: existing.as_ref().is_some_and(|current| current.active),
        created_at: existing.as_ref().and_then(|current| current.created_at).or(Some(now)),
        updated_at: Some(now),
    };

    if existing.is_some() {
        let mut fields = encode(&competition)?;
        fields.remove("active");
        store
            .update_doc(&doc(COMPETITIONS, competition.id.clone()), fields)
            .await?;
        info!(competition_id = %competition.id, name = %competition.name, "competition updated");
    } else {
        let created = store
            .add_doc(&collection(COMPETITIONS), encode(&competition)?)
            .await?;
        competition.id = created.id;
        info!(competition_id = %competition.id, name = %competition.name, "competition created");
    }

    Ok(competition)
}

/// Flips a competition's active flag. Turning one on first turns off any
/// other active competition of the same level.
pub async fn toggle_competition_active(
    store: &dyn DocumentStore,
    level: Level,
    id: &str,
) -> Result<bool> {
    let target = db::get_competition(store, id)
        .await?
        .ok_or_else(|| ScoringError::NotFound(format!("competition {id}")))?;

    for other in db::competitions_by_level(store, level).await? {
        if other.active && other.id != target.id {
            store
                .update_doc(&doc(COMPETITIONS, other.id.clone()), single_field("active", json!(false)))
                .await?;
            info!(competition_id = %other.id, "competition deactivated");
        }
    }

    let active = !target.active;
    store
        .update_doc(&doc(COMPETITIONS, target.id.clone()), single_field("active", json!(active)))
        .await?;
    info!(competition_id = %target.id, active, "competition toggled");
    Ok(active)
}

/// Removes the competition document only; its scores and groups remain.
pub async fn delete_competition(store: &dyn DocumentStore, id: &str) -> Result<()> {
    let target = doc(COMPETITIONS, id);
    ensure_exists(store, &target, "competition").await?;
    store.delete_doc(&target).await?;
    warn!(competition_id = id, "competition deleted; scores and groups are kept");
    Ok(())
}

#[derive(Debug, Clone, Default)]
pub struct GroupDraft {
    pub id: Option<String>,
    pub name: String,
    pub competition_id: String,
    pub level: Option<Level>,
    pub icon: String,
    pub leader: Option<String>,
    pub deputy: Option<String>,
    pub members: Vec<String>,
}

/// Saves a group after checking that none of its members already belongs to
/// another group of the same competition. The leader and deputy are always
/// members.
pub async fn save_group(store: &dyn DocumentStore, draft: GroupDraft) -> Result<Group> {
    required(&draft.name, "group name")?;
    required(&draft.competition_id, "competition")?;

    let leader = draft.leader.filter(|id| !id.is_empty());
    let deputy = draft.deputy.filter(|id| !id.is_empty());

    let mut members: Vec<String> = Vec::new();
    for member in draft
        .members
        .into_iter()
        .chain(leader.clone())
        .chain(deputy.clone())
    {
        if !member.is_empty() && !members.contains(&member) {
            members.push(member);
        }
    }

    let taken: HashSet<String> = db::groups_for_competition(store, &draft.competition_id)
        .await?
        .into_iter()
        .filter(|group| Some(&group.id) != draft.id.as_ref())
        .flat_map(|group| group.members)
        .collect();
    let conflicts: Vec<String> = members
        .iter()
        .filter(|member| taken.contains(*member))
        .cloned()
        .collect();
    if !conflicts.is_empty() {
        warn!(competition_id = %draft.competition_id, ?conflicts, "group membership conflict");
        return Err(ScoringError::MembershipConflict {
            student_ids: conflicts,
        });
    }

    let now = Utc::now();
    let mut group = Group {
        id: draft.id.clone().unwrap_or_default(),
        name: draft.name.trim().to_string(),
        level: draft.level,
        competition_id: draft.competition_id,
        icon: draft.icon,
        leader,
        deputy,
        members,
        created_at: None,
        updated_at: Some(now),
    };

    match &draft.id {
        Some(id) => {
            let target = doc(GROUPS, id.clone());
            ensure_exists(store, &target, "group").await?;
            store.update_doc(&target, encode(&group)?).await?;
            info!(group_id = %group.id, members = group.members.len(), "group updated");
        }
        None => {
            group.created_at = Some(now);
            let created = store.add_doc(&collection(GROUPS), encode(&group)?).await?;
            group.id = created.id;
            info!(group_id = %group.id, members = group.members.len(), "group created");
        }
    }

    Ok(group)
}

pub async fn delete_group(store: &dyn DocumentStore, id: &str) -> Result<()> {
    let target = doc(GROUPS, id);
    ensure_exists(store, &target, "group").await?;
    store.delete_doc(&target).await?;
    info!(group_id = id, "group deleted");
    Ok(())
}

#[derive(Debug, Clone)]
pub struct StudentDraft {
    pub name: String,
    pub level: Level,
    pub phone: Option<String>,
    pub icon: String,
    pub memorization_plan: String,
    pub review_plan: String,
}

impl StudentDraft {
    pub fn new(name: &str, level: Level) -> Self {
        Self {
            name: name.to_string(),
            level,
            phone: None,
            icon: String::new(),
            memorization_plan: String::new(),
            review_plan: String::new(),
        }
    }

    fn into_student(self, id: String) -> Student {
        // The student number doubles as the parent's lookup phone.
        let phone = self
            .phone
            .map(|raw| normalize_phone(&raw))
            .filter(|phone| !phone.is_empty());
        Student {
            id,
            name: self.name.trim().to_string(),
            level: self.level,
            icon: self.icon,
            student_number: phone.clone(),
            parent_phone: phone,
            memorization_plan: self.memorization_plan,
            review_plan: self.review_plan,
            password: None,
            created_at: None,
            updated_at: Some(Utc::now()),
        }
    }
}

pub async fn add_student(store: &dyn DocumentStore, draft: StudentDraft) -> Result<Student> {
    required(&draft.name, "student name")?;
    let mut student = draft.into_student(String::new());
    student.created_at = student.updated_at;
    let created = store.add_doc(&collection(STUDENTS), encode(&student)?).await?;
    student.id = created.id;
    info!(student_id = %student.id, level = %student.level, "student added");
    Ok(student)
}

pub async fn update_student(
    store: &dyn DocumentStore,
    id: &str,
    draft: StudentDraft,
) -> Result<Student> {
    required(&draft.name, "student name")?;
    let target = doc(STUDENTS, id);
    ensure_exists(store, &target, "student").await?;
    let student = draft.into_student(id.to_string());
    let mut fields = encode(&student)?;
    // A teacher edit never clears the student's own password.
    fields.remove("password");
    store.update_doc(&target, fields).await?;
    info!(student_id = id, "student updated");
    Ok(student)
}

pub async fn transfer_student(store: &dyn DocumentStore, id: &str, level: Level) -> Result<()> {
    let target = doc(STUDENTS, id);
    ensure_exists(store, &target, "student").await?;
    store
        .update_doc(&target, single_field("level", json!(level)))
        .await?;
    info!(student_id = id, %level, "student transferred");
    Ok(())
}

pub async fn delete_student(store: &dyn DocumentStore, id: &str) -> Result<()> {
    let target = doc(STUDENTS, id);
    ensure_exists(store, &target, "student").await?;
    store.delete_doc(&target).await?;
    info!(student_id = id, "student deleted");
    Ok(())
}

/// Bulk-adds students from a CSV with `name,student_number,icon` columns.
pub async fn import_students_csv(
    store: &dyn DocumentStore,
    csv_path: &Path,
    level: Level,
) -> anyhow::Result<usize> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        name: String,
        student_number: Option<String>,
        icon: Option<String>,
    }

    let mut reader = csv::Reader::from_path(csv_path)?;
    let mut inserted = 0usize;

    for result in reader.deserialize::<CsvRow>() {
        let row = result?;
        if row.name.trim().is_empty() {
            warn!(path = %csv_path.display(), "skipping row without a name");
            continue;
        }
        let draft = StudentDraft {
            phone: row.student_number,
            icon: row.icon.unwrap_or_default(),
            ..StudentDraft::new(&row.name, level)
        };
        add_student(store, draft).await?;
        inserted += 1;
    }

    Ok(inserted)
}

pub async fn add_teacher(
    store: &dyn DocumentStore,
    name: &str,
    phone: &str,
    level: Level,
) -> Result<Teacher> {
    required(name, "teacher name")?;
    required(phone, "teacher phone")?;

    let mut teacher = Teacher {
        id: String::new(),
        name: name.trim().to_string(),
        phone: normalize_phone(phone),
        level,
    };
    let created = store.add_doc(&collection(TEACHERS), encode(&teacher)?).await?;
    teacher.id = created.id;
    info!(teacher_id = %teacher.id, %level, "teacher added");
    Ok(teacher)
}

pub async fn delete_teacher(store: &dyn DocumentStore, id: &str) -> Result<()> {
    let target = doc(TEACHERS, id);
    ensure_exists(store, &target, "teacher").await?;
    store.delete_doc(&target).await?;
    info!(teacher_id = id, "teacher deleted");
    Ok(())
}
