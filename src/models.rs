use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

pub const ABSENCE_RECORD: &str = "ABSENCE_RECORD";
pub const ACTIVITY_DAY: &str = "ACTIVITY_DAY";

pub const DEFAULT_ABSENT_EXCUSE: i64 = 1;
pub const DEFAULT_ABSENT_NO_EXCUSE: i64 = 4;

/// One of the four fixed school tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum Level {
    Secondary,
    Middle,
    UpperElem,
    LowerElem,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Secondary => "secondary",
            Level::Middle => "middle",
            Level::UpperElem => "upper_elem",
            Level::LowerElem => "lower_elem",
        }
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a score was recorded against: a competition criterion or one of the
/// two attendance sentinels.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CriteriaKey {
    Criterion(String),
    Absence,
    Activity,
}

impl CriteriaKey {
    pub fn as_str(&self) -> &str {
        match self {
            CriteriaKey::Criterion(id) => id,
            CriteriaKey::Absence => ABSENCE_RECORD,
            CriteriaKey::Activity => ACTIVITY_DAY,
        }
    }
}

impl From<&str> for CriteriaKey {
    fn from(value: &str) -> Self {
        match value {
            ABSENCE_RECORD => CriteriaKey::Absence,
            ACTIVITY_DAY => CriteriaKey::Activity,
            other => CriteriaKey::Criterion(other.to_string()),
        }
    }
}

impl std::fmt::Display for CriteriaKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for CriteriaKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for CriteriaKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(CriteriaKey::from(raw.as_str()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoreKind {
    Positive,
    Negative,
    Absence,
    Activity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum AbsenceKind {
    Excused,
    Unexcused,
}

impl AbsenceKind {
    pub fn label(&self) -> &'static str {
        match self {
            AbsenceKind::Excused => "Excused absence",
            AbsenceKind::Unexcused => "Unexcused absence",
        }
    }

    /// Recovers the kind from a stored criteria name. Unknown labels count as
    /// unexcused.
    pub fn from_label(label: &str) -> Self {
        if label == AbsenceKind::Excused.label() {
            AbsenceKind::Excused
        } else {
            AbsenceKind::Unexcused
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Student {
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub level: Level,
    #[serde(default)]
    pub icon: String,
    #[serde(default)]
    pub student_number: Option<String>,
    #[serde(default)]
    pub parent_phone: Option<String>,
    #[serde(default)]
    pub memorization_plan: String,
    #[serde(default)]
    pub review_plan: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Criterion {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default, deserialize_with = "points_or_zero")]
    pub positive_points: i64,
    #[serde(default, deserialize_with = "points_or_zero")]
    pub negative_points: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Competition {
    #[serde(default)]
    pub id: String,
    pub name: String,
    /// `None` marks a general competition.
    #[serde(default)]
    pub level: Option<Level>,
    #[serde(default)]
    pub icon: String,
    #[serde(default)]
    pub criteria: Vec<Criterion>,
    #[serde(default, deserialize_with = "points_or_zero")]
    pub absent_excuse: i64,
    #[serde(default, deserialize_with = "points_or_zero")]
    pub absent_no_excuse: i64,
    #[serde(default, deserialize_with = "points_or_zero")]
    pub activity_points: i64,
    #[serde(default, deserialize_with = "points_or_zero")]
    pub activity_absent_points: i64,
    #[serde(default)]
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Competition {
    /// Deduction for an absence, always non-positive. Unset amounts fall back
    /// to 1 (excused) and 4 (unexcused).
    pub fn absence_points(&self, kind: AbsenceKind) -> i64 {
        let amount = match kind {
            AbsenceKind::Excused if self.absent_excuse != 0 => self.absent_excuse,
            AbsenceKind::Excused => DEFAULT_ABSENT_EXCUSE,
            AbsenceKind::Unexcused if self.absent_no_excuse != 0 => self.absent_no_excuse,
            AbsenceKind::Unexcused => DEFAULT_ABSENT_NO_EXCUSE,
        };
        amount.saturating_abs().saturating_neg()
    }

    pub fn activity_absent_deduction(&self) -> i64 {
        self.activity_absent_points.saturating_abs().saturating_neg()
    }

    pub fn criterion(&self, id: &str) -> Option<&Criterion> {
        self.criteria.iter().find(|criterion| criterion.id == id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub level: Option<Level>,
    pub competition_id: String,
    #[serde(default)]
    pub icon: String,
    #[serde(default)]
    pub leader: Option<String>,
    #[serde(default)]
    pub deputy: Option<String>,
    #[serde(default, deserialize_with = "nullable_list")]
    pub members: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Score {
    #[serde(default)]
    pub id: String,
    pub student_id: String,
    pub competition_id: String,
    #[serde(default)]
    pub group_id: Option<String>,
    pub criteria_id: CriteriaKey,
    #[serde(default)]
    pub criteria_name: String,
    #[serde(deserialize_with = "points")]
    pub points: i64,
    #[serde(rename = "type")]
    pub kind: ScoreKind,
    pub date: NaiveDate,
    #[serde(default)]
    pub level: Option<Level>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityDay {
    #[serde(default)]
    pub id: String,
    pub competition_id: String,
    pub date: NaiveDate,
    #[serde(default, deserialize_with = "points_or_zero")]
    pub points: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Teacher {
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub phone: String,
    pub level: Level,
}

/// Reads a point value stored as an integer, a float (truncated) or a numeric
/// string.
pub fn points_from_value(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|float| float.trunc() as i64)),
        Value::String(raw) => {
            let raw = raw.trim();
            raw.parse::<i64>().ok().or_else(|| {
                raw.parse::<f64>()
                    .ok()
                    .filter(|float| float.is_finite())
                    .map(|float| float.trunc() as i64)
            })
        }
        _ => None,
    }
}

fn points<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    let value = Value::deserialize(deserializer)?;
    points_from_value(&value)
        .ok_or_else(|| serde::de::Error::custom(format!("non-numeric points value: {value}")))
}

fn points_or_zero<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(points_from_value(&value).unwrap_or(0))
}

fn nullable_list<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn points_accept_numbers_and_numeric_strings() {
        assert_eq!(points_from_value(&json!(7)), Some(7));
        assert_eq!(points_from_value(&json!(-4)), Some(-4));
        assert_eq!(points_from_value(&json!(2.9)), Some(2));
        assert_eq!(points_from_value(&json!(" 12 ")), Some(12));
        assert_eq!(points_from_value(&json!("abc")), None);
        assert_eq!(points_from_value(&json!(null)), None);
    }

    #[test]
    fn score_with_non_numeric_points_is_rejected() {
        let raw = json!({
            "studentId": "s1",
            "competitionId": "c1",
            "criteriaId": "x",
            "points": "lots",
            "type": "positive",
            "date": "2026-10-18"
        });
        assert!(serde_json::from_value::<Score>(raw).is_err());
    }

    #[test]
    fn sentinel_criteria_round_trip_as_plain_strings() {
        let raw = json!({
            "studentId": "s1",
            "competitionId": "c1",
            "criteriaId": "ABSENCE_RECORD",
            "points": "-4",
            "type": "negative",
            "date": "2026-10-21"
        });
        let score: Score = serde_json::from_value(raw).expect("score decodes");
        assert_eq!(score.criteria_id, CriteriaKey::Absence);
        assert_eq!(score.points, -4);

        let encoded = serde_json::to_value(&score).expect("score encodes");
        assert_eq!(encoded["criteriaId"], json!("ABSENCE_RECORD"));
        assert_eq!(encoded["type"], json!("negative"));
    }

    #[test]
    fn group_without_members_decodes_empty() {
        let raw = json!({
            "name": "Falcons",
            "competitionId": "c1",
            "members": null
        });
        let group: Group = serde_json::from_value(raw).expect("group decodes");
        assert!(group.members.is_empty());
    }

    #[test]
    fn absence_points_use_defaults_and_force_negative() {
        let mut competition: Competition =
            serde_json::from_value(json!({ "name": "Autumn" })).expect("competition decodes");
        assert_eq!(competition.absence_points(AbsenceKind::Excused), -1);
        assert_eq!(competition.absence_points(AbsenceKind::Unexcused), -4);

        competition.absent_excuse = 2;
        competition.absent_no_excuse = -6;
        assert_eq!(competition.absence_points(AbsenceKind::Excused), -2);
        assert_eq!(competition.absence_points(AbsenceKind::Unexcused), -6);

        competition.activity_absent_points = 3;
        assert_eq!(competition.activity_absent_deduction(), -3);
    }

    #[test]
    fn extreme_deductions_saturate() {
        let mut competition: Competition =
            serde_json::from_value(json!({ "name": "Autumn" })).expect("competition decodes");
        competition.absent_excuse = i64::MIN;
        competition.activity_absent_points = i64::MIN;
        assert_eq!(competition.absence_points(AbsenceKind::Excused), -i64::MAX);
        assert_eq!(competition.activity_absent_deduction(), -i64::MAX);
    }
}
