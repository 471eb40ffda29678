use serde::Serialize;
use tracing::debug;

use crate::db;
use crate::leaderboard::{self, Leaderboard, LeaderboardLimits};
use crate::models::{Competition, Group, Level, Score, Student};
use crate::store::{Document, DocumentStore, StoreError, COMPETITIONS, GROUPS, SCORES, STUDENTS};

/// Collections backing the teacher views for one level. Snapshot listeners
/// feed the `apply_*` methods; everything derived is recomputed on read.
#[derive(Debug, Clone, Serialize)]
pub struct ScoreboardState {
    pub level: Level,
    pub students: Vec<Student>,
    pub competitions: Vec<Competition>,
    pub groups: Vec<Group>,
    pub scores: Vec<Score>,
}

impl ScoreboardState {
    pub fn new(level: Level) -> Self {
        Self {
            level,
            students: Vec::new(),
            competitions: Vec::new(),
            groups: Vec::new(),
            scores: Vec::new(),
        }
    }

    pub async fn load(store: &dyn DocumentStore, level: Level) -> Result<Self, StoreError> {
        let mut state = Self::new(level);
        state.refresh(store).await?;
        Ok(state)
    }

    pub async fn refresh(&mut self, store: &dyn DocumentStore) -> Result<(), StoreError> {
        self.students = db::students_by_level(store, self.level).await?;
        self.competitions = db::competitions_by_level(store, self.level).await?;
        self.groups = db::all_groups(store).await?;
        self.scores = db::all_scores(store).await?;
        debug!(
            level = %self.level,
            students = self.students.len(),
            scores = self.scores.len(),
            "state refreshed"
        );
        Ok(())
    }

    pub fn apply_students(&mut self, docs: &[Document]) {
        self.students = db::decode_documents(STUDENTS, docs);
    }

    pub fn apply_competitions(&mut self, docs: &[Document]) {
        self.competitions = db::decode_documents(COMPETITIONS, docs);
    }

    pub fn apply_groups(&mut self, docs: &[Document]) {
        self.groups = db::decode_documents(GROUPS, docs);
    }

    pub fn apply_scores(&mut self, docs: &[Document]) {
        self.scores = db::decode_documents(SCORES, docs);
    }

    /// Routes a snapshot to the matching collection. Unknown collections are
    /// ignored.
    pub fn apply(&mut self, collection: &str, docs: &[Document]) {
        match collection {
            STUDENTS => self.apply_students(docs),
            COMPETITIONS => self.apply_competitions(docs),
            GROUPS => self.apply_groups(docs),
            SCORES => self.apply_scores(docs),
            _ => {}
        }
    }

    pub fn active_competition(&self) -> Option<&Competition> {
        leaderboard::active_competition(&self.competitions, self.level)
    }

    pub fn leaderboard(&self, limits: LeaderboardLimits) -> Leaderboard {
        leaderboard::compute_leaderboard(
            &self.students,
            &self.scores,
            &self.groups,
            self.active_competition(),
            self.level,
            limits,
        )
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::store::{collection, encode, query};

    #[tokio::test]
    async fn refresh_loads_level_and_ranks_active_competition() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        db::seed(&store).await?;

        let state = ScoreboardState::load(&store, Level::Middle).await?;
        assert_eq!(state.students.len(), 3);
        assert!(state.active_competition().is_some());

        let board = state.leaderboard(LeaderboardLimits::default());
        assert_eq!(board.top_students().len(), 3);
        assert_eq!(board.groups.len(), 1);
        let totals: Vec<_> = board.students.iter().map(|s| s.total).collect();
        let mut sorted = totals.clone();
        sorted.sort_by(|a, b| b.cmp(a));
        assert_eq!(totals, sorted);

        let other_level = ScoreboardState::load(&store, Level::Secondary).await?;
        assert!(other_level.students.is_empty());
        assert!(other_level.active_competition().is_none());
        Ok(())
    }

    #[tokio::test]
    async fn active_general_competition_filters_the_leaderboard() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let general = store
            .add_doc(
                &collection(COMPETITIONS),
                encode(&json!({ "name": "School Cup", "level": null, "active": true }))?,
            )
            .await?;
        let student = store
            .add_doc(
                &collection(STUDENTS),
                encode(&json!({ "name": "Omar", "level": "middle" }))?,
            )
            .await?;
        for (competition_id, points) in [(general.id.as_str(), 4), ("old", 9)] {
            store
                .add_doc(
                    &collection(SCORES),
                    encode(&json!({
                        "studentId": student.id.as_str(),
                        "competitionId": competition_id,
                        "criteriaId": "memorization",
                        "points": points,
                        "type": "positive",
                        "date": "2026-10-19"
                    }))?,
                )
                .await?;
        }

        let state = ScoreboardState::load(&store, Level::Middle).await?;
        assert_eq!(
            state.active_competition().map(|c| c.id.as_str()),
            Some(general.id.as_str())
        );
        assert_eq!(state.leaderboard(LeaderboardLimits::default()).students[0].total, 4);
        Ok(())
    }

    #[tokio::test]
    async fn snapshots_replace_collections_and_skip_malformed_scores() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let student = store
            .add_doc(
                &collection(STUDENTS),
                encode(&json!({ "name": "Omar", "level": "middle" }))?,
            )
            .await?;
        for points in [json!(5), json!("3"), json!("lots")] {
            store
                .add_doc(
                    &collection(SCORES),
                    encode(&json!({
                        "studentId": student.id.as_str(),
                        "competitionId": "comp",
                        "criteriaId": "memorization",
                        "criteriaName": "Memorization",
                        "points": points,
                        "type": "positive",
                        "date": "2026-10-19"
                    }))?,
                )
                .await?;
        }

        let mut state = ScoreboardState::new(Level::Middle);
        let students = store.get_docs(&query(&collection(STUDENTS))).await?;
        let scores = store.get_docs(&query(&collection(SCORES))).await?;
        state.apply(STUDENTS, &students);
        state.apply(SCORES, &scores);
        state.apply("unknown", &scores);

        assert_eq!(state.scores.len(), 2);
        let board = state.leaderboard(LeaderboardLimits::default());
        assert_eq!(board.students[0].total, 8);
        Ok(())
    }
}
