//! In-process store with the same constraint behaviour as the Postgres schema.
//!
//! By default units of work are serialised: `begin` takes an exclusive lock on
//! the tables and works on a private copy that only replaces the shared state on
//! commit. An interleaved store lets units run side by side on snapshots and
//! checks the unique constraints again when each one commits.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::types::Json;
use time::PrimitiveDateTime;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::db::models::{Answer, Assessment, AssessmentQuestion, Attempt, Question};
use crate::db::types::AttemptStatus;
use crate::store::{
    AttemptFilter, GradeUpdate, NewAttempt, NewLink, Store, StoreError, StoreResult, UnitOfWork,
    UpsertAnswer,
};

#[derive(Debug, Clone, Default)]
struct Tables {
    assessments: BTreeMap<i64, Assessment>,
    questions: BTreeMap<i64, Question>,
    links: BTreeMap<i64, AssessmentQuestion>,
    attempts: BTreeMap<i64, Attempt>,
    answers: BTreeMap<i64, Answer>,
    /// Shared by every snapshot so concurrent units never hand out the same id.
    next_id: Arc<AtomicI64>,
}

impl Tables {
    fn allocate_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Applies the rows `working` changed relative to `base`.
    fn merge(&mut self, base: &Tables, working: Tables) {
        merge_rows(&mut self.assessments, &base.assessments, working.assessments);
        merge_rows(&mut self.questions, &base.questions, working.questions);
        merge_rows(&mut self.links, &base.links, working.links);
        merge_rows(&mut self.attempts, &base.attempts, working.attempts);
        merge_rows(&mut self.answers, &base.answers, working.answers);
    }

    fn check_unique(&self) -> StoreResult<()> {
        let mut in_progress = HashSet::new();
        for attempt in self.attempts.values() {
            if attempt.status == AttemptStatus::InProgress
                && !in_progress.insert((attempt.student_id, attempt.assessment_id))
            {
                return Err(StoreError::UniqueViolation(
                    "attempts_one_in_progress_key".to_string(),
                ));
            }
        }
        let mut pairs = HashSet::new();
        if !self.answers.values().all(|answer| pairs.insert((answer.attempt_id, answer.question_id)))
        {
            return Err(StoreError::UniqueViolation("answers_attempt_question_key".to_string()));
        }
        let mut pairs = HashSet::new();
        if !self.links.values().all(|link| pairs.insert((link.assessment_id, link.question_id))) {
            return Err(StoreError::UniqueViolation("assessment_questions_pair_key".to_string()));
        }
        Ok(())
    }
}

fn merge_rows<T: Clone + PartialEq>(
    target: &mut BTreeMap<i64, T>,
    base: &BTreeMap<i64, T>,
    working: BTreeMap<i64, T>,
) {
    for id in base.keys().filter(|id| !working.contains_key(id)) {
        target.remove(id);
    }
    for (id, row) in working {
        if base.get(&id) != Some(&row) {
            target.insert(id, row);
        }
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
    latency_ms: Arc<AtomicU64>,
    interleaved: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose units of work overlap instead of queueing, so races
    /// between them reach the commit-time constraint checks.
    pub fn interleaved() -> Self {
        Self { interleaved: true, ..Self::default() }
    }

    /// Delays every unit-of-work call, for exercising cancellation and races.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms.store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Stores `assessment`, assigning an id when it is zero.
    pub async fn put_assessment(&self, mut assessment: Assessment) -> Assessment {
        let mut tables = self.tables.lock().await;
        if assessment.id == 0 {
            assessment.id = tables.allocate_id();
        }
        tables.assessments.insert(assessment.id, assessment.clone());
        assessment
    }

    pub async fn put_question(&self, mut question: Question) -> Question {
        let mut tables = self.tables.lock().await;
        if question.id == 0 {
            question.id = tables.allocate_id();
        }
        tables.questions.insert(question.id, question.clone());
        question
    }

    pub async fn attempt_count(&self) -> usize {
        self.tables.lock().await.attempts.len()
    }

    pub async fn answers_for_pair(&self, attempt_id: i64, question_id: i64) -> Vec<Answer> {
        self.tables
            .lock()
            .await
            .answers
            .values()
            .filter(|answer| answer.attempt_id == attempt_id && answer.question_id == question_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> StoreResult<Box<dyn UnitOfWork>> {
        let latency = Duration::from_millis(self.latency_ms.load(Ordering::SeqCst));
        let (isolation, working) = if self.interleaved {
            let base = self.tables.lock().await.clone();
            let working = base.clone();
            (Isolation::Snapshot { tables: self.tables.clone(), base }, working)
        } else {
            let guard = self.tables.clone().lock_owned().await;
            let working = guard.clone();
            (Isolation::Exclusive(guard), working)
        };
        Ok(Box::new(MemoryUnitOfWork { isolation, working, latency }))
    }
}

enum Isolation {
    /// Holds the tables for the whole unit of work.
    Exclusive(OwnedMutexGuard<Tables>),
    /// Started from `base`; merges its own row changes on commit.
    Snapshot { tables: Arc<Mutex<Tables>>, base: Tables },
}

pub struct MemoryUnitOfWork {
    isolation: Isolation,
    working: Tables,
    latency: Duration,
}

impl MemoryUnitOfWork {
    async fn pause(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    fn sorted_links(&self, assessment_id: i64) -> Vec<AssessmentQuestion> {
        let mut links: Vec<AssessmentQuestion> = self
            .working
            .links
            .values()
            .filter(|link| link.assessment_id == assessment_id)
            .cloned()
            .collect();
        links.sort_by_key(|link| (link.order, link.id));
        links
    }

    fn pair_answer_id(&self, attempt_id: i64, question_id: i64) -> Option<i64> {
        self.working
            .answers
            .values()
            .find(|answer| answer.attempt_id == attempt_id && answer.question_id == question_id)
            .map(|answer| answer.id)
    }

    fn update_answer<F>(&mut self, id: i64, apply: F) -> Option<Answer>
    where
        F: FnOnce(&mut Answer),
    {
        let answer = self.working.answers.get_mut(&id)?;
        apply(answer);
        Some(answer.clone())
    }
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    async fn find_assessment(&mut self, id: i64) -> StoreResult<Option<Assessment>> {
        self.pause().await;
        Ok(self.working.assessments.get(&id).cloned())
    }

    async fn find_question(&mut self, id: i64) -> StoreResult<Option<Question>> {
        self.pause().await;
        Ok(self.working.questions.get(&id).cloned())
    }

    async fn find_questions(&mut self, ids: &[i64]) -> StoreResult<Vec<Question>> {
        self.pause().await;
        Ok(ids.iter().filter_map(|id| self.working.questions.get(id).cloned()).collect())
    }

    async fn list_links(&mut self, assessment_id: i64) -> StoreResult<Vec<AssessmentQuestion>> {
        self.pause().await;
        Ok(self.sorted_links(assessment_id))
    }

    async fn list_links_for_update(
        &mut self,
        assessment_id: i64,
    ) -> StoreResult<Vec<AssessmentQuestion>> {
        self.pause().await;
        Ok(self.sorted_links(assessment_id))
    }

    async fn find_link(
        &mut self,
        assessment_id: i64,
        question_id: i64,
    ) -> StoreResult<Option<AssessmentQuestion>> {
        self.pause().await;
        Ok(self
            .working
            .links
            .values()
            .find(|link| link.assessment_id == assessment_id && link.question_id == question_id)
            .cloned())
    }

    async fn insert_link(&mut self, link: NewLink) -> StoreResult<AssessmentQuestion> {
        self.pause().await;
        let duplicate = self.working.links.values().any(|existing| {
            existing.assessment_id == link.assessment_id && existing.question_id == link.question_id
        });
        if duplicate {
            return Err(StoreError::UniqueViolation("assessment_questions_pair_key".to_string()));
        }
        if !self.working.questions.contains_key(&link.question_id) {
            return Err(StoreError::Backend(format!(
                "question {} does not exist",
                link.question_id
            )));
        }

        let id = self.working.allocate_id();
        let created = AssessmentQuestion {
            id,
            assessment_id: link.assessment_id,
            question_id: link.question_id,
            order: link.order,
            points: link.points,
            required: link.required,
        };
        self.working.links.insert(id, created.clone());
        Ok(created)
    }

    async fn delete_link(&mut self, assessment_id: i64, question_id: i64) -> StoreResult<bool> {
        self.pause().await;
        let id = self
            .working
            .links
            .values()
            .find(|link| link.assessment_id == assessment_id && link.question_id == question_id)
            .map(|link| link.id);
        Ok(match id {
            Some(id) => self.working.links.remove(&id).is_some(),
            None => false,
        })
    }

    async fn set_link_order(&mut self, link_id: i64, order: i32) -> StoreResult<()> {
        self.pause().await;
        if let Some(link) = self.working.links.get_mut(&link_id) {
            link.order = order;
        }
        Ok(())
    }

    async fn lock_attempt_slot(&mut self, _student_id: i64, _assessment_id: i64) -> StoreResult<()> {
        // Exclusive units already run one at a time; snapshot units race to commit.
        Ok(())
    }

    async fn find_attempt(&mut self, id: i64) -> StoreResult<Option<Attempt>> {
        self.pause().await;
        Ok(self.working.attempts.get(&id).cloned())
    }

    async fn find_attempt_for_update(&mut self, id: i64) -> StoreResult<Option<Attempt>> {
        self.find_attempt(id).await
    }

    async fn find_attempt_for_share(&mut self, id: i64) -> StoreResult<Option<Attempt>> {
        self.find_attempt(id).await
    }

    async fn find_in_progress_attempt(
        &mut self,
        student_id: i64,
        assessment_id: i64,
    ) -> StoreResult<Option<Attempt>> {
        self.pause().await;
        Ok(self
            .working
            .attempts
            .values()
            .find(|attempt| {
                attempt.student_id == student_id
                    && attempt.assessment_id == assessment_id
                    && attempt.status == AttemptStatus::InProgress
            })
            .cloned())
    }

    async fn count_attempts(
        &mut self,
        student_id: i64,
        assessment_id: i64,
        status: Option<AttemptStatus>,
    ) -> StoreResult<i64> {
        self.pause().await;
        Ok(self
            .working
            .attempts
            .values()
            .filter(|attempt| {
                attempt.student_id == student_id
                    && attempt.assessment_id == assessment_id
                    && status.map_or(true, |status| attempt.status == status)
            })
            .count() as i64)
    }

    async fn last_completed_at(
        &mut self,
        student_id: i64,
        assessment_id: i64,
    ) -> StoreResult<Option<PrimitiveDateTime>> {
        self.pause().await;
        Ok(self
            .working
            .attempts
            .values()
            .filter(|attempt| {
                attempt.student_id == student_id
                    && attempt.assessment_id == assessment_id
                    && attempt.status == AttemptStatus::Completed
            })
            .filter_map(|attempt| attempt.completed_at)
            .max())
    }

    async fn insert_attempt(&mut self, attempt: NewAttempt) -> StoreResult<Attempt> {
        self.pause().await;
        let active = self.working.attempts.values().any(|existing| {
            existing.student_id == attempt.student_id
                && existing.assessment_id == attempt.assessment_id
                && existing.status == AttemptStatus::InProgress
        });
        if active {
            return Err(StoreError::UniqueViolation("attempts_one_in_progress_key".to_string()));
        }

        let id = self.working.allocate_id();
        let created = Attempt {
            id,
            student_id: attempt.student_id,
            assessment_id: attempt.assessment_id,
            attempt_number: attempt.attempt_number,
            status: AttemptStatus::InProgress,
            started_at: attempt.started_at,
            completed_at: None,
            expires_at: attempt.expires_at,
            current_question_index: 0,
            questions_answered: 0,
            total_questions: attempt.total_questions,
            time_remaining: attempt.time_remaining,
            score: None,
            percentage: None,
            passed: None,
            session_data: Json(attempt.session_data),
            last_activity_at: attempt.started_at,
            created_at: attempt.started_at,
            updated_at: attempt.started_at,
        };
        self.working.attempts.insert(id, created.clone());
        Ok(created)
    }

    async fn save_attempt(&mut self, attempt: &Attempt) -> StoreResult<()> {
        self.pause().await;
        if let Some(existing) = self.working.attempts.get_mut(&attempt.id) {
            let started_at = existing.started_at;
            let total_questions = existing.total_questions;
            *existing = attempt.clone();
            existing.started_at = started_at;
            existing.total_questions = total_questions;
        }
        Ok(())
    }

    async fn delete_attempt(&mut self, id: i64) -> StoreResult<bool> {
        self.pause().await;
        let removed = self.working.attempts.remove(&id).is_some();
        if removed {
            self.working.answers.retain(|_, answer| answer.attempt_id != id);
        }
        Ok(removed)
    }

    async fn list_attempts(&mut self, filter: &AttemptFilter) -> StoreResult<Vec<Attempt>> {
        self.pause().await;
        let mut attempts: Vec<Attempt> = self
            .working
            .attempts
            .values()
            .filter(|attempt| filter.student_id.map_or(true, |id| attempt.student_id == id))
            .filter(|attempt| filter.assessment_id.map_or(true, |id| attempt.assessment_id == id))
            .filter(|attempt| filter.status.map_or(true, |status| attempt.status == status))
            .filter(|attempt| filter.started_from.map_or(true, |from| attempt.started_at >= from))
            .filter(|attempt| filter.started_to.map_or(true, |to| attempt.started_at < to))
            .cloned()
            .collect();
        attempts.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));

        Ok(attempts
            .into_iter()
            .skip(filter.skip.max(0) as usize)
            .take(filter.effective_limit() as usize)
            .collect())
    }

    async fn list_timeout_candidates(
        &mut self,
        expired_before: PrimitiveDateTime,
        limit: i64,
    ) -> StoreResult<Vec<Attempt>> {
        self.pause().await;
        Ok(self
            .working
            .attempts
            .values()
            .filter(|attempt| attempt.status == AttemptStatus::InProgress)
            .filter(|attempt| {
                attempt.time_remaining.is_some_and(|remaining| remaining <= 0)
                    || attempt.expires_at.is_some_and(|expires| expires <= expired_before)
            })
            .take(limit.max(1) as usize)
            .cloned()
            .collect())
    }

    async fn upsert_answer(&mut self, answer: UpsertAnswer) -> StoreResult<Answer> {
        self.pause().await;
        if !self.working.attempts.contains_key(&answer.attempt_id) {
            return Err(StoreError::Backend(format!(
                "attempt {} does not exist",
                answer.attempt_id
            )));
        }

        if let Some(id) = self.pair_answer_id(answer.attempt_id, answer.question_id) {
            let updated = self.update_answer(id, |existing| {
                existing.value = Json(answer.value);
                existing.is_correct = answer.is_correct;
                existing.score = answer.score;
                existing.graded_by = None;
                existing.graded_at = None;
                existing.feedback = None;
                if let Some(seconds) = answer.time_spent {
                    existing.time_spent = existing.time_spent.max(seconds);
                }
                existing.last_modified_at = answer.now;
            });
            return updated.ok_or_else(|| StoreError::Backend(format!("answer {id} vanished")));
        }

        let id = self.working.allocate_id();
        let created = Answer {
            id,
            attempt_id: answer.attempt_id,
            question_id: answer.question_id,
            value: Json(answer.value),
            is_correct: answer.is_correct,
            score: answer.score,
            graded_by: None,
            graded_at: None,
            feedback: None,
            is_flagged: false,
            time_spent: answer.time_spent.unwrap_or(0),
            last_modified_at: answer.now,
            created_at: answer.now,
        };
        self.working.answers.insert(id, created.clone());
        Ok(created)
    }

    async fn find_answer(&mut self, id: i64) -> StoreResult<Option<Answer>> {
        self.pause().await;
        Ok(self.working.answers.get(&id).cloned())
    }

    async fn find_answer_by_pair(
        &mut self,
        attempt_id: i64,
        question_id: i64,
    ) -> StoreResult<Option<Answer>> {
        self.pause().await;
        Ok(self
            .pair_answer_id(attempt_id, question_id)
            .and_then(|id| self.working.answers.get(&id).cloned()))
    }

    async fn list_answers(&mut self, attempt_id: i64) -> StoreResult<Vec<Answer>> {
        self.pause().await;
        Ok(self
            .working
            .answers
            .values()
            .filter(|answer| answer.attempt_id == attempt_id)
            .cloned()
            .collect())
    }

    async fn answer_exists(&mut self, attempt_id: i64, question_id: i64) -> StoreResult<bool> {
        self.pause().await;
        Ok(self.pair_answer_id(attempt_id, question_id).is_some())
    }

    async fn answered_question_ids(&mut self, attempt_id: i64) -> StoreResult<Vec<i64>> {
        self.pause().await;
        let mut ids: Vec<i64> = self
            .working
            .answers
            .values()
            .filter(|answer| answer.attempt_id == attempt_id)
            .map(|answer| answer.question_id)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn grade_answer(&mut self, id: i64, grade: &GradeUpdate) -> StoreResult<Option<Answer>> {
        self.pause().await;
        Ok(self.update_answer(id, |answer| {
            answer.score = Some(grade.score);
            if grade.is_correct.is_some() {
                answer.is_correct = grade.is_correct;
            }
            if grade.feedback.is_some() {
                answer.feedback = grade.feedback.clone();
            }
            answer.graded_by = Some(grade.graded_by);
            answer.graded_at = Some(grade.graded_at);
            answer.last_modified_at = grade.graded_at;
        }))
    }

    async fn clear_grade(
        &mut self,
        id: i64,
        now: PrimitiveDateTime,
    ) -> StoreResult<Option<Answer>> {
        self.pause().await;
        Ok(self.update_answer(id, |answer| {
            answer.score = None;
            answer.is_correct = None;
            answer.feedback = None;
            answer.graded_by = None;
            answer.graded_at = None;
            answer.last_modified_at = now;
        }))
    }

    async fn set_answer_flag(
        &mut self,
        id: i64,
        flagged: bool,
        now: PrimitiveDateTime,
    ) -> StoreResult<Option<Answer>> {
        self.pause().await;
        Ok(self.update_answer(id, |answer| {
            answer.is_flagged = flagged;
            answer.last_modified_at = now;
        }))
    }

    async fn set_time_spent(
        &mut self,
        attempt_id: i64,
        question_id: i64,
        seconds: i32,
        now: PrimitiveDateTime,
    ) -> StoreResult<Option<Answer>> {
        self.pause().await;
        let Some(id) = self.pair_answer_id(attempt_id, question_id) else {
            return Ok(None);
        };
        Ok(self.update_answer(id, |answer| {
            answer.time_spent = seconds;
            answer.last_modified_at = now;
        }))
    }

    async fn delete_answer(&mut self, id: i64) -> StoreResult<Option<Answer>> {
        self.pause().await;
        Ok(self.working.answers.remove(&id))
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let MemoryUnitOfWork { isolation, working, .. } = *self;
        match isolation {
            Isolation::Exclusive(mut guard) => *guard = working,
            Isolation::Snapshot { tables, base } => {
                let mut committed = tables.lock().await;
                let mut merged = committed.clone();
                merged.merge(&base, working);
                merged.check_unique()?;
                *committed = merged;
            }
        }
        Ok(())
    }
}
