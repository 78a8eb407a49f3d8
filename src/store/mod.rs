//! Transaction boundary between the services and durable storage.
//!
//! Services open a [`UnitOfWork`] per operation, issue every read and write
//! through it, and commit once. Dropping a unit of work without committing
//! discards all of its writes.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use thiserror::Error;
use time::PrimitiveDateTime;

use crate::db::models::{Answer, Assessment, AssessmentQuestion, Attempt, Question};
use crate::db::session_data::SessionData;
use crate::db::types::AttemptStatus;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unique constraint {0} violated")]
    UniqueViolation(String),
    #[error(transparent)]
    Database(sqlx::Error),
    #[error("{0}")]
    Backend(String),
}

const UNIQUE_VIOLATION: &str = "23505";

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let Some(db_err) = err.as_database_error() {
            if db_err.code().as_deref() == Some(UNIQUE_VIOLATION) {
                let constraint = db_err.constraint().unwrap_or("unknown").to_string();
                return StoreError::UniqueViolation(constraint);
            }
        }
        StoreError::Database(err)
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone)]
pub struct NewAttempt {
    pub student_id: i64,
    pub assessment_id: i64,
    pub attempt_number: i32,
    pub started_at: PrimitiveDateTime,
    pub expires_at: Option<PrimitiveDateTime>,
    pub total_questions: i32,
    pub time_remaining: Option<i32>,
    pub session_data: SessionData,
}

/// Filters for attempt listings. `None` fields do not constrain the result.
#[derive(Debug, Clone, Default)]
pub struct AttemptFilter {
    pub student_id: Option<i64>,
    pub assessment_id: Option<i64>,
    pub status: Option<AttemptStatus>,
    pub started_from: Option<PrimitiveDateTime>,
    pub started_to: Option<PrimitiveDateTime>,
    pub skip: i64,
    pub limit: i64,
}

impl AttemptFilter {
    pub const MAX_LIMIT: i64 = 1000;

    pub fn effective_limit(&self) -> i64 {
        if self.limit <= 0 {
            100
        } else {
            self.limit.min(Self::MAX_LIMIT)
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpsertAnswer {
    pub attempt_id: i64,
    pub question_id: i64,
    pub value: serde_json::Value,
    pub is_correct: Option<bool>,
    pub score: Option<f64>,
    pub time_spent: Option<i32>,
    pub now: PrimitiveDateTime,
}

/// Reviewer grade; the grader stamp is always written as a pair.
#[derive(Debug, Clone)]
pub struct GradeUpdate {
    pub score: f64,
    pub is_correct: Option<bool>,
    pub feedback: Option<String>,
    pub graded_by: i64,
    pub graded_at: PrimitiveDateTime,
}

#[derive(Debug, Clone)]
pub struct NewLink {
    pub assessment_id: i64,
    pub question_id: i64,
    pub order: i32,
    pub points: Option<f64>,
    pub required: bool,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn begin(&self) -> StoreResult<Box<dyn UnitOfWork>>;
}

#[async_trait]
pub trait UnitOfWork: Send {
    async fn find_assessment(&mut self, id: i64) -> StoreResult<Option<Assessment>>;
    async fn find_question(&mut self, id: i64) -> StoreResult<Option<Question>>;
    async fn find_questions(&mut self, ids: &[i64]) -> StoreResult<Vec<Question>>;

    /// Links ordered by `order`, then `id`.
    async fn list_links(&mut self, assessment_id: i64) -> StoreResult<Vec<AssessmentQuestion>>;
    /// Same as `list_links`, holding row locks until the unit of work ends.
    async fn list_links_for_update(
        &mut self,
        assessment_id: i64,
    ) -> StoreResult<Vec<AssessmentQuestion>>;
    async fn find_link(
        &mut self,
        assessment_id: i64,
        question_id: i64,
    ) -> StoreResult<Option<AssessmentQuestion>>;
    async fn insert_link(&mut self, link: NewLink) -> StoreResult<AssessmentQuestion>;
    async fn delete_link(&mut self, assessment_id: i64, question_id: i64) -> StoreResult<bool>;
    async fn set_link_order(&mut self, link_id: i64, order: i32) -> StoreResult<()>;

    /// Serialises attempt creation for one (student, assessment) pair until the unit ends.
    async fn lock_attempt_slot(&mut self, student_id: i64, assessment_id: i64) -> StoreResult<()>;
    async fn find_attempt(&mut self, id: i64) -> StoreResult<Option<Attempt>>;
    async fn find_attempt_for_update(&mut self, id: i64) -> StoreResult<Option<Attempt>>;
    /// Holds off terminal transitions of the attempt until the unit ends.
    async fn find_attempt_for_share(&mut self, id: i64) -> StoreResult<Option<Attempt>>;
    async fn find_in_progress_attempt(
        &mut self,
        student_id: i64,
        assessment_id: i64,
    ) -> StoreResult<Option<Attempt>>;
    async fn count_attempts(
        &mut self,
        student_id: i64,
        assessment_id: i64,
        status: Option<AttemptStatus>,
    ) -> StoreResult<i64>;
    async fn last_completed_at(
        &mut self,
        student_id: i64,
        assessment_id: i64,
    ) -> StoreResult<Option<PrimitiveDateTime>>;
    async fn insert_attempt(&mut self, attempt: NewAttempt) -> StoreResult<Attempt>;
    /// Writes every mutable column of `attempt`.
    async fn save_attempt(&mut self, attempt: &Attempt) -> StoreResult<()>;
    async fn delete_attempt(&mut self, id: i64) -> StoreResult<bool>;
    async fn list_attempts(&mut self, filter: &AttemptFilter) -> StoreResult<Vec<Attempt>>;
    /// In-progress attempts with no time left or an expiry at or before `expired_before`.
    async fn list_timeout_candidates(
        &mut self,
        expired_before: PrimitiveDateTime,
        limit: i64,
    ) -> StoreResult<Vec<Attempt>>;

    async fn upsert_answer(&mut self, answer: UpsertAnswer) -> StoreResult<Answer>;
    async fn find_answer(&mut self, id: i64) -> StoreResult<Option<Answer>>;
    async fn find_answer_by_pair(
        &mut self,
        attempt_id: i64,
        question_id: i64,
    ) -> StoreResult<Option<Answer>>;
    async fn list_answers(&mut self, attempt_id: i64) -> StoreResult<Vec<Answer>>;
    async fn answer_exists(&mut self, attempt_id: i64, question_id: i64) -> StoreResult<bool>;
    async fn answered_question_ids(&mut self, attempt_id: i64) -> StoreResult<Vec<i64>>;
    async fn grade_answer(&mut self, id: i64, grade: &GradeUpdate) -> StoreResult<Option<Answer>>;
    async fn clear_grade(&mut self, id: i64, now: PrimitiveDateTime)
        -> StoreResult<Option<Answer>>;
    async fn set_answer_flag(
        &mut self,
        id: i64,
        flagged: bool,
        now: PrimitiveDateTime,
    ) -> StoreResult<Option<Answer>>;
    async fn set_time_spent(
        &mut self,
        attempt_id: i64,
        question_id: i64,
        seconds: i32,
        now: PrimitiveDateTime,
    ) -> StoreResult<Option<Answer>>;
    async fn delete_answer(&mut self, id: i64) -> StoreResult<Option<Answer>>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;
}
