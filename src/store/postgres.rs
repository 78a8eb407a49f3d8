use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};
use time::PrimitiveDateTime;

use crate::db::models::{Answer, Assessment, AssessmentQuestion, Attempt, Question};
use crate::db::types::AttemptStatus;
use crate::repositories;
use crate::store::{
    AttemptFilter, GradeUpdate, NewAttempt, NewLink, Store, StoreResult, UnitOfWork, UpsertAnswer,
};

/// Postgres-backed store; each unit of work is one database transaction.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn ping(&self) -> StoreResult<()> {
        repositories::health::ping(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> StoreResult<Box<dyn UnitOfWork>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgUnitOfWork { tx }))
    }
}

pub struct PgUnitOfWork {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    async fn find_assessment(&mut self, id: i64) -> StoreResult<Option<Assessment>> {
        Ok(repositories::assessments::find_by_id(&mut *self.tx, id).await?)
    }

    async fn find_question(&mut self, id: i64) -> StoreResult<Option<Question>> {
        Ok(repositories::questions::find_by_id(&mut *self.tx, id).await?)
    }

    async fn find_questions(&mut self, ids: &[i64]) -> StoreResult<Vec<Question>> {
        Ok(repositories::questions::list_by_ids(&mut *self.tx, ids).await?)
    }

    async fn list_links(&mut self, assessment_id: i64) -> StoreResult<Vec<AssessmentQuestion>> {
        Ok(repositories::assessment_questions::list_by_assessment(&mut *self.tx, assessment_id)
            .await?)
    }

    async fn list_links_for_update(
        &mut self,
        assessment_id: i64,
    ) -> StoreResult<Vec<AssessmentQuestion>> {
        Ok(repositories::assessment_questions::list_by_assessment_for_update(
            &mut *self.tx,
            assessment_id,
        )
        .await?)
    }

    async fn find_link(
        &mut self,
        assessment_id: i64,
        question_id: i64,
    ) -> StoreResult<Option<AssessmentQuestion>> {
        Ok(repositories::assessment_questions::find_by_pair(
            &mut *self.tx,
            assessment_id,
            question_id,
        )
        .await?)
    }

    async fn insert_link(&mut self, link: NewLink) -> StoreResult<AssessmentQuestion> {
        Ok(repositories::assessment_questions::create(&mut *self.tx, link).await?)
    }

    async fn delete_link(&mut self, assessment_id: i64, question_id: i64) -> StoreResult<bool> {
        Ok(repositories::assessment_questions::delete_by_pair(
            &mut *self.tx,
            assessment_id,
            question_id,
        )
        .await?)
    }

    async fn set_link_order(&mut self, link_id: i64, order: i32) -> StoreResult<()> {
        Ok(repositories::assessment_questions::set_order(&mut *self.tx, link_id, order).await?)
    }

    async fn lock_attempt_slot(&mut self, student_id: i64, assessment_id: i64) -> StoreResult<()> {
        Ok(repositories::attempts::acquire_slot_lock(&mut *self.tx, student_id, assessment_id)
            .await?)
    }

    async fn find_attempt(&mut self, id: i64) -> StoreResult<Option<Attempt>> {
        Ok(repositories::attempts::find_by_id(&mut *self.tx, id).await?)
    }

    async fn find_attempt_for_update(&mut self, id: i64) -> StoreResult<Option<Attempt>> {
        Ok(repositories::attempts::find_by_id_for_update(&mut *self.tx, id).await?)
    }

    async fn find_attempt_for_share(&mut self, id: i64) -> StoreResult<Option<Attempt>> {
        Ok(repositories::attempts::find_by_id_for_share(&mut *self.tx, id).await?)
    }

    async fn find_in_progress_attempt(
        &mut self,
        student_id: i64,
        assessment_id: i64,
    ) -> StoreResult<Option<Attempt>> {
        Ok(repositories::attempts::find_in_progress(&mut *self.tx, student_id, assessment_id)
            .await?)
    }

    async fn count_attempts(
        &mut self,
        student_id: i64,
        assessment_id: i64,
        status: Option<AttemptStatus>,
    ) -> StoreResult<i64> {
        Ok(repositories::attempts::count_by_pair(&mut *self.tx, student_id, assessment_id, status)
            .await?)
    }

    async fn last_completed_at(
        &mut self,
        student_id: i64,
        assessment_id: i64,
    ) -> StoreResult<Option<PrimitiveDateTime>> {
        Ok(repositories::attempts::last_completed_at(&mut *self.tx, student_id, assessment_id)
            .await?)
    }

    async fn insert_attempt(&mut self, attempt: NewAttempt) -> StoreResult<Attempt> {
        Ok(repositories::attempts::create(&mut *self.tx, attempt).await?)
    }

    async fn save_attempt(&mut self, attempt: &Attempt) -> StoreResult<()> {
        Ok(repositories::attempts::save(&mut *self.tx, attempt).await?)
    }

    async fn delete_attempt(&mut self, id: i64) -> StoreResult<bool> {
        Ok(repositories::attempts::delete_by_id(&mut *self.tx, id).await?)
    }

    async fn list_attempts(&mut self, filter: &AttemptFilter) -> StoreResult<Vec<Attempt>> {
        Ok(repositories::attempts::list(&mut *self.tx, filter).await?)
    }

    async fn list_timeout_candidates(
        &mut self,
        expired_before: PrimitiveDateTime,
        limit: i64,
    ) -> StoreResult<Vec<Attempt>> {
        Ok(repositories::attempts::list_timeout_candidates(&mut *self.tx, expired_before, limit)
            .await?)
    }

    async fn upsert_answer(&mut self, answer: UpsertAnswer) -> StoreResult<Answer> {
        Ok(repositories::answers::upsert(&mut *self.tx, answer).await?)
    }

    async fn find_answer(&mut self, id: i64) -> StoreResult<Option<Answer>> {
        Ok(repositories::answers::find_by_id(&mut *self.tx, id).await?)
    }

    async fn find_answer_by_pair(
        &mut self,
        attempt_id: i64,
        question_id: i64,
    ) -> StoreResult<Option<Answer>> {
        Ok(repositories::answers::find_by_pair(&mut *self.tx, attempt_id, question_id).await?)
    }

    async fn list_answers(&mut self, attempt_id: i64) -> StoreResult<Vec<Answer>> {
        Ok(repositories::answers::list_by_attempt(&mut *self.tx, attempt_id).await?)
    }

    async fn answer_exists(&mut self, attempt_id: i64, question_id: i64) -> StoreResult<bool> {
        Ok(repositories::answers::exists(&mut *self.tx, attempt_id, question_id).await?)
    }

    async fn answered_question_ids(&mut self, attempt_id: i64) -> StoreResult<Vec<i64>> {
        Ok(repositories::answers::answered_question_ids(&mut *self.tx, attempt_id).await?)
    }

    async fn grade_answer(&mut self, id: i64, grade: &GradeUpdate) -> StoreResult<Option<Answer>> {
        Ok(repositories::answers::grade(&mut *self.tx, id, grade).await?)
    }

    async fn clear_grade(
        &mut self,
        id: i64,
        now: PrimitiveDateTime,
    ) -> StoreResult<Option<Answer>> {
        Ok(repositories::answers::clear_grade(&mut *self.tx, id, now).await?)
    }

    async fn set_answer_flag(
        &mut self,
        id: i64,
        flagged: bool,
        now: PrimitiveDateTime,
    ) -> StoreResult<Option<Answer>> {
        Ok(repositories::answers::set_flag(&mut *self.tx, id, flagged, now).await?)
    }

    async fn set_time_spent(
        &mut self,
        attempt_id: i64,
        question_id: i64,
        seconds: i32,
        now: PrimitiveDateTime,
    ) -> StoreResult<Option<Answer>> {
        Ok(repositories::answers::set_time_spent(&mut *self.tx, attempt_id, question_id, seconds, now)
            .await?)
    }

    async fn delete_answer(&mut self, id: i64) -> StoreResult<Option<Answer>> {
        Ok(repositories::answers::delete_by_id(&mut *self.tx, id).await?)
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.tx.commit().await?;
        Ok(())
    }
}
