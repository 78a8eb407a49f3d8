use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use serde::Deserialize;
use time::PrimitiveDateTime;
use validator::Validate;

use crate::cache::CacheCoordinator;
use crate::core::context::RequestContext;
use crate::core::errors::{DomainError, DomainResult};
use crate::core::time::Clock;
use crate::db::models::{Answer, Attempt};
use crate::services::{scoring, sequencer};
use crate::store::{GradeUpdate, Store, UnitOfWork, UpsertAnswer};

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct SubmitAnswer {
    pub attempt_id: i64,
    pub question_id: i64,
    pub value: serde_json::Value,
    #[validate(range(min = 0, message = "time_spent must be non-negative"))]
    pub time_spent: Option<i32>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct GradeInput {
    pub answer_id: i64,
    #[validate(range(min = 0.0, message = "score must be non-negative"))]
    pub score: f64,
    pub is_correct: Option<bool>,
    #[validate(length(max = 10000, message = "feedback is too long"))]
    pub feedback: Option<String>,
}

impl GradeInput {
    fn check(&self) -> DomainResult<()> {
        self.validate().map_err(|err| {
            DomainError::Validation(format!("grade for answer {}: {err}", self.answer_id))
        })?;
        if !self.score.is_finite() {
            return Err(DomainError::Validation(format!(
                "grade for answer {}: score must be a finite number",
                self.answer_id
            )));
        }
        Ok(())
    }

    fn stamp(&self, grader_id: i64, now: PrimitiveDateTime) -> GradeUpdate {
        GradeUpdate {
            score: self.score,
            is_correct: self.is_correct,
            feedback: self.feedback.clone(),
            graded_by: grader_id,
            graded_at: now,
        }
    }
}

/// Answers within attempts: upsert, grading, flags and time tracking.
///
/// Every write invalidates the answer's own key and every key under its
/// attempt's scope once the store has committed.
#[derive(Clone)]
pub struct AnswerLedger {
    store: Arc<dyn Store>,
    cache: CacheCoordinator,
    clock: Arc<dyn Clock>,
}

impl AnswerLedger {
    pub fn new(store: Arc<dyn Store>, cache: CacheCoordinator, clock: Arc<dyn Clock>) -> Self {
        Self { store, cache, clock }
    }

    /// Creates the answer for (attempt, question) or replaces its value in place.
    ///
    /// Resubmitting drops any earlier grade; objective questions are graded again
    /// against the stored key.
    pub async fn upsert(&self, ctx: &RequestContext, input: SubmitAnswer) -> DomainResult<Answer> {
        input.validate().map_err(|err| DomainError::Validation(err.to_string()))?;

        let now = self.clock.now();
        let mut uow = super::begin(self.store.as_ref(), ctx).await?;
        let attempt = lock_open_attempt(&mut *uow, ctx, input.attempt_id, "answer").await?;

        let link = ctx
            .store(
                "Failed to fetch assessment question",
                uow.find_link(attempt.assessment_id, input.question_id),
            )
            .await?
            .ok_or_else(|| {
                DomainError::Validation(format!(
                    "question {} is not part of assessment {}",
                    input.question_id, attempt.assessment_id
                ))
            })?;
        let question = ctx
            .store("Failed to fetch question", uow.find_question(input.question_id))
            .await?
            .ok_or_else(|| DomainError::not_found("question", input.question_id))?;

        let graded = scoring::auto_grade(&question, &link, &input.value);
        let answer = ctx
            .store(
                "Failed to save answer",
                uow.upsert_answer(UpsertAnswer {
                    attempt_id: input.attempt_id,
                    question_id: input.question_id,
                    value: input.value,
                    is_correct: graded.map(|(is_correct, _)| is_correct),
                    score: graded.map(|(_, score)| score),
                    time_spent: input.time_spent,
                    now,
                }),
            )
            .await?;
        super::commit(ctx, uow, "Failed to commit answer").await?;
        self.invalidate_one(&answer).await;

        metrics::counter!("answers_upserted_total").increment(1);
        tracing::debug!(
            answer_id = answer.id,
            attempt_id = answer.attempt_id,
            question_id = answer.question_id,
            auto_graded = graded.is_some(),
            "Answer saved"
        );
        Ok(answer)
    }

    pub async fn get(&self, ctx: &RequestContext, answer_id: i64) -> DomainResult<Answer> {
        let key = self.cache.keys().answer(answer_id);
        self.cache
            .read_through(ctx, &key, self.cache.entity_ttl(), || async {
                let mut uow = super::begin(self.store.as_ref(), ctx).await?;
                let answer = ctx
                    .store("Failed to fetch answer", uow.find_answer(answer_id))
                    .await?
                    .ok_or_else(|| DomainError::not_found("answer", answer_id))?;
                Ok::<_, DomainError>(answer)
            })
            .await
    }

    pub async fn get_by_attempt_and_question(
        &self,
        ctx: &RequestContext,
        attempt_id: i64,
        question_id: i64,
    ) -> DomainResult<Answer> {
        let key = self.cache.keys().answer_by_question(attempt_id, question_id);
        self.cache
            .read_through(ctx, &key, self.cache.entity_ttl(), || async {
                let mut uow = super::begin(self.store.as_ref(), ctx).await?;
                let answer = ctx
                    .store(
                        "Failed to fetch answer",
                        uow.find_answer_by_pair(attempt_id, question_id),
                    )
                    .await?
                    .ok_or_else(|| {
                        DomainError::not_found("answer", format!("{attempt_id}/{question_id}"))
                    })?;
                Ok::<_, DomainError>(answer)
            })
            .await
    }

    pub async fn list_by_attempt(
        &self,
        ctx: &RequestContext,
        attempt_id: i64,
    ) -> DomainResult<Vec<Answer>> {
        let key = self.cache.keys().attempt_answers(attempt_id);
        self.cache
            .read_through(ctx, &key, self.cache.list_ttl(), || async {
                let mut uow = super::begin(self.store.as_ref(), ctx).await?;
                let answers =
                    ctx.store("Failed to list answers", uow.list_answers(attempt_id)).await?;
                Ok::<_, DomainError>(answers)
            })
            .await
    }

    /// Whether the pair has an answer. Served from a short-lived flag when present.
    pub async fn exists(
        &self,
        ctx: &RequestContext,
        attempt_id: i64,
        question_id: i64,
    ) -> DomainResult<bool> {
        let key = self.cache.keys().answer_exists(attempt_id, question_id);
        self.cache
            .read_through(ctx, &key, self.cache.exists_ttl(), || async {
                let mut uow = super::begin(self.store.as_ref(), ctx).await?;
                let exists = ctx
                    .store("Failed to check answer", uow.answer_exists(attempt_id, question_id))
                    .await?;
                Ok::<_, DomainError>(exists)
            })
            .await
    }

    pub async fn grade(
        &self,
        ctx: &RequestContext,
        grader_id: i64,
        input: GradeInput,
    ) -> DomainResult<Answer> {
        input.check()?;

        let now = self.clock.now();
        let mut uow = super::begin(self.store.as_ref(), ctx).await?;
        let update = input.stamp(grader_id, now);
        let answer = ctx
            .store("Failed to grade answer", uow.grade_answer(input.answer_id, &update))
            .await?
            .ok_or_else(|| DomainError::not_found("answer", input.answer_id))?;
        super::commit(ctx, uow, "Failed to commit grade").await?;
        self.invalidate_one(&answer).await;

        metrics::counter!("answers_graded_total").increment(1);
        tracing::info!(grader_id, answer_id = answer.id, "Answer graded");
        Ok(answer)
    }

    /// Applies every grade in one transaction. The first invalid or missing
    /// answer aborts the batch and nothing is written.
    pub async fn bulk_grade(
        &self,
        ctx: &RequestContext,
        grader_id: i64,
        grades: Vec<GradeInput>,
    ) -> DomainResult<Vec<Answer>> {
        for grade in &grades {
            grade.check()?;
        }
        let mut seen = HashSet::with_capacity(grades.len());
        if let Some(duplicate) = grades.iter().find(|grade| !seen.insert(grade.answer_id)) {
            return Err(DomainError::Validation(format!(
                "answer {} is graded more than once in the batch",
                duplicate.answer_id
            )));
        }
        if grades.is_empty() {
            return Ok(Vec::new());
        }

        let now = self.clock.now();
        let mut uow = super::begin(self.store.as_ref(), ctx).await?;
        let mut graded = Vec::with_capacity(grades.len());
        for grade in grades {
            let update = grade.stamp(grader_id, now);
            let answer = ctx
                .store("Failed to grade answer", uow.grade_answer(grade.answer_id, &update))
                .await?
                .ok_or_else(|| DomainError::not_found("answer", grade.answer_id))?;
            graded.push(answer);
        }
        super::commit(ctx, uow, "Failed to commit grades").await?;
        self.invalidate_many(&graded).await;

        metrics::counter!("answers_graded_total").increment(graded.len() as u64);
        tracing::info!(grader_id, count = graded.len(), "Answers graded");
        Ok(graded)
    }

    /// Drops score, correctness, feedback and the grader stamp together.
    pub async fn clear_grade(&self, ctx: &RequestContext, answer_id: i64) -> DomainResult<Answer> {
        let now = self.clock.now();
        let mut uow = super::begin(self.store.as_ref(), ctx).await?;
        let answer = ctx
            .store("Failed to clear grade", uow.clear_grade(answer_id, now))
            .await?
            .ok_or_else(|| DomainError::not_found("answer", answer_id))?;
        super::commit(ctx, uow, "Failed to commit cleared grade").await?;
        self.invalidate_one(&answer).await;
        Ok(answer)
    }

    pub async fn set_flag(
        &self,
        ctx: &RequestContext,
        answer_id: i64,
        flagged: bool,
    ) -> DomainResult<Answer> {
        let now = self.clock.now();
        let mut uow = super::begin(self.store.as_ref(), ctx).await?;
        let answer = ctx
            .store("Failed to flag answer", uow.set_answer_flag(answer_id, flagged, now))
            .await?
            .ok_or_else(|| DomainError::not_found("answer", answer_id))?;
        super::commit(ctx, uow, "Failed to commit answer flag").await?;
        self.invalidate_one(&answer).await;
        Ok(answer)
    }

    pub async fn flag(&self, ctx: &RequestContext, answer_id: i64) -> DomainResult<Answer> {
        self.set_flag(ctx, answer_id, true).await
    }

    pub async fn unflag(&self, ctx: &RequestContext, answer_id: i64) -> DomainResult<Answer> {
        self.set_flag(ctx, answer_id, false).await
    }

    /// Sets the accumulated time for a question. Callers only ever pass larger values.
    pub async fn update_time_spent(
        &self,
        ctx: &RequestContext,
        attempt_id: i64,
        question_id: i64,
        seconds: i32,
    ) -> DomainResult<Answer> {
        if seconds < 0 {
            return Err(DomainError::Validation("time_spent must be non-negative".to_string()));
        }

        let now = self.clock.now();
        let mut uow = super::begin(self.store.as_ref(), ctx).await?;
        lock_open_attempt(&mut *uow, ctx, attempt_id, "track time on").await?;
        let answer = ctx
            .store(
                "Failed to update time spent",
                uow.set_time_spent(attempt_id, question_id, seconds, now),
            )
            .await?
            .ok_or_else(|| DomainError::not_found("answer", format!("{attempt_id}/{question_id}")))?;
        super::commit(ctx, uow, "Failed to commit time spent").await?;
        self.invalidate_one(&answer).await;
        Ok(answer)
    }

    pub async fn answered_question_ids(
        &self,
        ctx: &RequestContext,
        attempt_id: i64,
    ) -> DomainResult<Vec<i64>> {
        let key = self.cache.keys().answered_questions(attempt_id);
        self.cache
            .read_through(ctx, &key, self.cache.list_ttl(), || async {
                let mut uow = super::begin(self.store.as_ref(), ctx).await?;
                let ids = ctx
                    .store("Failed to list answered questions", uow.answered_question_ids(attempt_id))
                    .await?;
                Ok::<_, DomainError>(ids)
            })
            .await
    }

    /// Questions of the attempt's assessment without an answer, in delivery order.
    pub async fn unanswered_question_ids(
        &self,
        ctx: &RequestContext,
        attempt_id: i64,
    ) -> DomainResult<Vec<i64>> {
        let mut uow = super::begin(self.store.as_ref(), ctx).await?;
        let attempt = ctx
            .store("Failed to fetch attempt", uow.find_attempt(attempt_id))
            .await?
            .ok_or_else(|| DomainError::not_found("attempt", attempt_id))?;
        let links = ctx
            .store("Failed to fetch assessment questions", uow.list_links(attempt.assessment_id))
            .await?;
        drop(uow);

        let answered: HashSet<i64> =
            self.answered_question_ids(ctx, attempt_id).await?.into_iter().collect();
        Ok(sequencer::for_attempt(links, &attempt.session_data.0)
            .into_iter()
            .map(|link| link.question_id)
            .filter(|question_id| !answered.contains(question_id))
            .collect())
    }

    pub async fn delete(&self, ctx: &RequestContext, answer_id: i64) -> DomainResult<()> {
        let mut uow = super::begin(self.store.as_ref(), ctx).await?;
        let answer = ctx
            .store("Failed to delete answer", uow.delete_answer(answer_id))
            .await?
            .ok_or_else(|| DomainError::not_found("answer", answer_id))?;
        super::commit(ctx, uow, "Failed to commit answer deletion").await?;
        self.invalidate_one(&answer).await;

        tracing::info!(answer_id, attempt_id = answer.attempt_id, "Answer deleted");
        Ok(())
    }

    async fn invalidate_one(&self, answer: &Answer) {
        self.invalidate_many(std::slice::from_ref(answer)).await;
    }

    /// One key per answer, one prefix delete per distinct attempt.
    async fn invalidate_many(&self, answers: &[Answer]) {
        let keys = self.cache.keys();
        let attempts: BTreeSet<i64> = answers.iter().map(|answer| answer.attempt_id).collect();
        self.cache
            .invalidate(
                answers.iter().map(|answer| keys.answer(answer.id)),
                attempts.into_iter().map(|attempt_id| keys.attempt_scope(attempt_id)),
            )
            .await;
    }
}

/// Loads the attempt under a share lock so a concurrent submit or sweep
/// cannot close it before this unit of work commits.
async fn lock_open_attempt(
    uow: &mut dyn UnitOfWork,
    ctx: &RequestContext,
    attempt_id: i64,
    action: &str,
) -> DomainResult<Attempt> {
    let attempt = ctx
        .store("Failed to lock attempt", uow.find_attempt_for_share(attempt_id))
        .await?
        .ok_or_else(|| DomainError::not_found("attempt", attempt_id))?;
    if !attempt.is_in_progress() {
        return Err(DomainError::InvalidState(format!(
            "cannot {action} attempt {}: it is {}",
            attempt.id,
            attempt.status.as_str()
        )));
    }
    Ok(attempt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::core::config::CacheSettings;
    use crate::db::models::Grading;
    use crate::test_support::{self, Fixture, SlowSetCache};
    use serde_json::json;
    use std::time::Duration;

    async fn started(fixture: &Fixture) -> i64 {
        fixture.attempts.start(&RequestContext::new(), 1, fixture.assessment.id).await.unwrap().id
    }

    fn grade(answer_id: i64, score: f64) -> GradeInput {
        GradeInput { answer_id, score, is_correct: Some(score > 0.0), feedback: None }
    }

    #[tokio::test]
    async fn upsert_keeps_one_row_per_pair() {
        let fixture = Fixture::with_questions(3).await;
        let ctx = RequestContext::new();
        let attempt_id = started(&fixture).await;
        let question_id = fixture.question_ids[2];

        let first = fixture
            .answers
            .upsert(&ctx, test_support::submission(attempt_id, question_id, json!("B")))
            .await
            .unwrap();
        let fetched = fixture.answers.get_by_attempt_and_question(&ctx, attempt_id, question_id).await.unwrap();
        assert_eq!(fetched.value.0, json!("B"));

        let second = fixture
            .answers
            .upsert(&ctx, test_support::submission(attempt_id, question_id, json!("C")))
            .await
            .unwrap();
        assert_eq!(second.id, first.id);

        let fetched = fixture.answers.get_by_attempt_and_question(&ctx, attempt_id, question_id).await.unwrap();
        assert_eq!(fetched.id, first.id);
        assert_eq!(fetched.value.0, json!("C"));
        assert_eq!(fixture.store.answers_for_pair(attempt_id, question_id).await.len(), 1);
    }

    #[tokio::test]
    async fn writes_never_serve_pre_write_payload() {
        let fixture = Fixture::with_questions(2).await;
        let ctx = RequestContext::new();
        let attempt_id = started(&fixture).await;
        let question_id = fixture.question_ids[0];

        let answer = fixture
            .answers
            .upsert(&ctx, test_support::submission(attempt_id, question_id, json!("old")))
            .await
            .unwrap();
        assert_eq!(fixture.answers.get(&ctx, answer.id).await.unwrap().value.0, json!("old"));
        assert_eq!(fixture.answers.list_by_attempt(&ctx, attempt_id).await.unwrap()[0].value.0, json!("old"));
        assert!(fixture.cache.contains(&fixture.keys().answer(answer.id)));

        fixture
            .answers
            .upsert(&ctx, test_support::submission(attempt_id, question_id, json!("new")))
            .await
            .unwrap();
        assert_eq!(fixture.answers.get(&ctx, answer.id).await.unwrap().value.0, json!("new"));
        let listed = fixture.answers.list_by_attempt(&ctx, attempt_id).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].value.0, json!("new"));

        let flagged = fixture.answers.flag(&ctx, answer.id).await.unwrap();
        assert!(flagged.is_flagged);
        assert!(fixture.answers.get(&ctx, answer.id).await.unwrap().is_flagged);
    }

    #[tokio::test]
    async fn slow_reader_does_not_restore_overwritten_answer() {
        let fixture = Fixture::with_questions(1).await;
        let ctx = RequestContext::new();
        let attempt_id = started(&fixture).await;
        let question_id = fixture.question_ids[0];
        let answer = fixture
            .answers
            .upsert(&ctx, test_support::submission(attempt_id, question_id, json!("old")))
            .await
            .unwrap();

        let cache = SlowSetCache::new(
            MemoryCache::new(),
            fixture.keys().answer(answer.id),
            Duration::from_millis(80),
        );
        let ledger = AnswerLedger::new(
            Arc::new(fixture.store.clone()),
            CacheCoordinator::new(Arc::new(cache), CacheSettings::default()),
            fixture.clock.clone(),
        );

        let reader = {
            let ledger = ledger.clone();
            tokio::spawn(async move { ledger.get(&RequestContext::new(), answer.id).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        ledger
            .upsert(&ctx, test_support::submission(attempt_id, question_id, json!("new")))
            .await
            .unwrap();
        assert_eq!(reader.await.unwrap().unwrap().value.0, json!("old"));
        assert_eq!(ledger.get(&ctx, answer.id).await.unwrap().value.0, json!("new"));
    }

    #[tokio::test]
    async fn objective_answers_are_auto_graded_without_reviewer() {
        let fixture = Fixture::with_questions(2).await;
        let ctx = RequestContext::new();
        let attempt_id = started(&fixture).await;

        let correct = fixture
            .answers
            .upsert(&ctx, test_support::submission(attempt_id, fixture.question_ids[0], json!("a")))
            .await
            .unwrap();
        assert_eq!(correct.grading(), Grading::Automatic { is_correct: Some(true), score: 2.0 });

        let wrong = fixture
            .answers
            .upsert(&ctx, test_support::submission(attempt_id, fixture.question_ids[1], json!("D")))
            .await
            .unwrap();
        assert_eq!(wrong.grading(), Grading::Automatic { is_correct: Some(false), score: 0.0 });
    }

    #[tokio::test]
    async fn upsert_rejects_foreign_questions_and_closed_attempts() {
        let fixture = Fixture::with_questions(1).await;
        let ctx = RequestContext::new();
        let attempt_id = started(&fixture).await;
        let stray = fixture.store.put_question(test_support::question(0, 1.0)).await;

        let err = fixture
            .answers
            .upsert(&ctx, test_support::submission(attempt_id, stray.id, json!("A")))
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));

        fixture.attempts.abandon(&ctx, attempt_id).await.unwrap();
        let err = fixture
            .answers
            .upsert(&ctx, test_support::submission(attempt_id, fixture.question_ids[0], json!("A")))
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidState(_)));
    }

    #[tokio::test]
    async fn grading_stamps_reviewer_atomically() {
        let fixture = Fixture::essays(1).await;
        let ctx = RequestContext::new();
        let attempt_id = started(&fixture).await;
        let answer = fixture
            .answers
            .upsert(&ctx, test_support::submission(attempt_id, fixture.question_ids[0], json!("essay")))
            .await
            .unwrap();
        assert_eq!(answer.grading(), Grading::Ungraded);
        assert!(answer.graded_at.is_none() && answer.graded_by.is_none());

        let input = GradeInput {
            answer_id: answer.id,
            score: 1.5,
            is_correct: None,
            feedback: Some("Good structure".to_string()),
        };
        let graded = fixture.answers.grade(&ctx, 77, input).await.unwrap();
        assert_eq!(
            graded.grading(),
            Grading::Reviewed {
                score: 1.5,
                is_correct: None,
                graded_by: 77,
                graded_at: fixture.clock.now(),
                feedback: Some("Good structure".to_string()),
            }
        );

        let cleared = fixture.answers.clear_grade(&ctx, answer.id).await.unwrap();
        assert_eq!(cleared.grading(), Grading::Ungraded);
        assert!(cleared.graded_at.is_none() && cleared.graded_by.is_none() && cleared.feedback.is_none());
    }

    #[tokio::test]
    async fn grading_a_missing_answer_is_not_found() {
        let fixture = Fixture::essays(1).await;
        let ctx = RequestContext::new();

        let err = fixture.answers.grade(&ctx, 77, grade(4040, 1.0)).await.unwrap_err();
        assert!(matches!(err, DomainError::NotFound { entity: "answer", ref id } if id == "4040"));

        let err = fixture.answers.grade(&ctx, 77, grade(4040, f64::NAN)).await.unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[tokio::test]
    async fn bulk_grade_is_all_or_nothing() {
        let fixture = Fixture::essays(2).await;
        let ctx = RequestContext::new();
        let attempt_id = started(&fixture).await;
        let mut ids = Vec::new();
        for question_id in &fixture.question_ids {
            let answer = fixture
                .answers
                .upsert(&ctx, test_support::submission(attempt_id, *question_id, json!("text")))
                .await
                .unwrap();
            ids.push(answer.id);
        }
        fixture.answers.list_by_attempt(&ctx, attempt_id).await.unwrap();

        let err = fixture
            .answers
            .bulk_grade(&ctx, 9, vec![grade(ids[0], 1.0), grade(4040, 1.0)])
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::NotFound { ref id, .. } if id == "4040"));
        assert_eq!(fixture.answers.get(&ctx, ids[0]).await.unwrap().grading(), Grading::Ungraded);

        let err = fixture
            .answers
            .bulk_grade(&ctx, 9, vec![grade(ids[0], 1.0), grade(ids[1], -2.0)])
            .await
            .unwrap_err();
        assert!(err.to_string().contains(&format!("answer {}", ids[1])));

        let graded = fixture
            .answers
            .bulk_grade(&ctx, 9, vec![grade(ids[0], 1.0), grade(ids[1], 0.0)])
            .await
            .unwrap();
        assert_eq!(graded.len(), 2);
        let listed = fixture.answers.list_by_attempt(&ctx, attempt_id).await.unwrap();
        assert!(listed.iter().all(|answer| answer.graded_by == Some(9)));
    }

    #[tokio::test]
    async fn exists_flag_is_refreshed_by_writes() {
        let fixture = Fixture::with_questions(2).await;
        let ctx = RequestContext::new();
        let attempt_id = started(&fixture).await;
        let question_id = fixture.question_ids[1];

        assert!(!fixture.answers.exists(&ctx, attempt_id, question_id).await.unwrap());
        let answer = fixture
            .answers
            .upsert(&ctx, test_support::submission(attempt_id, question_id, json!("A")))
            .await
            .unwrap();
        assert!(fixture.answers.exists(&ctx, attempt_id, question_id).await.unwrap());

        fixture.answers.delete(&ctx, answer.id).await.unwrap();
        assert!(!fixture.answers.exists(&ctx, attempt_id, question_id).await.unwrap());
        assert!(matches!(
            fixture.answers.get(&ctx, answer.id).await.unwrap_err(),
            DomainError::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn answered_and_unanswered_partition_the_assessment() {
        let fixture = Fixture::with_questions(3).await;
        let ctx = RequestContext::new();
        let attempt_id = started(&fixture).await;
        let ids = fixture.question_ids.clone();

        fixture
            .answers
            .upsert(&ctx, test_support::submission(attempt_id, ids[1], json!("A")))
            .await
            .unwrap();

        assert_eq!(fixture.answers.answered_question_ids(&ctx, attempt_id).await.unwrap(), vec![ids[1]]);
        assert_eq!(
            fixture.answers.unanswered_question_ids(&ctx, attempt_id).await.unwrap(),
            vec![ids[0], ids[2]]
        );

        fixture
            .answers
            .upsert(&ctx, test_support::submission(attempt_id, ids[0], json!("A")))
            .await
            .unwrap();
        assert_eq!(fixture.answers.unanswered_question_ids(&ctx, attempt_id).await.unwrap(), vec![ids[2]]);
    }

    #[tokio::test]
    async fn time_spent_updates_existing_answer() {
        let fixture = Fixture::with_questions(1).await;
        let ctx = RequestContext::new();
        let attempt_id = started(&fixture).await;
        let question_id = fixture.question_ids[0];

        let err = fixture.answers.update_time_spent(&ctx, attempt_id, question_id, 30).await.unwrap_err();
        assert!(matches!(err, DomainError::NotFound { .. }));

        fixture
            .answers
            .upsert(&ctx, test_support::submission(attempt_id, question_id, json!("A")))
            .await
            .unwrap();
        let updated = fixture.answers.update_time_spent(&ctx, attempt_id, question_id, 30).await.unwrap();
        assert_eq!(updated.time_spent, 30);
        let fetched = fixture.answers.get_by_attempt_and_question(&ctx, attempt_id, question_id).await.unwrap();
        assert_eq!(fetched.time_spent, 30);
    }

    #[tokio::test]
    async fn closed_attempts_reject_answer_writes() {
        let fixture = Fixture::with_questions(1).await;
        let ctx = RequestContext::new();
        let attempt_id = started(&fixture).await;
        let question_id = fixture.question_ids[0];
        fixture
            .answers
            .upsert(&ctx, test_support::submission(attempt_id, question_id, json!("A")))
            .await
            .unwrap();
        fixture.attempts.abandon(&ctx, attempt_id).await.unwrap();

        let err = fixture.answers.update_time_spent(&ctx, attempt_id, question_id, 30).await.unwrap_err();
        assert!(matches!(err, DomainError::InvalidState(_)));
        let err = fixture
            .answers
            .upsert(&ctx, test_support::submission(attempt_id, question_id, json!("B")))
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidState(_)));

        let kept = fixture.answers.get_by_attempt_and_question(&ctx, attempt_id, question_id).await.unwrap();
        assert_eq!(kept.value.0, json!("A"));
        assert_eq!(kept.time_spent, 0);

        let err = fixture.answers.update_time_spent(&ctx, 999, question_id, 30).await.unwrap_err();
        assert!(matches!(err, DomainError::NotFound { entity: "attempt", .. }));
    }

    #[tokio::test]
    async fn cache_outage_does_not_fail_writes_or_reads() {
        let fixture = Fixture::with_questions(1).await;
        let ctx = RequestContext::new();
        let attempt_id = started(&fixture).await;
        fixture.cache.set_available(false);

        let answer = fixture
            .answers
            .upsert(&ctx, test_support::submission(attempt_id, fixture.question_ids[0], json!("A")))
            .await
            .unwrap();
        assert_eq!(fixture.answers.get(&ctx, answer.id).await.unwrap().id, answer.id);
        assert!(fixture.answers.exists(&ctx, attempt_id, fixture.question_ids[0]).await.unwrap());
    }

    #[tokio::test]
    async fn cancelled_upsert_leaves_no_row_and_no_cache_entry() {
        let fixture = Fixture::with_questions(1).await;
        let attempt_id = started(&fixture).await;
        let question_id = fixture.question_ids[0];
        fixture.store.set_latency(std::time::Duration::from_millis(40));

        let ctx = RequestContext::new().with_timeout(std::time::Duration::from_millis(100));
        let err = fixture
            .answers
            .upsert(&ctx, test_support::submission(attempt_id, question_id, json!("A")))
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::Cancelled));

        fixture.store.set_latency(std::time::Duration::ZERO);
        assert!(fixture.store.answers_for_pair(attempt_id, question_id).await.is_empty());
        assert!(!fixture.cache.contains(&fixture.keys().answer_by_question(attempt_id, question_id)));
    }
}
