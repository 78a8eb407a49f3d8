use std::collections::HashSet;
use std::sync::Arc;

use serde::Deserialize;
use time::{Duration, PrimitiveDateTime};
use validator::Validate;

use crate::cache::CacheCoordinator;
use crate::core::config::AttemptSettings;
use crate::core::context::RequestContext;
use crate::core::errors::{DomainError, DomainResult};
use crate::core::time::{seconds, Clock};
use crate::db::models::{Assessment, Attempt};
use crate::db::session_data::SessionData;
use crate::db::types::AttemptStatus;
use crate::services::eligibility::{self, ValidationResult};
use crate::services::scoring::{self, FinalScore};
use crate::services::sequencer;
use crate::store::{AttemptFilter, NewAttempt, Store, UnitOfWork};

#[derive(Debug, Clone, Copy, Default, Deserialize, Validate)]
pub struct ProgressUpdate {
    #[validate(range(min = 0, message = "current_question_index must be non-negative"))]
    pub current_question_index: Option<i32>,
    #[validate(range(min = 0, message = "questions_answered must be non-negative"))]
    pub questions_answered: Option<i32>,
}

/// Running score recorded while the attempt is still open.
#[derive(Debug, Clone, Copy, Deserialize, Validate)]
pub struct ScoreUpdate {
    #[validate(range(min = 0.0, message = "score must be non-negative"))]
    pub score: f64,
    #[validate(range(min = 0.0, max = 100.0, message = "percentage must be within 0..=100"))]
    pub percentage: Option<f64>,
}

/// The attempt state machine: `InProgress` until exactly one terminal transition.
#[derive(Clone)]
pub struct AttemptService {
    store: Arc<dyn Store>,
    cache: CacheCoordinator,
    clock: Arc<dyn Clock>,
    timeout_grace: Duration,
}

impl AttemptService {
    pub fn new(
        store: Arc<dyn Store>,
        cache: CacheCoordinator,
        clock: Arc<dyn Clock>,
        settings: &AttemptSettings,
    ) -> Self {
        Self { store, cache, clock, timeout_grace: seconds(settings.timeout_grace_seconds) }
    }

    pub async fn check_eligibility(
        &self,
        ctx: &RequestContext,
        student_id: i64,
        assessment_id: i64,
    ) -> DomainResult<ValidationResult> {
        let now = self.clock.now();
        let mut uow = super::begin(self.store.as_ref(), ctx).await?;
        let assessment = load_assessment(&mut *uow, ctx, assessment_id).await?;
        eligibility::check(&mut *uow, ctx, student_id, &assessment, now).await
    }

    /// Opens a new attempt once eligibility passes.
    ///
    /// The slot lock and the in-progress unique index make the check and the
    /// insert atomic; a lost race surfaces as `Conflict`.
    pub async fn start(
        &self,
        ctx: &RequestContext,
        student_id: i64,
        assessment_id: i64,
    ) -> DomainResult<Attempt> {
        let now = self.clock.now();
        let mut uow = super::begin(self.store.as_ref(), ctx).await?;
        ctx.store("Failed to lock attempt slot", uow.lock_attempt_slot(student_id, assessment_id))
            .await?;

        let assessment = load_assessment(&mut *uow, ctx, assessment_id).await?;
        let verdict = eligibility::check(&mut *uow, ctx, student_id, &assessment, now).await?;
        if !verdict.valid {
            tracing::info!(
                student_id,
                assessment_id,
                reason = verdict.reason.as_deref().unwrap_or_default(),
                "Attempt start rejected"
            );
            return Err(DomainError::IneligibleAttempt(verdict.reason.unwrap_or_default()));
        }

        let links =
            ctx.store("Failed to fetch assessment questions", uow.list_links(assessment_id)).await?;
        let previous = ctx
            .store("Failed to count attempts", uow.count_attempts(student_id, assessment_id, None))
            .await?;
        let seed = assessment.shuffle_questions.then(|| u64::from(rand::random::<u32>()));
        let question_order: Vec<i64> =
            sequencer::sequence(links, seed).iter().map(|link| link.question_id).collect();
        let (expires_at, time_remaining) = attempt_deadline(&assessment, now);

        let attempt = ctx
            .store(
                "Failed to create attempt",
                uow.insert_attempt(NewAttempt {
                    student_id,
                    assessment_id,
                    attempt_number: previous as i32 + 1,
                    started_at: now,
                    expires_at,
                    total_questions: question_order.len() as i32,
                    time_remaining,
                    session_data: SessionData::new(seed, question_order),
                }),
            )
            .await?;
        super::commit(ctx, uow, "Failed to commit attempt start").await?;

        metrics::counter!("attempts_started_total").increment(1);
        tracing::info!(
            attempt_id = attempt.id,
            student_id,
            assessment_id,
            attempt_number = attempt.attempt_number,
            request_id = %ctx.request_id(),
            "Attempt started"
        );
        Ok(attempt)
    }

    pub async fn get(&self, ctx: &RequestContext, attempt_id: i64) -> DomainResult<Attempt> {
        let key = self.cache.keys().attempt(attempt_id);
        self.cache
            .read_through(ctx, &key, self.cache.entity_ttl(), || async {
                let mut uow = super::begin(self.store.as_ref(), ctx).await?;
                let attempt = ctx
                    .store("Failed to fetch attempt", uow.find_attempt(attempt_id))
                    .await?
                    .ok_or_else(|| DomainError::not_found("attempt", attempt_id))?;
                Ok::<_, DomainError>(attempt)
            })
            .await
    }

    /// The open attempt for the pair, if any.
    pub async fn resume(
        &self,
        ctx: &RequestContext,
        student_id: i64,
        assessment_id: i64,
    ) -> DomainResult<Option<Attempt>> {
        let mut uow = super::begin(self.store.as_ref(), ctx).await?;
        ctx.store(
            "Failed to fetch in-progress attempt",
            uow.find_in_progress_attempt(student_id, assessment_id),
        )
        .await
    }

    pub async fn list(
        &self,
        ctx: &RequestContext,
        filter: &AttemptFilter,
    ) -> DomainResult<Vec<Attempt>> {
        if filter.skip < 0 {
            return Err(DomainError::Validation("skip must be non-negative".to_string()));
        }
        if let (Some(from), Some(to)) = (filter.started_from, filter.started_to) {
            if from > to {
                return Err(DomainError::Validation(
                    "started_from must not be after started_to".to_string(),
                ));
            }
        }

        let mut uow = super::begin(self.store.as_ref(), ctx).await?;
        ctx.store("Failed to list attempts", uow.list_attempts(filter)).await
    }

    pub async fn update_progress(
        &self,
        ctx: &RequestContext,
        attempt_id: i64,
        update: ProgressUpdate,
    ) -> DomainResult<Attempt> {
        update.validate().map_err(|err| DomainError::Validation(err.to_string()))?;

        self.update_in_progress(ctx, attempt_id, "update progress of", |attempt, _| {
            if let Some(index) = update.current_question_index {
                if attempt.total_questions > 0 && index >= attempt.total_questions {
                    return Err(DomainError::Validation(format!(
                        "current_question_index {index} is outside 0..{}",
                        attempt.total_questions
                    )));
                }
                attempt.current_question_index = index;
            }
            if let Some(answered) = update.questions_answered {
                if answered > attempt.total_questions {
                    return Err(DomainError::Validation(format!(
                        "questions_answered {answered} exceeds {} questions",
                        attempt.total_questions
                    )));
                }
                attempt.questions_answered = answered;
            }
            Ok(())
        })
        .await
    }

    /// Records the remaining time. Negative values are stored as zero, which
    /// makes the attempt a timeout candidate for the sweeper.
    pub async fn update_time_remaining(
        &self,
        ctx: &RequestContext,
        attempt_id: i64,
        remaining_seconds: i32,
    ) -> DomainResult<Attempt> {
        let remaining = remaining_seconds.max(0);
        self.update_in_progress(ctx, attempt_id, "update time of", |attempt, _| {
            if let Some(current) = attempt.time_remaining {
                if remaining > current {
                    return Err(DomainError::Validation(format!(
                        "time_remaining cannot increase ({current}s -> {remaining}s)"
                    )));
                }
            }
            attempt.time_remaining = Some(remaining);
            Ok(())
        })
        .await
    }

    pub async fn update_score(
        &self,
        ctx: &RequestContext,
        attempt_id: i64,
        update: ScoreUpdate,
    ) -> DomainResult<Attempt> {
        update.validate().map_err(|err| DomainError::Validation(err.to_string()))?;
        if !update.score.is_finite() {
            return Err(DomainError::Validation("score must be a finite number".to_string()));
        }

        self.update_in_progress(ctx, attempt_id, "update score of", |attempt, _| {
            attempt.score = Some(update.score);
            if update.percentage.is_some() {
                attempt.percentage = update.percentage;
            }
            Ok(())
        })
        .await
    }

    /// Merges client resume state; the question seed and order are left alone.
    pub async fn save_session_data(
        &self,
        ctx: &RequestContext,
        attempt_id: i64,
        patch: serde_json::Map<String, serde_json::Value>,
    ) -> DomainResult<Attempt> {
        self.update_in_progress(ctx, attempt_id, "save session of", |attempt, _| {
            attempt.session_data.0.merge_client_state(patch);
            Ok(())
        })
        .await
    }

    pub async fn complete(
        &self,
        ctx: &RequestContext,
        attempt_id: i64,
        outcome: FinalScore,
    ) -> DomainResult<Attempt> {
        if !(outcome.score.is_finite() && outcome.score >= 0.0)
            || !(0.0..=100.0).contains(&outcome.percentage)
        {
            return Err(DomainError::Validation(format!(
                "invalid final score {} ({}%)",
                outcome.score, outcome.percentage
            )));
        }
        self.finish(ctx, attempt_id, AttemptStatus::Completed, Some(outcome)).await
    }

    /// Scores the attempt from its answers and completes it.
    ///
    /// Unless `allow_unanswered` is set, every required question must have an answer.
    pub async fn submit(
        &self,
        ctx: &RequestContext,
        attempt_id: i64,
        allow_unanswered: bool,
    ) -> DomainResult<Attempt> {
        let now = self.clock.now();
        let mut uow = super::begin(self.store.as_ref(), ctx).await?;
        let mut attempt = load_attempt_for_update(&mut *uow, ctx, attempt_id).await?;
        ensure_in_progress(&attempt, "submit")?;

        let assessment = load_assessment(&mut *uow, ctx, attempt.assessment_id).await?;
        let links = ctx
            .store("Failed to fetch assessment questions", uow.list_links(assessment.id))
            .await?;
        let links = sequencer::for_attempt(links, &attempt.session_data.0);
        let question_ids: Vec<i64> = links.iter().map(|link| link.question_id).collect();
        let questions =
            ctx.store("Failed to fetch questions", uow.find_questions(&question_ids)).await?;
        let answers = ctx.store("Failed to fetch answers", uow.list_answers(attempt.id)).await?;

        let answered: HashSet<i64> = answers.iter().map(|answer| answer.question_id).collect();
        if !allow_unanswered {
            let missing: Vec<String> = links
                .iter()
                .filter(|link| link.required && !answered.contains(&link.question_id))
                .map(|link| link.question_id.to_string())
                .collect();
            if !missing.is_empty() {
                return Err(DomainError::Validation(format!(
                    "required questions unanswered: {}",
                    missing.join(", ")
                )));
            }
        }

        let summary =
            scoring::summarize(&links, &questions, &answers, assessment.passing_percentage);
        attempt.questions_answered =
            question_ids.iter().filter(|id| answered.contains(id)).count() as i32;
        close(&mut attempt, AttemptStatus::Completed, now, Some(summary.final_score()));

        ctx.store("Failed to submit attempt", uow.save_attempt(&attempt)).await?;
        super::commit(ctx, uow, "Failed to commit attempt submission").await?;
        self.invalidate(attempt.id).await;

        metrics::counter!("attempts_finished_total", "status" => "completed").increment(1);
        tracing::info!(
            attempt_id,
            score = summary.score,
            max_score = summary.max_score,
            passed = summary.passed,
            pending_review = summary.pending_review,
            "Attempt submitted"
        );
        Ok(attempt)
    }

    pub async fn abandon(&self, ctx: &RequestContext, attempt_id: i64) -> DomainResult<Attempt> {
        self.finish(ctx, attempt_id, AttemptStatus::Abandoned, None).await
    }

    pub async fn time_out(&self, ctx: &RequestContext, attempt_id: i64) -> DomainResult<Attempt> {
        self.finish(ctx, attempt_id, AttemptStatus::TimedOut, None).await
    }

    /// In-progress attempts with no time left or past their expiry plus the grace period.
    pub async fn timed_out_candidates(
        &self,
        ctx: &RequestContext,
        limit: i64,
    ) -> DomainResult<Vec<Attempt>> {
        let expired_before = self.clock.now() - self.timeout_grace;
        let mut uow = super::begin(self.store.as_ref(), ctx).await?;
        ctx.store(
            "Failed to list timeout candidates",
            uow.list_timeout_candidates(expired_before, limit),
        )
        .await
    }

    /// Times out up to `limit` candidates in one transaction and returns their ids.
    pub async fn sweep_timeouts(&self, ctx: &RequestContext, limit: i64) -> DomainResult<Vec<i64>> {
        let now = self.clock.now();
        let mut uow = super::begin(self.store.as_ref(), ctx).await?;
        let candidates = ctx
            .store(
                "Failed to list timeout candidates",
                uow.list_timeout_candidates(now - self.timeout_grace, limit),
            )
            .await?;
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let mut ids = Vec::with_capacity(candidates.len());
        for mut attempt in candidates {
            close(&mut attempt, AttemptStatus::TimedOut, now, None);
            ctx.store("Failed to time out attempt", uow.save_attempt(&attempt)).await?;
            ids.push(attempt.id);
        }
        super::commit(ctx, uow, "Failed to commit timeout sweep").await?;

        let keys: Vec<String> = ids.iter().map(|id| self.cache.keys().attempt(*id)).collect();
        self.cache.invalidate(keys, Vec::<String>::new()).await;

        metrics::counter!("attempts_timed_out_total").increment(ids.len() as u64);
        metrics::counter!("attempts_finished_total", "status" => "timed_out")
            .increment(ids.len() as u64);
        tracing::info!(count = ids.len(), "Timed out expired attempts");
        Ok(ids)
    }

    /// Removes an attempt together with its answers.
    pub async fn delete(&self, ctx: &RequestContext, attempt_id: i64) -> DomainResult<()> {
        let mut uow = super::begin(self.store.as_ref(), ctx).await?;
        let answers = ctx.store("Failed to fetch answers", uow.list_answers(attempt_id)).await?;
        let deleted = ctx.store("Failed to delete attempt", uow.delete_attempt(attempt_id)).await?;
        if !deleted {
            return Err(DomainError::not_found("attempt", attempt_id));
        }
        super::commit(ctx, uow, "Failed to commit attempt deletion").await?;

        let keys = self.cache.keys();
        let mut stale = vec![keys.attempt(attempt_id)];
        stale.extend(answers.iter().map(|answer| keys.answer(answer.id)));
        self.cache.invalidate(stale, [keys.attempt_scope(attempt_id)]).await;

        tracing::info!(attempt_id, answers = answers.len(), "Attempt deleted");
        Ok(())
    }

    async fn finish(
        &self,
        ctx: &RequestContext,
        attempt_id: i64,
        status: AttemptStatus,
        outcome: Option<FinalScore>,
    ) -> DomainResult<Attempt> {
        let now = self.clock.now();
        let mut uow = super::begin(self.store.as_ref(), ctx).await?;
        let mut attempt = load_attempt_for_update(&mut *uow, ctx, attempt_id).await?;
        ensure_in_progress(&attempt, transition_verb(status))?;

        close(&mut attempt, status, now, outcome);
        ctx.store("Failed to finish attempt", uow.save_attempt(&attempt)).await?;
        super::commit(ctx, uow, "Failed to commit attempt transition").await?;
        self.invalidate(attempt.id).await;

        metrics::counter!("attempts_finished_total", "status" => status.as_str()).increment(1);
        tracing::info!(attempt_id, status = status.as_str(), "Attempt finished");
        Ok(attempt)
    }

    async fn update_in_progress<F>(
        &self,
        ctx: &RequestContext,
        attempt_id: i64,
        action: &'static str,
        apply: F,
    ) -> DomainResult<Attempt>
    where
        F: FnOnce(&mut Attempt, PrimitiveDateTime) -> DomainResult<()> + Send,
    {
        let now = self.clock.now();
        let mut uow = super::begin(self.store.as_ref(), ctx).await?;
        let mut attempt = load_attempt_for_update(&mut *uow, ctx, attempt_id).await?;
        ensure_in_progress(&attempt, action)?;

        apply(&mut attempt, now)?;
        attempt.last_activity_at = now;
        attempt.updated_at = now;

        ctx.store("Failed to update attempt", uow.save_attempt(&attempt)).await?;
        super::commit(ctx, uow, "Failed to commit attempt update").await?;
        self.invalidate(attempt.id).await;
        Ok(attempt)
    }

    async fn invalidate(&self, attempt_id: i64) {
        self.cache.invalidate([self.cache.keys().attempt(attempt_id)], Vec::<String>::new()).await;
    }
}

/// `expires_at` and the initial `time_remaining` for an attempt started at `now`.
///
/// A time limit is capped by the end of the availability window. Untimed
/// attempts expire with the window and carry no countdown.
fn attempt_deadline(
    assessment: &Assessment,
    now: PrimitiveDateTime,
) -> (Option<PrimitiveDateTime>, Option<i32>) {
    let limited = assessment
        .time_limit_seconds
        .filter(|limit| *limit > 0)
        .map(|limit| now + Duration::seconds(i64::from(limit)));

    match (limited, assessment.available_until) {
        (Some(limit), until) => {
            let expires_at = match until {
                Some(until) if until < limit => until,
                _ => limit,
            };
            let remaining = (expires_at - now).whole_seconds().clamp(0, i64::from(i32::MAX));
            (Some(expires_at), Some(remaining as i32))
        }
        (None, until) => (until, None),
    }
}

fn close(
    attempt: &mut Attempt,
    status: AttemptStatus,
    now: PrimitiveDateTime,
    outcome: Option<FinalScore>,
) {
    attempt.status = status;
    attempt.completed_at = Some(now);
    attempt.last_activity_at = now;
    attempt.updated_at = now;
    if let Some(outcome) = outcome {
        attempt.score = Some(outcome.score);
        attempt.percentage = Some(outcome.percentage);
        attempt.passed = Some(outcome.passed);
    }
}

fn transition_verb(status: AttemptStatus) -> &'static str {
    match status {
        AttemptStatus::Completed => "complete",
        AttemptStatus::Abandoned => "abandon",
        AttemptStatus::TimedOut => "time out",
        AttemptStatus::InProgress => "reopen",
    }
}

fn ensure_in_progress(attempt: &Attempt, action: &str) -> DomainResult<()> {
    if attempt.is_in_progress() {
        return Ok(());
    }
    Err(DomainError::InvalidState(format!(
        "cannot {action} attempt {}: it is {}",
        attempt.id,
        attempt.status.as_str()
    )))
}

async fn load_assessment(
    uow: &mut dyn UnitOfWork,
    ctx: &RequestContext,
    assessment_id: i64,
) -> DomainResult<Assessment> {
    ctx.store("Failed to fetch assessment", uow.find_assessment(assessment_id))
        .await?
        .ok_or_else(|| DomainError::not_found("assessment", assessment_id))
}

async fn load_attempt_for_update(
    uow: &mut dyn UnitOfWork,
    ctx: &RequestContext,
    attempt_id: i64,
) -> DomainResult<Attempt> {
    ctx.store("Failed to fetch attempt", uow.find_attempt_for_update(attempt_id))
        .await?
        .ok_or_else(|| DomainError::not_found("attempt", attempt_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{self, Fixture};
    use serde_json::json;
    use time::macros::datetime;

    #[tokio::test]
    async fn start_snapshots_question_count() {
        let fixture = Fixture::with_questions(3).await;
        let ctx = RequestContext::new();

        let attempt = fixture.attempts.start(&ctx, 1, fixture.assessment.id).await.unwrap();
        assert_eq!(attempt.status, AttemptStatus::InProgress);
        assert_eq!(attempt.started_at, fixture.clock.now());
        assert_eq!(attempt.attempt_number, 1);
        assert_eq!(attempt.total_questions, 3);

        let extra = fixture.store.put_question(test_support::question(0, 1.0)).await;
        fixture.sequencer.add_question(&ctx, fixture.assessment.id, extra.id, None, true).await.unwrap();
        fixture
            .sequencer
            .remove_question(&ctx, fixture.assessment.id, fixture.question_ids[0])
            .await
            .unwrap();
        fixture.sequencer.add_question(&ctx, fixture.assessment.id, fixture.question_ids[0], None, true).await.unwrap();

        let reloaded = fixture.attempts.get(&ctx, attempt.id).await.unwrap();
        assert_eq!(reloaded.total_questions, 3);
    }

    #[tokio::test]
    async fn max_attempts_scenario() {
        let fixture = Fixture::with_questions(2).await;
        let ctx = RequestContext::new();
        let assessment_id = fixture.assessment.id;

        let attempt = fixture.attempts.start(&ctx, 5, assessment_id).await.unwrap();
        assert_eq!(attempt.status, AttemptStatus::InProgress);

        let err = fixture.attempts.start(&ctx, 5, assessment_id).await.unwrap_err();
        assert!(matches!(err, DomainError::IneligibleAttempt(ref reason) if reason.contains("already in progress")));

        let outcome = FinalScore { score: 1.0, percentage: 50.0, passed: true };
        let completed = fixture.attempts.complete(&ctx, attempt.id, outcome).await.unwrap();
        assert_eq!(completed.status, AttemptStatus::Completed);
        assert_eq!(completed.completed_at, Some(fixture.clock.now()));
        assert_eq!(completed.passed, Some(true));

        let err = fixture.attempts.start(&ctx, 5, assessment_id).await.unwrap_err();
        assert!(matches!(err, DomainError::IneligibleAttempt(ref reason) if reason.contains("Maximum attempts")));
    }

    #[tokio::test]
    async fn concurrent_starts_admit_exactly_one() {
        let fixture = Fixture::interleaved(2).await;
        let assessment_id = fixture.assessment.id;
        fixture.store.set_latency(std::time::Duration::from_millis(5));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let attempts = fixture.attempts.clone();
            handles.push(tokio::spawn(async move {
                attempts.start(&RequestContext::new(), 42, assessment_id).await
            }));
        }

        let (mut started, mut lost_race) = (0, 0);
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => started += 1,
                Err(DomainError::Conflict(_)) => lost_race += 1,
                Err(DomainError::IneligibleAttempt(_)) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(started, 1);
        // Every start passed eligibility before the first commit landed.
        assert_eq!(lost_race, 7);
        assert_eq!(fixture.store.attempt_count().await, 1);
    }

    #[tokio::test]
    async fn terminal_attempts_reject_further_changes() {
        let fixture = Fixture::with_questions(2).await;
        let ctx = RequestContext::new();
        let attempt = fixture.attempts.start(&ctx, 1, fixture.assessment.id).await.unwrap();
        fixture.attempts.abandon(&ctx, attempt.id).await.unwrap();

        let progress = ProgressUpdate { current_question_index: Some(1), questions_answered: None };
        let err = fixture.attempts.update_progress(&ctx, attempt.id, progress).await.unwrap_err();
        assert!(matches!(err, DomainError::InvalidState(_)));

        let err = fixture.attempts.time_out(&ctx, attempt.id).await.unwrap_err();
        assert!(matches!(err, DomainError::InvalidState(_)));

        let outcome = FinalScore { score: 0.0, percentage: 0.0, passed: false };
        let err = fixture.attempts.complete(&ctx, attempt.id, outcome).await.unwrap_err();
        assert!(matches!(err, DomainError::InvalidState(_)));

        let reloaded = fixture.attempts.get(&ctx, attempt.id).await.unwrap();
        assert_eq!(reloaded.status, AttemptStatus::Abandoned);
    }

    #[tokio::test]
    async fn missing_attempt_is_not_found() {
        let fixture = Fixture::with_questions(1).await;
        let ctx = RequestContext::new();

        let err = fixture.attempts.abandon(&ctx, 999).await.unwrap_err();
        assert!(matches!(err, DomainError::NotFound { entity: "attempt", .. }));
        let err = fixture.attempts.update_time_remaining(&ctx, 999, 10).await.unwrap_err();
        assert!(matches!(err, DomainError::NotFound { .. }));
        let err = fixture.attempts.start(&ctx, 1, 999).await.unwrap_err();
        assert!(matches!(err, DomainError::NotFound { entity: "assessment", .. }));
    }

    #[tokio::test]
    async fn progress_is_validated_against_snapshot() {
        let fixture = Fixture::with_questions(3).await;
        let ctx = RequestContext::new();
        let attempt = fixture.attempts.start(&ctx, 1, fixture.assessment.id).await.unwrap();

        let update = ProgressUpdate { current_question_index: Some(2), questions_answered: Some(2) };
        let updated = fixture.attempts.update_progress(&ctx, attempt.id, update).await.unwrap();
        assert_eq!(updated.current_question_index, 2);
        assert_eq!(updated.questions_answered, 2);

        let update = ProgressUpdate { current_question_index: Some(3), questions_answered: None };
        let err = fixture.attempts.update_progress(&ctx, attempt.id, update).await.unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));

        let update = ProgressUpdate { current_question_index: Some(-1), questions_answered: None };
        let err = fixture.attempts.update_progress(&ctx, attempt.id, update).await.unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[tokio::test]
    async fn time_remaining_never_increases() {
        let fixture = Fixture::with_questions(1).await;
        let ctx = RequestContext::new();
        let attempt = fixture.attempts.start(&ctx, 1, fixture.assessment.id).await.unwrap();
        assert_eq!(attempt.time_remaining, Some(1800));

        let updated = fixture.attempts.update_time_remaining(&ctx, attempt.id, 1200).await.unwrap();
        assert_eq!(updated.time_remaining, Some(1200));

        let err = fixture.attempts.update_time_remaining(&ctx, attempt.id, 1500).await.unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));

        let updated = fixture.attempts.update_time_remaining(&ctx, attempt.id, -5).await.unwrap();
        assert_eq!(updated.time_remaining, Some(0));

        let candidates = fixture.attempts.timed_out_candidates(&ctx, 10).await.unwrap();
        assert_eq!(candidates.iter().map(|a| a.id).collect::<Vec<_>>(), vec![attempt.id]);
    }

    #[tokio::test]
    async fn session_data_merge_keeps_seed() {
        let fixture = Fixture::shuffled(6).await;
        let ctx = RequestContext::new();
        let attempt = fixture.attempts.start(&ctx, 1, fixture.assessment.id).await.unwrap();
        let seed = attempt.question_seed();
        assert!(seed.is_some());

        let first_order = fixture.sequencer.attempt_questions(&ctx, &attempt).await.unwrap();

        let mut patch = serde_json::Map::new();
        patch.insert("scroll".to_string(), json!(120));
        let updated = fixture.attempts.save_session_data(&ctx, attempt.id, patch).await.unwrap();
        assert_eq!(updated.question_seed(), seed);
        assert_eq!(updated.session_data.0.client_state().get("scroll"), Some(&json!(120)));

        let resumed = fixture.attempts.resume(&ctx, 1, fixture.assessment.id).await.unwrap().unwrap();
        let resumed_order = fixture.sequencer.attempt_questions(&ctx, &resumed).await.unwrap();
        assert_eq!(first_order, resumed_order);
    }

    #[tokio::test]
    async fn sweep_times_out_expired_attempts_and_refreshes_cache() {
        let fixture = Fixture::with_questions(2).await;
        let ctx = RequestContext::new();
        let expiring = fixture.attempts.start(&ctx, 1, fixture.assessment.id).await.unwrap();
        assert_eq!(expiring.expires_at, Some(fixture.clock.now() + Duration::minutes(30)));

        // Populate the entity cache before the sweep.
        fixture.attempts.get(&ctx, expiring.id).await.unwrap();

        fixture.clock.advance(Duration::minutes(30));
        assert!(fixture.attempts.sweep_timeouts(&ctx, 10).await.unwrap().is_empty());

        fixture.clock.advance(Duration::seconds(30));
        let swept = fixture.attempts.sweep_timeouts(&ctx, 10).await.unwrap();
        assert_eq!(swept, vec![expiring.id]);

        let reloaded = fixture.attempts.get(&ctx, expiring.id).await.unwrap();
        assert_eq!(reloaded.status, AttemptStatus::TimedOut);
        assert_eq!(reloaded.completed_at, Some(fixture.clock.now()));
        assert!(fixture.attempts.sweep_timeouts(&ctx, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn submit_scores_answers() {
        let fixture = Fixture::with_questions(2).await;
        let ctx = RequestContext::new();
        let attempt = fixture.attempts.start(&ctx, 1, fixture.assessment.id).await.unwrap();
        let [first, second] = [fixture.question_ids[0], fixture.question_ids[1]];

        fixture.answers.upsert(&ctx, test_support::submission(attempt.id, first, json!("A"))).await.unwrap();

        let err = fixture.attempts.submit(&ctx, attempt.id, false).await.unwrap_err();
        assert!(matches!(err, DomainError::Validation(ref message) if message.contains(&second.to_string())));

        let submitted = fixture.attempts.submit(&ctx, attempt.id, true).await.unwrap();
        assert_eq!(submitted.status, AttemptStatus::Completed);
        assert_eq!(submitted.score, Some(2.0));
        assert_eq!(submitted.percentage, Some(50.0));
        assert_eq!(submitted.passed, Some(false));
        assert_eq!(submitted.questions_answered, 1);
    }

    #[tokio::test]
    async fn delete_removes_answers_and_cached_entries() {
        let fixture = Fixture::with_questions(2).await;
        let ctx = RequestContext::new();
        let attempt = fixture.attempts.start(&ctx, 1, fixture.assessment.id).await.unwrap();
        let answer = fixture
            .answers
            .upsert(&ctx, test_support::submission(attempt.id, fixture.question_ids[0], json!("A")))
            .await
            .unwrap();
        fixture.attempts.get(&ctx, attempt.id).await.unwrap();
        fixture.answers.get(&ctx, answer.id).await.unwrap();
        fixture.answers.list_by_attempt(&ctx, attempt.id).await.unwrap();

        fixture.attempts.delete(&ctx, attempt.id).await.unwrap();

        let keys = fixture.keys();
        assert!(!fixture.cache.contains(&keys.attempt(attempt.id)));
        assert!(!fixture.cache.contains(&keys.answer(answer.id)));
        assert!(!fixture.cache.contains(&keys.attempt_answers(attempt.id)));
        assert!(matches!(
            fixture.attempts.get(&ctx, attempt.id).await.unwrap_err(),
            DomainError::NotFound { .. }
        ));
        assert!(fixture.store.answers_for_pair(attempt.id, fixture.question_ids[0]).await.is_empty());
        assert!(matches!(
            fixture.attempts.delete(&ctx, attempt.id).await.unwrap_err(),
            DomainError::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn cancelled_start_leaves_no_attempt() {
        let fixture = Fixture::with_questions(2).await;
        fixture.store.set_latency(std::time::Duration::from_millis(40));
        let ctx = RequestContext::new().with_timeout(std::time::Duration::from_millis(60));

        let err = fixture.attempts.start(&ctx, 1, fixture.assessment.id).await.unwrap_err();
        assert!(matches!(err, DomainError::Cancelled));

        fixture.store.set_latency(std::time::Duration::ZERO);
        assert_eq!(fixture.store.attempt_count().await, 0);
        let attempt = fixture.attempts.start(&RequestContext::new(), 1, fixture.assessment.id).await.unwrap();
        assert_eq!(attempt.attempt_number, 1);
    }

    #[test]
    fn deadline_is_capped_by_availability_window() {
        let mut assessment = test_support::assessment(0);
        assessment.available_until = Some(datetime!(2025-03-01 10:10));
        let (expires_at, remaining) = attempt_deadline(&assessment, datetime!(2025-03-01 10:00));
        assert_eq!(expires_at, Some(datetime!(2025-03-01 10:10)));
        assert_eq!(remaining, Some(600));

        assessment.time_limit_seconds = None;
        let (expires_at, remaining) = attempt_deadline(&assessment, datetime!(2025-03-01 10:00));
        assert_eq!(expires_at, Some(datetime!(2025-03-01 10:10)));
        assert_eq!(remaining, None);
    }

    #[tokio::test]
    async fn list_filters_by_student_and_status() {
        let fixture = Fixture::with_questions(1).await;
        let ctx = RequestContext::new();
        let first = fixture.attempts.start(&ctx, 1, fixture.assessment.id).await.unwrap();
        fixture.attempts.start(&ctx, 2, fixture.assessment.id).await.unwrap();
        fixture.attempts.abandon(&ctx, first.id).await.unwrap();

        let filter = AttemptFilter {
            student_id: Some(1),
            status: Some(AttemptStatus::Abandoned),
            ..AttemptFilter::default()
        };
        let listed = fixture.attempts.list(&ctx, &filter).await.unwrap();
        assert_eq!(listed.iter().map(|a| a.id).collect::<Vec<_>>(), vec![first.id]);

        let bad = AttemptFilter {
            started_from: Some(datetime!(2025-03-02 00:00)),
            started_to: Some(datetime!(2025-03-01 00:00)),
            ..AttemptFilter::default()
        };
        assert!(matches!(
            fixture.attempts.list(&ctx, &bad).await.unwrap_err(),
            DomainError::Validation(_)
        ));
    }
}
