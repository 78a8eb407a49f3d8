use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;

use serde_json::json;
use sqlx::types::Json;
use time::macros::datetime;
use time::PrimitiveDateTime;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::cache::{Cache, CacheCoordinator, CacheError, CacheKeys, MemoryCache};
use crate::core::config::{AttemptSettings, CacheSettings};
use crate::core::context::RequestContext;
use crate::core::time::ManualClock;
use crate::db::models::{Answer, Assessment, Attempt, Question};
use crate::db::session_data::SessionData;
use crate::db::types::{AssessmentStatus, AttemptStatus, QuestionType};
use crate::services::answers::SubmitAnswer;
use crate::services::{AnswerLedger, AttemptService, QuestionSequencer};
use crate::store::MemoryStore;

pub(crate) const START: PrimitiveDateTime = datetime!(2025-03-01 10:00);

pub(crate) async fn env_lock() -> OwnedMutexGuard<()> {
    static LOCK: OnceLock<Arc<Mutex<()>>> = OnceLock::new();
    let lock = LOCK.get_or_init(|| Arc::new(Mutex::new(()))).clone();
    lock.lock_owned().await
}

/// Delays writes to one key so they land after whatever runs concurrently.
#[derive(Clone)]
pub(crate) struct SlowSetCache {
    inner: MemoryCache,
    key: String,
    delay: Duration,
}

impl SlowSetCache {
    pub(crate) fn new(inner: MemoryCache, key: impl Into<String>, delay: Duration) -> Self {
        Self { inner, key: key.into(), delay }
    }

    pub(crate) fn inner(&self) -> &MemoryCache {
        &self.inner
    }
}

#[async_trait]
impl Cache for SlowSetCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.inner.get(key).await
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, CacheError> {
        self.inner.get_many(keys).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        if key == self.key {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.inner.delete(key).await
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, CacheError> {
        self.inner.delete_prefix(prefix).await
    }
}

/// Published, one attempt, 30 minute limit, 60% to pass.
pub(crate) fn assessment(id: i64) -> Assessment {
    Assessment {
        id,
        title: format!("Assessment {id}"),
        status: AssessmentStatus::Published,
        max_attempts: 1,
        time_limit_seconds: Some(1800),
        passing_percentage: 60.0,
        shuffle_questions: false,
        retake_cooldown_seconds: None,
        available_from: None,
        available_until: None,
        created_at: START,
        updated_at: START,
    }
}

/// Multiple choice question whose correct answer is "A".
pub(crate) fn question(id: i64, points: f64) -> Question {
    Question {
        id,
        question_type: QuestionType::MultipleChoice,
        prompt: format!("Question {id}"),
        points,
        correct_answer: Some("A".to_string()),
        created_at: START,
        updated_at: START,
    }
}

pub(crate) fn attempt(id: i64, student_id: i64, assessment_id: i64) -> Attempt {
    Attempt {
        id,
        student_id,
        assessment_id,
        attempt_number: 1,
        status: AttemptStatus::InProgress,
        started_at: START,
        completed_at: None,
        expires_at: None,
        current_question_index: 0,
        questions_answered: 0,
        total_questions: 3,
        time_remaining: None,
        score: None,
        percentage: None,
        passed: None,
        session_data: Json(SessionData::default()),
        last_activity_at: START,
        created_at: START,
        updated_at: START,
    }
}

pub(crate) fn answer(id: i64, attempt_id: i64, question_id: i64) -> Answer {
    Answer {
        id,
        attempt_id,
        question_id,
        value: Json(json!("A")),
        is_correct: None,
        score: None,
        graded_by: None,
        graded_at: None,
        feedback: None,
        is_flagged: false,
        time_spent: 0,
        last_modified_at: START,
        created_at: START,
    }
}

pub(crate) fn submission(attempt_id: i64, question_id: i64, value: serde_json::Value) -> SubmitAnswer {
    SubmitAnswer { attempt_id, question_id, value, time_spent: None }
}

/// Services wired to an in-memory store and cache, with one seeded assessment.
pub(crate) struct Fixture {
    pub(crate) store: MemoryStore,
    pub(crate) cache: MemoryCache,
    pub(crate) clock: Arc<ManualClock>,
    pub(crate) assessment: Assessment,
    /// Linked question ids in assessment order.
    pub(crate) question_ids: Vec<i64>,
    pub(crate) sequencer: QuestionSequencer,
    pub(crate) attempts: AttemptService,
    pub(crate) answers: AnswerLedger,
    keys: CacheKeys,
}

impl Fixture {
    pub(crate) async fn with_questions(count: usize) -> Self {
        Self::build(assessment(0), QuestionType::MultipleChoice, count).await
    }

    pub(crate) async fn shuffled(count: usize) -> Self {
        let mut assessment = assessment(0);
        assessment.shuffle_questions = true;
        Self::build(assessment, QuestionType::MultipleChoice, count).await
    }

    pub(crate) async fn essays(count: usize) -> Self {
        Self::build(assessment(0), QuestionType::Essay, count).await
    }

    /// Like `with_questions`, but units of work overlap instead of queueing.
    pub(crate) async fn interleaved(count: usize) -> Self {
        Self::build_on(MemoryStore::interleaved(), assessment(0), QuestionType::MultipleChoice, count)
            .await
    }

    pub(crate) async fn build(
        assessment: Assessment,
        question_type: QuestionType,
        count: usize,
    ) -> Self {
        Self::build_on(MemoryStore::new(), assessment, question_type, count).await
    }

    async fn build_on(
        store: MemoryStore,
        assessment: Assessment,
        question_type: QuestionType,
        count: usize,
    ) -> Self {
        let cache = MemoryCache::new();
        let clock = Arc::new(ManualClock::new(START));
        let settings = CacheSettings::default();
        let keys = CacheKeys::new(settings.key_prefix.clone());
        let coordinator = CacheCoordinator::new(Arc::new(cache.clone()), settings);
        let attempt_settings = AttemptSettings {
            sweep_interval_seconds: 60,
            sweep_batch_size: 100,
            timeout_grace_seconds: 30,
        };

        let shared_store = Arc::new(store.clone());
        let sequencer = QuestionSequencer::new(shared_store.clone(), coordinator.clone());
        let attempts = AttemptService::new(
            shared_store.clone(),
            coordinator.clone(),
            clock.clone(),
            &attempt_settings,
        );
        let answers = AnswerLedger::new(shared_store, coordinator, clock.clone());

        let assessment = store.put_assessment(assessment).await;
        let ctx = RequestContext::new();
        let mut question_ids = Vec::with_capacity(count);
        for _ in 0..count {
            let mut question = question(0, 2.0);
            question.question_type = question_type;
            if !question_type.is_objective() {
                question.correct_answer = None;
            }
            let question = store.put_question(question).await;
            sequencer
                .add_question(&ctx, assessment.id, question.id, None, true)
                .await
                .expect("link fixture question");
            question_ids.push(question.id);
        }

        Self {
            store,
            cache,
            clock,
            assessment,
            question_ids,
            sequencer,
            attempts,
            answers,
            keys,
        }
    }

    pub(crate) fn keys(&self) -> &CacheKeys {
        &self.keys
    }
}
