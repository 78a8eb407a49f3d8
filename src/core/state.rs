use std::sync::Arc;

use crate::cache::{CacheCoordinator, RedisCache};
use crate::core::{config::Settings, redis::RedisHandle, time::SystemClock};
use crate::services::{AnswerLedger, AttemptService, QuestionSequencer};
use crate::store::PgStore;

/// Shared runtime wiring: Postgres store, Redis-backed cache and the services built on them.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<InnerState>,
}

struct InnerState {
    settings: Settings,
    store: PgStore,
    redis: RedisHandle,
    attempts: AttemptService,
    answers: AnswerLedger,
    sequencer: QuestionSequencer,
}

impl AppState {
    pub fn new(settings: Settings, store: PgStore, redis: RedisHandle) -> Self {
        let shared_store = Arc::new(store.clone());
        let clock = Arc::new(SystemClock);
        let cache = CacheCoordinator::new(
            Arc::new(RedisCache::new(redis.clone())),
            settings.cache().clone(),
        );

        let attempts = AttemptService::new(
            shared_store.clone(),
            cache.clone(),
            clock.clone(),
            settings.attempts(),
        );
        let answers = AnswerLedger::new(shared_store.clone(), cache.clone(), clock);
        let sequencer = QuestionSequencer::new(shared_store, cache);

        Self {
            inner: Arc::new(InnerState { settings, store, redis, attempts, answers, sequencer }),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub fn store(&self) -> &PgStore {
        &self.inner.store
    }

    pub fn redis(&self) -> &RedisHandle {
        &self.inner.redis
    }

    pub fn attempts(&self) -> &AttemptService {
        &self.inner.attempts
    }

    pub fn answers(&self) -> &AnswerLedger {
        &self.inner.answers
    }

    pub fn sequencer(&self) -> &QuestionSequencer {
        &self.inner.sequencer
    }
}
