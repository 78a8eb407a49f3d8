/// Key layout. Every key scoped to an attempt lives under `attempt_scope`, so
/// one prefix delete drops all of them. Prefixes always end with `:` so that
/// attempt 1 never matches attempt 10.
#[derive(Debug, Clone)]
pub struct CacheKeys {
    prefix: String,
}

impl CacheKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    pub fn attempt(&self, attempt_id: i64) -> String {
        format!("{}:attempt:{attempt_id}", self.prefix)
    }

    pub fn attempt_scope(&self, attempt_id: i64) -> String {
        format!("{}:attempt:{attempt_id}:", self.prefix)
    }

    pub fn answer(&self, answer_id: i64) -> String {
        format!("{}:answer:{answer_id}", self.prefix)
    }

    pub fn attempt_answers(&self, attempt_id: i64) -> String {
        format!("{}answers:list", self.attempt_scope(attempt_id))
    }

    pub fn answer_by_question(&self, attempt_id: i64, question_id: i64) -> String {
        format!("{}answers:question:{question_id}", self.attempt_scope(attempt_id))
    }

    pub fn answer_exists(&self, attempt_id: i64, question_id: i64) -> String {
        format!("{}answers:exists:{question_id}", self.attempt_scope(attempt_id))
    }

    pub fn answered_questions(&self, attempt_id: i64) -> String {
        format!("{}answers:answered", self.attempt_scope(attempt_id))
    }

    pub fn assessment_questions(&self, assessment_id: i64) -> String {
        format!("{}:assessment:{assessment_id}:questions", self.prefix)
    }

    /// Invalidation fence for an exact key or a scope prefix. Fences sit outside
    /// every attempt scope so a prefix delete never removes one.
    pub fn fence(&self, target: &str) -> String {
        format!("{}:fence:{target}", self.prefix)
    }

    /// Fences guarding `key`: its own, plus its attempt scope's when it has one.
    pub fn fences_for(&self, key: &str) -> Vec<String> {
        let mut fences = vec![self.fence(key)];
        if let Some(scope) = self.scope_of(key) {
            fences.push(self.fence(&scope));
        }
        fences
    }

    fn scope_of(&self, key: &str) -> Option<String> {
        let head = format!("{}:attempt:", self.prefix);
        let rest = key.strip_prefix(&head)?;
        let (id, tail) = rest.split_once(':')?;
        let attempt_id = id.parse::<i64>().ok()?;
        if tail.is_empty() {
            return None;
        }
        Some(self.attempt_scope(attempt_id))
    }
}
