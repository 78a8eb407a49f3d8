use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::cache::CacheCoordinator;
use crate::core::context::RequestContext;
use crate::core::errors::{DomainError, DomainResult};
use crate::db::models::{AssessmentQuestion, Attempt};
use crate::db::session_data::SessionData;
use crate::store::{NewLink, Store, UnitOfWork};

/// Links sorted by `order` ascending, ties broken by link id.
pub fn ordered(mut links: Vec<AssessmentQuestion>) -> Vec<AssessmentQuestion> {
    links.sort_by_key(|link| (link.order, link.id));
    links
}

/// Deterministic permutation of the ordered links for `seed`.
pub fn shuffled(links: Vec<AssessmentQuestion>, seed: u64) -> Vec<AssessmentQuestion> {
    let mut links = ordered(links);
    let mut rng = StdRng::seed_from_u64(seed);
    links.shuffle(&mut rng);
    links
}

pub fn sequence(links: Vec<AssessmentQuestion>, seed: Option<u64>) -> Vec<AssessmentQuestion> {
    match seed {
        Some(seed) => shuffled(links, seed),
        None => ordered(links),
    }
}

/// Links in the order an attempt was started with.
///
/// Follows the order recorded at start, so later reorders and additions do not
/// reach an attempt in flight; questions removed since then are dropped.
/// Payloads without a recorded order are sequenced from their seed.
pub fn for_attempt(
    links: Vec<AssessmentQuestion>,
    session: &SessionData,
) -> Vec<AssessmentQuestion> {
    let order = session.question_order();
    if order.is_empty() {
        return sequence(links, session.question_seed());
    }

    let mut by_question: HashMap<i64, AssessmentQuestion> =
        links.into_iter().map(|link| (link.question_id, link)).collect();
    order.iter().filter_map(|question_id| by_question.remove(question_id)).collect()
}

/// Checks that `requested` names every linked question exactly once.
pub fn validate_permutation(current: &[AssessmentQuestion], requested: &[i64]) -> DomainResult<()> {
    if requested.len() != current.len() {
        return Err(DomainError::Validation(format!(
            "expected {} question ids, got {}",
            current.len(),
            requested.len()
        )));
    }

    let linked: HashSet<i64> = current.iter().map(|link| link.question_id).collect();
    let mut seen = HashSet::with_capacity(requested.len());
    for question_id in requested {
        if !linked.contains(question_id) {
            return Err(DomainError::Validation(format!(
                "question {question_id} is not part of the assessment"
            )));
        }
        if !seen.insert(*question_id) {
            return Err(DomainError::Validation(format!(
                "question {question_id} listed more than once"
            )));
        }
    }
    Ok(())
}

/// Question ordering for assessments and the attempts taken against them.
#[derive(Clone)]
pub struct QuestionSequencer {
    store: Arc<dyn Store>,
    cache: CacheCoordinator,
}

impl QuestionSequencer {
    pub fn new(store: Arc<dyn Store>, cache: CacheCoordinator) -> Self {
        Self { store, cache }
    }

    pub async fn assessment_questions(
        &self,
        ctx: &RequestContext,
        assessment_id: i64,
    ) -> DomainResult<Vec<AssessmentQuestion>> {
        let key = self.cache.keys().assessment_questions(assessment_id);
        self.cache
            .read_through(ctx, &key, self.cache.list_ttl(), || async {
                let mut uow = super::begin(self.store.as_ref(), ctx).await?;
                let links = ctx
                    .store("Failed to fetch assessment questions", uow.list_links(assessment_id))
                    .await?;
                Ok::<_, DomainError>(ordered(links))
            })
            .await
    }

    /// The questions of `attempt` in delivery order, stable across resumes.
    pub async fn attempt_questions(
        &self,
        ctx: &RequestContext,
        attempt: &Attempt,
    ) -> DomainResult<Vec<AssessmentQuestion>> {
        let links = self.assessment_questions(ctx, attempt.assessment_id).await?;
        Ok(for_attempt(links, &attempt.session_data.0))
    }

    /// Reassigns dense orders 1..N following `question_ids`.
    pub async fn reorder(
        &self,
        ctx: &RequestContext,
        assessment_id: i64,
        question_ids: &[i64],
    ) -> DomainResult<Vec<AssessmentQuestion>> {
        let mut uow = super::begin(self.store.as_ref(), ctx).await?;
        let links = ctx
            .store(
                "Failed to lock assessment questions",
                uow.list_links_for_update(assessment_id),
            )
            .await?;
        validate_permutation(&links, question_ids)?;

        let mut reordered = Vec::with_capacity(links.len());
        for (position, question_id) in question_ids.iter().enumerate() {
            let Some(mut link) = links.iter().find(|link| link.question_id == *question_id).cloned()
            else {
                continue;
            };
            link.order = position as i32 + 1;
            reordered.push(link);
        }
        write_orders(&mut *uow, ctx, &links, &reordered).await?;

        super::commit(ctx, uow, "Failed to commit reorder").await?;
        self.invalidate(assessment_id).await;

        tracing::info!(assessment_id, questions = reordered.len(), "Assessment questions reordered");
        Ok(reordered)
    }

    /// Appends a question at order N+1.
    pub async fn add_question(
        &self,
        ctx: &RequestContext,
        assessment_id: i64,
        question_id: i64,
        points: Option<f64>,
        required: bool,
    ) -> DomainResult<AssessmentQuestion> {
        if points.is_some_and(|points| !points.is_finite() || points < 0.0) {
            return Err(DomainError::Validation("points must be a non-negative number".to_string()));
        }

        let mut uow = super::begin(self.store.as_ref(), ctx).await?;
        ctx.store("Failed to fetch assessment", uow.find_assessment(assessment_id))
            .await?
            .ok_or_else(|| DomainError::not_found("assessment", assessment_id))?;
        ctx.store("Failed to fetch question", uow.find_question(question_id))
            .await?
            .ok_or_else(|| DomainError::not_found("question", question_id))?;

        let links = ctx
            .store(
                "Failed to lock assessment questions",
                uow.list_links_for_update(assessment_id),
            )
            .await?;
        if links.iter().any(|link| link.question_id == question_id) {
            return Err(DomainError::Conflict(format!(
                "question {question_id} is already part of assessment {assessment_id}"
            )));
        }

        let link = ctx
            .store(
                "Failed to link question",
                uow.insert_link(NewLink {
                    assessment_id,
                    question_id,
                    order: links.len() as i32 + 1,
                    points,
                    required,
                }),
            )
            .await?;

        super::commit(ctx, uow, "Failed to commit question link").await?;
        self.invalidate(assessment_id).await;
        Ok(link)
    }

    /// Unlinks a question and closes the gap it leaves.
    pub async fn remove_question(
        &self,
        ctx: &RequestContext,
        assessment_id: i64,
        question_id: i64,
    ) -> DomainResult<Vec<AssessmentQuestion>> {
        let mut uow = super::begin(self.store.as_ref(), ctx).await?;
        let links = ctx
            .store(
                "Failed to lock assessment questions",
                uow.list_links_for_update(assessment_id),
            )
            .await?;
        if !links.iter().any(|link| link.question_id == question_id) {
            return Err(DomainError::not_found(
                "assessment question",
                format!("{assessment_id}/{question_id}"),
            ));
        }

        ctx.store("Failed to unlink question", uow.delete_link(assessment_id, question_id))
            .await?;
        let remaining: Vec<AssessmentQuestion> = ordered(links.clone())
            .into_iter()
            .filter(|link| link.question_id != question_id)
            .enumerate()
            .map(|(position, mut link)| {
                link.order = position as i32 + 1;
                link
            })
            .collect();
        write_orders(&mut *uow, ctx, &links, &remaining).await?;

        super::commit(ctx, uow, "Failed to commit question unlink").await?;
        self.invalidate(assessment_id).await;
        Ok(remaining)
    }

    async fn invalidate(&self, assessment_id: i64) {
        let key = self.cache.keys().assessment_questions(assessment_id);
        self.cache.invalidate([key], Vec::<String>::new()).await;
    }
}

/// Persists only the links whose order changed.
async fn write_orders(
    uow: &mut dyn UnitOfWork,
    ctx: &RequestContext,
    before: &[AssessmentQuestion],
    after: &[AssessmentQuestion],
) -> DomainResult<()> {
    for link in after {
        let unchanged =
            before.iter().any(|previous| previous.id == link.id && previous.order == link.order);
        if unchanged {
            continue;
        }
        ctx.store("Failed to update question order", uow.set_link_order(link.id, link.order))
            .await?;
    }
    Ok(())
}
