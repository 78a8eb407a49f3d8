use serde::Serialize;
use time::PrimitiveDateTime;

use crate::core::context::RequestContext;
use crate::core::errors::DomainResult;
use crate::core::time::format_primitive;
use crate::db::models::{Assessment, Attempt};
use crate::db::types::AttemptStatus;
use crate::store::UnitOfWork;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub reason: Option<String>,
}

impl ValidationResult {
    pub fn allowed() -> Self {
        Self { valid: true, reason: None }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self { valid: false, reason: Some(reason.into()) }
    }
}

/// Everything the eligibility rules look at for one (student, assessment) pair.
#[derive(Debug, Clone)]
pub struct EligibilityFacts<'a> {
    pub assessment: &'a Assessment,
    pub active_attempt: Option<&'a Attempt>,
    pub completed_attempts: i64,
    pub last_completed_at: Option<PrimitiveDateTime>,
    pub question_count: usize,
    pub now: PrimitiveDateTime,
}

/// Applies the start rules in a fixed order and returns the first rejection.
pub fn evaluate(facts: &EligibilityFacts<'_>) -> ValidationResult {
    let assessment = facts.assessment;

    if !assessment.status.is_attemptable() {
        return ValidationResult::rejected(format!(
            "Assessment is {} and does not accept attempts",
            assessment.status.as_str()
        ));
    }

    if let Some(from) = assessment.available_from {
        if facts.now < from {
            return ValidationResult::rejected(format!(
                "Assessment opens at {}",
                format_primitive(from)
            ));
        }
    }
    if let Some(until) = assessment.available_until {
        if facts.now >= until {
            return ValidationResult::rejected(format!(
                "Assessment closed at {}",
                format_primitive(until)
            ));
        }
    }

    if let Some(active) = facts.active_attempt {
        return ValidationResult::rejected(format!(
            "Attempt {} is already in progress",
            active.id
        ));
    }

    if assessment.max_attempts > 0 && facts.completed_attempts >= i64::from(assessment.max_attempts)
    {
        return ValidationResult::rejected(format!(
            "Maximum attempts reached ({}/{})",
            facts.completed_attempts, assessment.max_attempts
        ));
    }

    if let (Some(cooldown), Some(last)) =
        (assessment.retake_cooldown_seconds.filter(|seconds| *seconds > 0), facts.last_completed_at)
    {
        let available_at = last + time::Duration::seconds(i64::from(cooldown));
        if facts.now < available_at {
            return ValidationResult::rejected(format!(
                "Retake available at {}",
                format_primitive(available_at)
            ));
        }
    }

    if facts.question_count == 0 {
        return ValidationResult::rejected("Assessment has no questions");
    }

    ValidationResult::allowed()
}

/// Gathers the facts inside `uow` and evaluates them.
///
/// Run inside the same unit of work that creates the attempt, after the slot
/// lock, so the answer holds until commit.
pub(crate) async fn check(
    uow: &mut dyn UnitOfWork,
    ctx: &RequestContext,
    student_id: i64,
    assessment: &Assessment,
    now: PrimitiveDateTime,
) -> DomainResult<ValidationResult> {
    let active = ctx
        .store(
            "Failed to fetch in-progress attempt",
            uow.find_in_progress_attempt(student_id, assessment.id),
        )
        .await?;
    let completed_attempts = ctx
        .store(
            "Failed to count completed attempts",
            uow.count_attempts(student_id, assessment.id, Some(AttemptStatus::Completed)),
        )
        .await?;
    let last_completed_at = match assessment.retake_cooldown_seconds {
        Some(seconds) if seconds > 0 => {
            ctx.store(
                "Failed to fetch last completed attempt",
                uow.last_completed_at(student_id, assessment.id),
            )
            .await?
        }
        _ => None,
    };
    let links = ctx.store("Failed to fetch assessment questions", uow.list_links(assessment.id)).await?;

    Ok(evaluate(&EligibilityFacts {
        assessment,
        active_attempt: active.as_ref(),
        completed_attempts,
        last_completed_at,
        question_count: links.len(),
        now,
    }))
}
