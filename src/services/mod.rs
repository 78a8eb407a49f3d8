pub mod answers;
pub mod attempts;
pub mod eligibility;
pub mod scoring;
pub mod sequencer;

use crate::core::context::RequestContext;
use crate::core::errors::{DomainError, DomainResult};
use crate::store::{Store, UnitOfWork};

pub use answers::AnswerLedger;
pub use attempts::AttemptService;
pub use sequencer::QuestionSequencer;

pub(crate) async fn begin(
    store: &dyn Store,
    ctx: &RequestContext,
) -> DomainResult<Box<dyn UnitOfWork>> {
    ctx.store("Failed to open transaction", store.begin()).await
}

/// Commits unless the request was cancelled first; a commit already in flight
/// is not interrupted.
pub(crate) async fn commit(
    ctx: &RequestContext,
    uow: Box<dyn UnitOfWork>,
    context: &'static str,
) -> DomainResult<()> {
    ctx.ensure_active()?;
    uow.commit().await.map_err(|err| DomainError::store(context, err))
}
