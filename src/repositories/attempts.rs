use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder};
use time::PrimitiveDateTime;

use crate::db::models::Attempt;
use crate::db::types::AttemptStatus;
use crate::store::{AttemptFilter, NewAttempt};

pub(crate) const COLUMNS: &str = "\
    id, student_id, assessment_id, attempt_number, status, started_at, completed_at, \
    expires_at, current_question_index, questions_answered, total_questions, time_remaining, \
    score, percentage, passed, session_data, last_activity_at, created_at, updated_at";

pub(crate) async fn acquire_slot_lock(
    executor: impl sqlx::PgExecutor<'_>,
    student_id: i64,
    assessment_id: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT pg_advisory_xact_lock($1, $2)")
        .bind(hash_key(student_id))
        .bind(hash_key(assessment_id))
        .execute(executor)
        .await?;
    Ok(())
}

/// Folds an id into the 32-bit key space of two-argument advisory locks.
fn hash_key(id: i64) -> i32 {
    ((id as u64 ^ ((id as u64) >> 32)) & 0xFFFF_FFFF) as u32 as i32
}

pub(crate) async fn find_by_id(
    executor: impl sqlx::PgExecutor<'_>,
    id: i64,
) -> Result<Option<Attempt>, sqlx::Error> {
    sqlx::query_as::<_, Attempt>(&format!("SELECT {COLUMNS} FROM attempts WHERE id = $1"))
        .bind(id)
        .fetch_optional(executor)
        .await
}

pub(crate) async fn find_by_id_for_update(
    executor: impl sqlx::PgExecutor<'_>,
    id: i64,
) -> Result<Option<Attempt>, sqlx::Error> {
    sqlx::query_as::<_, Attempt>(&format!(
        "SELECT {COLUMNS} FROM attempts WHERE id = $1 FOR UPDATE"
    ))
    .bind(id)
    .fetch_optional(executor)
    .await
}

pub(crate) async fn find_by_id_for_share(
    executor: impl sqlx::PgExecutor<'_>,
    id: i64,
) -> Result<Option<Attempt>, sqlx::Error> {
    sqlx::query_as::<_, Attempt>(&format!(
        "SELECT {COLUMNS} FROM attempts WHERE id = $1 FOR SHARE"
    ))
    .bind(id)
    .fetch_optional(executor)
    .await
}

pub(crate) async fn find_in_progress(
    executor: impl sqlx::PgExecutor<'_>,
    student_id: i64,
    assessment_id: i64,
) -> Result<Option<Attempt>, sqlx::Error> {
    sqlx::query_as::<_, Attempt>(&format!(
        "SELECT {COLUMNS} FROM attempts \
         WHERE student_id = $1 AND assessment_id = $2 AND status = $3"
    ))
    .bind(student_id)
    .bind(assessment_id)
    .bind(AttemptStatus::InProgress)
    .fetch_optional(executor)
    .await
}

pub(crate) async fn count_by_pair(
    executor: impl sqlx::PgExecutor<'_>,
    student_id: i64,
    assessment_id: i64,
    status: Option<AttemptStatus>,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar(
        "SELECT COUNT(*) FROM attempts \
         WHERE student_id = $1 AND assessment_id = $2 AND ($3::attemptstatus IS NULL OR status = $3)",
    )
    .bind(student_id)
    .bind(assessment_id)
    .bind(status)
    .fetch_one(executor)
    .await
}

pub(crate) async fn last_completed_at(
    executor: impl sqlx::PgExecutor<'_>,
    student_id: i64,
    assessment_id: i64,
) -> Result<Option<PrimitiveDateTime>, sqlx::Error> {
    sqlx::query_scalar(
        "SELECT MAX(completed_at) FROM attempts \
         WHERE student_id = $1 AND assessment_id = $2 AND status = $3",
    )
    .bind(student_id)
    .bind(assessment_id)
    .bind(AttemptStatus::Completed)
    .fetch_one(executor)
    .await
}

pub(crate) async fn create(
    executor: impl sqlx::PgExecutor<'_>,
    attempt: NewAttempt,
) -> Result<Attempt, sqlx::Error> {
    sqlx::query_as::<_, Attempt>(&format!(
        "INSERT INTO attempts (
            student_id, assessment_id, attempt_number, status, started_at, expires_at,
            current_question_index, questions_answered, total_questions, time_remaining,
            session_data, last_activity_at, created_at, updated_at
        ) VALUES ($1,$2,$3,$4,$5,$6,0,0,$7,$8,$9,$5,$5,$5)
        RETURNING {COLUMNS}"
    ))
    .bind(attempt.student_id)
    .bind(attempt.assessment_id)
    .bind(attempt.attempt_number)
    .bind(AttemptStatus::InProgress)
    .bind(attempt.started_at)
    .bind(attempt.expires_at)
    .bind(attempt.total_questions)
    .bind(attempt.time_remaining)
    .bind(Json(attempt.session_data))
    .fetch_one(executor)
    .await
}

/// `started_at` and `total_questions` are never rewritten.
pub(crate) async fn save(
    executor: impl sqlx::PgExecutor<'_>,
    attempt: &Attempt,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE attempts
         SET status = $1,
             completed_at = $2,
             current_question_index = $3,
             questions_answered = $4,
             time_remaining = $5,
             score = $6,
             percentage = $7,
             passed = $8,
             session_data = $9,
             last_activity_at = $10,
             updated_at = $11
         WHERE id = $12",
    )
    .bind(attempt.status)
    .bind(attempt.completed_at)
    .bind(attempt.current_question_index)
    .bind(attempt.questions_answered)
    .bind(attempt.time_remaining)
    .bind(attempt.score)
    .bind(attempt.percentage)
    .bind(attempt.passed)
    .bind(&attempt.session_data)
    .bind(attempt.last_activity_at)
    .bind(attempt.updated_at)
    .bind(attempt.id)
    .execute(executor)
    .await?;
    Ok(())
}

pub(crate) async fn delete_by_id(
    executor: impl sqlx::PgExecutor<'_>,
    id: i64,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM attempts WHERE id = $1").bind(id).execute(executor).await?;
    Ok(result.rows_affected() > 0)
}

pub(crate) async fn list(
    executor: impl sqlx::PgExecutor<'_>,
    filter: &AttemptFilter,
) -> Result<Vec<Attempt>, sqlx::Error> {
    let mut builder =
        QueryBuilder::<Postgres>::new(format!("SELECT {COLUMNS} FROM attempts WHERE TRUE"));

    if let Some(student_id) = filter.student_id {
        builder.push(" AND student_id = ");
        builder.push_bind(student_id);
    }
    if let Some(assessment_id) = filter.assessment_id {
        builder.push(" AND assessment_id = ");
        builder.push_bind(assessment_id);
    }
    if let Some(status) = filter.status {
        builder.push(" AND status = ");
        builder.push_bind(status);
    }
    if let Some(from) = filter.started_from {
        builder.push(" AND started_at >= ");
        builder.push_bind(from);
    }
    if let Some(to) = filter.started_to {
        builder.push(" AND started_at < ");
        builder.push_bind(to);
    }

    builder.push(" ORDER BY started_at DESC, id DESC OFFSET ");
    builder.push_bind(filter.skip.max(0));
    builder.push(" LIMIT ");
    builder.push_bind(filter.effective_limit());

    builder.build_query_as::<Attempt>().fetch_all(executor).await
}

pub(crate) async fn list_timeout_candidates(
    executor: impl sqlx::PgExecutor<'_>,
    expired_before: PrimitiveDateTime,
    limit: i64,
) -> Result<Vec<Attempt>, sqlx::Error> {
    sqlx::query_as::<_, Attempt>(&format!(
        "SELECT {COLUMNS} FROM attempts
         WHERE status = $1
           AND (time_remaining <= 0 OR expires_at <= $2)
         ORDER BY id
         LIMIT $3
         FOR UPDATE SKIP LOCKED"
    ))
    .bind(AttemptStatus::InProgress)
    .bind(expired_before)
    .bind(limit.max(1))
    .fetch_all(executor)
    .await
}
