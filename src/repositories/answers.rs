use sqlx::types::Json;
use time::PrimitiveDateTime;

use crate::db::models::Answer;
use crate::store::{GradeUpdate, UpsertAnswer};

pub(crate) const COLUMNS: &str = "\
    id, attempt_id, question_id, value, is_correct, score, graded_by, graded_at, \
    feedback, is_flagged, time_spent, last_modified_at, created_at";

/// Inserts or replaces the answer for (attempt, question) in one statement.
///
/// A resubmission keeps the row identity, replaces the payload and resets any
/// reviewer grade. Time spent never decreases.
pub(crate) async fn upsert(
    executor: impl sqlx::PgExecutor<'_>,
    answer: UpsertAnswer,
) -> Result<Answer, sqlx::Error> {
    sqlx::query_as::<_, Answer>(&format!(
        "INSERT INTO answers (
            attempt_id, question_id, value, is_correct, score, time_spent,
            last_modified_at, created_at
         ) VALUES ($1,$2,$3,$4,$5,COALESCE($6, 0),$7,$7)
         ON CONFLICT (attempt_id, question_id) DO UPDATE
             SET value = EXCLUDED.value,
                 is_correct = EXCLUDED.is_correct,
                 score = EXCLUDED.score,
                 graded_by = NULL,
                 graded_at = NULL,
                 feedback = NULL,
                 time_spent = GREATEST(answers.time_spent, COALESCE($6, answers.time_spent)),
                 last_modified_at = EXCLUDED.last_modified_at
         RETURNING {COLUMNS}"
    ))
    .bind(answer.attempt_id)
    .bind(answer.question_id)
    .bind(Json(answer.value))
    .bind(answer.is_correct)
    .bind(answer.score)
    .bind(answer.time_spent)
    .bind(answer.now)
    .fetch_one(executor)
    .await
}

pub(crate) async fn find_by_id(
    executor: impl sqlx::PgExecutor<'_>,
    id: i64,
) -> Result<Option<Answer>, sqlx::Error> {
    sqlx::query_as::<_, Answer>(&format!("SELECT {COLUMNS} FROM answers WHERE id = $1"))
        .bind(id)
        .fetch_optional(executor)
        .await
}

pub(crate) async fn find_by_pair(
    executor: impl sqlx::PgExecutor<'_>,
    attempt_id: i64,
    question_id: i64,
) -> Result<Option<Answer>, sqlx::Error> {
    sqlx::query_as::<_, Answer>(&format!(
        "SELECT {COLUMNS} FROM answers WHERE attempt_id = $1 AND question_id = $2"
    ))
    .bind(attempt_id)
    .bind(question_id)
    .fetch_optional(executor)
    .await
}

pub(crate) async fn list_by_attempt(
    executor: impl sqlx::PgExecutor<'_>,
    attempt_id: i64,
) -> Result<Vec<Answer>, sqlx::Error> {
    sqlx::query_as::<_, Answer>(&format!(
        "SELECT {COLUMNS} FROM answers WHERE attempt_id = $1 ORDER BY id"
    ))
    .bind(attempt_id)
    .fetch_all(executor)
    .await
}

pub(crate) async fn exists(
    executor: impl sqlx::PgExecutor<'_>,
    attempt_id: i64,
    question_id: i64,
) -> Result<bool, sqlx::Error> {
    sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM answers WHERE attempt_id = $1 AND question_id = $2)",
    )
    .bind(attempt_id)
    .bind(question_id)
    .fetch_one(executor)
    .await
}

pub(crate) async fn answered_question_ids(
    executor: impl sqlx::PgExecutor<'_>,
    attempt_id: i64,
) -> Result<Vec<i64>, sqlx::Error> {
    sqlx::query_scalar("SELECT question_id FROM answers WHERE attempt_id = $1 ORDER BY question_id")
        .bind(attempt_id)
        .fetch_all(executor)
        .await
}

pub(crate) async fn grade(
    executor: impl sqlx::PgExecutor<'_>,
    id: i64,
    grade: &GradeUpdate,
) -> Result<Option<Answer>, sqlx::Error> {
    sqlx::query_as::<_, Answer>(&format!(
        "UPDATE answers
         SET score = $1,
             is_correct = COALESCE($2, is_correct),
             feedback = COALESCE($3, feedback),
             graded_by = $4,
             graded_at = $5,
             last_modified_at = $5
         WHERE id = $6
         RETURNING {COLUMNS}"
    ))
    .bind(grade.score)
    .bind(grade.is_correct)
    .bind(&grade.feedback)
    .bind(grade.graded_by)
    .bind(grade.graded_at)
    .bind(id)
    .fetch_optional(executor)
    .await
}

pub(crate) async fn clear_grade(
    executor: impl sqlx::PgExecutor<'_>,
    id: i64,
    now: PrimitiveDateTime,
) -> Result<Option<Answer>, sqlx::Error> {
    sqlx::query_as::<_, Answer>(&format!(
        "UPDATE answers
         SET score = NULL,
             is_correct = NULL,
             feedback = NULL,
             graded_by = NULL,
             graded_at = NULL,
             last_modified_at = $1
         WHERE id = $2
         RETURNING {COLUMNS}"
    ))
    .bind(now)
    .bind(id)
    .fetch_optional(executor)
    .await
}

pub(crate) async fn set_flag(
    executor: impl sqlx::PgExecutor<'_>,
    id: i64,
    flagged: bool,
    now: PrimitiveDateTime,
) -> Result<Option<Answer>, sqlx::Error> {
    sqlx::query_as::<_, Answer>(&format!(
        "UPDATE answers SET is_flagged = $1, last_modified_at = $2 WHERE id = $3 RETURNING {COLUMNS}"
    ))
    .bind(flagged)
    .bind(now)
    .bind(id)
    .fetch_optional(executor)
    .await
}

pub(crate) async fn set_time_spent(
    executor: impl sqlx::PgExecutor<'_>,
    attempt_id: i64,
    question_id: i64,
    seconds: i32,
    now: PrimitiveDateTime,
) -> Result<Option<Answer>, sqlx::Error> {
    sqlx::query_as::<_, Answer>(&format!(
        "UPDATE answers
         SET time_spent = $1, last_modified_at = $2
         WHERE attempt_id = $3 AND question_id = $4
         RETURNING {COLUMNS}"
    ))
    .bind(seconds)
    .bind(now)
    .bind(attempt_id)
    .bind(question_id)
    .fetch_optional(executor)
    .await
}

pub(crate) async fn delete_by_id(
    executor: impl sqlx::PgExecutor<'_>,
    id: i64,
) -> Result<Option<Answer>, sqlx::Error> {
    sqlx::query_as::<_, Answer>(&format!("DELETE FROM answers WHERE id = $1 RETURNING {COLUMNS}"))
        .bind(id)
        .fetch_optional(executor)
        .await
}
