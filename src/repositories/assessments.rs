use crate::db::models::Assessment;

pub(crate) const COLUMNS: &str = "\
    id, title, status, max_attempts, time_limit_seconds, passing_percentage, \
    shuffle_questions, retake_cooldown_seconds, available_from, available_until, \
    created_at, updated_at";

pub(crate) async fn find_by_id(
    executor: impl sqlx::PgExecutor<'_>,
    id: i64,
) -> Result<Option<Assessment>, sqlx::Error> {
    sqlx::query_as::<_, Assessment>(&format!("SELECT {COLUMNS} FROM assessments WHERE id = $1"))
        .bind(id)
        .fetch_optional(executor)
        .await
}
