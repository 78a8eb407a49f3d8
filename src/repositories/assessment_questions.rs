use crate::db::models::AssessmentQuestion;
use crate::store::NewLink;

pub(crate) const COLUMNS: &str = "id, assessment_id, question_id, \"order\", points, required";

pub(crate) async fn list_by_assessment(
    executor: impl sqlx::PgExecutor<'_>,
    assessment_id: i64,
) -> Result<Vec<AssessmentQuestion>, sqlx::Error> {
    sqlx::query_as::<_, AssessmentQuestion>(&format!(
        "SELECT {COLUMNS} FROM assessment_questions WHERE assessment_id = $1 ORDER BY \"order\", id"
    ))
    .bind(assessment_id)
    .fetch_all(executor)
    .await
}

pub(crate) async fn list_by_assessment_for_update(
    executor: impl sqlx::PgExecutor<'_>,
    assessment_id: i64,
) -> Result<Vec<AssessmentQuestion>, sqlx::Error> {
    sqlx::query_as::<_, AssessmentQuestion>(&format!(
        "SELECT {COLUMNS} FROM assessment_questions WHERE assessment_id = $1 \
         ORDER BY \"order\", id FOR UPDATE"
    ))
    .bind(assessment_id)
    .fetch_all(executor)
    .await
}

pub(crate) async fn find_by_pair(
    executor: impl sqlx::PgExecutor<'_>,
    assessment_id: i64,
    question_id: i64,
) -> Result<Option<AssessmentQuestion>, sqlx::Error> {
    sqlx::query_as::<_, AssessmentQuestion>(&format!(
        "SELECT {COLUMNS} FROM assessment_questions WHERE assessment_id = $1 AND question_id = $2"
    ))
    .bind(assessment_id)
    .bind(question_id)
    .fetch_optional(executor)
    .await
}

pub(crate) async fn create(
    executor: impl sqlx::PgExecutor<'_>,
    link: NewLink,
) -> Result<AssessmentQuestion, sqlx::Error> {
    sqlx::query_as::<_, AssessmentQuestion>(&format!(
        "INSERT INTO assessment_questions (assessment_id, question_id, \"order\", points, required)
         VALUES ($1,$2,$3,$4,$5)
         RETURNING {COLUMNS}"
    ))
    .bind(link.assessment_id)
    .bind(link.question_id)
    .bind(link.order)
    .bind(link.points)
    .bind(link.required)
    .fetch_one(executor)
    .await
}

pub(crate) async fn delete_by_pair(
    executor: impl sqlx::PgExecutor<'_>,
    assessment_id: i64,
    question_id: i64,
) -> Result<bool, sqlx::Error> {
    let result =
        sqlx::query("DELETE FROM assessment_questions WHERE assessment_id = $1 AND question_id = $2")
            .bind(assessment_id)
            .bind(question_id)
            .execute(executor)
            .await?;
    Ok(result.rows_affected() > 0)
}

pub(crate) async fn set_order(
    executor: impl sqlx::PgExecutor<'_>,
    link_id: i64,
    order: i32,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE assessment_questions SET \"order\" = $1 WHERE id = $2")
        .bind(order)
        .bind(link_id)
        .execute(executor)
        .await?;
    Ok(())
}
