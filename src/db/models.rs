use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use time::PrimitiveDateTime;

use crate::db::session_data::SessionData;
use crate::db::types::{AssessmentStatus, AttemptStatus, QuestionType};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Assessment {
    pub id: i64,
    pub title: String,
    pub status: AssessmentStatus,
    /// Zero means unlimited.
    pub max_attempts: i32,
    pub time_limit_seconds: Option<i32>,
    pub passing_percentage: f64,
    pub shuffle_questions: bool,
    pub retake_cooldown_seconds: Option<i32>,
    pub available_from: Option<PrimitiveDateTime>,
    pub available_until: Option<PrimitiveDateTime>,
    pub created_at: PrimitiveDateTime,
    pub updated_at: PrimitiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Question {
    pub id: i64,
    pub question_type: QuestionType,
    pub prompt: String,
    pub points: f64,
    pub correct_answer: Option<String>,
    pub created_at: PrimitiveDateTime,
    pub updated_at: PrimitiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct AssessmentQuestion {
    pub id: i64,
    pub assessment_id: i64,
    pub question_id: i64,
    pub order: i32,
    /// Overrides the question's default points when present.
    pub points: Option<f64>,
    pub required: bool,
}

impl AssessmentQuestion {
    pub fn effective_points(&self, question: &Question) -> f64 {
        match self.points {
            Some(points) => points,
            None => question.points,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Attempt {
    pub id: i64,
    pub student_id: i64,
    pub assessment_id: i64,
    pub attempt_number: i32,
    pub status: AttemptStatus,
    pub started_at: PrimitiveDateTime,
    pub completed_at: Option<PrimitiveDateTime>,
    pub expires_at: Option<PrimitiveDateTime>,
    pub current_question_index: i32,
    pub questions_answered: i32,
    pub total_questions: i32,
    pub time_remaining: Option<i32>,
    pub score: Option<f64>,
    pub percentage: Option<f64>,
    pub passed: Option<bool>,
    pub session_data: Json<SessionData>,
    pub last_activity_at: PrimitiveDateTime,
    pub created_at: PrimitiveDateTime,
    pub updated_at: PrimitiveDateTime,
}

impl Attempt {
    pub fn is_in_progress(&self) -> bool {
        self.status == AttemptStatus::InProgress
    }

    pub fn question_seed(&self) -> Option<u64> {
        self.session_data.0.question_seed()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Answer {
    pub id: i64,
    pub attempt_id: i64,
    pub question_id: i64,
    pub value: Json<serde_json::Value>,
    pub is_correct: Option<bool>,
    pub score: Option<f64>,
    pub graded_by: Option<i64>,
    pub graded_at: Option<PrimitiveDateTime>,
    pub feedback: Option<String>,
    pub is_flagged: bool,
    pub time_spent: i32,
    pub last_modified_at: PrimitiveDateTime,
    pub created_at: PrimitiveDateTime,
}

/// Grading state of an answer, derived from its nullable columns.
#[derive(Debug, Clone, PartialEq)]
pub enum Grading {
    Ungraded,
    /// Scored by comparison against the question's correct answer, no reviewer involved.
    Automatic { is_correct: Option<bool>, score: f64 },
    Reviewed {
        score: f64,
        is_correct: Option<bool>,
        graded_by: i64,
        graded_at: PrimitiveDateTime,
        feedback: Option<String>,
    },
}

impl Answer {
    pub fn grading(&self) -> Grading {
        match (self.score, self.graded_by, self.graded_at) {
            (Some(score), Some(graded_by), Some(graded_at)) => Grading::Reviewed {
                score,
                is_correct: self.is_correct,
                graded_by,
                graded_at,
                feedback: self.feedback.clone(),
            },
            (Some(score), None, None) => Grading::Automatic { is_correct: self.is_correct, score },
            _ => Grading::Ungraded,
        }
    }

    pub fn awarded_score(&self) -> Option<f64> {
        match self.grading() {
            Grading::Ungraded => None,
            Grading::Automatic { score, .. } | Grading::Reviewed { score, .. } => Some(score),
        }
    }
}
