use serde::{Deserialize, Serialize};
use sqlx::Type;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "assessmentstatus", rename_all = "lowercase")]
pub enum AssessmentStatus {
    Draft,
    Published,
    Active,
    Closed,
    Archived,
}

impl AssessmentStatus {
    /// Whether students may open new attempts against an assessment in this status.
    pub fn is_attemptable(self) -> bool {
        matches!(self, AssessmentStatus::Published | AssessmentStatus::Active)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AssessmentStatus::Draft => "draft",
            AssessmentStatus::Published => "published",
            AssessmentStatus::Active => "active",
            AssessmentStatus::Closed => "closed",
            AssessmentStatus::Archived => "archived",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "attemptstatus", rename_all = "snake_case")]
pub enum AttemptStatus {
    InProgress,
    Completed,
    Abandoned,
    TimedOut,
}

impl AttemptStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, AttemptStatus::InProgress)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AttemptStatus::InProgress => "in_progress",
            AttemptStatus::Completed => "completed",
            AttemptStatus::Abandoned => "abandoned",
            AttemptStatus::TimedOut => "timed_out",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "questiontype", rename_all = "snake_case")]
pub enum QuestionType {
    MultipleChoice,
    TrueFalse,
    ShortAnswer,
    Essay,
}

impl QuestionType {
    /// Objective questions can be graded by comparing against a stored correct answer.
    pub fn is_objective(self) -> bool {
        matches!(self, QuestionType::MultipleChoice | QuestionType::TrueFalse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_in_progress_is_not_terminal() {
        assert!(!AttemptStatus::InProgress.is_terminal());
        assert!(AttemptStatus::Completed.is_terminal());
        assert!(AttemptStatus::Abandoned.is_terminal());
        assert!(AttemptStatus::TimedOut.is_terminal());
    }

    #[test]
    fn attempt_status_serializes_snake_case() {
        let value = serde_json::to_value(AttemptStatus::TimedOut).unwrap();
        assert_eq!(value, "timed_out");
        assert_eq!(AttemptStatus::TimedOut.as_str(), "timed_out");
    }

    #[test]
    fn attemptable_statuses() {
        assert!(AssessmentStatus::Published.is_attemptable());
        assert!(AssessmentStatus::Active.is_attemptable());
        assert!(!AssessmentStatus::Draft.is_attemptable());
        assert!(!AssessmentStatus::Closed.is_attemptable());
        assert!(!AssessmentStatus::Archived.is_attemptable());
    }
}
