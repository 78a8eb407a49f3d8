use std::collections::HashMap;

use serde::Serialize;

use crate::db::models::{Answer, AssessmentQuestion, Question};
use crate::db::types::QuestionType;

/// Final result persisted on a completed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FinalScore {
    pub score: f64,
    pub percentage: f64,
    pub passed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreSummary {
    pub score: f64,
    pub max_score: f64,
    pub percentage: f64,
    pub passed: bool,
    /// Answers still waiting for a reviewer.
    pub pending_review: usize,
}

impl ScoreSummary {
    pub fn final_score(&self) -> FinalScore {
        FinalScore { score: self.score, percentage: self.percentage, passed: self.passed }
    }
}

pub fn percentage(score: f64, max_score: f64) -> f64 {
    if max_score <= 0.0 {
        return 0.0;
    }
    let value = (score / max_score * 100.0).clamp(0.0, 100.0);
    (value * 100.0).round() / 100.0
}

/// Sums awarded scores over the assessment's links.
///
/// Answers to questions no longer linked are ignored. Ungraded answers count as
/// zero and are reported in `pending_review`.
pub fn summarize(
    links: &[AssessmentQuestion],
    questions: &[Question],
    answers: &[Answer],
    passing_percentage: f64,
) -> ScoreSummary {
    let questions: HashMap<i64, &Question> =
        questions.iter().map(|question| (question.id, question)).collect();
    let answers: HashMap<i64, &Answer> =
        answers.iter().map(|answer| (answer.question_id, answer)).collect();

    let mut score = 0.0;
    let mut max_score = 0.0;
    let mut pending_review = 0;

    for link in links {
        let Some(question) = questions.get(&link.question_id) else {
            continue;
        };
        let points = link.effective_points(question);
        max_score += points;

        if let Some(answer) = answers.get(&link.question_id) {
            match answer.awarded_score() {
                Some(awarded) => score += awarded.clamp(0.0, points.max(0.0)),
                None => pending_review += 1,
            }
        }
    }

    let percentage = percentage(score, max_score);
    ScoreSummary {
        score,
        max_score,
        percentage,
        passed: percentage >= passing_percentage,
        pending_review,
    }
}

/// Automatic grade for objective questions: `(is_correct, score)`.
///
/// Returns `None` for subjective questions and objective ones without a key.
pub fn auto_grade(
    question: &Question,
    link: &AssessmentQuestion,
    value: &serde_json::Value,
) -> Option<(bool, f64)> {
    if !question.question_type.is_objective() {
        return None;
    }
    let expected = question.correct_answer.as_deref()?;
    let is_correct = match question.question_type {
        QuestionType::TrueFalse => {
            normalize_bool(value).is_some_and(|given| Some(given) == normalize_bool_str(expected))
        }
        _ => normalize_text(value).is_some_and(|given| given == expected.trim().to_lowercase()),
    };
    let score = if is_correct { link.effective_points(question) } else { 0.0 };
    Some((is_correct, score))
}

fn normalize_text(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(text) => Some(text.trim().to_lowercase()),
        serde_json::Value::Number(number) => Some(number.to_string()),
        serde_json::Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

fn normalize_bool(value: &serde_json::Value) -> Option<bool> {
    match value {
        serde_json::Value::Bool(flag) => Some(*flag),
        serde_json::Value::String(text) => normalize_bool_str(text),
        _ => None,
    }
}

fn normalize_bool_str(text: &str) -> Option<bool> {
    match text.trim().to_lowercase().as_str() {
        "true" | "t" | "yes" | "1" => Some(true),
        "false" | "f" | "no" | "0" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;
    use serde_json::json;

    fn link(question_id: i64, points: Option<f64>) -> AssessmentQuestion {
        AssessmentQuestion {
            id: question_id + 100,
            assessment_id: 1,
            question_id,
            order: question_id as i32,
            points,
            required: true,
        }
    }

    #[test]
    fn summary_uses_point_overrides_and_counts_pending() {
        let questions = vec![
            test_support::question(1, 2.0),
            test_support::question(2, 3.0),
            test_support::question(3, 5.0),
        ];
        let links = vec![link(1, None), link(2, Some(5.0)), link(3, None)];

        let mut graded = test_support::answer(11, 9, 1);
        graded.score = Some(2.0);
        let mut partially = test_support::answer(12, 9, 2);
        partially.score = Some(2.5);
        let ungraded = test_support::answer(13, 9, 3);

        let summary = summarize(&links, &questions, &[graded, partially, ungraded], 40.0);
        assert_eq!(summary.score, 4.5);
        assert_eq!(summary.max_score, 12.0);
        assert_eq!(summary.percentage, 37.5);
        assert!(!summary.passed);
        assert_eq!(summary.pending_review, 1);
    }

    #[test]
    fn empty_assessment_scores_zero() {
        let summary = summarize(&[], &[], &[], 0.0);
        assert_eq!(summary.percentage, 0.0);
        assert!(summary.passed);
    }

    #[test]
    fn auto_grade_handles_objective_types_only() {
        let mut choice = test_support::question(1, 4.0);
        choice.question_type = QuestionType::MultipleChoice;
        choice.correct_answer = Some("B".to_string());
        assert_eq!(auto_grade(&choice, &link(1, None), &json!(" b ")), Some((true, 4.0)));
        assert_eq!(auto_grade(&choice, &link(1, Some(1.0)), &json!("C")), Some((false, 0.0)));

        let mut truth = test_support::question(2, 1.0);
        truth.question_type = QuestionType::TrueFalse;
        truth.correct_answer = Some("true".to_string());
        assert_eq!(auto_grade(&truth, &link(2, None), &json!(true)), Some((true, 1.0)));
        assert_eq!(auto_grade(&truth, &link(2, None), &json!("no")), Some((false, 0.0)));

        let mut essay = test_support::question(3, 10.0);
        essay.question_type = QuestionType::Essay;
        essay.correct_answer = Some("anything".to_string());
        assert_eq!(auto_grade(&essay, &link(3, None), &json!("anything")), None);
    }
}
