pub(crate) mod answers;
pub(crate) mod assessment_questions;
pub(crate) mod assessments;
pub(crate) mod attempts;
pub(crate) mod health;
pub(crate) mod questions;
