use std::collections::HashMap;

use crate::grading::rubric::{Criterion, EvaluationMethod, Rubric};
use crate::stages::jobs::{CriterionScore, GptEvaluationResult, GradeTotals, TestExecutionResult};

/// Score every criterion of `rubric`, in presentation order.
///
/// `evaluations` is keyed by criterion id. A semantic criterion without an
/// evaluation scores 0 for its GPT part.
pub fn score_criteria(
    rubric: &Rubric,
    tests: &TestExecutionResult,
    evaluations: &HashMap<String, GptEvaluationResult>,
) -> Vec<CriterionScore> {
    let ratio = tests.pass_ratio();
    rubric
        .ordered_criteria()
        .into_iter()
        .map(|criterion| score_criterion(criterion, ratio, tests, evaluations.get(&criterion.id)))
        .collect()
}

fn score_criterion(
    criterion: &Criterion,
    pass_ratio: f64,
    tests: &TestExecutionResult,
    evaluation: Option<&GptEvaluationResult>,
) -> CriterionScore {
    let max = criterion.max_points.max(0.0);
    let unit_part = pass_ratio * max;
    let gpt_part = evaluation.map_or(0.0, |e| e.score.clamp(0.0, max));
    let tests_note = format!("{}/{} tests passed", tests.passed_tests, tests.total_tests);

    let (score, justification) = match criterion.evaluation_method {
        EvaluationMethod::UnitTest => (unit_part, Some(tests_note)),
        EvaluationMethod::GptSemantic => (gpt_part, evaluation.map(|e| e.justification.clone())),
        EvaluationMethod::Hybrid => {
            let (uw, gw) = match (criterion.unit_test_weight.max(0.0), criterion.gpt_weight.max(0.0)) {
                (u, g) if u + g == 0.0 => (0.5, 0.5),
                weights => weights,
            };
            let score = (uw * unit_part + gw * gpt_part) / (uw + gw);
            let justification = match evaluation {
                Some(e) => format!("{}. {}", tests_note, e.justification),
                None => tests_note,
            };
            (score, Some(justification))
        }
    };

    CriterionScore {
        criterion_id: criterion.id.clone(),
        title: criterion.title.clone(),
        score: round2(score),
        max_points: max,
        justification,
    }
}

/// Sum the breakdown into totals and a letter grade.
pub fn totals(breakdown: &[CriterionScore]) -> GradeTotals {
    let total_score: f64 = breakdown.iter().map(|c| c.score).sum();
    let max_score: f64 = breakdown.iter().map(|c| c.max_points).sum();
    let percentage = if max_score > 0.0 {
        round2(total_score / max_score * 100.0)
    } else {
        0.0
    };

    GradeTotals {
        total_score: round2(total_score),
        max_score: round2(max_score),
        percentage,
        letter_grade: letter_grade(percentage).to_string(),
    }
}

pub fn letter_grade(percentage: f64) -> &'static str {
    match percentage {
        p if p >= 90.0 => "A",
        p if p >= 80.0 => "B",
        p if p >= 70.0 => "C",
        p if p >= 60.0 => "D",
        _ => "F",
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn criterion(id: &str, method: EvaluationMethod, max: f64) -> Criterion {
        Criterion {
            id: id.to_string(),
            title: id.to_uppercase(),
            max_points: max,
            evaluation_method: method,
            unit_test_weight: 0.0,
            gpt_weight: 0.0,
            gpt_instructions: None,
            files_to_analyze: vec![],
            order: 0,
        }
    }

    fn tests(passed: u32, total: u32) -> TestExecutionResult {
        TestExecutionResult {
            success: true,
            total_tests: total,
            passed_tests: passed,
            failed_tests: total - passed,
            build_success: true,
        }
    }

    fn eval(id: &str, score: f64) -> (String, GptEvaluationResult) {
        (
            id.to_string(),
            GptEvaluationResult {
                success: true,
                criterion_id: id.to_string(),
                score,
                justification: format!("{} looks fine", id),
            },
        )
    }

    #[test]
    fn scores_each_method() {
        let mut hybrid = criterion("h", EvaluationMethod::Hybrid, 10.0);
        hybrid.unit_test_weight = 3.0;
        hybrid.gpt_weight = 1.0;
        let rubric = Rubric {
            id: "r1".into(),
            title: "r".into(),
            total_points: 30.0,
            criteria: vec![
                criterion("u", EvaluationMethod::UnitTest, 10.0),
                criterion("g", EvaluationMethod::GptSemantic, 10.0),
                hybrid,
            ],
        };
        let evaluations = HashMap::from([eval("g", 6.0), eval("h", 2.0)]);

        let breakdown = score_criteria(&rubric, &tests(3, 4), &evaluations);
        assert_eq!(breakdown[0].score, 7.5);
        assert_eq!(breakdown[1].score, 6.0);
        // (3 * 7.5 + 1 * 2.0) / 4
        assert_eq!(breakdown[2].score, 6.13);
        assert_eq!(breakdown[1].justification.as_deref(), Some("g looks fine"));
    }

    #[test]
    fn hybrid_without_weights_is_an_even_split() {
        let rubric = Rubric {
            id: "r1".into(),
            title: "r".into(),
            total_points: 10.0,
            criteria: vec![criterion("h", EvaluationMethod::Hybrid, 10.0)],
        };
        let evaluations = HashMap::from([eval("h", 10.0)]);
        let breakdown = score_criteria(&rubric, &tests(0, 2), &evaluations);
        assert_eq!(breakdown[0].score, 5.0);
    }

    #[test]
    fn gpt_scores_are_clamped_and_no_tests_scores_zero() {
        let rubric = Rubric {
            id: "r1".into(),
            title: "r".into(),
            total_points: 20.0,
            criteria: vec![
                criterion("u", EvaluationMethod::UnitTest, 10.0),
                criterion("g", EvaluationMethod::GptSemantic, 10.0),
            ],
        };
        let evaluations = HashMap::from([eval("g", 99.0)]);
        let breakdown = score_criteria(&rubric, &tests(0, 0), &evaluations);
        assert_eq!(breakdown[0].score, 0.0);
        assert_eq!(breakdown[1].score, 10.0);
    }

    #[test]
    fn totals_round_and_grade() {
        let breakdown = vec![
            CriterionScore {
                criterion_id: "a".into(),
                title: "A".into(),
                score: 8.0,
                max_points: 9.0,
                justification: None,
            },
            CriterionScore {
                criterion_id: "b".into(),
                title: "B".into(),
                score: 0.0,
                max_points: 0.0,
                justification: None,
            },
        ];
        let t = totals(&breakdown);
        assert_eq!(t.total_score, 8.0);
        assert_eq!(t.max_score, 9.0);
        assert_eq!(t.percentage, 88.89);
        assert_eq!(t.letter_grade, "B");
    }

    #[test]
    fn empty_breakdown_is_zero_percent() {
        let t = totals(&[]);
        assert_eq!(t.percentage, 0.0);
        assert_eq!(t.letter_grade, "F");
    }

    #[test]
    fn letter_grade_boundaries() {
        assert_eq!(letter_grade(90.0), "A");
        assert_eq!(letter_grade(89.99), "B");
        assert_eq!(letter_grade(80.0), "B");
        assert_eq!(letter_grade(70.0), "C");
        assert_eq!(letter_grade(60.0), "D");
        assert_eq!(letter_grade(59.99), "F");
    }
}
