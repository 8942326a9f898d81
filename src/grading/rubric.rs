use serde::{Deserialize, Serialize};

/// How a criterion is scored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationMethod {
    #[serde(alias = "UNIT_TEST")]
    UnitTest,
    #[serde(alias = "GPT_SEMANTIC")]
    GptSemantic,
    #[serde(alias = "HYBRID")]
    Hybrid,
}

impl EvaluationMethod {
    /// Whether the criterion needs an LLM evaluation job.
    pub fn needs_semantic_evaluation(&self) -> bool {
        matches!(self, EvaluationMethod::GptSemantic | EvaluationMethod::Hybrid)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Criterion {
    pub id: String,
    pub title: String,
    pub max_points: f64,
    pub evaluation_method: EvaluationMethod,
    #[serde(default)]
    pub unit_test_weight: f64,
    #[serde(default)]
    pub gpt_weight: f64,
    #[serde(default)]
    pub gpt_instructions: Option<String>,
    #[serde(default)]
    pub files_to_analyze: Vec<String>,
    #[serde(default)]
    pub order: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rubric {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub total_points: f64,
    pub criteria: Vec<Criterion>,
}

impl Rubric {
    /// Criteria in presentation order.
    pub fn ordered_criteria(&self) -> Vec<&Criterion> {
        let mut criteria: Vec<&Criterion> = self.criteria.iter().collect();
        criteria.sort_by_key(|c| c.order);
        criteria
    }

    /// Criteria that fan out to GPT evaluation, in presentation order.
    pub fn semantic_criteria(&self) -> Vec<&Criterion> {
        self.ordered_criteria()
            .into_iter()
            .filter(|c| c.evaluation_method.needs_semantic_evaluation())
            .collect()
    }
}
