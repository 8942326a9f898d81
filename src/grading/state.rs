use serde::Serialize;

use crate::stages::Stage;

/// Where a grading job is in the pipeline.
///
/// ```text
/// Accepted -> Cloning -> Testing -> Analyzing -> Evaluating -> Reporting -> Complete
///        \________________________________________________________________-> Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GradingState {
    Accepted,
    Cloning,
    Testing,
    Analyzing,
    Evaluating,
    Reporting,
    Complete,
    Failed,
}

/// Progress reported while evaluations resolve, from `Evaluating` up to this
const EVALUATION_CEILING: u8 = 85;

impl GradingState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, GradingState::Complete | GradingState::Failed)
    }

    /// Progress (0-100) reported on entering this state.
    pub fn progress(&self) -> u8 {
        match self {
            GradingState::Accepted => 5,
            GradingState::Cloning => 10,
            GradingState::Testing => 30,
            GradingState::Analyzing => 50,
            GradingState::Evaluating => 70,
            GradingState::Reporting => 90,
            GradingState::Complete => 100,
            // Failure does not move the counter
            GradingState::Failed => 0,
        }
    }

    /// The stage this state waits on.
    pub fn stage(&self) -> Stage {
        match self {
            GradingState::Accepted | GradingState::Complete | GradingState::Failed => {
                Stage::Accepted
            }
            GradingState::Cloning => Stage::Clone,
            GradingState::Testing => Stage::TestExecution,
            GradingState::Analyzing => Stage::CodeAnalysis,
            GradingState::Evaluating => Stage::GptEvaluation,
            GradingState::Reporting => Stage::ReportGeneration,
        }
    }

    /// The state after this one succeeds. Terminal states have none.
    pub fn next(&self) -> Option<GradingState> {
        match self {
            GradingState::Accepted => Some(GradingState::Cloning),
            GradingState::Cloning => Some(GradingState::Testing),
            GradingState::Testing => Some(GradingState::Analyzing),
            GradingState::Analyzing => Some(GradingState::Evaluating),
            GradingState::Evaluating => Some(GradingState::Reporting),
            GradingState::Reporting => Some(GradingState::Complete),
            GradingState::Complete | GradingState::Failed => None,
        }
    }

    /// Whether moving to `to` is a legal transition.
    pub fn can_transition_to(&self, to: GradingState) -> bool {
        match to {
            GradingState::Failed => !self.is_terminal(),
            _ => self.next() == Some(to),
        }
    }
}

impl std::fmt::Display for GradingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            GradingState::Accepted => "ACCEPTED",
            GradingState::Cloning => "CLONING",
            GradingState::Testing => "TESTING",
            GradingState::Analyzing => "ANALYZING",
            GradingState::Evaluating => "EVALUATING",
            GradingState::Reporting => "REPORTING",
            GradingState::Complete => "COMPLETE",
            GradingState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Progress while `done` of `total` evaluations have resolved: rises from the
/// `Evaluating` milestone toward 85.
pub fn evaluation_progress(done: usize, total: usize) -> u8 {
    let floor = GradingState::Evaluating.progress();
    if total == 0 {
        return EVALUATION_CEILING;
    }
    let span = usize::from(EVALUATION_CEILING - floor);
    floor + (span * done.min(total) / total) as u8
}
