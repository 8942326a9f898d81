//! Grading runs: the per-submission state machine and everything it needs
//! around the stage queues (rubrics, scoring, work directories, outcome
//! reporting).

pub mod collaborators;
pub mod orchestrator;
pub mod rubric;
pub mod scoring;
pub mod state;
pub mod workdir;

pub use collaborators::{
    DirectoryTestSuiteResolver, FileRubricProvider, GradeFailure, GradeReport, GradingOutcome,
    InMemoryRubricProvider, InMemoryTestSuites, LogResultSink, MemoryResultSink, ResultSink,
    RubricProvider, TestSuiteResolver,
};
pub use orchestrator::{GradingRequest, Orchestrator, CANCELLED_MESSAGE};
pub use rubric::{Criterion, EvaluationMethod, Rubric};
pub use state::GradingState;
pub use workdir::WorkDirectory;
