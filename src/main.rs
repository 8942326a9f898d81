use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};

use autograder_pipeline::config::PipelineConfig;
use autograder_pipeline::grading::{GradingOutcome, GradingRequest, MemoryResultSink};
use autograder_pipeline::pipeline::Pipeline;
use autograder_pipeline::shutdown::install_shutdown_handler;
use autograder_pipeline::telemetry::init_tracing;

#[derive(Parser, Debug)]
#[command(name = "autograder-workers")]
#[command(version)]
#[command(about = "Grading pipeline workers: clone, test, analyze, evaluate and report submissions")]
#[command(propagate_version = true)]
struct Args {
    /// Config file layered over autograder.toml and the environment
    #[arg(long, short = 'c', global = true, env = "AUTOGRADER_CONFIG")]
    config: Option<PathBuf>,

    /// Default worker concurrency for every queue
    #[arg(long, global = true)]
    concurrency: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the queue workers until SIGINT/SIGTERM
    Run {
        /// Port for the queue dashboard (optional)
        #[arg(long)]
        dashboard_port: Option<u16>,
    },

    /// Grade one submission in-process and print the outcome
    Grade(GradeArgs),
}

#[derive(Parser, Debug)]
struct GradeArgs {
    #[arg(long)]
    submission_id: String,

    /// Git URL of the submission repository
    #[arg(long)]
    repo_url: String,

    #[arg(long)]
    rubric_id: String,

    /// Test suite id (repeatable)
    #[arg(long = "test-suite")]
    test_suites: Vec<String>,

    #[arg(long, default_value = "1")]
    attempt: u32,

    #[arg(long, default_value = "")]
    assignment_id: String,

    #[arg(long, default_value = "")]
    student_id: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

fn load_config(args: &Args) -> Result<PipelineConfig, Box<dyn std::error::Error>> {
    let mut config = PipelineConfig::load_from(args.config.as_deref())?;
    if let Some(concurrency) = args.concurrency {
        config = config.with_concurrency(concurrency);
    }
    Ok(config)
}

async fn run_workers(
    config: PipelineConfig,
    dashboard_port: Option<u16>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut builder = Pipeline::builder(config);
    if let Some(port) = dashboard_port {
        let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;
        builder = builder.dashboard(addr);
    }
    let pipeline = builder.build().await?;

    let shutdown = install_shutdown_handler();
    let workers = pipeline.start(shutdown.clone());

    shutdown.cancelled().await;
    workers.join().await;
    Ok(())
}

async fn grade_once(
    config: PipelineConfig,
    args: GradeArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let sink = Arc::new(MemoryResultSink::new());
    let pipeline = Pipeline::builder(config).sink(sink.clone()).build().await?;

    let shutdown = install_shutdown_handler();
    let workers = pipeline.start(shutdown.clone());

    let request = GradingRequest {
        submission_id: args.submission_id,
        assignment_id: args.assignment_id,
        student_id: args.student_id,
        github_repo_url: args.repo_url,
        rubric_id: args.rubric_id,
        test_suite_ids: args.test_suites,
        attempt_number: args.attempt,
    };
    let handle = pipeline.submit(&request).await?;
    tracing::info!(grading_job_id = %handle.id(), "Waiting for grading outcome");

    let outcome = tokio::select! {
        outcomes = sink.wait_for(1) => outcomes.into_iter().next(),
        _ = shutdown.cancelled() => None,
    };
    workers.shutdown().await;

    let Some(outcome) = outcome else {
        eprintln!("Error: interrupted before grading finished");
        std::process::exit(130);
    };

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&outcome)?),
        OutputFormat::Table => print_outcome(&outcome),
    }
    if matches!(outcome, GradingOutcome::Failed(_)) {
        std::process::exit(1);
    }
    Ok(())
}

fn print_outcome(outcome: &GradingOutcome) {
    match outcome {
        GradingOutcome::Completed(report) => {
            println!("{:<16} {}", "SUBMISSION", report.submission_id);
            println!("{:<16} COMPLETE", "STATUS");
            println!(
                "{:<16} {:.2} / {:.2} ({:.2}%)",
                "SCORE", report.total_score, report.max_score, report.percentage
            );
            println!("{:<16} {}", "GRADE", report.letter_grade);
            println!("{:<16} {}", "BUILD", if report.build_success { "ok" } else { "failed" });
            println!("{:<16} {}", "REPORT", report.report_reference);
        }
        GradingOutcome::Failed(failure) => {
            println!("{:<16} {}", "SUBMISSION", failure.submission_id);
            println!("{:<16} FAILED", "STATUS");
            println!("{:<16} {}", "STAGE", failure.failed_stage);
            println!("{:<16} {}", "ERROR", failure.error_message);
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    let args = Args::parse();
    let config = load_config(&args)?;
    init_tracing(&config.log);

    match args.command {
        Commands::Run { dashboard_port } => run_workers(config, dashboard_port).await,
        Commands::Grade(grade) => grade_once(config, grade).await,
    }
}
