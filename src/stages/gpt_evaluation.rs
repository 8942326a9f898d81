use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::LlmConfig;
use crate::error::{PipelineError, Result, StageError};
use crate::queue::JobContext;
use crate::stages::jobs::{GptEvaluationJob, GptEvaluationResult};
use crate::stages::StageHandler;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(90);
const MAX_CONTEXT_CHARS: usize = 12_000;

const SYSTEM_PROMPT: &str = "You are a strict but fair teaching assistant grading a student's \
software project against one rubric criterion. Reply with a single JSON object of the form \
{\"score\": <number>, \"justification\": \"<two to four sentences>\"} and nothing else.";

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Verdict {
    score: f64,
    #[serde(default)]
    justification: String,
}

/// Scores one rubric criterion with an OpenAI-compatible chat completion API.
#[derive(Debug, Clone)]
pub struct OpenAiEvaluator {
    client: Client,
    model: String,
    api_key: Option<String>,
    base_url: String,
}

impl OpenAiEvaluator {
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| PipelineError::Collaborator(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            model: config.model.clone(),
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn complete(&self, api_key: &str, prompt: String) -> std::result::Result<String, StageError> {
        let request = ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            temperature: 0.2,
        };

        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&request)
            .send()
            .await
            .map_err(map_http_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(classify_status(status.as_u16(), &body));
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| StageError::transient(format!("failed to parse completion: {}", e)))?;

        completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| StageError::transient("completion had no content"))
    }
}

/// The user prompt for one criterion.
pub fn build_prompt(job: &GptEvaluationJob) -> String {
    let mut context = job.context.clone();
    if context.len() > MAX_CONTEXT_CHARS {
        let mut cut = MAX_CONTEXT_CHARS;
        while !context.is_char_boundary(cut) {
            cut -= 1;
        }
        context.truncate(cut);
        context.push_str("\n[context truncated]");
    }

    let instructions = job
        .instructions
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or("Judge how well the submission satisfies the criterion.");

    format!(
        "Criterion: {title} (id {id})\nMaximum points: {max}\n\nInstructions:\n{instructions}\n\n\
         Submission context:\n{context}\n\nScore from 0 to {max}.",
        title = job.criterion_title,
        id = job.criterion_id,
        max = job.max_points,
        instructions = instructions,
        context = context,
    )
}

/// Pull the score out of a model reply, tolerating code fences and prose
/// around the JSON object. The score is clamped to `[0, max_points]`.
pub fn parse_verdict(reply: &str, max_points: f64) -> std::result::Result<(f64, String), StageError> {
    let start = reply.find('{');
    let end = reply.rfind('}');
    let (Some(start), Some(end)) = (start, end) else {
        return Err(StageError::transient("model reply contained no JSON object"));
    };
    if end < start {
        return Err(StageError::transient("model reply contained no JSON object"));
    }

    let verdict: Verdict = serde_json::from_str(&reply[start..=end])
        .map_err(|e| StageError::transient(format!("malformed model verdict: {}", e)))?;
    if !verdict.score.is_finite() {
        return Err(StageError::transient("model returned a non-numeric score"));
    }

    Ok((verdict.score.clamp(0.0, max_points.max(0.0)), verdict.justification))
}

fn map_http_error(error: reqwest::Error) -> StageError {
    if error.is_timeout() {
        StageError::transient(format!("LLM request timeout: {}", error))
    } else if error.is_connect() {
        StageError::transient(format!("LLM connection error: {}", error))
    } else if let Some(status) = error.status() {
        classify_status(status.as_u16(), &error.to_string())
    } else {
        StageError::transient(format!("LLM HTTP error: {}", error))
    }
}

fn classify_status(status: u16, body: &str) -> StageError {
    match status {
        401 | 403 => StageError::permanent(format!("LLM authentication failed: {}", body)),
        404 => StageError::permanent(format!("LLM model not found: {}", body)),
        400 => StageError::permanent(format!("LLM rejected request: {}", body)),
        429 => StageError::transient(format!("LLM rate limit exceeded: {}", body)),
        _ => StageError::transient(format!("LLM request failed with status {}: {}", status, body)),
    }
}

#[async_trait]
impl StageHandler<GptEvaluationJob, GptEvaluationResult> for OpenAiEvaluator {
    async fn handle(
        &self,
        job: GptEvaluationJob,
        ctx: &JobContext,
    ) -> std::result::Result<GptEvaluationResult, StageError> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(StageError::permanent("no LLM API key configured"));
        };
        tracing::info!(
            submission_id = %job.submission_id,
            criterion_id = %job.criterion_id,
            model = %self.model,
            "Evaluating criterion"
        );

        let reply = self.complete(api_key, build_prompt(&job)).await?;
        ctx.progress(80).await;
        let (score, justification) = parse_verdict(&reply, job.max_points)?;

        tracing::debug!(criterion_id = %job.criterion_id, score, "Criterion evaluated");
        Ok(GptEvaluationResult {
            success: true,
            criterion_id: job.criterion_id,
            score,
            justification,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn job() -> GptEvaluationJob {
        GptEvaluationJob {
            submission_id: "s1".into(),
            criterion_id: "c1".into(),
            criterion_title: "Code quality".into(),
            max_points: 10.0,
            instructions: Some("Look at naming.".into()),
            context: "Tests: 3/4 passed".into(),
            work_dir: PathBuf::from("/tmp/w"),
        }
    }

    #[test]
    fn verdict_in_code_fence_is_parsed() {
        let reply = "```json\n{\"score\": 7.5, \"justification\": \"Clear names.\"}\n```";
        let (score, why) = parse_verdict(reply, 10.0).unwrap();
        assert_eq!(score, 7.5);
        assert_eq!(why, "Clear names.");
    }

    #[test]
    fn verdict_score_is_clamped() {
        let (score, _) = parse_verdict(r#"{"score": 42}"#, 10.0).unwrap();
        assert_eq!(score, 10.0);
        let (score, _) = parse_verdict(r#"{"score": -3}"#, 10.0).unwrap();
        assert_eq!(score, 0.0);
    }

    #[test]
    fn reply_without_json_is_retryable() {
        assert!(parse_verdict("I cannot grade this.", 10.0).unwrap_err().is_retryable());
    }

    #[test]
    fn http_status_classification() {
        assert!(!classify_status(401, "").is_retryable());
        assert!(!classify_status(404, "").is_retryable());
        assert!(classify_status(429, "").is_retryable());
        assert!(classify_status(503, "").is_retryable());
    }

    #[test]
    fn prompt_contains_criterion_and_context() {
        let prompt = build_prompt(&job());
        assert!(prompt.contains("Code quality"));
        assert!(prompt.contains("Look at naming."));
        assert!(prompt.contains("Tests: 3/4 passed"));
        assert!(prompt.contains("Score from 0 to 10"));
    }

    #[test]
    fn long_context_is_truncated() {
        let mut long = job();
        long.context = "é".repeat(MAX_CONTEXT_CHARS);
        let prompt = build_prompt(&long);
        assert!(prompt.contains("[context truncated]"));
    }

    #[tokio::test]
    async fn missing_api_key_is_permanent() {
        let evaluator = OpenAiEvaluator::from_config(&LlmConfig {
            api_key: None,
            ..LlmConfig::default()
        })
        .unwrap();
        let err = evaluator
            .handle(job(), &JobContext::standalone(crate::queue::QueueName::GptEvaluation))
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::Permanent(_)));
    }
}
