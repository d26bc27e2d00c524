//! Text decomposition: the external LLM call and the parsing contract.
//!
//! The service returns a free-text completion with no schema guarantee, so
//! the parser tolerates missing numbering, extra whitespace, and blank
//! lines. Everything downstream works with the parsed, ordered step list.

use serde::{Deserialize, Serialize};
use task_splitter_sdk::{async_trait, Decomposer, EngineError, EngineResult};

const OPENAI_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";
const DEFAULT_MODEL: &str = "gpt-3.5-turbo";
const SYSTEM_PROMPT: &str = "Break down tasks into a short list of concise steps.";

/// Parse a completion into an ordered step list.
///
/// Split on newlines, strip a leading `<digits>.` prefix (with or without a
/// trailing space), trim, and drop blank lines.
pub fn parse_steps(completion: &str) -> Vec<String> {
    completion
        .lines()
        .map(strip_numbering)
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

fn strip_numbering(line: &str) -> &str {
    let trimmed = line.trim_start();
    let digits = trimmed.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 {
        return trimmed;
    }
    match trimmed[digits..].strip_prefix('.') {
        Some(rest) => rest,
        None => trimmed,
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: String,
}

/// OpenAI-backed implementation of the decomposition contract.
pub struct OpenAiDecomposer {
    client: reqwest::Client,
    api_key: Option<String>,
    model: String,
    url: String,
}

impl OpenAiDecomposer {
    /// Build from `OPENAI_API_KEY` / `OPENAI_MODEL`. A missing key is not a
    /// construction error; the first decompose call reports it as a service
    /// error, so the run fails with the same message the caller would see
    /// from a misconfigured deployment.
    pub fn from_env() -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: std::env::var("OPENAI_API_KEY").ok(),
            model: std::env::var("OPENAI_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string()),
            url: OPENAI_CHAT_URL.to_string(),
        }
    }

    pub fn new(api_key: String, model: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: Some(api_key),
            model,
            url: OPENAI_CHAT_URL.to_string(),
        }
    }

    /// Point the client at a different endpoint (for testing against a
    /// local stub server).
    pub fn with_url(mut self, url: String) -> Self {
        self.url = url;
        self
    }
}

#[async_trait]
impl Decomposer for OpenAiDecomposer {
    async fn decompose(&self, text: &str) -> EngineResult<Vec<String>> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| EngineError::Service("OPENAI_API_KEY not set".to_string()))?;

        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: format!("Task: {}", text),
                },
            ],
            temperature: 0.2,
        };

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| EngineError::Service(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(%status, "decomposition service returned an error");
            return Err(EngineError::Service(format!(
                "service returned {}: {}",
                status,
                body.chars().take(200).collect::<String>()
            )));
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| EngineError::Service(format!("malformed response body: {}", e)))?;

        let completion = body
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default();

        let steps = parse_steps(&completion);
        tracing::debug!(count = steps.len(), "parsed decomposition steps");
        Ok(steps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_numbered_list() {
        let steps = parse_steps("1. Buy milk\n2. Call plumber\n\n3.Pay rent");
        assert_eq!(steps, vec!["Buy milk", "Call plumber", "Pay rent"]);
    }

    #[test]
    fn parses_unnumbered_lines() {
        let steps = parse_steps("Buy milk\nCall plumber");
        assert_eq!(steps, vec!["Buy milk", "Call plumber"]);
    }

    #[test]
    fn drops_blank_and_whitespace_lines() {
        let steps = parse_steps("  \n1.   \n\n  trim me  \n");
        assert_eq!(steps, vec!["trim me"]);
    }

    #[test]
    fn empty_completion_yields_no_steps() {
        assert!(parse_steps("").is_empty());
        assert!(parse_steps("\n\n\n").is_empty());
    }

    #[test]
    fn keeps_digits_that_are_not_numbering() {
        // "3 eggs" has no dot after the digits, so nothing is stripped
        let steps = parse_steps("3 eggs\n10. ten");
        assert_eq!(steps, vec!["3 eggs", "ten"]);
    }

    #[test]
    fn numbering_without_space_is_stripped() {
        assert_eq!(parse_steps("12.mow lawn"), vec!["mow lawn"]);
    }
}
