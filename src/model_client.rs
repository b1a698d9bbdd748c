//! Clients for the two hosted LLM endpoints the pipeline treats as remote
//! functions: a relevance-scoring model and a summary-writing model.
//!
//! Grounded on `original_source/services/content_validator/ranker.py`
//! (`Ranker.rank`, a chat-completion prompt that must answer with a bare
//! integer 0-100) and `original_source/services/writer/ai_writer.py`
//! (`Writer.write`, a chat-completion prompt parsed into the `News`
//! pydantic model via a LangChain `PydanticOutputParser`, catching
//! `OutputParserException`). Both originals hit the same Together AI
//! chat-completions endpoint; this module keeps that one HTTP shape and
//! gives each stage its own trait so the model boundary stays mockable in
//! tests (spec.md §4.2/§4.3 treat the model as an external collaborator).

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};

#[async_trait]
pub trait ScoringModel: Send + Sync {
    /// Returns a relevance rank in `0..=100` for `post_text` against a
    /// user's `preferences` and `antipathies` free-text descriptions
    /// (spec.md §4.2 step 3).
    async fn rank(&self, preferences: &str, antipathies: &str, post_text: &str) -> PipelineResult<i32>;
}

#[async_trait]
pub trait WritingModel: Send + Sync {
    /// Produces a personalized summary of `post_text` for a user whose
    /// stated `preferences` should shape the framing (spec.md §4.3: "Call
    /// the writing model with (title, preferences, content)").
    async fn write(&self, preferences: &str, post_text: &str) -> PipelineResult<String>;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

/// A chat-completions-compatible HTTP client shared by both stages; each
/// stage wraps it in its own trait impl with its own prompt.
pub struct ChatModelClient {
    client: Client,
    api_key: String,
    endpoint: String,
    model_name: String,
}

impl ChatModelClient {
    pub fn new(client: Client, api_key: String, endpoint: String, model_name: String) -> Self {
        Self {
            client,
            api_key,
            endpoint,
            model_name,
        }
    }

    async fn complete(&self, system_prompt: String, user_prompt: String) -> PipelineResult<String> {
        let request = ChatRequest {
            model: &self.model_name,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: user_prompt,
                },
            ],
            temperature: 0.0,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| PipelineError::TransientFetch(anyhow::anyhow!(e)))?
            .error_for_status()
            .map_err(|e| PipelineError::TransientFetch(anyhow::anyhow!(e)))?
            .json::<ChatResponse>()
            .await
            .map_err(|e| PipelineError::ModelOutput(format!("unparseable chat response: {e}")))?;

        response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| PipelineError::ModelOutput("empty choices array".into()))
    }
}

#[async_trait]
impl ScoringModel for ChatModelClient {
    async fn rank(&self, preferences: &str, antipathies: &str, post_text: &str) -> PipelineResult<i32> {
        let system = "You are a relevance ranking assistant. Given a reader's stated \
            preferences and antipathies and a news post, respond with a single integer \
            from 0 to 100, and nothing else, expressing how relevant the post is to the \
            reader."
            .to_string();
        let user = format!("Preferences: {preferences}\nAntipathies: {antipathies}\n\nPost:\n{post_text}");

        let raw = self.complete(system, user).await?;
        raw.trim()
            .parse::<i32>()
            .map_err(|_| PipelineError::ModelOutput(format!("non-integer rank: {raw:?}")))
    }
}

#[derive(Deserialize)]
struct NewsOutput {
    content: String,
}

#[async_trait]
impl WritingModel for ChatModelClient {
    async fn write(&self, preferences: &str, post_text: &str) -> PipelineResult<String> {
        let system = "You are a news summarization assistant. Write a short, personalized \
            summary of the given post for a reader with the stated preferences. Respond with \
            a JSON object of the exact shape {\"content\": \"<summary text>\"} and nothing else."
            .to_string();
        let user = format!("Preferences: {preferences}\n\nPost:\n{post_text}");

        let raw = self.complete(system, user).await?;
        let parsed: NewsOutput = serde_json::from_str(raw.trim())
            .map_err(|e| PipelineError::ModelOutput(format!("unparseable writer output: {e}")))?;
        Ok(parsed.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn test_client(server: &MockServer) -> ChatModelClient {
        ChatModelClient::new(
            Client::new(),
            "test-key".into(),
            server.url("/v1/chat/completions"),
            "test-model".into(),
        )
    }

    #[tokio::test]
    async fn rank_parses_bare_integer_response() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200).json_body(serde_json::json!({
                "choices": [{"message": {"content": "87"}}]
            }));
        });

        let model = test_client(&server);
        let rank = model.rank("rust and databases", "politics", "A post about rust").await.unwrap();
        assert_eq!(rank, 87);
        mock.assert();
    }

    #[tokio::test]
    async fn rank_rejects_non_integer_content_as_model_output_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200).json_body(serde_json::json!({
                "choices": [{"message": {"content": "very relevant"}}]
            }));
        });

        let model = test_client(&server);
        let err = model.rank("x", "y", "z").await.unwrap_err();
        assert!(matches!(err, PipelineError::ModelOutput(_)));
    }

    #[tokio::test]
    async fn write_parses_content_json_envelope() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200).json_body(serde_json::json!({
                "choices": [{"message": {"content": "{\"content\": \"Summary text.\"}"}}]
            }));
        });

        let model = test_client(&server);
        let news = model.write("prefs", "post body").await.unwrap();
        assert_eq!(news, "Summary text.");
    }

    #[tokio::test]
    async fn write_rejects_malformed_json_as_model_output_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200).json_body(serde_json::json!({
                "choices": [{"message": {"content": "not json"}}]
            }));
        });

        let model = test_client(&server);
        let err = model.write("prefs", "post body").await.unwrap_err();
        assert!(matches!(err, PipelineError::ModelOutput(_)));
    }
}
