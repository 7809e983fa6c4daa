use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::{CompletionRequest, ExplainError, ReasoningService};

/// OpenAI-compatible chat completions client.
pub struct OpenAiService {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ReplyMessage,
}

#[derive(Deserialize)]
struct ReplyMessage {
    content: Option<String>,
}

impl OpenAiService {
    pub fn new(base_url: &str, model: &str, api_key: Option<String>) -> Result<Self, ExplainError> {
        let client = Client::builder()
            .user_agent(concat!("flowwatch/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key,
        })
    }

    fn url(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url)
    }
}

#[async_trait]
impl ReasoningService for OpenAiService {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, ExplainError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| ExplainError::NotConfigured("API key not found".to_string()))?;

        let body = ChatRequest {
            model: &self.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: &request.system,
                },
                ChatMessage {
                    role: "user",
                    content: &request.prompt,
                },
            ],
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let request_id = Uuid::new_v4();
        let url = self.url();
        debug!(%url, %request_id, model = %self.model, "chat completion request");

        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .header("X-Request-Id", request_id.to_string())
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExplainError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let text = response.text().await?;
        parse_reply(&text)
    }
}

/// Pull the first choice's message content out of a completions response body.
fn parse_reply(body: &str) -> Result<String, ExplainError> {
    let resp: ChatResponse =
        serde_json::from_str(body).map_err(|e| ExplainError::Parse(e.to_string()))?;
    resp.choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ExplainError::Parse("missing choices[0].message.content".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reply() {
        let body = r#"{"id":"x","choices":[{"index":0,"message":{"role":"assistant","content":"  Port scan burst.\n"}}]}"#;
        assert_eq!(parse_reply(body).unwrap(), "Port scan burst.");
    }

    #[test]
    fn test_parse_reply_rejects_missing_content() {
        assert!(matches!(
            parse_reply(r#"{"choices":[]}"#),
            Err(ExplainError::Parse(_))
        ));
        assert!(matches!(
            parse_reply(r#"{"choices":[{"message":{"content":null}}]}"#),
            Err(ExplainError::Parse(_))
        ));
        assert!(matches!(parse_reply("<html>"), Err(ExplainError::Parse(_))));
    }

    #[test]
    fn test_request_body_shape() {
        let body = ChatRequest {
            model: "gpt-4",
            messages: [
                ChatMessage {
                    role: "system",
                    content: "sys",
                },
                ChatMessage {
                    role: "user",
                    content: "hi",
                },
            ],
            temperature: 0.5,
            max_tokens: 300,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["messages"][1]["role"], "user");
        assert_eq!(json["max_tokens"], 300);
    }

    #[tokio::test]
    async fn test_missing_key_is_not_configured() {
        let svc = OpenAiService::new("http://127.0.0.1:9", "gpt-4", None).unwrap();
        let req = CompletionRequest {
            system: "s".to_string(),
            prompt: "p".to_string(),
            temperature: 0.5,
            max_tokens: 10,
        };
        assert!(matches!(
            svc.complete(&req).await,
            Err(ExplainError::NotConfigured(_))
        ));
    }

    #[test]
    fn test_base_url_trailing_slash() {
        let svc = OpenAiService::new("https://api.example.com/", "m", None).unwrap();
        assert_eq!(svc.url(), "https://api.example.com/v1/chat/completions");
    }
}
