use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Advisor, AdvisorError, AdvisorResult};

/// Connection details for an OpenAI-compatible chat endpoint.
#[derive(Clone, Debug)]
pub struct ChatSettings {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub timeout: Duration,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Post to `base_url` as given instead of appending `/chat/completions`.
    pub use_full_url: bool,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.deepseek.com/v1".to_string(),
            api_key: String::new(),
            model: "deepseek-chat".to_string(),
            timeout: Duration::from_secs(120),
            max_tokens: 2000,
            temperature: 0.5,
            use_full_url: false,
        }
    }
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Single-shot client for `/chat/completions`. Wrap it in
/// [`RetryingAdvisor`](crate::RetryingAdvisor) for retries.
pub struct ChatCompletionsAdvisor {
    settings: ChatSettings,
    http: Client,
}

impl ChatCompletionsAdvisor {
    pub fn new(settings: ChatSettings) -> AdvisorResult<Self> {
        if settings.api_key.trim().is_empty() {
            return Err(AdvisorError::Configuration("api key is empty".into()));
        }
        let http = Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|err| AdvisorError::Configuration(err.to_string()))?;
        Ok(Self { settings, http })
    }

    fn endpoint(&self) -> String {
        endpoint_for(&self.settings)
    }
}

fn endpoint_for(settings: &ChatSettings) -> String {
    if settings.use_full_url {
        settings.base_url.clone()
    } else {
        format!(
            "{}/chat/completions",
            settings.base_url.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl Advisor for ChatCompletionsAdvisor {
    fn model(&self) -> &str {
        &self.settings.model
    }

    async fn advise(&self, system_prompt: &str, user_prompt: &str) -> AdvisorResult<String> {
        let mut messages = Vec::with_capacity(2);
        if !system_prompt.is_empty() {
            messages.push(ChatMessage {
                role: "system",
                content: system_prompt,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: user_prompt,
        });
        let request = ChatRequest {
            model: &self.settings.model,
            messages,
            temperature: self.settings.temperature,
            max_tokens: self.settings.max_tokens,
        };
        let url = self.endpoint();
        debug!(url = %url, model = %self.settings.model, "calling chat completions");

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.settings.api_key)
            .json(&request)
            .send()
            .await
            .map_err(classify_transport)?;
        let status = response.status();
        let body = response.text().await.map_err(classify_transport)?;
        check_status(status, &body)?;
        extract_content(&body)
    }
}

fn check_status(status: StatusCode, body: &str) -> AdvisorResult<()> {
    if status.is_success() {
        return Ok(());
    }
    let body = body.to_string();
    if status.is_server_error() {
        Err(AdvisorError::Server {
            status: status.as_u16(),
            body,
        })
    } else {
        Err(AdvisorError::Client {
            status: status.as_u16(),
            body,
        })
    }
}

fn extract_content(body: &str) -> AdvisorResult<String> {
    let parsed: ChatResponse =
        serde_json::from_str(body).map_err(|err| AdvisorError::Parse(err.to_string()))?;
    parsed
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .filter(|content| !content.trim().is_empty())
        .ok_or(AdvisorError::EmptyResponse)
}

fn classify_transport(err: reqwest::Error) -> AdvisorError {
    let message = err.to_string();
    let lowered = message.to_lowercase();
    if err.is_timeout() {
        AdvisorError::Timeout
    } else if lowered.contains("reset") {
        AdvisorError::ConnectionReset(message)
    } else if err.is_connect() {
        AdvisorError::ConnectionRefused(message)
    } else if err.is_body() || err.is_decode() || lowered.contains("eof") {
        AdvisorError::EndOfStream(message)
    } else {
        AdvisorError::Configuration(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_appends_chat_path() {
        let settings = ChatSettings {
            base_url: "https://dashscope.aliyuncs.com/compatible-mode/v1/".into(),
            ..ChatSettings::default()
        };
        assert_eq!(
            endpoint_for(&settings),
            "https://dashscope.aliyuncs.com/compatible-mode/v1/chat/completions"
        );

        let full = ChatSettings {
            base_url: "https://proxy.local/custom".into(),
            use_full_url: true,
            ..ChatSettings::default()
        };
        assert_eq!(endpoint_for(&full), "https://proxy.local/custom");
    }

    #[test]
    fn extracts_first_choice() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"hold everything"}}]}"#;
        assert_eq!(extract_content(body).unwrap(), "hold everything");
    }

    #[test]
    fn empty_choices_are_an_error() {
        assert_eq!(
            extract_content(r#"{"choices":[]}"#).unwrap_err(),
            AdvisorError::EmptyResponse
        );
        assert!(matches!(
            extract_content("<html>").unwrap_err(),
            AdvisorError::Parse(_)
        ));
    }

    #[test]
    fn status_mapping() {
        assert!(check_status(StatusCode::OK, "").is_ok());
        assert!(check_status(StatusCode::BAD_GATEWAY, "")
            .unwrap_err()
            .is_transient());
        assert!(!check_status(StatusCode::UNAUTHORIZED, "invalid key")
            .unwrap_err()
            .is_transient());
    }

    #[test]
    fn empty_key_is_rejected() {
        assert!(matches!(
            ChatCompletionsAdvisor::new(ChatSettings::default()),
            Err(AdvisorError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn refused_connection_is_transient() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let advisor = ChatCompletionsAdvisor::new(ChatSettings {
            base_url: format!("http://{addr}"),
            api_key: "test-key".into(),
            timeout: Duration::from_secs(5),
            ..ChatSettings::default()
        })
        .unwrap();
        let err = advisor.advise("system", "user").await.unwrap_err();
        assert!(err.is_transient(), "unexpected error {err:?}");
    }
}
