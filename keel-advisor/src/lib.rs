//! Advisory calls to a language model.
//!
//! [`Advisor`] is the seam the trading loop talks to. [`RetryingAdvisor`]
//! wraps any advisor with bounded retries for transient failures, and
//! [`ChatCompletionsAdvisor`] speaks the OpenAI-compatible chat API used by
//! DeepSeek and Qwen.

mod chat;
mod parse;
mod retry;

use async_trait::async_trait;
use thiserror::Error;

pub use chat::{ChatCompletionsAdvisor, ChatSettings};
pub use parse::{parse_decisions, AdvisorReply};
pub use retry::{RetryPolicy, RetryingAdvisor};

/// Convenience alias for advisor results.
pub type AdvisorResult<T> = Result<T, AdvisorError>;

/// Failures surfaced by an advisory call.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum AdvisorError {
    #[error("request timed out")]
    Timeout,
    #[error("connection reset: {0}")]
    ConnectionReset(String),
    #[error("connection refused: {0}")]
    ConnectionRefused(String),
    /// The response body ended before it was complete.
    #[error("unexpected end of stream: {0}")]
    EndOfStream(String),
    #[error("server error (status {status}): {body}")]
    Server { status: u16, body: String },
    #[error("request rejected (status {status}): {body}")]
    Client { status: u16, body: String },
    #[error("model returned an empty response")]
    EmptyResponse,
    #[error("failed to parse model output: {0}")]
    Parse(String),
    #[error("advisor misconfigured: {0}")]
    Configuration(String),
    #[error("advisor failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: Box<AdvisorError> },
}

impl AdvisorError {
    /// Whether retrying the same request may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout
            | Self::ConnectionReset(_)
            | Self::ConnectionRefused(_)
            | Self::EndOfStream(_) => true,
            Self::Server { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Something that turns a pair of prompts into model text.
#[async_trait]
pub trait Advisor: Send + Sync {
    /// Model identifier used in logs and journal records.
    fn model(&self) -> &str;

    async fn advise(&self, system_prompt: &str, user_prompt: &str) -> AdvisorResult<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(AdvisorError::Timeout.is_transient());
        assert!(AdvisorError::ConnectionReset("peer".into()).is_transient());
        assert!(AdvisorError::ConnectionRefused("port".into()).is_transient());
        assert!(AdvisorError::EndOfStream("EOF".into()).is_transient());
        assert!(AdvisorError::Server {
            status: 503,
            body: String::new()
        }
        .is_transient());

        assert!(!AdvisorError::Client {
            status: 401,
            body: "bad key".into()
        }
        .is_transient());
        assert!(!AdvisorError::Parse("no array".into()).is_transient());
        assert!(!AdvisorError::EmptyResponse.is_transient());
    }
}
