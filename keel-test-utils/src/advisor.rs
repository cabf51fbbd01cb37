use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use keel_advisor::{Advisor, AdvisorError, AdvisorResult};

/// Prompts captured from one advisory call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedPrompt {
    pub system: String,
    pub user: String,
}

#[derive(Default)]
struct Script {
    replies: VecDeque<AdvisorResult<String>>,
    prompts: Vec<RecordedPrompt>,
    delay: Option<Duration>,
}

/// [`Advisor`] that replays queued replies and records every prompt pair.
///
/// Once the queue runs dry each call answers with an empty decision list.
#[derive(Clone, Default)]
pub struct ScriptedAdvisor {
    script: Arc<Mutex<Script>>,
}

impl ScriptedAdvisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(self, text: impl Into<String>) -> Self {
        self.push(Ok(text.into()));
        self
    }

    pub fn fail(self, err: AdvisorError) -> Self {
        self.push(Err(err));
        self
    }

    /// Hold every reply for `delay` before answering.
    pub fn with_delay(self, delay: Duration) -> Self {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .delay = Some(delay);
        self
    }

    pub fn push(&self, reply: AdvisorResult<String>) {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replies
            .push_back(reply);
    }

    pub fn prompts(&self) -> Vec<RecordedPrompt> {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .prompts
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.prompts().len()
    }
}

#[async_trait]
impl Advisor for ScriptedAdvisor {
    fn model(&self) -> &str {
        "scripted"
    }

    async fn advise(&self, system_prompt: &str, user_prompt: &str) -> AdvisorResult<String> {
        let (reply, delay) = {
            let mut script = self.script.lock().unwrap_or_else(PoisonError::into_inner);
            script.prompts.push(RecordedPrompt {
                system: system_prompt.to_string(),
                user: user_prompt.to_string(),
            });
            let reply = script
                .replies
                .pop_front()
                .unwrap_or_else(|| Ok("[]".to_string()));
            (reply, script.delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        reply
    }
}
