use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::request::MetadataRequest;
use crate::result::{AiError, GeneratedMetadata};

/// AI text-generation provider.
///
/// No latency bound is guaranteed; callers race it against their own deadline.
#[async_trait]
pub trait TextGenerator: Send + Sync + 'static {
    async fn generate(&self, request: &MetadataRequest) -> Result<GeneratedMetadata, AiError>;
}

#[derive(Debug, Clone)]
struct ScriptedReply {
    delay: Duration,
    outcome: Result<GeneratedMetadata, AiError>,
}

/// In-memory generator for tests/dev.
///
/// Replies are consumed from a script in order; once the script is empty the
/// generator answers with a title derived from the request after `default_delay`.
#[derive(Debug, Default)]
pub struct InMemoryTextGenerator {
    script: Mutex<VecDeque<ScriptedReply>>,
    default_delay: Duration,
    calls: AtomicUsize,
}

impl InMemoryTextGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.default_delay = delay;
        self
    }

    pub fn push_reply(&self, delay: Duration, metadata: GeneratedMetadata) {
        self.push(ScriptedReply {
            delay,
            outcome: Ok(metadata),
        });
    }

    pub fn push_failure(&self, delay: Duration, message: impl Into<String>) {
        self.push(ScriptedReply {
            delay,
            outcome: Err(AiError::InferenceFailed(message.into())),
        });
    }

    /// Number of `generate` calls received so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn push(&self, reply: ScriptedReply) {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(reply);
    }

    fn next_reply(&self, request: &MetadataRequest) -> ScriptedReply {
        let scripted = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();

        scripted.unwrap_or_else(|| ScriptedReply {
            delay: self.default_delay,
            outcome: Ok(echo_metadata(request)),
        })
    }
}

fn echo_metadata(request: &MetadataRequest) -> GeneratedMetadata {
    let headline: String = request
        .prompt
        .split_whitespace()
        .take(6)
        .collect::<Vec<_>>()
        .join(" ");
    GeneratedMetadata::new(
        format!("{}: {}", request.template_name, headline),
        format!("Generated from the {} template: {}", request.template_name, request.prompt),
    )
}

#[async_trait]
impl TextGenerator for InMemoryTextGenerator {
    async fn generate(&self, request: &MetadataRequest) -> Result<GeneratedMetadata, AiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let reply = self.next_reply(request);
        if !reply.delay.is_zero() {
            tokio::time::sleep(reply.delay).await;
        }
        reply.outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn scripted_replies_are_consumed_in_order() {
        let generator = InMemoryTextGenerator::new();
        generator.push_failure(Duration::from_secs(1), "model overloaded");
        generator.push_reply(Duration::ZERO, GeneratedMetadata::new("Second", "reply"));

        let request = MetadataRequest::new("promo", "summer sale banner", "en");
        assert!(generator.generate(&request).await.is_err());
        assert_eq!(generator.generate(&request).await.unwrap().title, "Second");

        let echoed = generator.generate(&request).await.unwrap();
        assert_eq!(echoed.title, "promo: summer sale banner");
        assert_eq!(generator.calls(), 3);
    }
}
