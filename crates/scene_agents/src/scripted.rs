//! Scripted generation capability for testing.
//!
//! Returns queued replies in order and records every request, so pipeline
//! tests can drive exact failure sequences without a provider.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{AgentError, AgentResult};
use crate::roles::AgentRole;
use crate::traits::{Generation, GenerationCapability, GenerationRequest};

/// One queued reply.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// Return this generation
    Respond(Generation),
    /// Fail with a provider error
    ProviderError(String),
    /// Fail as if the provider timed out
    Timeout,
}

impl ScriptedReply {
    pub fn text(artifact: impl Into<String>) -> Self {
        Self::Respond(Generation::new(artifact))
    }

    /// A fenced script reply.
    pub fn script(body: impl AsRef<str>) -> Self {
        Self::text(format!("```python\n{}\n```", body.as_ref()))
    }

    /// A critique verdict reply.
    pub fn verdict(rating: f64, should_refine: bool, feedback: &str) -> Self {
        Self::text(
            serde_json::json!({
                "rating": rating,
                "should_refine": should_refine,
                "feedback": feedback
            })
            .to_string(),
        )
    }
}

/// Generation capability that replays queued replies.
///
/// Once the queue is drained the last reply repeats.
#[derive(Clone)]
pub struct ScriptedAgent {
    role: AgentRole,
    name: String,
    replies: Arc<Mutex<VecDeque<ScriptedReply>>>,
    last: Arc<Mutex<Option<ScriptedReply>>>,
    requests: Arc<Mutex<Vec<GenerationRequest>>>,
    delay: Duration,
}

impl ScriptedAgent {
    pub fn new(role: AgentRole) -> Self {
        Self {
            role,
            name: format!("scripted-{}", role),
            replies: Arc::new(Mutex::new(VecDeque::new())),
            last: Arc::new(Mutex::new(None)),
            requests: Arc::new(Mutex::new(Vec::new())),
            delay: Duration::ZERO,
        }
    }

    /// Queue a reply.
    pub fn reply(self, reply: ScriptedReply) -> Self {
        self.replies.lock().push_back(reply);
        self
    }

    /// Sleep before answering each call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of calls made so far.
    pub fn call_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// All requests received so far.
    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().clone()
    }

    fn next_reply(&self) -> ScriptedReply {
        let next = self.replies.lock().pop_front();
        let mut last = self.last.lock();
        match next {
            Some(reply) => {
                *last = Some(reply.clone());
                reply
            }
            None => last
                .clone()
                .unwrap_or_else(|| ScriptedReply::ProviderError("no scripted reply".to_string())),
        }
    }
}

#[async_trait]
impl GenerationCapability for ScriptedAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, request: &GenerationRequest) -> AgentResult<Generation> {
        self.requests.lock().push(request.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match self.next_reply() {
            ScriptedReply::Respond(generation) => Ok(generation),
            ScriptedReply::ProviderError(message) => Err(AgentError::provider(self.role, message)),
            ScriptedReply::Timeout => Err(AgentError::Timeout(0)),
        }
    }
}
