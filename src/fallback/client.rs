use crate::error::{ReflectaError, Result};
use crate::session::model::ContentItem;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// One answered question, oldest first in a history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QaPair {
    pub question: String,
    pub answer: String,
}

impl QaPair {
    pub fn new(question: &str, answer: &str) -> Self {
        Self {
            question: question.to_string(),
            answer: answer.to_string(),
        }
    }
}

/// Stateless question generation, one request per call.
///
/// Implementations keep nothing between calls; the whole context travels in
/// the arguments.
#[async_trait]
pub trait QuestionGenerator: Send + Sync {
    async fn generate_first_question(&self, content: &ContentItem) -> Result<String>;

    async fn generate_follow_up(&self, content: &ContentItem, history: &[QaPair])
    -> Result<String>;

    /// Get the name of this generator, for logs.
    fn name(&self) -> &str;
}

#[derive(Default)]
struct MockGeneratorState {
    responses: VecDeque<String>,
    first_calls: usize,
    follow_up_calls: usize,
    last_history: Vec<QaPair>,
}

/// Mock question generator for testing.
///
/// Returns queued responses in order, then a numbered placeholder.
#[derive(Clone)]
pub struct MockQuestionGenerator {
    state: Arc<Mutex<MockGeneratorState>>,
    should_fail: bool,
    error_message: String,
}

impl MockQuestionGenerator {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockGeneratorState::default())),
            should_fail: false,
            error_message: "mock question service unavailable".to_string(),
        }
    }

    /// Queue responses returned by successive calls.
    pub fn with_responses(self, responses: &[&str]) -> Self {
        self.state()
            .responses
            .extend(responses.iter().map(|r| r.to_string()));
        self
    }

    /// Configure the mock to fail every call
    pub fn with_failure(mut self) -> Self {
        self.should_fail = true;
        self
    }

    fn state(&self) -> MutexGuard<'_, MockGeneratorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn first_question_calls(&self) -> usize {
        self.state().first_calls
    }

    pub fn follow_up_calls(&self) -> usize {
        self.state().follow_up_calls
    }

    /// History passed to the most recent follow-up request.
    pub fn last_history(&self) -> Vec<QaPair> {
        self.state().last_history.clone()
    }

    fn respond(&self, state: &mut MockGeneratorState) -> Result<String> {
        if self.should_fail {
            return Err(ReflectaError::FallbackRequest {
                message: self.error_message.clone(),
            });
        }
        let call = state.first_calls + state.follow_up_calls;
        Ok(state
            .responses
            .pop_front()
            .unwrap_or_else(|| format!("mock question {}", call)))
    }
}

impl Default for MockQuestionGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QuestionGenerator for MockQuestionGenerator {
    async fn generate_first_question(&self, _content: &ContentItem) -> Result<String> {
        let mut state = self.state();
        state.first_calls += 1;
        self.respond(&mut state)
    }

    async fn generate_follow_up(
        &self,
        _content: &ContentItem,
        history: &[QaPair],
    ) -> Result<String> {
        let mut state = self.state();
        state.follow_up_calls += 1;
        state.last_history = history.to_vec();
        self.respond(&mut state)
    }

    fn name(&self) -> &str {
        "mock"
    }
}
