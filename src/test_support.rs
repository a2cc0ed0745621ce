//! Doubles for tests and embedders.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::invoker::{InvokeError, InvokeRequest, ToolInvoker};

/// Scripted invoker: responses are queued per action name and consumed in
/// order; every request is recorded for assertions.
#[derive(Default)]
pub struct MockInvoker {
    responses: Mutex<HashMap<String, VecDeque<Result<Value, InvokeError>>>>,
    calls: Mutex<Vec<InvokeRequest>>,
}

impl MockInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for the next invocation of `action`.
    pub fn push_response(&self, action: &str, response: Result<Value, InvokeError>) {
        let mut responses = self.responses.lock().unwrap_or_else(|e| e.into_inner());
        responses
            .entry(action.to_string())
            .or_default()
            .push_back(response);
    }

    pub fn push_ok(&self, action: &str, value: Value) {
        self.push_response(action, Ok(value));
    }

    pub fn push_retriable(&self, action: &str, message: &str) {
        self.push_response(action, Err(InvokeError::retriable(message)));
    }

    pub fn push_fatal(&self, action: &str, message: &str) {
        self.push_response(action, Err(InvokeError::fatal(message)));
    }

    /// Every request seen so far, in call order.
    pub fn calls(&self) -> Vec<InvokeRequest> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn calls_for(&self, action: &str) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|c| c.action == action)
            .count()
    }
}

#[async_trait]
impl ToolInvoker for MockInvoker {
    async fn invoke(&self, request: InvokeRequest) -> Result<Value, InvokeError> {
        {
            let mut calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
            calls.push(request.clone());
        }
        let mut responses = self.responses.lock().unwrap_or_else(|e| e.into_inner());
        match responses.get_mut(&request.action).and_then(VecDeque::pop_front) {
            Some(response) => response,
            None => Err(InvokeError::fatal(format!(
                "no scripted response for action '{}'",
                request.action
            ))),
        }
    }
}
