//! Scripted remote executor for testing adapters without real hosts.
//!
//! Responses are matched against [`RemoteRequest::describe`] by substring.
//! One-shot rules are consumed in the order they were added and take
//! precedence over standing rules; among standing rules the most recently
//! added match wins. Unmatched requests succeed with empty output (exit 0,
//! or HTTP 200 for REST calls).

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::executor::{RemoteExecutor, RemoteOutput, RemoteRequest, RemoteTarget};
use crate::error::{ControlError, Result};

struct Rule {
    pattern: String,
    response: Result<RemoteOutput>,
    once: bool,
}

/// Executor that replays canned responses and records every request.
#[derive(Default)]
pub struct ScriptedExecutor {
    rules: Mutex<Vec<Rule>>,
    requests: Mutex<Vec<(String, RemoteRequest)>>,
    delay: Mutex<Option<Duration>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, pattern: &str, response: Result<RemoteOutput>, once: bool) {
        let mut rules = self.rules.lock().unwrap_or_else(|e| e.into_inner());
        rules.push(Rule {
            pattern: pattern.to_string(),
            response,
            once,
        });
    }

    /// Answer every matching request with `output`.
    pub fn respond(&self, pattern: &str, output: RemoteOutput) {
        self.push(pattern, Ok(output), false);
    }

    /// Answer the next matching request with `output`.
    pub fn respond_once(&self, pattern: &str, output: RemoteOutput) {
        self.push(pattern, Ok(output), true);
    }

    /// Fail every matching request with `error`.
    pub fn fail(&self, pattern: &str, error: ControlError) {
        self.push(pattern, Err(error), false);
    }

    /// Fail the next matching request with `error`.
    pub fn fail_once(&self, pattern: &str, error: ControlError) {
        self.push(pattern, Err(error), true);
    }

    /// Sleep before answering each request.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap_or_else(|e| e.into_inner()) = delay;
    }

    /// All requests seen so far with the host they targeted.
    pub fn requests(&self) -> Vec<(String, RemoteRequest)> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Rendered form of every request seen so far.
    pub fn described(&self) -> Vec<String> {
        self.requests()
            .iter()
            .map(|(_, r)| r.describe())
            .collect()
    }

    /// Number of requests whose rendering contains `pattern`.
    pub fn count(&self, pattern: &str) -> usize {
        self.described().iter().filter(|d| d.contains(pattern)).count()
    }

    fn answer(&self, request: &RemoteRequest) -> Result<RemoteOutput> {
        let line = request.describe();
        let mut rules = self.rules.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(pos) = rules.iter().position(|r| r.once && line.contains(r.pattern.as_str())) {
            return rules.remove(pos).response;
        }
        if let Some(rule) = rules
            .iter()
            .rev()
            .find(|r| !r.once && line.contains(r.pattern.as_str()))
        {
            return rule.response.clone();
        }
        match request {
            RemoteRequest::Http { .. } => Ok(RemoteOutput::http(200, "")),
            _ => Ok(RemoteOutput::ok("")),
        }
    }
}

#[async_trait]
impl RemoteExecutor for ScriptedExecutor {
    async fn execute(&self, target: &RemoteTarget, request: RemoteRequest) -> Result<RemoteOutput> {
        let delay = *self.delay.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let response = self.answer(&request);
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((target.host_id.clone(), request));
        response
    }
}
