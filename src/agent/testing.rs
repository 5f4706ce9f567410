//! Scripted reasoning service for workflow tests.

use crate::agent::client::{ReasoningRequest, ReasoningService};
use crate::error::WorkflowError;
use crate::models::Turn;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

/// Replays canned responses per profile name.
///
/// The last response of a script repeats once the queue drains. `Err`
/// entries surface as service failures.
#[derive(Default)]
pub struct ScriptedReasoning {
    scripts: Mutex<HashMap<String, VecDeque<Result<Value, String>>>>,
    delays: HashMap<String, Duration>,
    calls: Mutex<Vec<(String, Vec<Turn>)>>,
    completed: Mutex<Vec<String>>,
}

impl ScriptedReasoning {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, profile: &str, responses: Vec<Result<Value, String>>) -> Self {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts.insert(profile.to_string(), responses.into());
        }
        self
    }

    pub fn respond(self, profile: &str, response: Value) -> Self {
        self.script(profile, vec![Ok(response)])
    }

    pub fn delay(mut self, profile: &str, delay: Duration) -> Self {
        self.delays.insert(profile.to_string(), delay);
        self
    }

    pub fn call_count(&self, profile: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == profile)
            .count()
    }

    /// Conversations each call of `profile` received, in call order.
    pub fn conversations(&self, profile: &str) -> Vec<Vec<Turn>> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == profile)
            .map(|(_, turns)| turns.clone())
            .collect()
    }

    /// Profile names in the order their calls finished.
    pub fn completion_order(&self) -> Vec<String> {
        self.completed.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReasoningService for ScriptedReasoning {
    async fn invoke(&self, request: ReasoningRequest<'_>) -> Result<Value, WorkflowError> {
        let name = request.profile.name.clone();
        self.calls
            .lock()
            .unwrap()
            .push((name.clone(), request.conversation.to_vec()));

        if let Some(delay) = self.delays.get(&name) {
            tokio::time::sleep(*delay).await;
        }

        let next = {
            let mut scripts = self.scripts.lock().unwrap();
            match scripts.get_mut(&name) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            }
        };

        self.completed.lock().unwrap().push(name.clone());

        match next {
            Some(Ok(value)) => Ok(value),
            Some(Err(message)) => Err(WorkflowError::Service(message)),
            None => Err(WorkflowError::Service(format!("no script for {}", name))),
        }
    }
}
