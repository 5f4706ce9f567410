//! The judge loop: invoke, judge, retry with feedback, bounded by a budget.
//!
//! ```text
//! Analyzing --results--> Judging --accepted--> Accepted
//!     ^                     |
//!     |                     +--rejected/partial, budget left--> Retrying
//!     +------feedback-------+                                      |
//!                           +--rejected/partial, no budget--> Exhausted
//! ```

use crate::agent::{invoke_structured, AgentProfile, ReasoningService, ToolSet};
use crate::error::WorkflowError;
use crate::models::{
    ConversationState, JudgeScore, JudgeVerdict, Row, RoutingDecision, SpecialistId,
    SpecialistResult, Turn,
};
use crate::orchestrator::specialists::{merge, SpecialistInvoker};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JudgeState {
    Analyzing,
    Judging,
    Retrying,
    Accepted,
    Exhausted,
}

impl JudgeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JudgeState::Accepted | JudgeState::Exhausted)
    }
}

/// Shape the judge profile must return.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct JudgeOutput {
    pub score: JudgeScore,
    #[serde(default)]
    pub reason: String,
    /// Rows from the data that actually answer the question.
    #[serde(default)]
    pub useful_data: Option<Vec<Row>>,
    /// What the next attempt should change.
    #[serde(default)]
    pub suggestions: Option<String>,
    /// Specialist ids responsible for the shortcomings.
    #[serde(default)]
    pub flagged_specialists: Option<Vec<String>>,
}

/// What the loop ended with.
#[derive(Debug)]
pub struct JudgeOutcome {
    /// Merged result of the latest invocation of every specialist.
    pub result: SpecialistResult,
    pub per_specialist: Vec<(SpecialistId, SpecialistResult)>,
    /// Absent when a specialist asked for clarification instead.
    pub verdict: Option<JudgeVerdict>,
    pub final_state: JudgeState,
    pub judge_calls: usize,
    pub invocations: usize,
}

pub struct JudgeLoop {
    reasoning: Arc<dyn ReasoningService>,
    profile: AgentProfile,
    max_retries: usize,
}

impl JudgeLoop {
    pub fn new(reasoning: Arc<dyn ReasoningService>, profile: AgentProfile, max_retries: usize) -> Self {
        Self {
            reasoning,
            profile,
            max_retries,
        }
    }

    pub async fn run(
        &self,
        invoker: &SpecialistInvoker,
        decision: &RoutingDecision,
        state: &ConversationState,
    ) -> Result<JudgeOutcome, WorkflowError> {
        let assigned = decision.assigned_specialists.clone();
        let mut snapshots: Vec<(SpecialistId, ConversationState)> =
            assigned.iter().map(|id| (*id, state.snapshot())).collect();
        let mut latest: Vec<(SpecialistId, SpecialistResult)> = Vec::with_capacity(assigned.len());

        let mut pending = assigned.clone();
        let mut merged = SpecialistResult::default();
        let mut verdict: Option<JudgeVerdict> = None;
        let mut judge_calls = 0;
        let mut invocations = 0;
        let mut current = JudgeState::Analyzing;

        while !current.is_terminal() {
            let next = match current {
                JudgeState::Analyzing => {
                    let jobs = snapshots
                        .iter()
                        .filter(|(id, _)| pending.contains(id))
                        .map(|(id, snapshot)| (*id, snapshot.snapshot()))
                        .collect();

                    for outcome in invoker.run(jobs).await {
                        invocations += 1;
                        let result = outcome.result?;
                        match latest.iter_mut().find(|(id, _)| *id == outcome.id) {
                            Some(slot) => slot.1 = result,
                            None => latest.push((outcome.id, result)),
                        }
                    }
                    latest.sort_by_key(|(id, _)| {
                        assigned.iter().position(|a| a == id).unwrap_or(usize::MAX)
                    });
                    merged = merge(&latest);

                    if let Some(question) = merged.clarifying() {
                        info!("Specialist asked for clarification: {}", question);
                        return Ok(JudgeOutcome {
                            result: merged,
                            per_specialist: latest,
                            verdict: None,
                            final_state: JudgeState::Accepted,
                            judge_calls,
                            invocations,
                        });
                    }
                    JudgeState::Judging
                }
                JudgeState::Judging => {
                    judge_calls += 1;
                    let v = self.judge(decision, &merged, &assigned).await?;
                    info!(
                        "Judge verdict {} (attempt {}): {}",
                        v.score, judge_calls, v.reason
                    );
                    if let Some(ref rows) = v.useful_data {
                        debug!("Judge marked {} rows as useful", rows.len());
                    }

                    let next = if v.is_accepted() {
                        JudgeState::Accepted
                    } else if judge_calls <= self.max_retries {
                        JudgeState::Retrying
                    } else {
                        warn!(
                            "Retry budget of {} spent; keeping the last result",
                            self.max_retries
                        );
                        JudgeState::Exhausted
                    };
                    verdict = Some(v);
                    next
                }
                JudgeState::Retrying => {
                    let Some(ref v) = verdict else {
                        return Err(WorkflowError::Service(
                            "retrying without a verdict".to_string(),
                        ));
                    };
                    pending = if v.flagged.is_empty() {
                        assigned.clone()
                    } else {
                        v.flagged.clone()
                    };

                    let feedback = feedback_turn(v);
                    for (id, snapshot) in snapshots.iter_mut() {
                        if pending.contains(id) {
                            snapshot.push(feedback.clone());
                        }
                    }
                    JudgeState::Analyzing
                }
                JudgeState::Accepted | JudgeState::Exhausted => current,
            };

            debug!("Judge loop: {:?} -> {:?}", current, next);
            current = next;
        }

        Ok(JudgeOutcome {
            result: merged,
            per_specialist: latest,
            verdict,
            final_state: current,
            judge_calls,
            invocations,
        })
    }

    async fn judge(
        &self,
        decision: &RoutingDecision,
        result: &SpecialistResult,
        assigned: &[SpecialistId],
    ) -> Result<JudgeVerdict, WorkflowError> {
        let payload = json!({
            "original_question": decision.user_question,
            "user_goal": decision.user_goal,
            "data": result.rows(),
            "report": result.findings,
        });
        let conversation = [Turn::user(payload.to_string())];

        let output: JudgeOutput = invoke_structured(
            self.reasoning.as_ref(),
            &self.profile,
            &conversation,
            &ToolSet::empty(),
        )
        .await?;

        let mut flagged = Vec::new();
        for raw in output.flagged_specialists.unwrap_or_default() {
            match raw.parse::<SpecialistId>() {
                Ok(id) if assigned.contains(&id) => {
                    if !flagged.contains(&id) {
                        flagged.push(id);
                    }
                }
                _ => warn!("Judge flagged unassigned specialist '{}'; ignoring", raw),
            }
        }

        Ok(JudgeVerdict {
            score: output.score,
            reason: output.reason,
            useful_data: output.useful_data,
            suggestions: output.suggestions.filter(|s| !s.trim().is_empty()),
            flagged,
        })
    }
}

fn feedback_turn(verdict: &JudgeVerdict) -> Turn {
    let mut text = format!(
        "Your previous answer was rated {} by the reviewer.\nReason: {}",
        verdict.score, verdict.reason
    );
    if let Some(ref suggestions) = verdict.suggestions {
        text.push_str("\nSuggestions: ");
        text.push_str(suggestions);
    }
    text.push_str("\nRevise your answer so it addresses this feedback.");
    Turn::user(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::profiles::JUDGE;
    use crate::agent::testing::ScriptedReasoning;
    use crate::config::{DispatchMode, ModelConfig};
    use crate::orchestrator::specialists::Specialist;
    use serde_json::Value;

    fn setup(reasoning: ScriptedReasoning, max_retries: usize) -> (JudgeLoop, SpecialistInvoker, Arc<ScriptedReasoning>) {
        let reasoning = Arc::new(reasoning);
        let config = ModelConfig::default();
        let specialists = SpecialistId::all()
            .into_iter()
            .map(|id| Specialist {
                id,
                profile: AgentProfile::specialist(id, &config),
                tools: ToolSet::empty(),
            })
            .collect();

        let invoker = SpecialistInvoker::new(reasoning.clone(), specialists, DispatchMode::Concurrent);
        let judge = JudgeLoop::new(reasoning.clone(), AgentProfile::judge(&config), max_retries);
        (judge, invoker, reasoning)
    }

    fn decision(assigned: Vec<SpecialistId>) -> RoutingDecision {
        RoutingDecision {
            assigned_specialists: assigned,
            user_question: "What is total revenue by room category in 2025?".to_string(),
            user_goal: "Revenue per category".to_string(),
            commentary: String::new(),
            requires_graph: false,
            clarifying_question: None,
        }
    }

    fn state() -> ConversationState {
        let mut state = ConversationState::new();
        state.push_user("What is total revenue by room category in 2025?");
        state
    }

    fn answer(findings: &str) -> Result<Value, String> {
        Ok(json!({"data": [{"category": "Villa", "revenue": 10}, {"category": "Suite", "revenue": 7}], "findings": findings}))
    }

    #[tokio::test]
    async fn test_accepted_on_first_pass() {
        let scripted = ScriptedReasoning::new()
            .script("data_analyst", vec![answer("first")])
            .respond(JUDGE, json!({"score": "accepted", "reason": "complete"}));
        let (judge, invoker, reasoning) = setup(scripted, 2);

        let outcome = judge
            .run(&invoker, &decision(vec![SpecialistId::DataAnalyst]), &state())
            .await
            .unwrap();

        assert_eq!(outcome.final_state, JudgeState::Accepted);
        assert_eq!(outcome.judge_calls, 1);
        assert_eq!(reasoning.call_count(JUDGE), 1);
        assert_eq!(reasoning.call_count("data_analyst"), 1);
        assert_eq!(outcome.result.findings, "first");
    }

    #[tokio::test]
    async fn test_exhaustion_returns_last_result() {
        let scripted = ScriptedReasoning::new()
            .script(
                "data_analyst",
                vec![answer("first"), answer("second"), answer("third")],
            )
            .respond(
                JUDGE,
                json!({"score": "rejected", "reason": "wrong year", "suggestions": "filter 2025"}),
            );
        let (judge, invoker, reasoning) = setup(scripted, 2);

        let outcome = judge
            .run(&invoker, &decision(vec![SpecialistId::DataAnalyst]), &state())
            .await
            .unwrap();

        assert_eq!(outcome.final_state, JudgeState::Exhausted);
        assert_eq!(reasoning.call_count("data_analyst"), 3);
        assert_eq!(reasoning.call_count(JUDGE), 3);
        assert_eq!(outcome.invocations, 3);
        assert_eq!(outcome.result.findings, "third");
        assert_eq!(outcome.verdict.unwrap().score, JudgeScore::Rejected);

        let retried = reasoning.conversations("data_analyst");
        assert_eq!(retried[0].len(), 1);
        assert_eq!(retried[2].len(), 3);
        assert!(retried[1][1].content.contains("filter 2025"));
    }

    #[tokio::test]
    async fn test_zero_budget_judges_once() {
        let scripted = ScriptedReasoning::new()
            .script("data_analyst", vec![answer("only")])
            .respond(JUDGE, json!({"score": "partial", "reason": "half"}));
        let (judge, invoker, reasoning) = setup(scripted, 0);

        let outcome = judge
            .run(&invoker, &decision(vec![SpecialistId::DataAnalyst]), &state())
            .await
            .unwrap();

        assert_eq!(outcome.final_state, JudgeState::Exhausted);
        assert_eq!(reasoning.call_count(JUDGE), 1);
        assert_eq!(reasoning.call_count("data_analyst"), 1);
    }

    #[tokio::test]
    async fn test_feedback_only_reaches_flagged_specialist() {
        let scripted = ScriptedReasoning::new()
            .script("data_analyst", vec![answer("numbers")])
            .script(
                "marketing_analyst",
                vec![Ok(json!({"findings": "vague"})), Ok(json!({"findings": "sharp"}))],
            )
            .script(
                JUDGE,
                vec![
                    Ok(json!({"score": "partial", "reason": "no plan", "flagged_specialists": ["marketing_analyst"]})),
                    Ok(json!({"score": "accepted", "reason": "good"})),
                ],
            );
        let (judge, invoker, reasoning) = setup(scripted, 2);

        let outcome = judge
            .run(
                &invoker,
                &decision(vec![SpecialistId::DataAnalyst, SpecialistId::MarketingAnalyst]),
                &state(),
            )
            .await
            .unwrap();

        assert_eq!(reasoning.call_count("data_analyst"), 1);
        assert_eq!(reasoning.call_count("marketing_analyst"), 2);
        assert_eq!(outcome.per_specialist[0].0, SpecialistId::DataAnalyst);
        assert!(outcome.result.findings.contains("numbers"));
        assert!(outcome.result.findings.contains("sharp"));
        assert!(!outcome.result.findings.contains("vague"));

        let second = &reasoning.conversations("marketing_analyst")[1];
        assert!(second.last().unwrap().content.contains("no plan"));
    }

    #[tokio::test]
    async fn test_specialist_clarification_skips_judge() {
        let scripted = ScriptedReasoning::new()
            .respond(
                "data_analyst",
                json!({"data": null, "findings": "", "clarifying_question": "Which hotel?"}),
            )
            .respond(JUDGE, json!({"score": "accepted", "reason": "n/a"}));
        let (judge, invoker, reasoning) = setup(scripted, 2);

        let outcome = judge
            .run(&invoker, &decision(vec![SpecialistId::DataAnalyst]), &state())
            .await
            .unwrap();

        assert_eq!(outcome.result.clarifying(), Some("Which hotel?"));
        assert_eq!(reasoning.call_count(JUDGE), 0);
        assert!(outcome.verdict.is_none());
    }

    #[tokio::test]
    async fn test_failed_specialist_aborts() {
        let scripted = ScriptedReasoning::new()
            .script("data_analyst", vec![Err("upstream 503".to_string())])
            .respond(JUDGE, json!({"score": "accepted", "reason": "n/a"}));
        let (judge, invoker, reasoning) = setup(scripted, 2);

        let result = judge
            .run(&invoker, &decision(vec![SpecialistId::DataAnalyst]), &state())
            .await;

        tokio_test::assert_err!(result);
        assert_eq!(reasoning.call_count(JUDGE), 0);
    }
}
