//! One request, end to end: route, invoke and judge, chart, compose.

use crate::agent::{invoke_structured, AgentProfile, ReasoningService, ToolSet};
use crate::config::Config;
use crate::error::WorkflowError;
use crate::graph::GraphHandle;
use crate::models::{
    AskRequest, ConversationState, FinalResponse, GraphArtifact, RoutingDecision,
    SpecialistId, SpecialistResult,
};
use crate::orchestrator::judge::JudgeLoop;
use crate::orchestrator::router::Router;
use crate::orchestrator::specialists::{Specialist, SpecialistInvoker};
use crate::report::compose_markdown;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Tool sets handed to the profiles.
#[derive(Clone, Default)]
pub struct WorkflowTools {
    /// Retrieval tools over the knowledge base.
    pub knowledge: ToolSet,
    /// Knowledge tools plus data access.
    pub data: ToolSet,
}

pub struct Workflow {
    reasoning: Arc<dyn ReasoningService>,
    router: Router,
    invoker: SpecialistInvoker,
    judge: JudgeLoop,
    responder: AgentProfile,
    graph: Option<GraphHandle>,
    timeout: Duration,
}

impl Workflow {
    pub fn new(
        config: &Config,
        reasoning: Arc<dyn ReasoningService>,
        tools: WorkflowTools,
        graph: Option<GraphHandle>,
    ) -> Self {
        let model = &config.model;

        let specialists = SpecialistId::all()
            .into_iter()
            .map(|id| Specialist {
                id,
                profile: AgentProfile::specialist(id, model),
                tools: match id {
                    SpecialistId::DataAnalyst => tools.data.clone(),
                    SpecialistId::MarketingAnalyst => tools.knowledge.clone(),
                },
            })
            .collect();

        Self {
            router: Router::new(
                reasoning.clone(),
                AgentProfile::router(model),
                tools.knowledge.clone(),
                config.router.shortcuts.clone(),
            ),
            invoker: SpecialistInvoker::new(reasoning.clone(), specialists, config.general.dispatch),
            judge: JudgeLoop::new(
                reasoning.clone(),
                AgentProfile::judge(model),
                config.general.max_retries,
            ),
            responder: AgentProfile::direct_responder(model),
            reasoning,
            graph,
            timeout: Duration::from_secs(config.general.request_timeout_seconds),
        }
    }

    /// Execute under the wall-clock budget; nothing partial survives a timeout.
    pub async fn run(&self, request: AskRequest) -> Result<FinalResponse, WorkflowError> {
        let result = match tokio::time::timeout(self.timeout, self.execute(request)).await {
            Ok(result) => result,
            Err(_) => Err(WorkflowError::Timeout(self.timeout)),
        };

        if let Err(ref e) = result {
            error!("Workflow failed ({}): {}", e.kind(), e);
        }
        result
    }

    async fn execute(&self, request: AskRequest) -> Result<FinalResponse, WorkflowError> {
        let started = Instant::now();

        let question = request.question.trim();
        if question.is_empty() {
            return Err(WorkflowError::Validation("question must not be empty".to_string()));
        }

        let mut state = ConversationState::from_history(&request.history)?;
        if state.is_empty() {
            info!("Handling question in a new conversation");
        } else {
            info!("Handling question with {} prior turns", state.len());
        }
        state.push_user(question);

        let decision = self.router.route(&state).await?;
        if let Some(clarifying) = decision.clarifying() {
            return Ok(clarification(clarifying, started));
        }

        let result = if decision.is_terminal() {
            info!("Answering directly: {}", decision.commentary);
            self.answer_directly(&state).await?
        } else {
            let outcome = self.judge.run(&self.invoker, &decision, &state).await?;
            debug!(
                "Judge loop ended in {:?} after {} judge calls and {} invocations",
                outcome.final_state, outcome.judge_calls, outcome.invocations
            );
            outcome.result
        };

        if let Some(clarifying) = result.clarifying() {
            return Ok(clarification(clarifying, started));
        }

        let graph = self.chart(&decision, &result).await;
        let markdown = compose_markdown(&decision, &result, graph.as_ref(), question);

        let elapsed = started.elapsed();
        info!("Answer composed in {:.1}s", elapsed.as_secs_f64());

        Ok(FinalResponse {
            markdown,
            elapsed_time: elapsed,
            clarifying_question: None,
            error: None,
        })
    }

    async fn answer_directly(&self, state: &ConversationState) -> Result<SpecialistResult, WorkflowError> {
        invoke_structured(
            self.reasoning.as_ref(),
            &self.responder,
            state.turns(),
            &ToolSet::empty(),
        )
        .await
    }

    /// Chart failures never fail the request.
    async fn chart(
        &self,
        decision: &RoutingDecision,
        result: &SpecialistResult,
    ) -> Option<GraphArtifact> {
        if !decision.requires_graph || !result.has_data() {
            return None;
        }
        let Some(ref handle) = self.graph else {
            debug!("Chart requested but the graph pipeline is disabled");
            return None;
        };

        match handle.render(result.rows().to_vec(), &decision.user_question).await {
            Ok(artifact) => Some(artifact),
            Err(e) => {
                warn!("Chart skipped ({}): {}", e.kind(), e);
                None
            }
        }
    }
}

fn clarification(question: &str, started: Instant) -> FinalResponse {
    info!("Asking for clarification");
    FinalResponse {
        markdown: question.to_string(),
        elapsed_time: started.elapsed(),
        clarifying_question: Some(question.to_string()),
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::profiles::{DIRECT_RESPONDER, GRAPH_CODE, JUDGE, ROUTER};
    use crate::agent::testing::ScriptedReasoning;
    use crate::graph::fakes::{FakePublisher, FakeRenderer};
    use crate::graph::{GraphPipeline, GraphWorker};
    use crate::models::HistoryEntry;
    use serde_json::json;

    const CHART_QUESTION: &str = "Show a bar chart of nights booked per month";

    fn ask(question: &str) -> AskRequest {
        AskRequest {
            question: question.to_string(),
            history: Vec::new(),
        }
    }

    fn chart_script() -> ScriptedReasoning {
        ScriptedReasoning::new()
            .respond(
                ROUTER,
                json!({"assigned_agents": ["data_analyst"], "user_goal": "Nights per month"}),
            )
            .respond(
                "data_analyst",
                json!({
                    "data": [{"month": "2025-01", "nights": 40}, {"month": "2025-02", "nights": 52}],
                    "findings": "February is busier."
                }),
            )
            .respond(JUDGE, json!({"score": "accepted", "reason": "answers it"}))
            .respond(GRAPH_CODE, json!({"code": "plt.savefig(img_buf, format='png')"}))
    }

    fn workflow(reasoning: Arc<ScriptedReasoning>, renderer: Option<FakeRenderer>) -> Workflow {
        let config = Config::default();
        let graph = renderer.map(|r| {
            let pipeline = GraphPipeline::new(
                reasoning.clone(),
                AgentProfile::graph_code(&config.model),
                Arc::new(r),
                Arc::new(FakePublisher::default()),
            );
            GraphWorker::spawn(pipeline, 1).unwrap()
        });
        Workflow::new(&config, reasoning, WorkflowTools::default(), graph)
    }

    #[tokio::test]
    async fn test_revenue_question_end_to_end() {
        let reasoning = Arc::new(
            ScriptedReasoning::new()
                .respond(ROUTER, json!({"assigned_agents": ["data_analyst"]}))
                .respond(
                    "data_analyst",
                    json!({
                        "data": [{"category": "Villa", "revenue": 1200}, {"category": "Suite", "revenue": 800}],
                        "findings": "Villas lead revenue."
                    }),
                )
                .respond(JUDGE, json!({"score": "accepted", "reason": "ok"})),
        );
        let wf = workflow(reasoning.clone(), Some(FakeRenderer { bytes: vec![1], fail: false }));

        let response = wf
            .run(ask("What is total revenue by room category in 2025?"))
            .await
            .unwrap();

        assert!(response
            .markdown
            .starts_with("# What is total revenue by room category in 2025?"));
        assert!(response.markdown.contains("| Villa | 1200 |"));
        assert!(!response.markdown.contains("![Chart]"));
        assert_eq!(reasoning.call_count(GRAPH_CODE), 0);
        assert_eq!(reasoning.call_count("marketing_analyst"), 0);
    }

    #[tokio::test]
    async fn test_chart_question_embeds_published_image() {
        let reasoning = Arc::new(chart_script());
        let wf = workflow(reasoning.clone(), Some(FakeRenderer { bytes: vec![1], fail: false }));

        let response = wf.run(ask(CHART_QUESTION)).await.unwrap();

        assert!(response.markdown.contains("![Chart](https://files.example.com/charts/1.png)"));
        assert_eq!(reasoning.call_count(GRAPH_CODE), 1);
    }

    #[tokio::test]
    async fn test_chart_question_without_data_skips_graph() {
        for data in [json!(null), json!([])] {
            let reasoning = Arc::new(
                ScriptedReasoning::new()
                    .respond(ROUTER, json!({"assigned_agents": ["data_analyst"]}))
                    .respond(
                        "data_analyst",
                        json!({"data": data, "findings": "No bookings matched."}),
                    )
                    .respond(JUDGE, json!({"score": "accepted", "reason": "nothing to show"}))
                    .respond(GRAPH_CODE, json!({"code": "plt.savefig(img_buf, format='png')"})),
            );
            let wf = workflow(reasoning.clone(), Some(FakeRenderer { bytes: vec![1], fail: false }));

            let response = wf.run(ask(CHART_QUESTION)).await.unwrap();

            assert_eq!(reasoning.call_count(GRAPH_CODE), 0);
            assert!(!response.markdown.contains("![Chart]"));
            assert!(response.markdown.contains("No bookings matched."));
        }
    }

    #[tokio::test]
    async fn test_chart_failure_is_invisible() {
        let failing = workflow(
            Arc::new(chart_script()),
            Some(FakeRenderer { bytes: Vec::new(), fail: true }),
        );
        let disabled = workflow(Arc::new(chart_script()), None);

        let with_failure = failing.run(ask(CHART_QUESTION)).await.unwrap();
        let without_graph = disabled.run(ask(CHART_QUESTION)).await.unwrap();

        assert_eq!(with_failure.markdown, without_graph.markdown);
        assert!(with_failure.error.is_none());
    }

    #[tokio::test]
    async fn test_clarification_invokes_no_specialist() {
        let reasoning = Arc::new(
            ScriptedReasoning::new()
                .respond(
                    ROUTER,
                    json!({"assigned_agents": ["data_analyst"], "clarifying_question": "Which year?"}),
                )
                .respond("data_analyst", json!({"findings": "should not run"})),
        );
        let wf = workflow(reasoning.clone(), None);

        let response = wf.run(ask("Total revenue")).await.unwrap();

        assert_eq!(response.markdown, "Which year?");
        assert_eq!(response.clarifying_question.as_deref(), Some("Which year?"));
        assert_eq!(reasoning.call_count("data_analyst"), 0);
        assert_eq!(reasoning.call_count(JUDGE), 0);
    }

    #[tokio::test]
    async fn test_direct_answer_uses_history_without_judge() {
        let reasoning = Arc::new(
            ScriptedReasoning::new()
                .respond(ROUTER, json!({"assigned_agents": [], "commentary": "already answered"}))
                .respond(DIRECT_RESPONDER, json!({"findings": "Villas led with 1200."})),
        );
        let wf = workflow(reasoning.clone(), None);

        let request = AskRequest {
            question: "Which category led?".to_string(),
            history: vec![
                HistoryEntry {
                    role: "user".to_string(),
                    content: "Revenue by category".to_string(),
                },
                HistoryEntry {
                    role: "agent".to_string(),
                    content: "# Revenue by category\n\n| Villa | 1200 |".to_string(),
                },
            ],
        };

        let response = wf.run(request).await.unwrap();

        assert!(response.markdown.contains("Villas led with 1200."));
        assert_eq!(reasoning.call_count(JUDGE), 0);
        let seen = &reasoning.conversations(DIRECT_RESPONDER)[0];
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[1].role, crate::models::Role::Assistant);
    }

    #[tokio::test]
    async fn test_router_failure_becomes_error_payload() {
        let reasoning = Arc::new(
            ScriptedReasoning::new().script(ROUTER, vec![Err("503 from upstream".to_string())]),
        );
        let wf = workflow(reasoning, None);

        let err = wf.run(ask("Revenue?")).await.unwrap_err();
        assert_eq!(err.kind(), "service");
    }

    #[tokio::test]
    async fn test_blank_question_is_rejected() {
        let wf = workflow(Arc::new(ScriptedReasoning::new()), None);
        let err = wf.run(ask("   ")).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Validation(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_aborts_the_whole_workflow() {
        let reasoning = Arc::new(
            chart_script().delay("data_analyst", Duration::from_secs(3600)),
        );
        let wf = workflow(reasoning.clone(), None);

        let err = wf.run(ask(CHART_QUESTION)).await.unwrap_err();

        assert!(matches!(err, WorkflowError::Timeout(_)));
        assert_eq!(reasoning.call_count(JUDGE), 0);
    }
}
