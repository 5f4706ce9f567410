//! Request routing.
//!
//! The router profile proposes a decision; [`Router::route`] then enforces the
//! routing policy on top of it so that clarifications, direct answers,
//! shortcuts and the graph flag never depend on model whims.

use crate::agent::{invoke_structured, AgentProfile, ReasoningService, ToolSet};
use crate::config::Shortcut;
use crate::error::WorkflowError;
use crate::models::{ConversationState, Role, RoutingDecision, SpecialistId};
use schemars::JsonSchema;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info};

/// Word prefixes that count as an explicit chart request.
const CHART_PREFIXES: &[&str] = &[
    "chart",
    "graph",
    "plot",
    "visualiz",
    "visualis",
    "histogram",
    "diagram",
    "gráfic",
    "grafic",
];

/// Shape the router profile must return.
#[derive(Debug, Default, Deserialize, JsonSchema)]
pub struct RouterOutput {
    /// Specialist ids in dispatch order: data_analyst, marketing_analyst.
    #[serde(default)]
    pub assigned_agents: Option<Vec<String>>,
    /// The exact last user message.
    #[serde(default)]
    pub user_question: Option<String>,
    /// One-sentence summary of what the user wants.
    #[serde(default)]
    pub user_goal: Option<String>,
    #[serde(default)]
    pub commentary: Option<String>,
    #[serde(default)]
    pub requires_graph: Option<bool>,
    /// Set only when a key parameter is missing.
    #[serde(default)]
    pub clarifying_question: Option<String>,
}

pub struct Router {
    reasoning: Arc<dyn ReasoningService>,
    profile: AgentProfile,
    tools: ToolSet,
    shortcuts: Vec<Shortcut>,
}

impl Router {
    pub fn new(
        reasoning: Arc<dyn ReasoningService>,
        profile: AgentProfile,
        tools: ToolSet,
        shortcuts: Vec<Shortcut>,
    ) -> Self {
        Self {
            reasoning,
            profile,
            tools,
            shortcuts,
        }
    }

    /// Produce the routing decision for the latest user turn.
    pub async fn route(&self, state: &ConversationState) -> Result<RoutingDecision, WorkflowError> {
        let last_user = state
            .last_user()
            .ok_or_else(|| WorkflowError::Validation("conversation has no user turn".to_string()))?
            .to_string();

        let output: RouterOutput = invoke_structured(
            self.reasoning.as_ref(),
            &self.profile,
            state.turns(),
            &self.tools,
        )
        .await?;
        debug!("Router proposal: {:?}", output);

        let user_question = non_blank(output.user_question).unwrap_or_else(|| last_user.clone());
        let user_goal = non_blank(output.user_goal).unwrap_or_else(|| user_question.clone());
        let commentary = non_blank(output.commentary).unwrap_or_default();

        let mut decision = RoutingDecision {
            assigned_specialists: Vec::new(),
            user_question,
            user_goal,
            commentary,
            requires_graph: false,
            clarifying_question: None,
        };

        if let Some(question) = non_blank(output.clarifying_question) {
            info!("Routing: clarification needed");
            decision.clarifying_question = Some(question);
            return Ok(decision);
        }

        let proposed = parse_ids(output.assigned_agents.as_deref().unwrap_or_default())?;

        if find_prior_answer(state, &last_user).is_some() {
            info!("Routing: answer already present in conversation");
            decision.commentary = format!(
                "Reusing the earlier answer to \"{}\" from this conversation.",
                last_user.trim()
            );
            return Ok(decision);
        }
        if proposed.is_empty() {
            info!("Routing: direct answer from existing context");
            if decision.commentary.is_empty() {
                decision.commentary = "Answering from existing conversation context.".to_string();
            }
            return Ok(decision);
        }

        let mut assigned = match self.shortcut_for(&last_user) {
            Some(shortcut) => {
                info!("Routing: shortcut matched {:?}", shortcut.keywords);
                parse_ids(&shortcut.specialists)?
            }
            None => proposed,
        };
        assigned.sort();
        assigned.dedup();

        decision.requires_graph = mentions_chart(&last_user);
        if output.requires_graph.unwrap_or(false) && !decision.requires_graph {
            debug!("Router proposed a graph the user did not ask for; ignoring");
        }
        decision.assigned_specialists = assigned;

        info!(
            "Routing: {:?}, graph: {}",
            decision
                .assigned_specialists
                .iter()
                .map(SpecialistId::as_str)
                .collect::<Vec<_>>(),
            decision.requires_graph
        );
        Ok(decision)
    }

    fn shortcut_for(&self, question: &str) -> Option<&Shortcut> {
        let lowered = question.to_lowercase();
        self.shortcuts.iter().find(|s| {
            s.keywords
                .iter()
                .any(|k| !k.trim().is_empty() && lowered.contains(&k.to_lowercase()))
        })
    }
}

fn parse_ids(ids: &[String]) -> Result<Vec<SpecialistId>, WorkflowError> {
    ids.iter().map(|id| id.parse()).collect()
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Whether the text explicitly asks for a chart (English or Spanish).
pub fn mentions_chart(text: &str) -> bool {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .any(|word| CHART_PREFIXES.iter().any(|p| word.starts_with(p)))
}

/// Find an earlier composed answer whose heading restates `question`.
///
/// The trailing user turn (the question being routed) is not searched.
pub fn find_prior_answer<'a>(state: &'a ConversationState, question: &str) -> Option<&'a str> {
    let wanted = normalize(question);
    if wanted.is_empty() {
        return None;
    }

    state
        .turns()
        .iter()
        .filter(|t| t.role == Role::Assistant)
        .map(|t| t.content.as_str())
        .find(|content| {
            let mut lines = content.lines();
            let Some(heading) = lines.next().and_then(|l| l.trim().strip_prefix("# ")) else {
                return false;
            };
            normalize(heading) == wanted && lines.any(|l| !l.trim().is_empty())
        })
}

fn normalize(text: &str) -> String {
    text.trim()
        .trim_end_matches(|c: char| c == '?' || c == '.' || c == '!')
        .trim_start_matches(|c: char| c == '¿' || c == '¡')
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::profiles::ROUTER;
    use crate::agent::testing::ScriptedReasoning;
    use crate::config::{ModelConfig, RouterConfig};
    use serde_json::{json, Value};

    fn router_with(response: Value) -> (Router, Arc<ScriptedReasoning>) {
        let reasoning = Arc::new(ScriptedReasoning::new().respond(ROUTER, response));
        let router = Router::new(
            reasoning.clone(),
            AgentProfile::router(&ModelConfig::default()),
            ToolSet::empty(),
            RouterConfig::default().shortcuts,
        );
        (router, reasoning)
    }

    fn asking(question: &str) -> ConversationState {
        let mut state = ConversationState::new();
        state.push_user(question);
        state
    }

    #[tokio::test]
    async fn test_revenue_question_goes_to_data_analyst_only() {
        let (router, _) = router_with(json!({
            "assigned_agents": ["data_analyst"],
            "user_question": "What is total revenue by room category in 2025?",
            "user_goal": "Revenue per room category for 2025",
            "requires_graph": false,
            "clarifying_question": ""
        }));

        let decision = router
            .route(&asking("What is total revenue by room category in 2025?"))
            .await
            .unwrap();

        assert_eq!(decision.assigned_specialists, vec![SpecialistId::DataAnalyst]);
        assert_eq!(decision.clarifying(), None);
        assert!(!decision.requires_graph);
    }

    #[tokio::test]
    async fn test_clarification_clears_assignment() {
        let (router, _) = router_with(json!({
            "assigned_agents": ["data_analyst", "marketing_analyst"],
            "requires_graph": true,
            "clarifying_question": "Which year do you mean?"
        }));

        let decision = router.route(&asking("Plot the total")).await.unwrap();

        assert_eq!(decision.clarifying(), Some("Which year do you mean?"));
        assert!(decision.assigned_specialists.is_empty());
        assert!(!decision.requires_graph);
    }

    #[tokio::test]
    async fn test_chart_request_sets_graph_flag_and_orders_specialists() {
        let (router, _) = router_with(json!({
            "assigned_agents": ["marketing_analyst", "data_analyst", "data_analyst"],
            "requires_graph": false
        }));

        let decision = router
            .route(&asking("Show a bar chart of nights booked per month"))
            .await
            .unwrap();

        assert!(decision.requires_graph);
        assert_eq!(
            decision.assigned_specialists,
            vec![SpecialistId::DataAnalyst, SpecialistId::MarketingAnalyst]
        );
        assert_eq!(
            decision.user_question,
            "Show a bar chart of nights booked per month"
        );
    }

    #[tokio::test]
    async fn test_graph_flag_is_never_inferred() {
        let (router, _) = router_with(json!({
            "assigned_agents": ["data_analyst"],
            "requires_graph": true
        }));

        let decision = router.route(&asking("Nights per month in 2024")).await.unwrap();
        assert!(!decision.requires_graph);
    }

    #[tokio::test]
    async fn test_shortcut_overrides_assignment() {
        let (router, _) = router_with(json!({
            "assigned_agents": ["marketing_analyst"]
        }));

        let decision = router
            .route(&asking("¿Cuál es el mayorista con más noches?"))
            .await
            .unwrap();
        assert_eq!(decision.assigned_specialists, vec![SpecialistId::DataAnalyst]);
    }

    #[tokio::test]
    async fn test_prior_answer_is_reused() {
        let (router, _) = router_with(json!({
            "assigned_agents": ["data_analyst"]
        }));

        let mut state = asking("Revenue by category in 2025?");
        state.push_assistant("# Revenue by category in 2025?\n\n| a | b |\n|---|---|\n| 1 | 2 |");
        state.push_user("revenue by category in 2025");

        let decision = router.route(&state).await.unwrap();
        assert!(decision.is_terminal());
        assert_eq!(decision.clarifying(), None);
        assert!(decision.commentary.contains("Reusing"));
    }

    #[tokio::test]
    async fn test_unknown_specialist_is_routing_error() {
        let (router, _) = router_with(json!({
            "assigned_agents": ["sql_wizard"]
        }));

        let err = router.route(&asking("Revenue?")).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Routing(_)));
    }

    #[tokio::test]
    async fn test_service_failure_aborts_routing() {
        let reasoning = Arc::new(
            ScriptedReasoning::new().script(ROUTER, vec![Err("connection reset".to_string())]),
        );
        let router = Router::new(
            reasoning,
            AgentProfile::router(&ModelConfig::default()),
            ToolSet::empty(),
            Vec::new(),
        );

        let err = router.route(&asking("Revenue?")).await.unwrap_err();
        assert_eq!(err.kind(), "service");
    }

    #[test]
    fn test_mentions_chart() {
        assert!(mentions_chart("Show a bar chart of nights"));
        assert!(mentions_chart("Muéstrame un gráfico de ingresos"));
        assert!(mentions_chart("can you visualize it"));
        assert!(mentions_chart("plot revenue"));
        assert!(!mentions_chart("Summarize this paragraph"));
        assert!(!mentions_chart("What is total revenue by room category in 2025?"));
    }
}
