//! Specialist dispatch and result merging.

use crate::agent::{invoke_structured, AgentProfile, ReasoningService, ToolSet};
use crate::config::DispatchMode;
use crate::error::WorkflowError;
use crate::models::{ConversationState, SpecialistId, SpecialistResult};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// A reasoning profile plus the tools it may call.
pub struct Specialist {
    pub id: SpecialistId,
    pub profile: AgentProfile,
    pub tools: ToolSet,
}

/// Result of one specialist invocation.
#[derive(Debug)]
pub struct SpecialistOutcome {
    pub id: SpecialistId,
    pub result: Result<SpecialistResult, WorkflowError>,
}

/// Runs specialists against conversation snapshots.
pub struct SpecialistInvoker {
    reasoning: Arc<dyn ReasoningService>,
    specialists: HashMap<SpecialistId, Arc<Specialist>>,
    mode: DispatchMode,
}

impl SpecialistInvoker {
    pub fn new(
        reasoning: Arc<dyn ReasoningService>,
        specialists: Vec<Specialist>,
        mode: DispatchMode,
    ) -> Self {
        let specialists = specialists
            .into_iter()
            .map(|s| (s.id, Arc::new(s)))
            .collect();

        Self {
            reasoning,
            specialists,
            mode,
        }
    }

    /// Invoke each `(id, snapshot)` job; outcomes come back in job order.
    ///
    /// Every job runs to completion even when another one fails.
    pub async fn run(&self, jobs: Vec<(SpecialistId, ConversationState)>) -> Vec<SpecialistOutcome> {
        match self.mode {
            DispatchMode::Concurrent if jobs.len() > 1 => self.run_concurrent(jobs).await,
            _ => self.run_sequential(jobs).await,
        }
    }

    async fn run_concurrent(
        &self,
        jobs: Vec<(SpecialistId, ConversationState)>,
    ) -> Vec<SpecialistOutcome> {
        let ids: Vec<SpecialistId> = jobs.iter().map(|(id, _)| *id).collect();
        info!("Dispatching {} specialists concurrently", ids.len());

        let mut set = JoinSet::new();
        for (index, (id, snapshot)) in jobs.into_iter().enumerate() {
            let reasoning = self.reasoning.clone();
            let specialist = self.specialists.get(&id).cloned();
            set.spawn(async move {
                let result = match specialist {
                    Some(s) => invoke(reasoning.as_ref(), &s, &snapshot).await,
                    None => Err(unregistered(id)),
                };
                (index, result)
            });
        }

        let mut slots: Vec<Option<Result<SpecialistResult, WorkflowError>>> =
            ids.iter().map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, result)) => slots[index] = Some(result),
                Err(e) => error!("Specialist task did not complete: {}", e),
            }
        }

        ids.into_iter()
            .zip(slots)
            .map(|(id, slot)| SpecialistOutcome {
                id,
                result: slot.unwrap_or_else(|| {
                    Err(WorkflowError::Service(format!("{} task did not complete", id)))
                }),
            })
            .collect()
    }

    /// One after another; each snapshot also sees the earlier results.
    async fn run_sequential(
        &self,
        jobs: Vec<(SpecialistId, ConversationState)>,
    ) -> Vec<SpecialistOutcome> {
        let mut carried: Vec<String> = Vec::new();
        let mut outcomes = Vec::with_capacity(jobs.len());

        for (id, mut snapshot) in jobs {
            for note in &carried {
                snapshot.push_assistant(note.clone());
            }

            let result = match self.specialists.get(&id) {
                Some(s) => invoke(self.reasoning.as_ref(), s, &snapshot).await,
                None => Err(unregistered(id)),
            };

            if let Ok(ref r) = result {
                if let Some(note) = carry_note(id, r) {
                    carried.push(note);
                }
            }
            outcomes.push(SpecialistOutcome { id, result });
        }

        outcomes
    }
}

async fn invoke(
    reasoning: &dyn ReasoningService,
    specialist: &Specialist,
    snapshot: &ConversationState,
) -> Result<SpecialistResult, WorkflowError> {
    debug!(
        "Invoking {} with {} turns",
        specialist.id,
        snapshot.len()
    );

    let result: SpecialistResult = invoke_structured(
        reasoning,
        &specialist.profile,
        snapshot.turns(),
        &specialist.tools,
    )
    .await
    .inspect_err(|e| warn!("{} failed: {}", specialist.id, e))?;

    info!(
        "{} returned {} rows",
        specialist.id,
        result.rows().len()
    );
    Ok(result)
}

fn unregistered(id: SpecialistId) -> WorkflowError {
    WorkflowError::Routing(format!("no specialist registered for {}", id))
}

fn carry_note(id: SpecialistId, result: &SpecialistResult) -> Option<String> {
    if result.findings.trim().is_empty() && !result.has_data() {
        return None;
    }

    let mut note = format!("### Result from {}\n{}", id, result.findings.trim());
    if result.has_data() {
        if let Ok(rows) = serde_json::to_string(result.rows()) {
            note.push_str("\n\nData: ");
            note.push_str(&rows);
        }
    }
    Some(note)
}

/// Merge per-specialist results in the given order.
///
/// Rows are concatenated. Findings get a `### Result from <id>` header when
/// more than one specialist wrote any. The first clarifying question wins.
pub fn merge(results: &[(SpecialistId, SpecialistResult)]) -> SpecialistResult {
    let rows: Vec<_> = results
        .iter()
        .flat_map(|(_, r)| r.rows().iter().cloned())
        .collect();

    let written: Vec<(SpecialistId, &str)> = results
        .iter()
        .map(|(id, r)| (*id, r.findings.trim()))
        .filter(|(_, f)| !f.is_empty())
        .collect();

    let findings = match written.as_slice() {
        [] => String::new(),
        [(_, only)] => only.to_string(),
        many => many
            .iter()
            .map(|(id, f)| format!("### Result from {}\n{}", id, f))
            .collect::<Vec<_>>()
            .join("\n\n"),
    };

    let clarifying_question = results
        .iter()
        .find_map(|(_, r)| r.clarifying().map(str::to_string));

    SpecialistResult {
        data: if rows.is_empty() { None } else { Some(rows) },
        findings,
        clarifying_question,
    }
}
