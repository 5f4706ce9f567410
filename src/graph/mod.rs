//! Chart pipeline: generate plotting code, render it in the sandbox, publish
//! the image.
//!
//! The pipeline runs on a dedicated worker thread with its own runtime so
//! rendering never competes with request handling. Callers submit jobs
//! through a [`GraphHandle`].

pub mod publish;
pub mod sandbox;

use crate::agent::{invoke_structured, AgentProfile, ReasoningService, ToolSet};
use crate::error::WorkflowError;
use crate::models::{GraphArtifact, Row, Turn};
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::{debug, info};

pub use publish::HttpPublisher;
pub use sandbox::PythonSandbox;

/// Turns plotting code plus a table into image bytes.
#[async_trait]
pub trait ChartRenderer: Send + Sync {
    async fn render(&self, code: &str, table: &[Row]) -> Result<Vec<u8>, WorkflowError>;
}

/// File-hosting collaborator.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Upload the image and return its public URL.
    async fn publish(&self, image: Vec<u8>) -> Result<String, WorkflowError>;
}

/// Shape the graph-code profile must return.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct GraphCode {
    /// Python source using only `table_data`, `img_buf`, `pd` and `plt`.
    pub code: String,
}

pub struct GraphPipeline {
    reasoning: Arc<dyn ReasoningService>,
    profile: AgentProfile,
    renderer: Arc<dyn ChartRenderer>,
    publisher: Arc<dyn Publisher>,
}

impl GraphPipeline {
    pub fn new(
        reasoning: Arc<dyn ReasoningService>,
        profile: AgentProfile,
        renderer: Arc<dyn ChartRenderer>,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        Self {
            reasoning,
            profile,
            renderer,
            publisher,
        }
    }

    pub async fn run(&self, table: &[Row], question: &str) -> Result<GraphArtifact, WorkflowError> {
        if table.is_empty() {
            return Err(WorkflowError::SandboxExecution("no rows to chart".to_string()));
        }

        let columns: Vec<&String> = table[0].keys().collect();
        let request = json!({
            "question": question,
            "columns": columns,
            "table_data": table,
        });
        let conversation = [Turn::user(request.to_string())];

        let generated: GraphCode = invoke_structured(
            self.reasoning.as_ref(),
            &self.profile,
            &conversation,
            &ToolSet::empty(),
        )
        .await?;
        debug!("Generated chart code:\n{}", generated.code);

        let image = self.renderer.render(&generated.code, table).await?;
        if image.is_empty() {
            return Err(WorkflowError::SandboxExecution(
                "chart code produced no image".to_string(),
            ));
        }

        let url = self.publisher.publish(image).await?;
        info!("Chart published at {}", url);

        Ok(GraphArtifact {
            generation_code: generated.code,
            image_reference: url,
        })
    }
}

struct GraphJob {
    table: Vec<Row>,
    question: String,
    reply: oneshot::Sender<Result<GraphArtifact, WorkflowError>>,
}

/// Submits chart jobs to the graph worker.
#[derive(Clone)]
pub struct GraphHandle {
    jobs: mpsc::Sender<GraphJob>,
}

impl GraphHandle {
    pub async fn render(&self, table: Vec<Row>, question: &str) -> Result<GraphArtifact, WorkflowError> {
        let (reply, receiver) = oneshot::channel();
        self.jobs
            .send(GraphJob {
                table,
                question: question.to_string(),
                reply,
            })
            .await
            .map_err(|_| WorkflowError::SandboxExecution("graph worker is gone".to_string()))?;

        receiver.await.map_err(|_| {
            WorkflowError::SandboxExecution("graph worker dropped the job".to_string())
        })?
    }
}

/// Dedicated thread running the graph pipeline.
pub struct GraphWorker;

impl GraphWorker {
    /// Start the worker; it stops once every [`GraphHandle`] is dropped.
    pub fn spawn(pipeline: GraphPipeline, max_concurrent: usize) -> std::io::Result<GraphHandle> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (jobs, mut queue) = mpsc::channel::<GraphJob>(32);

        std::thread::Builder::new()
            .name("graph-worker".to_string())
            .spawn(move || {
                let pipeline = Arc::new(pipeline);
                let permits = Arc::new(Semaphore::new(max_concurrent.max(1)));

                runtime.block_on(async move {
                    while let Some(job) = queue.recv().await {
                        let Ok(permit) = permits.clone().acquire_owned().await else {
                            break;
                        };
                        let pipeline = pipeline.clone();
                        tokio::spawn(async move {
                            let _permit = permit;
                            let result = pipeline.run(&job.table, &job.question).await;
                            let _ = job.reply.send(result);
                        });
                    }
                    debug!("Graph worker stopping");
                });
            })?;

        info!("Graph worker started ({} concurrent renders)", max_concurrent.max(1));
        Ok(GraphHandle { jobs })
    }
}


#[cfg(test)]
mod tests {
    use super::fakes::{FakePublisher, FakeRenderer};
    use super::*;
    use crate::agent::profiles::GRAPH_CODE;
    use crate::agent::testing::ScriptedReasoning;
    use crate::config::ModelConfig;
    use std::sync::atomic::Ordering;

    fn table() -> Vec<Row> {
        serde_json::from_value(json!([
            {"month": "2025-01", "nights": 40},
            {"month": "2025-02", "nights": 52}
        ]))
        .unwrap()
    }

    fn pipeline(renderer: FakeRenderer, publisher: Arc<FakePublisher>) -> GraphPipeline {
        let reasoning = Arc::new(ScriptedReasoning::new().respond(
            GRAPH_CODE,
            json!({"code": "plt.bar([r['month'] for r in table_data], [r['nights'] for r in table_data])\nplt.savefig(img_buf, format='png')"}),
        ));
        GraphPipeline::new(
            reasoning,
            AgentProfile::graph_code(&ModelConfig::default()),
            Arc::new(renderer),
            publisher,
        )
    }

    #[tokio::test]
    async fn test_pipeline_publishes_rendered_chart() {
        let publisher = Arc::new(FakePublisher::default());
        let pipeline = pipeline(
            FakeRenderer {
                bytes: vec![1, 2, 3],
                fail: false,
            },
            publisher.clone(),
        );

        let artifact = pipeline.run(&table(), "Plot nights per month").await.unwrap();
        assert_eq!(artifact.image_reference, "https://files.example.com/charts/1.png");
        assert!(artifact.generation_code.contains("img_buf"));
        assert_eq!(publisher.uploads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_image_is_not_published() {
        let publisher = Arc::new(FakePublisher::default());
        let pipeline = pipeline(
            FakeRenderer {
                bytes: Vec::new(),
                fail: false,
            },
            publisher.clone(),
        );

        let err = pipeline.run(&table(), "Plot").await.unwrap_err();
        assert_eq!(err.kind(), "sandbox_execution");
        assert_eq!(publisher.uploads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_worker_runs_jobs_off_the_caller_runtime() {
        let publisher = Arc::new(FakePublisher::default());
        let handle = GraphWorker::spawn(
            pipeline(
                FakeRenderer {
                    bytes: vec![7],
                    fail: false,
                },
                publisher,
            ),
            2,
        )
        .unwrap();

        let (a, b) = tokio::join!(
            handle.render(table(), "Plot A"),
            handle.render(table(), "Plot B")
        );
        let mut urls = vec![a.unwrap().image_reference, b.unwrap().image_reference];
        urls.sort();
        assert_eq!(
            urls,
            vec![
                "https://files.example.com/charts/1.png",
                "https://files.example.com/charts/2.png"
            ]
        );
    }
}
