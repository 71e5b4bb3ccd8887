use std::sync::Arc;

use anyhow::{Result, anyhow};
use graph_flow::{
    ExecutionStatus, FlowRunner, GraphBuilder, InMemorySessionStorage, Session, SessionStorage,
    Task,
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::biomcp::BioMcpServerConfig;
use crate::confirm::{
    CONFIRMATION_REQUEST_KEY, CONFIRMATION_RESPONSE_KEY, ConfirmationRequest, ConfirmationResponse,
};
use crate::logging::{SessionLogInput, log_session_completion};
use crate::model::{CannedModelClient, ModelClient};
use crate::stages::{PipelineSpec, keys};
use crate::tasks::{
    CoordinatorTask, FinalOutputTask, LlmStageTask, LoopVerdict, PIPELINE_ERROR_KEY,
    REFINE_CONTINUE_KEY, REFINE_CYCLES_KEY, REFINE_VERDICT_KEY, RefinerTask,
};

struct PipelineTasks {
    coordinator: Arc<CoordinatorTask>,
    bio_researcher: Arc<LlmStageTask>,
    health_researcher: Arc<LlmStageTask>,
    aggregator: Arc<LlmStageTask>,
    initial_writer: Arc<LlmStageTask>,
    critic: Arc<LlmStageTask>,
    refiner: Arc<RefinerTask>,
    final_output: Arc<FinalOutputTask>,
}

fn build_graph(
    spec: PipelineSpec,
    client: Arc<dyn ModelClient>,
    max_refine_cycles: u32,
    biomcp: Option<BioMcpServerConfig>,
) -> (Arc<graph_flow::Graph>, PipelineTasks) {
    let tasks = PipelineTasks {
        coordinator: Arc::new(CoordinatorTask),
        bio_researcher: Arc::new(
            LlmStageTask::new(spec.bio_researcher.clone(), client.clone()).with_tool_server(biomcp),
        ),
        health_researcher: Arc::new(LlmStageTask::new(
            spec.health_researcher.clone(),
            client.clone(),
        )),
        aggregator: Arc::new(LlmStageTask::new(spec.aggregator.clone(), client.clone())),
        initial_writer: Arc::new(LlmStageTask::new(spec.initial_writer.clone(), client.clone())),
        critic: Arc::new(LlmStageTask::new(spec.critic.clone(), client.clone())),
        refiner: Arc::new(RefinerTask::new(
            spec.refiner.clone(),
            client,
            max_refine_cycles,
        )),
        final_output: Arc::new(FinalOutputTask),
    };

    let builder = GraphBuilder::new("medluma_report_pipeline")
        .add_task(tasks.coordinator.clone())
        .add_task(tasks.bio_researcher.clone())
        .add_task(tasks.health_researcher.clone())
        .add_task(tasks.aggregator.clone())
        .add_task(tasks.initial_writer.clone())
        .add_task(tasks.critic.clone())
        .add_task(tasks.refiner.clone())
        .add_task(tasks.final_output.clone())
        .add_edge(tasks.coordinator.id(), tasks.bio_researcher.id())
        .add_edge(tasks.bio_researcher.id(), tasks.health_researcher.id())
        .add_edge(tasks.health_researcher.id(), tasks.aggregator.id())
        .add_edge(tasks.aggregator.id(), tasks.initial_writer.id())
        .add_edge(tasks.initial_writer.id(), tasks.critic.id())
        .add_edge(tasks.critic.id(), tasks.refiner.id())
        // The loop driver: keep cycling while the refiner asks for another
        // critique pass, otherwise fall through to final formatting.
        .add_conditional_edge(
            tasks.refiner.id(),
            |ctx| ctx.get_sync::<bool>(REFINE_CONTINUE_KEY).unwrap_or(false),
            tasks.critic.id(),
            tasks.final_output.id(),
        )
        .set_start_task(tasks.coordinator.id());

    (Arc::new(builder.build()), tasks)
}

fn new_session_id() -> String {
    format!("medluma-{}", Uuid::new_v4())
}

/// Options for starting a report session.
pub struct SessionOptions<'a> {
    pub query: &'a str,
    pub session_id: Option<String>,
    storage: Option<Arc<dyn SessionStorage>>,
    client: Option<Arc<dyn ModelClient>>,
    spec: Option<PipelineSpec>,
    max_refine_cycles: u32,
    biomcp: Option<BioMcpServerConfig>,
}

impl<'a> SessionOptions<'a> {
    pub fn new(query: &'a str) -> Self {
        Self {
            query,
            session_id: None,
            storage: None,
            client: None,
            spec: None,
            max_refine_cycles: 2,
            biomcp: None,
        }
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Share storage with later `resume` calls; required for any session that
    /// pauses at the confirmation gate.
    pub fn with_shared_storage(mut self, storage: Arc<dyn SessionStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_model_client(mut self, client: Arc<dyn ModelClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn with_pipeline_spec(mut self, spec: PipelineSpec) -> Self {
        self.spec = Some(spec);
        self
    }

    pub fn with_max_refine_cycles(mut self, max_refine_cycles: u32) -> Self {
        self.max_refine_cycles = max_refine_cycles;
        self
    }

    pub fn with_biomcp_server(mut self, server: BioMcpServerConfig) -> Self {
        self.biomcp = Some(server);
        self
    }
}

/// Options for resuming a session paused at the confirmation gate.
pub struct ResumeOptions {
    pub session_id: String,
    pub response: ConfirmationResponse,
    storage: Option<Arc<dyn SessionStorage>>,
    client: Option<Arc<dyn ModelClient>>,
    spec: Option<PipelineSpec>,
    max_refine_cycles: u32,
    biomcp: Option<BioMcpServerConfig>,
}

impl ResumeOptions {
    pub fn new(session_id: impl Into<String>, response: ConfirmationResponse) -> Self {
        Self {
            session_id: session_id.into(),
            response,
            storage: None,
            client: None,
            spec: None,
            max_refine_cycles: 2,
            biomcp: None,
        }
    }

    pub fn with_shared_storage(mut self, storage: Arc<dyn SessionStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_model_client(mut self, client: Arc<dyn ModelClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn with_pipeline_spec(mut self, spec: PipelineSpec) -> Self {
        self.spec = Some(spec);
        self
    }

    pub fn with_max_refine_cycles(mut self, max_refine_cycles: u32) -> Self {
        self.max_refine_cycles = max_refine_cycles;
        self
    }

    pub fn with_biomcp_server(mut self, server: BioMcpServerConfig) -> Self {
        self.biomcp = Some(server);
        self
    }
}

/// Where a session stands after a drive through the graph.
#[derive(Debug, Clone)]
pub enum SessionProgress {
    /// Suspended at the confirmation gate; answer and call `resume_report_session`.
    AwaitingConfirmation {
        session_id: String,
        request: ConfirmationRequest,
    },
    Completed(SessionOutcome),
}

/// Final state of a completed session.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub session_id: String,
    pub final_output: String,
    pub user_preference: String,
    pub critique: Option<String>,
    pub refine_cycles: u32,
    pub verdict: Option<LoopVerdict>,
}

impl SessionOutcome {
    pub fn approved(&self) -> bool {
        matches!(self.verdict, Some(LoopVerdict::Approved))
    }

    async fn from_session(session: &Session, session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            final_output: session
                .context
                .get(keys::FINAL_OUTPUT)
                .await
                .unwrap_or_default(),
            user_preference: session
                .context
                .get(keys::USER_PREFERENCE)
                .await
                .unwrap_or_default(),
            critique: session.context.get(keys::CRITIQUE).await,
            refine_cycles: session.context.get(REFINE_CYCLES_KEY).await.unwrap_or(0),
            verdict: session.context.get(REFINE_VERDICT_KEY).await,
        }
    }
}

/// Run the report pipeline end-to-end with default settings (offline model
/// client), answering the confirmation gate with `answer`.
pub async fn run_report_session(query: &str, answer: &str) -> Result<SessionOutcome> {
    let storage: Arc<dyn SessionStorage> = Arc::new(InMemorySessionStorage::new());
    let options = SessionOptions::new(query).with_shared_storage(storage.clone());

    let progress = run_report_session_with_options(options).await?;
    let (session_id, request) = match progress {
        SessionProgress::Completed(outcome) => return Ok(outcome),
        SessionProgress::AwaitingConfirmation {
            session_id,
            request,
        } => (session_id, request),
    };

    let response = ConfirmationResponse::confirmed(request.id, answer);
    let resumed = resume_report_session(
        ResumeOptions::new(session_id, response).with_shared_storage(storage),
    )
    .await?;

    match resumed {
        SessionProgress::Completed(outcome) => Ok(outcome),
        SessionProgress::AwaitingConfirmation { .. } => {
            Err(anyhow!("pipeline paused again after confirmation"))
        }
    }
}

/// Run the report pipeline until it completes or suspends at the gate.
pub async fn run_report_session_with_options(options: SessionOptions<'_>) -> Result<SessionProgress> {
    let client = options
        .client
        .unwrap_or_else(|| Arc::new(CannedModelClient));
    let spec = options.spec.unwrap_or_default();
    let (graph, tasks) = build_graph(spec, client, options.max_refine_cycles, options.biomcp);

    let storage = options
        .storage
        .unwrap_or_else(|| Arc::new(InMemorySessionStorage::new()));
    let runner = FlowRunner::new(graph, storage.clone());

    let session_id = options.session_id.clone().unwrap_or_else(new_session_id);
    let session = Session::new_from_task(session_id.clone(), tasks.coordinator.id());

    session
        .context
        .set(keys::QUERY, options.query.to_string())
        .await;

    storage
        .save(session)
        .await
        .map_err(|err| anyhow!("failed to persist session: {err}"))?;

    info!(session_id = %session_id, "starting report session");
    drive_session(&runner, &storage, &session_id).await
}

/// Resume a session paused at the confirmation gate with the user's answer.
pub async fn resume_report_session(options: ResumeOptions) -> Result<SessionProgress> {
    let client = options
        .client
        .unwrap_or_else(|| Arc::new(CannedModelClient));
    let spec = options.spec.unwrap_or_default();
    let (graph, _tasks) = build_graph(spec, client, options.max_refine_cycles, options.biomcp);

    let storage = options
        .storage
        .ok_or_else(|| anyhow!("resume requires the storage the session was started with"))?;
    let runner = FlowRunner::new(graph, storage.clone());

    let session = load_session(&storage, &options.session_id).await?;
    session
        .context
        .set(CONFIRMATION_RESPONSE_KEY, &options.response)
        .await;
    storage
        .save(session)
        .await
        .map_err(|err| anyhow!("failed to persist confirmation response: {err}"))?;

    info!(session_id = %options.session_id, confirmed = options.response.confirmed, "resuming report session");
    drive_session(&runner, &storage, &options.session_id).await
}

async fn drive_session(
    runner: &FlowRunner,
    storage: &Arc<dyn SessionStorage>,
    session_id: &str,
) -> Result<SessionProgress> {
    loop {
        let result = runner
            .run(session_id)
            .await
            .map_err(|err| anyhow!("graph execution failure: {err}"))?;

        match result.status {
            ExecutionStatus::Completed => break,
            ExecutionStatus::WaitingForInput => {
                let session = load_session(storage, session_id).await?;
                let request: ConfirmationRequest = session
                    .context
                    .get(CONFIRMATION_REQUEST_KEY)
                    .await
                    .ok_or_else(|| {
                        anyhow!("pipeline suspended without a pending confirmation request")
                    })?;
                return Ok(SessionProgress::AwaitingConfirmation {
                    session_id: session_id.to_string(),
                    request,
                });
            }
            ExecutionStatus::Error(message) => return Err(anyhow!(message)),
        }
    }

    let session = load_session(storage, session_id).await?;

    if let Some(error) = session.context.get::<String>(PIPELINE_ERROR_KEY).await {
        return Err(anyhow!("pipeline failed: {error}"));
    }

    let outcome = SessionOutcome::from_session(&session, session_id).await;

    let query: String = session.context.get(keys::QUERY).await.unwrap_or_default();
    if let Err(err) = log_session_completion(SessionLogInput {
        session_id: outcome.session_id.clone(),
        query: Some(query),
        preference: outcome.user_preference.clone(),
        approved: outcome.approved(),
        refine_cycles: outcome.refine_cycles,
        final_output: outcome.final_output.clone(),
    }) {
        warn!(error = %err, "failed to append session log");
    }

    Ok(SessionProgress::Completed(outcome))
}

async fn load_session(
    storage: &Arc<dyn SessionStorage>,
    session_id: &str,
) -> Result<Session> {
    storage
        .get(session_id)
        .await
        .map_err(|err| anyhow!("failed to load session: {err}"))?
        .ok_or_else(|| anyhow!("session {session_id} not found in storage"))
}
