use std::sync::Arc;

use async_trait::async_trait;
use graph_flow::{Context, NextAction, Task, TaskResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use crate::MedLumaError;
use crate::biomcp::BioMcpServerConfig;
use crate::confirm::{
    CONFIRMATION_REQUEST_KEY, CONFIRMATION_RESPONSE_KEY, ConfirmationRequest,
    ConfirmationResponse, ConfirmationStatus, resolve,
};
use crate::model::{ModelClient, ModelRequest};
use crate::stages::{
    APPROVAL_SENTINEL, OutputPreference, StageSpec, keys, render_instruction,
};

/// Number of completed critique/revise cycles.
pub const REFINE_CYCLES_KEY: &str = "refine.cycles";
/// Checked by the loop driver edge: `true` keeps the loop going.
pub const REFINE_CONTINUE_KEY: &str = "refine.continue";
/// Terminal [`LoopVerdict`] of the refinement loop.
pub const REFINE_VERDICT_KEY: &str = "refine.verdict";
/// Explicit exit signal recorded when the critic approves.
pub const LOOP_SIGNAL_KEY: &str = "refine.signal";
/// Set by any stage whose model call failed; ends the graph.
pub const PIPELINE_ERROR_KEY: &str = "pipeline.error";

/// How the refinement loop left its most recent cycle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LoopVerdict {
    Revise,
    Approved,
    IterationLimitReached,
}

/// Exit signal recorded when the critic approves the draft.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoopSignal {
    pub status: String,
    pub message: String,
}

impl LoopSignal {
    pub fn approved() -> Self {
        Self {
            status: "approved".to_string(),
            message: "Article approved.".to_string(),
        }
    }
}

async fn fail_stage(
    context: &Context,
    stage: &str,
    err: anyhow::Error,
) -> graph_flow::Result<TaskResult> {
    let error = MedLumaError::model(stage, err.to_string());
    error!(stage = %stage, error = %error, "stage failed; ending pipeline");
    context.set(PIPELINE_ERROR_KEY, error.to_string()).await;
    Ok(TaskResult::new(Some(error.to_string()), NextAction::End))
}

/// Confirmation gate. Raises the output-format question on first invocation
/// and suspends; resolves the recorded answer on re-invocation after resume.
#[derive(Default)]
pub struct CoordinatorTask;

#[async_trait]
impl Task for CoordinatorTask {
    fn id(&self) -> &str {
        "coordinator"
    }

    #[instrument(name = "task.coordinator", skip(self, context))]
    async fn run(&self, context: Context) -> graph_flow::Result<TaskResult> {
        let request: Option<ConfirmationRequest> = context.get(CONFIRMATION_REQUEST_KEY).await;
        let response: Option<ConfirmationResponse> = context.get(CONFIRMATION_RESPONSE_KEY).await;

        let request = match request {
            Some(request) => request,
            None => {
                let request = ConfirmationRequest::output_format();
                context.set(CONFIRMATION_REQUEST_KEY, &request).await;
                info!(request_id = %request.id, "requesting output preference");
                return Ok(TaskResult::new(
                    Some("Waiting for user preference...".to_string()),
                    NextAction::WaitForInput,
                ));
            }
        };

        let preference = match resolve(&request, response.as_ref()) {
            ConfirmationStatus::Pending => {
                debug!(request_id = %request.id, "confirmation still unanswered");
                return Ok(TaskResult::new(
                    Some("Waiting for user preference...".to_string()),
                    NextAction::WaitForInput,
                ));
            }
            ConfirmationStatus::Confirmed => response
                .map(|response| OutputPreference::from_answer(&response.answer))
                .unwrap_or(OutputPreference::Simple),
            ConfirmationStatus::Rejected => {
                warn!(request_id = %request.id, "user cancelled; defaulting to simple output");
                OutputPreference::Simple
            }
        };

        context
            .set(keys::USER_PREFERENCE, preference.as_str().to_string())
            .await;
        info!(preference = preference.as_str(), "user preference recorded");

        Ok(TaskResult::new(
            Some(format!("User preference: {}", preference.as_str())),
            NextAction::ContinueAndExecute,
        ))
    }
}

/// Generic LLM-backed stage: render the instruction template from the session
/// context, call the model, store the text under the stage's output key.
pub struct LlmStageTask {
    spec: StageSpec,
    client: Arc<dyn ModelClient>,
    tool_server: Option<BioMcpServerConfig>,
}

impl LlmStageTask {
    pub fn new(spec: StageSpec, client: Arc<dyn ModelClient>) -> Self {
        Self {
            spec,
            client,
            tool_server: None,
        }
    }

    pub fn with_tool_server(mut self, server: Option<BioMcpServerConfig>) -> Self {
        self.tool_server = server;
        self
    }
}

#[async_trait]
impl Task for LlmStageTask {
    fn id(&self) -> &str {
        self.spec.name
    }

    #[instrument(name = "task.stage", skip(self, context), fields(stage = %self.spec.name))]
    async fn run(&self, context: Context) -> graph_flow::Result<TaskResult> {
        let instruction = render_instruction(self.spec.instruction, &context).await;
        let request = ModelRequest {
            stage: self.spec.name,
            model: &self.spec.model,
            instruction: &instruction,
            tool: self.spec.tool,
            tool_server: self.tool_server.as_ref(),
        };

        match self.client.generate(request).await {
            Ok(text) => {
                debug!(output_key = self.spec.output_key, chars = text.len(), "stage produced output");
                context.set(self.spec.output_key, text).await;
                Ok(TaskResult::new(
                    Some(format!("{} completed", self.spec.name)),
                    NextAction::ContinueAndExecute,
                ))
            }
            Err(err) => fail_stage(&context, self.spec.name, err).await,
        }
    }
}

/// Revising half of the bounded refinement loop.
///
/// A critique exactly equal to the approval sentinel ends the loop immediately
/// with zero model calls and the draft untouched. Anything else is treated as
/// "needs revision": one rewrite, one counted cycle, capped at `max_cycles`.
pub struct RefinerTask {
    spec: StageSpec,
    client: Arc<dyn ModelClient>,
    max_cycles: u32,
}

impl RefinerTask {
    pub fn new(spec: StageSpec, client: Arc<dyn ModelClient>, max_cycles: u32) -> Self {
        Self {
            spec,
            client,
            max_cycles,
        }
    }
}

#[async_trait]
impl Task for RefinerTask {
    fn id(&self) -> &str {
        self.spec.name
    }

    #[instrument(name = "task.refiner", skip(self, context))]
    async fn run(&self, context: Context) -> graph_flow::Result<TaskResult> {
        let critique: String = context.get(keys::CRITIQUE).await.unwrap_or_default();

        if critique == APPROVAL_SENTINEL {
            let signal = LoopSignal::approved();
            context.set(LOOP_SIGNAL_KEY, &signal).await;
            context.set(REFINE_VERDICT_KEY, &LoopVerdict::Approved).await;
            context.set_sync(REFINE_CONTINUE_KEY, false);
            info!("critique approved the draft; exiting refinement loop");
            return Ok(TaskResult::new(
                Some(signal.message),
                NextAction::ContinueAndExecute,
            ));
        }

        let instruction = render_instruction(self.spec.instruction, &context).await;
        let request = ModelRequest {
            stage: self.spec.name,
            model: &self.spec.model,
            instruction: &instruction,
            tool: self.spec.tool,
            tool_server: None,
        };

        match self.client.generate(request).await {
            Ok(text) => {
                context.set(keys::CURRENT_SCIENCE_ARTICLE, text).await;
            }
            Err(err) => return fail_stage(&context, self.spec.name, err).await,
        }

        let cycles: u32 = context.get(REFINE_CYCLES_KEY).await.unwrap_or(0) + 1;
        context.set(REFINE_CYCLES_KEY, cycles).await;

        let verdict = if cycles >= self.max_cycles {
            LoopVerdict::IterationLimitReached
        } else {
            LoopVerdict::Revise
        };
        context.set_sync(REFINE_CONTINUE_KEY, matches!(verdict, LoopVerdict::Revise));
        context.set(REFINE_VERDICT_KEY, &verdict).await;

        info!(cycles, max_cycles = self.max_cycles, ?verdict, "refinement cycle complete");

        Ok(TaskResult::new(
            Some(format!("Refinement cycle {cycles} complete")),
            NextAction::ContinueAndExecute,
        ))
    }
}

/// Deterministic final formatting stage.
///
/// `simple` (the default for unrecognised or rejected answers) emits the
/// refined article verbatim; `comprehensive` assembles the sectioned report.
#[derive(Default)]
pub struct FinalOutputTask;

#[async_trait]
impl Task for FinalOutputTask {
    fn id(&self) -> &str {
        "final_output"
    }

    #[instrument(name = "task.final_output", skip(self, context))]
    async fn run(&self, context: Context) -> graph_flow::Result<TaskResult> {
        let preference_raw: String = context.get(keys::USER_PREFERENCE).await.unwrap_or_default();
        let preference = OutputPreference::from_answer(&preference_raw);
        let article: String = context
            .get(keys::CURRENT_SCIENCE_ARTICLE)
            .await
            .unwrap_or_default();

        let final_output = match preference {
            OutputPreference::Simple => article,
            OutputPreference::Comprehensive => {
                let executive_summary: String = context
                    .get(keys::EXECUTIVE_SUMMARY)
                    .await
                    .unwrap_or_default();
                let health_research: String = context
                    .get(keys::HEALTH_RESEARCH)
                    .await
                    .unwrap_or_default();
                let bio_research: String =
                    context.get(keys::BIO_RESEARCH).await.unwrap_or_default();

                format!(
                    "**BACKGROUND**\n{article}\n\n**EXECUTIVE SUMMARY**\n{executive_summary}\n\n**KEY DEVELOPMENTS**\n{health_research}\n\n**REFERENCES**\n{bio_research}"
                )
            }
        };

        context.set(keys::FINAL_OUTPUT, final_output.clone()).await;
        info!(preference = preference.as_str(), "final output assembled");

        Ok(TaskResult::new(Some(final_output), NextAction::End))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loop_signal_serializes_to_expected_payload() {
        let signal = LoopSignal::approved();
        let value = serde_json::to_value(&signal).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"status": "approved", "message": "Article approved."})
        );
    }
}
