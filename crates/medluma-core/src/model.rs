//! Opaque model-invocation seam: run a stage instruction against a model,
//! get produced text back. Retry, tool-calling and transport concerns live
//! entirely behind this trait.

use anyhow::Result;
use async_trait::async_trait;

use crate::biomcp::BioMcpServerConfig;
use crate::stages::{APPROVAL_SENTINEL, StageTool};

/// One model invocation on behalf of a stage.
#[derive(Debug, Clone)]
pub struct ModelRequest<'a> {
    pub stage: &'a str,
    pub model: &'a str,
    pub instruction: &'a str,
    pub tool: Option<StageTool>,
    pub tool_server: Option<&'a BioMcpServerConfig>,
}

#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn generate(&self, request: ModelRequest<'_>) -> Result<String>;
}

/// Deterministic offline client: plausible fixed text per stage, with the
/// critic approving on sight so offline runs complete in one cycle.
#[derive(Debug, Default, Clone)]
pub struct CannedModelClient;

#[async_trait]
impl ModelClient for CannedModelClient {
    async fn generate(&self, request: ModelRequest<'_>) -> Result<String> {
        tracing::debug!(stage = %request.stage, model = %request.model, "canned model response");

        let text = match request.stage {
            "bio_researcher" => {
                "Clinical trials report progress on targeted therapies; APC mutations remain the \
                 primary driver. References: [1] ClinicalTrials.gov NCT000000, [2] PubMed 12345678."
            }
            "health_researcher" => {
                "Three advances: improved screening (available now), gene-targeted therapy \
                 (trials, ~3 years), AI-assisted diagnosis (~5 years). References: [1] Nature \
                 Medicine 2025."
            }
            "aggregator" => {
                "Executive summary: research and recent news converge on earlier detection and \
                 targeted treatment as the key takeaways."
            }
            "initial_writer" => {
                "Recent work on this disease points toward earlier detection and therapies \
                 targeting its underlying mutations, with several advances expected to reach \
                 patients within five years."
            }
            "critic" => APPROVAL_SENTINEL,
            "refiner" => {
                "Revised article incorporating reviewer feedback, with references attached."
            }
            other => {
                anyhow::bail!("no canned response for stage {other}");
            }
        };

        Ok(text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn canned_critic_approves() {
        let client = CannedModelClient;
        let request = ModelRequest {
            stage: "critic",
            model: "gemini-2.5-flash-lite",
            instruction: "Review: ...",
            tool: None,
            tool_server: None,
        };
        assert_eq!(client.generate(request).await.unwrap(), "APPROVED");
    }

    #[tokio::test]
    async fn unknown_stage_is_an_error() {
        let client = CannedModelClient;
        let request = ModelRequest {
            stage: "mystery",
            model: "gemini-2.5-flash-lite",
            instruction: "",
            tool: None,
            tool_server: None,
        };
        assert!(client.generate(request).await.is_err());
    }
}
