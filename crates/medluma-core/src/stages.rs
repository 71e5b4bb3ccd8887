//! Static pipeline definition: stage names, models, instruction templates and
//! output keys. This is the configuration data the rest of the crate wires
//! into a `graph_flow` graph.

use std::collections::HashMap;

use graph_flow::Context;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ModelsConfig;

/// Session state keys shared between stages. Later stages read values written
/// by earlier ones; names are part of the interchange format and must not
/// change.
pub mod keys {
    pub const QUERY: &str = "query";
    pub const USER_PREFERENCE: &str = "user_preference";
    pub const BIO_RESEARCH: &str = "bio_research";
    pub const HEALTH_RESEARCH: &str = "health_research";
    pub const EXECUTIVE_SUMMARY: &str = "executive_summary";
    pub const CURRENT_SCIENCE_ARTICLE: &str = "current_science_article";
    pub const CRITIQUE: &str = "critique";
    pub const FINAL_OUTPUT: &str = "final_output";
}

/// Critique text that terminates the refinement loop. Anything else, byte for
/// byte, means "needs revision".
pub const APPROVAL_SENTINEL: &str = "APPROVED";

/// External tool a stage depends on. Execution of the tool itself lives behind
/// the model client.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum StageTool {
    BioMcp,
    WebSearch,
}

/// One LLM-backed stage: a model, an instruction template and the key its
/// output lands under.
#[derive(Debug, Clone)]
pub struct StageSpec {
    pub name: &'static str,
    pub model: String,
    pub instruction: &'static str,
    pub output_key: &'static str,
    pub tool: Option<StageTool>,
}

/// The fixed MedLuma pipeline, in execution order after the coordinator.
#[derive(Debug, Clone)]
pub struct PipelineSpec {
    pub bio_researcher: StageSpec,
    pub health_researcher: StageSpec,
    pub aggregator: StageSpec,
    pub initial_writer: StageSpec,
    pub critic: StageSpec,
    pub refiner: StageSpec,
}

impl PipelineSpec {
    pub fn new(models: &ModelsConfig) -> Self {
        Self {
            bio_researcher: StageSpec {
                name: "bio_researcher",
                model: models.flash.clone(),
                instruction: "You are a researcher. Use the mcp tool to find research and clinical trial information about: {query}. Include known mutations associated with this disease. Only output a brief summary with appropriate references.",
                output_key: keys::BIO_RESEARCH,
                tool: Some(StageTool::BioMcp),
            },
            health_researcher: StageSpec {
                name: "health_researcher",
                model: models.flash_lite.clone(),
                instruction: "Research recent medical breakthroughs for: {query}. Include 3 significant advances, their practical applications, and estimated timelines. Keep the report concise (100 words). Include relevant references.",
                output_key: keys::HEALTH_RESEARCH,
                tool: Some(StageTool::WebSearch),
            },
            aggregator: StageSpec {
                name: "aggregator",
                model: models.flash_lite.clone(),
                instruction: "Combine these findings into an executive summary:\n**Research:** {bio_research}\n**News:** {health_research}\nHighlight key takeaways (200 words).",
                output_key: keys::EXECUTIVE_SUMMARY,
                tool: None,
            },
            initial_writer: StageSpec {
                name: "initial_writer",
                model: models.flash_lite.clone(),
                instruction: "Based on: {executive_summary}, write a first draft article (100-150 words). Output only the article text.",
                output_key: keys::CURRENT_SCIENCE_ARTICLE,
                tool: None,
            },
            critic: StageSpec {
                name: "critic",
                model: models.flash_lite.clone(),
                instruction: "Review: {current_science_article}\nIf well-written with references: respond \"APPROVED\"\nOtherwise: provide 2-3 suggestions.",
                output_key: keys::CRITIQUE,
                tool: None,
            },
            refiner: StageSpec {
                name: "refiner",
                model: models.flash_lite.clone(),
                instruction: "Draft: {current_science_article}\nCritique: {critique}\nRewrite the draft incorporating the feedback. Output only the article text.",
                output_key: keys::CURRENT_SCIENCE_ARTICLE,
                tool: None,
            },
        }
    }
}

impl Default for PipelineSpec {
    fn default() -> Self {
        Self::new(&ModelsConfig::default())
    }
}

/// Output preference chosen through the confirmation gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputPreference {
    Comprehensive,
    Simple,
}

impl OutputPreference {
    /// Anything that is not recognisably "comprehensive" defaults to simple.
    pub fn from_answer(answer: &str) -> Self {
        if answer.trim().eq_ignore_ascii_case("comprehensive") {
            Self::Comprehensive
        } else {
            Self::Simple
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Comprehensive => "comprehensive",
            Self::Simple => "simple",
        }
    }
}

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([a-z_]+)\}").expect("invalid placeholder regex"));

/// Render an instruction template by substituting `{key}` placeholders from
/// the session context. Missing keys render empty.
pub async fn render_instruction(template: &str, context: &Context) -> String {
    let mut values: HashMap<String, String> = HashMap::new();
    for captures in PLACEHOLDER.captures_iter(template) {
        let key = captures[1].to_string();
        if values.contains_key(&key) {
            continue;
        }
        let value: String = context.get(&key).await.unwrap_or_default();
        if value.is_empty() {
            debug!(key = %key, "instruction placeholder resolved empty");
        }
        values.insert(key, value);
    }

    PLACEHOLDER
        .replace_all(template, |captures: &regex::Captures| {
            values
                .get(&captures[1])
                .cloned()
                .unwrap_or_default()
        })
        .to_string()
}
