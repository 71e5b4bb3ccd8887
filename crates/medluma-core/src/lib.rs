//! MedLuma core built directly on top of `graph_flow`.
//!
//! A fixed disease-information report pipeline: a coordinator that pauses for
//! the user's output preference, two research stages, aggregation, article
//! drafting, a bounded critique/refine loop, and final formatting. The only
//! control flow original to this crate is the confirmation gate and the
//! refinement loop; agent sequencing and session persistence belong to
//! `graph_flow`, model invocation to the [`ModelClient`] seam.

mod biomcp;
mod confirm;
mod config;
mod error;
mod gemini;
mod logging;
mod model;
mod stages;
mod tasks;
mod workflow;

pub use biomcp::{BioMcpServerConfig, locate_biomcp};
pub use confirm::{
    CONFIRMATION_REQUEST_KEY, CONFIRMATION_RESPONSE_KEY, ConfirmationPayload, ConfirmationRequest,
    ConfirmationResponse, ConfirmationStatus, OUTPUT_FORMAT_HINT, resolve,
};
pub use config::{
    BioMcpSettings, Config, ConfigLoader, DEFAULT_FLASH_LITE_MODEL, DEFAULT_FLASH_MODEL,
    LoggingConfig, ModelsConfig, RefineConfig, RetryPolicy, require_env,
};
pub use error::MedLumaError;
pub use gemini::GeminiModelClient;
pub use logging::{SessionLogInput, log_session_completion};
pub use model::{CannedModelClient, ModelClient, ModelRequest};
pub use stages::{
    APPROVAL_SENTINEL, OutputPreference, PipelineSpec, StageSpec, StageTool, keys,
    render_instruction,
};
pub use tasks::{
    CoordinatorTask, FinalOutputTask, LOOP_SIGNAL_KEY, LlmStageTask, LoopSignal, LoopVerdict,
    REFINE_CYCLES_KEY, REFINE_VERDICT_KEY, RefinerTask,
};
pub use workflow::{
    ResumeOptions, SessionOptions, SessionOutcome, SessionProgress, resume_report_session,
    run_report_session, run_report_session_with_options,
};
