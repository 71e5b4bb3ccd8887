use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Once};

use anyhow::{Result, anyhow};
use graph_flow::{InMemorySessionStorage, SessionStorage};
use medluma_core::{
    ConfirmationResponse, LOOP_SIGNAL_KEY, LoopSignal, LoopVerdict, ModelClient, ModelRequest,
    ResumeOptions, SessionOptions, SessionOutcome, SessionProgress, keys, resume_report_session,
    run_report_session, run_report_session_with_options,
};

static LOG_DIR: Once = Once::new();

fn isolate_logs() {
    LOG_DIR.call_once(|| {
        let dir = std::env::temp_dir().join(format!("medluma-test-logs-{}", std::process::id()));
        unsafe {
            std::env::set_var("MEDLUMA_LOG_DIR", &dir);
        }
    });
}

/// Model client with a fixed per-stage response script, recording every call.
struct ScriptedClient {
    responses: Mutex<HashMap<&'static str, VecDeque<String>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedClient {
    fn new(script: Vec<(&'static str, Vec<&str>)>) -> Arc<Self> {
        let responses = script
            .into_iter()
            .map(|(stage, texts)| {
                (
                    stage,
                    texts.into_iter().map(str::to_string).collect::<VecDeque<_>>(),
                )
            })
            .collect();
        Arc::new(Self {
            responses: Mutex::new(responses),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls_for(&self, stage: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.as_str() == stage)
            .count()
    }
}

#[async_trait::async_trait]
impl ModelClient for ScriptedClient {
    async fn generate(&self, request: ModelRequest<'_>) -> Result<String> {
        self.calls.lock().unwrap().push(request.stage.to_string());
        self.responses
            .lock()
            .unwrap()
            .get_mut(request.stage)
            .and_then(|queue| queue.pop_front())
            .ok_or_else(|| anyhow!("no scripted response left for stage {}", request.stage))
    }
}

fn research_script() -> Vec<(&'static str, Vec<&'static str>)> {
    vec![
        ("bio_researcher", vec!["bio findings [1] PubMed 123"]),
        ("health_researcher", vec!["three recent advances"]),
        ("aggregator", vec!["combined summary"]),
        ("initial_writer", vec!["draft v1"]),
    ]
}

async fn run_to_gate(
    client: Arc<ScriptedClient>,
) -> (Arc<dyn SessionStorage>, String, medluma_core::ConfirmationRequest) {
    isolate_logs();
    let storage: Arc<dyn SessionStorage> = Arc::new(InMemorySessionStorage::new());
    let options = SessionOptions::new("Summarize recent advances in the treatment of gardner syndrome")
        .with_shared_storage(storage.clone())
        .with_model_client(client);

    let progress = run_report_session_with_options(options)
        .await
        .expect("pipeline should start");

    match progress {
        SessionProgress::AwaitingConfirmation {
            session_id,
            request,
        } => (storage, session_id, request),
        SessionProgress::Completed(_) => panic!("pipeline must pause at the confirmation gate"),
    }
}

async fn resume_with_answer(
    storage: Arc<dyn SessionStorage>,
    client: Arc<ScriptedClient>,
    session_id: String,
    response: ConfirmationResponse,
) -> SessionOutcome {
    let progress = resume_report_session(
        ResumeOptions::new(session_id, response)
            .with_shared_storage(storage)
            .with_model_client(client),
    )
    .await
    .expect("resume should succeed");

    match progress {
        SessionProgress::Completed(outcome) => outcome,
        SessionProgress::AwaitingConfirmation { .. } => {
            panic!("pipeline should complete after confirmation")
        }
    }
}

#[tokio::test]
async fn pipeline_pauses_at_gate_before_any_model_call() {
    let client = ScriptedClient::new(research_script());
    let (_storage, _session_id, request) = run_to_gate(client.clone()).await;

    assert_eq!(request.payload.preference_type, "output_format");
    assert!(request.hint.contains("'comprehensive'"));
    assert_eq!(client.calls.lock().unwrap().len(), 0);
}

#[tokio::test]
async fn mismatched_correlation_id_keeps_session_suspended() {
    let client = ScriptedClient::new(research_script());
    let (storage, session_id, request) = run_to_gate(client.clone()).await;

    let stray = ConfirmationResponse::confirmed("unrelated-id", "comprehensive");
    let progress = resume_report_session(
        ResumeOptions::new(session_id, stray)
            .with_shared_storage(storage)
            .with_model_client(client),
    )
    .await
    .expect("resume should not error");

    match progress {
        SessionProgress::AwaitingConfirmation { request: again, .. } => {
            assert_eq!(again.id, request.id, "original request must stay outstanding");
        }
        SessionProgress::Completed(_) => panic!("mismatched answer must not unblock the gate"),
    }
}

#[tokio::test]
async fn comprehensive_answer_assembles_sectioned_report() {
    let mut script = research_script();
    script.push(("critic", vec!["add references please", "APPROVED"]));
    script.push(("refiner", vec!["draft v2"]));
    let client = ScriptedClient::new(script);

    let (storage, session_id, request) = run_to_gate(client.clone()).await;
    let response = ConfirmationResponse::confirmed(request.id, "comprehensive");
    let outcome = resume_with_answer(storage, client.clone(), session_id, response).await;

    assert_eq!(outcome.user_preference, "comprehensive");
    assert!(outcome.approved());
    assert_eq!(outcome.refine_cycles, 1);

    assert!(outcome.final_output.contains("**BACKGROUND**\ndraft v2"));
    assert!(outcome.final_output.contains("**EXECUTIVE SUMMARY**\ncombined summary"));
    assert!(outcome.final_output.contains("**KEY DEVELOPMENTS**\nthree recent advances"));
    assert!(outcome.final_output.contains("**REFERENCES**\nbio findings [1] PubMed 123"));

    assert_eq!(client.calls_for("critic"), 2);
    assert_eq!(client.calls_for("refiner"), 1);
}

#[tokio::test]
async fn simple_answer_emits_article_only() {
    let mut script = research_script();
    script.push(("critic", vec!["APPROVED"]));
    let client = ScriptedClient::new(script);

    let (storage, session_id, request) = run_to_gate(client.clone()).await;
    let response = ConfirmationResponse::confirmed(request.id, "simple");
    let outcome = resume_with_answer(storage, client.clone(), session_id, response).await;

    assert_eq!(outcome.final_output, "draft v1");
}

#[tokio::test]
async fn unrecognized_answer_defaults_to_simple() {
    let mut script = research_script();
    script.push(("critic", vec!["APPROVED"]));
    let client = ScriptedClient::new(script);

    let (storage, session_id, request) = run_to_gate(client.clone()).await;
    let response = ConfirmationResponse::confirmed(request.id, "give me the works");
    let outcome = resume_with_answer(storage, client.clone(), session_id, response).await;

    assert_eq!(outcome.user_preference, "simple");
    assert_eq!(outcome.final_output, "draft v1");
}

#[tokio::test]
async fn rejected_confirmation_still_completes_with_simple_output() {
    let mut script = research_script();
    script.push(("critic", vec!["APPROVED"]));
    let client = ScriptedClient::new(script);

    let (storage, session_id, request) = run_to_gate(client.clone()).await;
    let response = ConfirmationResponse::rejected(request.id);
    let outcome = resume_with_answer(storage, client.clone(), session_id, response).await;

    assert_eq!(outcome.user_preference, "simple");
    assert_eq!(outcome.final_output, "draft v1");
}

#[tokio::test]
async fn approval_on_first_critique_skips_revision_entirely() {
    let mut script = research_script();
    script.push(("critic", vec!["APPROVED"]));
    let client = ScriptedClient::new(script);

    let (storage, session_id, request) = run_to_gate(client.clone()).await;
    let response = ConfirmationResponse::confirmed(request.id, "simple");
    let outcome = resume_with_answer(storage, client.clone(), session_id, response).await;

    assert!(outcome.approved());
    assert_eq!(outcome.refine_cycles, 0);
    assert_eq!(outcome.final_output, "draft v1", "draft must be left unchanged");
    assert_eq!(client.calls_for("critic"), 1);
    assert_eq!(client.calls_for("refiner"), 0);
}

#[tokio::test]
async fn loop_stops_at_iteration_cap_without_error() {
    let mut script = research_script();
    script.push(("critic", vec!["too thin", "still too thin"]));
    script.push(("refiner", vec!["draft v2", "draft v3"]));
    let client = ScriptedClient::new(script);

    let (storage, session_id, request) = run_to_gate(client.clone()).await;
    let response = ConfirmationResponse::confirmed(request.id, "simple");
    let outcome = resume_with_answer(storage, client.clone(), session_id, response).await;

    assert!(!outcome.approved());
    assert_eq!(outcome.verdict, Some(LoopVerdict::IterationLimitReached));
    assert_eq!(outcome.refine_cycles, 2);
    assert_eq!(outcome.final_output, "draft v3");
    assert_eq!(client.calls_for("critic"), 2, "never more than two critique calls");
    assert_eq!(client.calls_for("refiner"), 2, "never more than two revise calls");
}

#[tokio::test]
async fn session_state_is_additive_across_stages() {
    let mut script = research_script();
    script.push(("critic", vec!["APPROVED"]));
    let client = ScriptedClient::new(script);

    let (storage, session_id, request) = run_to_gate(client.clone()).await;
    let response = ConfirmationResponse::confirmed(request.id, "comprehensive");
    resume_with_answer(storage.clone(), client, session_id.clone(), response).await;

    let session = storage
        .get(&session_id)
        .await
        .expect("storage lookup should succeed")
        .expect("session should still exist");

    // Later writes never remove earlier keys.
    let preference: Option<String> = session.context.get(keys::USER_PREFERENCE).await;
    let bio: Option<String> = session.context.get(keys::BIO_RESEARCH).await;
    let summary: Option<String> = session.context.get(keys::EXECUTIVE_SUMMARY).await;
    assert_eq!(preference.as_deref(), Some("comprehensive"));
    assert_eq!(bio.as_deref(), Some("bio findings [1] PubMed 123"));
    assert_eq!(summary.as_deref(), Some("combined summary"));
}

#[tokio::test]
async fn approval_records_exit_signal_in_session_state() {
    let mut script = research_script();
    script.push(("critic", vec!["APPROVED"]));
    let client = ScriptedClient::new(script);

    let (storage, session_id, request) = run_to_gate(client.clone()).await;
    let response = ConfirmationResponse::confirmed(request.id, "simple");
    resume_with_answer(storage.clone(), client, session_id.clone(), response).await;

    let session = storage
        .get(&session_id)
        .await
        .expect("storage lookup should succeed")
        .expect("session should still exist");

    let signal: Option<LoopSignal> = session.context.get(LOOP_SIGNAL_KEY).await;
    assert_eq!(signal, Some(LoopSignal::approved()));
}

#[tokio::test]
async fn failed_model_call_surfaces_stage_in_error() {
    // No critic responses scripted: the first critique call fails.
    let client = ScriptedClient::new(research_script());

    let (storage, session_id, request) = run_to_gate(client.clone()).await;
    let response = ConfirmationResponse::confirmed(request.id, "simple");
    let err = resume_report_session(
        ResumeOptions::new(session_id, response)
            .with_shared_storage(storage)
            .with_model_client(client),
    )
    .await
    .expect_err("pipeline must fail when a stage's model call fails");

    assert!(
        err.to_string().contains("model call failed in stage critic"),
        "error should name the failing stage: {err}"
    );
}

#[tokio::test]
async fn offline_convenience_run_completes() {
    isolate_logs();
    let outcome = run_report_session("Summarize advances for gardner syndrome", "simple")
        .await
        .expect("offline run should complete");

    assert!(outcome.approved(), "canned critic approves immediately");
    assert!(!outcome.final_output.is_empty());
}
