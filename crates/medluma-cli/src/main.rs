use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, bail};
use clap::{Args, Parser, Subcommand};
use graph_flow::{InMemorySessionStorage, SessionStorage};
use medluma_core::{
    BioMcpServerConfig, CannedModelClient, Config, ConfigLoader, ConfirmationResponse,
    GeminiModelClient, ModelClient, PipelineSpec, ResumeOptions, SessionOptions, SessionOutcome,
    SessionProgress, locate_biomcp, resume_report_session, run_report_session_with_options,
};
use tokio::runtime::Runtime;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "medluma", version, about = "MedLuma disease-information report pipeline")]
struct Cli {
    /// Path to medluma.toml (defaults to MEDLUMA_CONFIG or ./medluma.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a disease-information report.
    Run(RunArgs),
    /// Locate the biomcp executable and print its path.
    Locate,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Disease or research area to report on.
    #[arg(long, default_value = "Summarize recent advances in the treatment of gardner syndrome")]
    query: String,

    /// Optional session ID.
    #[arg(long)]
    session: Option<String>,

    /// Answer the output-format question non-interactively.
    #[arg(long)]
    answer: Option<String>,

    /// Use the deterministic offline model client; skips biomcp and API key.
    #[arg(long, default_value_t = false)]
    offline: bool,
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,medluma_core=info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = ConfigLoader::load(cli.config.clone())?;

    let rt = Runtime::new()?;
    rt.block_on(async move {
        match cli.command {
            Command::Run(args) => run_command(args, config).await?,
            Command::Locate => locate_command(config)?,
        }
        Ok::<(), anyhow::Error>(())
    })?;

    Ok(())
}

fn locate_command(config: Config) -> Result<()> {
    let path = locate_biomcp(&config.biomcp)?;
    println!("{}", path.display());
    Ok(())
}

async fn run_command(args: RunArgs, config: Config) -> Result<()> {
    info!(query = %args.query, offline = args.offline, "starting MedLuma session");

    let (client, biomcp): (Arc<dyn ModelClient>, Option<BioMcpServerConfig>) = if args.offline {
        (Arc::new(CannedModelClient), None)
    } else {
        // Both are startup preconditions: fail before any stage runs.
        let path = locate_biomcp(&config.biomcp)?;
        let server = BioMcpServerConfig::new(path, &config.biomcp);
        let api_key = config.api_key()?;
        (
            Arc::new(GeminiModelClient::new(api_key, config.retry.clone())),
            Some(server),
        )
    };

    let storage: Arc<dyn SessionStorage> = Arc::new(InMemorySessionStorage::new());
    let spec = PipelineSpec::new(&config.models);

    let mut options = SessionOptions::new(&args.query)
        .with_shared_storage(storage.clone())
        .with_model_client(client.clone())
        .with_pipeline_spec(spec.clone())
        .with_max_refine_cycles(config.refine.max_cycles);

    if let Some(session_id) = args.session {
        options = options.with_session_id(session_id);
    }
    if let Some(server) = biomcp.clone() {
        options = options.with_biomcp_server(server);
    }

    let mut progress = run_report_session_with_options(options).await?;

    // The gate resolves exactly once per session, but a mismatched answer
    // leaves it outstanding, so keep asking until the pipeline moves on.
    loop {
        match progress {
            SessionProgress::Completed(outcome) => {
                print_outcome(&outcome);
                return Ok(());
            }
            SessionProgress::AwaitingConfirmation {
                session_id,
                request,
            } => {
                let answer = match &args.answer {
                    Some(answer) => answer.clone(),
                    None => prompt(&request.hint)?,
                };
                println!("You selected: {answer}");

                let response = ConfirmationResponse::confirmed(request.id, answer);
                let mut resume = ResumeOptions::new(session_id, response)
                    .with_shared_storage(storage.clone())
                    .with_model_client(client.clone())
                    .with_pipeline_spec(spec.clone())
                    .with_max_refine_cycles(config.refine.max_cycles);
                if let Some(server) = biomcp.clone() {
                    resume = resume.with_biomcp_server(server);
                }

                progress = resume_report_session(resume).await?;
            }
        }
    }
}

fn prompt(hint: &str) -> Result<String> {
    println!("{hint}");
    print!("Your choice (comprehensive/simple): ");
    io::stdout().flush()?;

    let mut line = String::new();
    if io::stdin().lock().read_line(&mut line)? == 0 {
        bail!("stdin closed while waiting for output preference");
    }
    Ok(line.trim().to_string())
}

fn print_outcome(outcome: &SessionOutcome) {
    println!();
    println!("{}", "=".repeat(60));
    println!("FINAL OUTPUT (session {}):", outcome.session_id);
    println!("{}", "=".repeat(60));
    println!("{}", outcome.final_output);

    if outcome.approved() {
        info!(cycles = outcome.refine_cycles, "article approved by critic");
    } else {
        info!(
            cycles = outcome.refine_cycles,
            "refinement stopped at iteration cap"
        );
    }
}
