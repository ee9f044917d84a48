//! Task runner binary
//!
//! Runs a single job against a scripted model and prints its output events
//! as JSON lines. Questions asked by the job are answered from stdin.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use task_orchestrator::{
    DeliveryMode, JobRegistry, JobSpec, OrchestratorConfig, QuestionBroker, QuestionPrompt,
    ScriptedLlmClient, SubmitAnswerRequest, SubmitAnswerResponse, ToolRegistry,
};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tracing_subscriber::EnvFilter;

const DEMO_SCRIPT: &[&[&str]] = &[
    &[
        "Let me check with you first. ",
        r#"<tool_use>{"name":"ask_followup_question","arguments":"#,
        r#"{"question":"Pick a color","options":["red","green","blue"]}}</tool_use>"#,
    ],
    &["<thinking>the user answered</thinking>", "<completion>Color recorded</completion>"],
];

#[derive(Parser)]
#[command(name = "task-runner")]
#[command(about = "Run one interactive job and stream its events", long_about = None)]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Task prompt
    prompt: String,

    /// YAML configuration file; ACOLIB_TASK_* variables override it
    #[arg(short, long, env = "ACOLIB_TASK_CONFIG")]
    config: Option<PathBuf>,

    /// YAML file with the scripted model turns, a list of fragment lists
    #[arg(short, long)]
    script: Option<PathBuf>,

    /// Sliding inactivity timeout in milliseconds
    #[arg(long)]
    sliding_timeout_ms: Option<u64>,
}

fn load_script(path: Option<&PathBuf>) -> Result<Vec<Vec<String>>> {
    match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading script {}", path.display()))?;
            serde_yaml::from_str(&raw).with_context(|| format!("parsing script {}", path.display()))
        }
        None => Ok(DEMO_SCRIPT
            .iter()
            .map(|turn| turn.iter().map(|f| f.to_string()).collect())
            .collect()),
    }
}

/// Read answers until one is accepted, the question is already settled or
/// input ends
async fn answer_question<R>(
    registry: &JobRegistry,
    question: &QuestionPrompt,
    input: &mut Lines<R>,
) -> Result<Option<SubmitAnswerResponse>>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        eprintln!("{} {:?}", question.prompt, question.choices);
        let Some(answer) = input.next_line().await? else {
            tracing::warn!(question_id = %question.question_id, "Input closed before an answer");
            return Ok(None);
        };

        let response = registry.submit_answer(SubmitAnswerRequest::new(
            question.question_id.clone(),
            answer.trim(),
        ));
        match response.status {
            200 | 404 | 409 => return Ok(Some(response)),
            status => {
                tracing::warn!(status, error = ?response.error, "Answer rejected, asking again");
                eprintln!("{}", response.error.as_deref().unwrap_or("invalid answer"));
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => OrchestratorConfig::from_file_with_env(path)?,
        None => OrchestratorConfig::from_env()?,
    };
    let buffer = config.channel_buffer;
    let script = load_script(cli.script.as_ref())?;
    tracing::info!(turns = script.len(), "Loaded model script");

    let broker = Arc::new(QuestionBroker::from_config(&config));
    let registry = JobRegistry::new(
        config,
        broker,
        Arc::new(ScriptedLlmClient::new(script)),
        Arc::new(ToolRegistry::new()),
    );

    let (mode, mut events) = DeliveryMode::stream(buffer);
    let mut spec = JobSpec::new(cli.prompt).with_delivery(mode);
    if let Some(ms) = cli.sliding_timeout_ms {
        spec = spec.with_sliding_timeout_ms(ms);
    }
    let job_id = registry.create(spec)?;

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    while let Some(event) = events.recv().await {
        println!("{}", event.to_json_line()?);

        if let Some(question) = event.question() {
            answer_question(&registry, question, &mut stdin).await?;
        }
        if event.event_type.is_terminal() {
            break;
        }
    }

    let outcome = registry.wait(&job_id).await?;
    tracing::info!(job_id = %outcome.job_id, kind = outcome.kind.as_str(), "Job finished");
    if !outcome.is_success() {
        anyhow::bail!(
            "job ended {}: {}",
            outcome.kind.as_str(),
            outcome.error.unwrap_or_default()
        );
    }
    Ok(())
}
