use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use deep_researcher_core::{
    CheckpointStore, ConfigOverrides, ConfigResolver, FileCheckpointStore, HttpModelFactory,
    ModelFactory, SearchApi, StartRequest, StubModel, TelemetryOptions, ThreadStatus,
    TraceCollector, Workflow, WorkflowEvent, init_telemetry, metrics::init_metrics_from_env,
    persist_trace, thread_key_for,
};
use futures::StreamExt;
use tokio::runtime::Runtime;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "deep-researcher",
    version,
    about = "Multi-agent deep research with resumable threads"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send a message to a chat, starting its thread if needed.
    Run(RunArgs),
    /// Continue a chat's thread from its latest checkpoint.
    Resume(ResumeArgs),
    /// Show the checkpoint history of a chat's thread.
    Checkpoints(CheckpointArgs),
}

#[derive(Args, Debug, Clone)]
struct ThreadArgs {
    /// Owner of the chat.
    #[arg(long, default_value = "local")]
    user: String,

    /// Chat identifier; the same user and chat always map to the same thread.
    #[arg(long)]
    chat: String,

    /// Directory holding per-thread checkpoint files.
    #[arg(long, env = "DEEPRESEARCHER_CHECKPOINT_DIR", default_value = ".deep-researcher/checkpoints")]
    checkpoint_dir: PathBuf,
}

#[derive(Args, Debug, Clone)]
struct ExecArgs {
    /// TOML configuration file (falls back to DEEPRESEARCHER_CONFIG, then ./deep-researcher.toml).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Use scripted offline models instead of provider APIs.
    #[arg(long, default_value_t = false)]
    offline: bool,

    /// Print every event as one NDJSON line instead of only the report.
    #[arg(long, default_value_t = false)]
    ndjson: bool,

    /// Print a summary of the node transitions after the run.
    #[arg(long, value_enum)]
    explain: Option<ExplainFormat>,

    /// Write the run's transitions as JSON into this directory.
    #[arg(long)]
    trace_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    thread: ThreadArgs,

    #[command(flatten)]
    exec: ExecArgs,

    /// Research request, or the answer to a clarifying question.
    #[arg(long)]
    message: String,

    /// Skip the clarification step.
    #[arg(long, default_value_t = false)]
    no_clarification: bool,

    /// Skip the research outline.
    #[arg(long, default_value_t = false)]
    no_outline: bool,

    /// Search backend: tavily, openai, anthropic or none.
    #[arg(long)]
    search_api: Option<String>,

    /// Maximum concurrent research units per supervisor round.
    #[arg(long)]
    max_units: Option<usize>,
}

#[derive(Args, Debug)]
struct ResumeArgs {
    #[command(flatten)]
    thread: ThreadArgs,

    #[command(flatten)]
    exec: ExecArgs,
}

#[derive(Args, Debug)]
struct CheckpointArgs {
    #[command(flatten)]
    thread: ThreadArgs,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum ExplainFormat {
    Markdown,
    Mermaid,
    Graphviz,
}

fn main() -> Result<()> {
    init_telemetry(TelemetryOptions {
        to_stderr: true,
        ..TelemetryOptions::default()
    })?;
    init_metrics_from_env("deep-researcher-cli");

    let cli = Cli::parse();

    let rt = Runtime::new()?;
    rt.block_on(async move {
        match cli.command {
            Command::Run(args) => run_command(args).await,
            Command::Resume(args) => resume_command(args).await,
            Command::Checkpoints(args) => checkpoints_command(args).await,
        }
    })
}

impl RunArgs {
    fn overrides(&self) -> Result<ConfigOverrides> {
        let search_api = self
            .search_api
            .as_deref()
            .map(str::parse::<SearchApi>)
            .transpose()?;
        Ok(ConfigOverrides {
            allow_clarification: self.no_clarification.then_some(false),
            generate_outline: self.no_outline.then_some(false),
            search_api,
            max_concurrent_research_units: self.max_units,
            ..ConfigOverrides::default()
        })
    }
}

async fn run_command(args: RunArgs) -> Result<()> {
    let overrides = args.overrides()?;
    info!(user = %args.thread.user, chat = %args.thread.chat, "starting research turn");
    execute(&args.thread, &args.exec, Some(args.message), &overrides).await
}

async fn resume_command(args: ResumeArgs) -> Result<()> {
    info!(user = %args.thread.user, chat = %args.thread.chat, "resuming research thread");
    execute(&args.thread, &args.exec, None, &ConfigOverrides::default()).await
}

async fn open_store(thread: &ThreadArgs) -> Result<Arc<FileCheckpointStore>> {
    let store = FileCheckpointStore::open(thread.checkpoint_dir.clone())
        .await
        .with_context(|| {
            format!(
                "failed to open checkpoint dir {}",
                thread.checkpoint_dir.display()
            )
        })?;
    Ok(Arc::new(store))
}

async fn execute(
    thread: &ThreadArgs,
    exec: &ExecArgs,
    message: Option<String>,
    overrides: &ConfigOverrides,
) -> Result<()> {
    let config = ConfigResolver::from_file(exec.config.clone())?.resolve(overrides)?;
    let store = open_store(thread).await?;
    let factory: Arc<dyn ModelFactory> = if exec.offline {
        Arc::new(StubModel::offline())
    } else {
        Arc::new(HttpModelFactory::from_env())
    };
    let workflow = Workflow::new(factory, store.clone());

    let thread_key = thread_key_for(&thread.user, &thread.chat);
    let request = StartRequest::new(thread_key.clone(), message, config).with_user(&thread.user);
    let mut handle = workflow.start(request).await?;
    info!(thread_key = %handle.thread_key, resumed = handle.resumed, "thread running");

    let mut collector = TraceCollector::new();
    let mut outcome = RunOutcome::Paused;
    while let Some(event) = handle.events.next().await {
        collector.record(&event);
        if exec.ndjson {
            print!("{}", event.to_ndjson());
        }
        match event {
            WorkflowEvent::Final { final_report, .. } => {
                outcome = RunOutcome::Finished(final_report);
            }
            WorkflowEvent::Error { error, .. } => {
                outcome = RunOutcome::Failed(error);
            }
            WorkflowEvent::Update { .. } => {}
        }
    }

    if !exec.ndjson {
        match &outcome {
            RunOutcome::Finished(Some(report)) => println!("{report}"),
            RunOutcome::Finished(None) => println!("(run finished without a report)"),
            RunOutcome::Failed(error) => eprintln!("research failed: {error}"),
            RunOutcome::Paused => {
                let question = pending_question(store.as_ref(), &thread_key).await?;
                println!("{}", question.unwrap_or_else(|| "(waiting for input)".into()));
                eprintln!(
                    "answer with: deep-researcher run --user {} --chat {} --message \"...\"",
                    thread.user, thread.chat
                );
            }
        }
    }

    if let Some(format) = exec.explain {
        if collector.is_empty() {
            warn!("no transitions recorded; nothing to explain");
        } else {
            let summary = collector.summary();
            let rendered = match format {
                ExplainFormat::Markdown => summary.render_markdown(),
                ExplainFormat::Mermaid => summary.render_mermaid(),
                ExplainFormat::Graphviz => summary.render_graphviz(),
            };
            eprintln!("{rendered}");
        }
    }

    if let Some(dir) = &exec.trace_dir {
        let path = persist_trace(dir, &thread_key, collector.events())?;
        info!(path = %path.display(), "trace written");
    }

    match outcome {
        RunOutcome::Failed(error) => Err(anyhow::anyhow!(error)),
        _ => Ok(()),
    }
}

enum RunOutcome {
    Finished(Option<String>),
    Failed(String),
    Paused,
}

async fn pending_question(store: &dyn CheckpointStore, thread_key: &str) -> Result<Option<String>> {
    let Some(head) = store.get(thread_key).await? else {
        return Ok(None);
    };
    if head.status != ThreadStatus::AwaitingInput {
        return Ok(None);
    }
    Ok(head
        .channel_values
        .messages
        .iter()
        .rev()
        .find(|message| message.is_ai())
        .map(|message| message.content().to_string()))
}

async fn checkpoints_command(args: CheckpointArgs) -> Result<()> {
    let store = open_store(&args.thread).await?;
    let thread_key = thread_key_for(&args.thread.user, &args.thread.chat);
    let history = store.list(&thread_key).await?;
    if history.is_empty() {
        println!("no checkpoints for {thread_key}");
        return Ok(());
    }

    println!("{thread_key}");
    for checkpoint in history {
        let status = match checkpoint.status {
            ThreadStatus::Running { next } => format!("running -> {}", next.name()),
            ThreadStatus::AwaitingInput => "awaiting input".to_string(),
            ThreadStatus::Completed => "completed".to_string(),
        };
        let detail = serde_json::json!({
            "messages": checkpoint.channel_values.messages.len(),
            "notes": checkpoint.channel_values.notes.len(),
            "hasReport": checkpoint.channel_values.final_report.is_some(),
            "midResearch": checkpoint.supervisor.is_some(),
        });
        println!(
            "  #{:<3} {}  {:<32} {}",
            checkpoint.step,
            checkpoint.created_at.format("%Y-%m-%d %H:%M:%S"),
            status,
            detail
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exec_args() -> ExecArgs {
        ExecArgs {
            config: None,
            offline: true,
            ndjson: false,
            explain: None,
            trace_dir: None,
        }
    }

    #[test]
    fn run_flags_become_overrides() {
        let cli = Cli::try_parse_from([
            "deep-researcher",
            "run",
            "--chat",
            "c1",
            "--message",
            "nurse pay",
            "--no-clarification",
            "--search-api",
            "none",
            "--max-units",
            "2",
        ])
        .unwrap();
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.thread.user, "local");
        let overrides = args.overrides().unwrap();
        assert_eq!(overrides.allow_clarification, Some(false));
        assert_eq!(overrides.generate_outline, None);
        assert_eq!(overrides.search_api, Some(SearchApi::None));
        assert_eq!(overrides.max_concurrent_research_units, Some(2));
    }

    #[test]
    fn unknown_search_backend_is_rejected() {
        let cli = Cli::try_parse_from([
            "deep-researcher",
            "run",
            "--chat",
            "c1",
            "--message",
            "x",
            "--search-api",
            "bing",
        ])
        .unwrap();
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert!(args.overrides().is_err());
    }

    #[tokio::test]
    async fn offline_run_completes_and_leaves_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let trace_dir = dir.path().join("traces");
        let thread = ThreadArgs {
            user: "u1".into(),
            chat: "c1".into(),
            checkpoint_dir: dir.path().join("checkpoints"),
        };
        let exec = ExecArgs {
            trace_dir: Some(trace_dir.clone()),
            ..exec_args()
        };
        let overrides = ConfigOverrides {
            allow_clarification: Some(false),
            search_api: Some(SearchApi::None),
            ..ConfigOverrides::default()
        };

        execute(&thread, &exec, Some("nurse pay trends".into()), &overrides)
            .await
            .unwrap();

        let store = open_store(&thread).await.unwrap();
        let thread_key = thread_key_for("u1", "c1");
        let head = store.get(&thread_key).await.unwrap().unwrap();
        assert_eq!(head.status, ThreadStatus::Completed);
        assert!(head.channel_values.final_report.is_some());
        assert!(trace_dir.join(format!("{thread_key}.json")).exists());
    }
}
