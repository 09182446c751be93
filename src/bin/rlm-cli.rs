//! RLM CLI - run scripts through the execution loop from the command line
//!
//! Scripts can call a few demo tools; every history record is printed as a
//! JSON line on stderr when `--history` is set.

use anyhow::Context;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use rlm::execution::{
    HistoryRecord, HistorySink, RlmRuntime, RunHooks, RunRequest, ToolCall, ToolContext,
    ToolDefinition, ToolOutcome, ToolResolver, preamble_build, with_runtime_tools,
};
use rlm::RlmConfig;
use serde_json::{Value, json};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "rlm")]
#[command(about = "Resumable sandboxed script execution", long_about = None)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a script file
    Run {
        /// Script to execute
        file: PathBuf,

        /// Worker key selecting the worker process
        #[arg(long, default_value = "cli")]
        worker_key: String,

        /// Interpret in this process instead of a worker
        #[arg(long)]
        in_process: bool,

        /// Print history records to stderr
        #[arg(long)]
        history: bool,
    },

    /// Print the preamble for the demo tools
    Preamble,

    /// Print the effective configuration
    Config,
}

/// Demo tools available to CLI scripts.
struct DemoTools;

#[async_trait]
impl ToolResolver for DemoTools {
    fn list_tools(&self) -> Vec<ToolDefinition> {
        vec![
            ToolDefinition {
                name: "echo".into(),
                description: "Return the arguments unchanged.".into(),
                parameters: json!({"type": "object", "properties": {}}),
            },
            ToolDefinition {
                name: "upper".into(),
                description: "Uppercase a string.".into(),
                parameters: json!({
                    "type": "object",
                    "properties": {"text": {"type": "string"}},
                    "required": ["text"]
                }),
            },
            ToolDefinition {
                name: "fail".into(),
                description: "Always fails with the given message.".into(),
                parameters: json!({
                    "type": "object",
                    "properties": {"message": {"type": "string"}}
                }),
            },
        ]
    }

    async fn execute(&self, call: ToolCall, _context: &ToolContext) -> anyhow::Result<ToolOutcome> {
        match call.name.as_str() {
            "echo" => Ok(ToolOutcome::value(Value::Object(call.arguments))),
            "upper" => {
                let text = call
                    .arguments
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                Ok(ToolOutcome::text(text.to_uppercase()))
            }
            "fail" => {
                let message = call
                    .arguments
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                Ok(ToolOutcome::error(message))
            }
            other => anyhow::bail!("no such tool: {other}"),
        }
    }
}

/// Writes history records to stderr, or drops them.
struct StderrHistory {
    enabled: bool,
}

#[async_trait]
impl HistorySink for StderrHistory {
    async fn append(&self, record: HistoryRecord) -> anyhow::Result<()> {
        if self.enabled {
            eprintln!("{}", serde_json::to_string(&record)?);
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => RlmConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => RlmConfig::default(),
    }
    .with_env()?;

    match cli.command {
        Commands::Run {
            file,
            worker_key,
            in_process,
            history,
        } => {
            let code = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let runtime = if in_process {
                RlmRuntime::local().with_limits(config.limits)
            } else {
                RlmRuntime::from_config(&config)
            };
            let sink = StderrHistory { enabled: history };
            let context = ToolContext::new(worker_key);
            let request = RunRequest::new(uuid::Uuid::new_v4().to_string(), code);

            let result = runtime
                .run(request, &DemoTools, &context, RunHooks::new(&sink))
                .await;
            runtime.shutdown().await;

            let result = result?;
            for line in &result.print_output {
                println!("{line}");
            }
            println!("=> {}", result.output);
            println!("({} tool calls)", result.tool_call_count);
        }

        Commands::Preamble => {
            println!("{}", preamble_build(&with_runtime_tools(DemoTools.list_tools())));
        }

        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
