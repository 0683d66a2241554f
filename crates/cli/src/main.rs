mod tools;

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use codepilot::agent::{self, AgentConfig, AgentError, AgentOutcome, StopReason};
use codepilot::config::{self, Config};
use codepilot::history::Conversation;
use codepilot::llm::{
    ChatRequest, ClientFactory, Detected, DetectionCache, GenerateRequest, LlmBackend, LlmError,
    RequestCategory, RequestSettings,
};
use codepilot::tools::ToolRegistry;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "codepilot")]
#[command(about = "Codepilot CLI", long_about = None)]
struct Cli {
    /// Config file path (default: CODEPILOT_CONFIG_PATH or ~/.codepilot/config.json)
    #[arg(long, short, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Probe the completion and instruction endpoints and report backend and context window.
    Detect,

    /// Single-turn code completion against the completion endpoint.
    Complete {
        /// Prompt text (the code before the cursor).
        prompt: String,

        /// Optional system prompt.
        #[arg(long)]
        system: Option<String>,
    },

    /// Chat with the instruction model (interactive, no tools).
    Chat {
        /// Optional system prompt.
        #[arg(long)]
        system: Option<String>,
    },

    /// Agent mode: the instruction model may read files under the workspace root. Ctrl-C stops the current run.
    Agent {
        /// Workspace root the tools may read (default: current directory).
        #[arg(long, value_name = "DIR")]
        root: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Version) => {
            println!("codepilot {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Some(Commands::Detect) => run_detect(cli.config).await,
        Some(Commands::Complete { prompt, system }) => run_complete(cli.config, prompt, system).await,
        Some(Commands::Chat { system }) => run_chat(cli.config, system).await,
        Some(Commands::Agent { root }) => run_agent(cli.config, root).await,
        None => {
            println!("Run with --help for usage");
            Ok(())
        }
    };
    if let Err(e) = result {
        log::error!("{:#}", e);
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

/// Fill the cache entry for `category`: from config when the backend is forced, else by probing.
async fn ensure_detected(
    config: &Config,
    factory: &ClientFactory,
    cache: &DetectionCache,
) -> anyhow::Result<Detected> {
    let category = factory.category();
    if let Some(detected) = config.configured_backend(category) {
        log::info!("{}: using configured backend {}", category, detected.backend);
        cache.set(category, detected);
        return Ok(detected);
    }
    let settings = config.request_settings(category);
    let probed = factory
        .detect(&settings.endpoint, &settings.model)
        .await
        .with_context(|| format!("detecting {} backend at {}", category, settings.endpoint.url))?;
    let detected = Detected {
        fragment_policy: config.endpoint(category).fragment_policy,
        ..probed
    };
    cache.set(category, detected);
    Ok(detected)
}

async fn run_detect(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let (config, path) = config::load_config(config_path)?;
    log::debug!("config: {}", path.display());
    let cache = Arc::new(DetectionCache::new());
    for category in [RequestCategory::Completion, RequestCategory::Instruction] {
        let factory = ClientFactory::new(category, Arc::clone(&cache));
        let endpoint = config.endpoint(category);
        match ensure_detected(&config, &factory, &cache).await {
            Ok(d) => println!(
                "{:<12} {:<8} {} model={} context_length={}",
                category.to_string(),
                d.backend.to_string(),
                endpoint.url,
                endpoint.model,
                d.context_length
                    .map_or_else(|| "unknown".to_string(), |n| n.to_string())
            ),
            Err(e) => println!("{:<12} {:<8} {} ({:#})", category.to_string(), "-", endpoint.url, e),
        }
    }
    Ok(())
}

async fn run_complete(
    config_path: Option<PathBuf>,
    prompt: String,
    system: Option<String>,
) -> anyhow::Result<()> {
    let (config, _) = config::load_config(config_path)?;
    let cache = Arc::new(DetectionCache::new());
    let factory = ClientFactory::new(RequestCategory::Completion, Arc::clone(&cache));
    ensure_detected(&config, &factory, &cache).await?;

    let settings = config.request_settings(RequestCategory::Completion);
    let request = GenerateRequest {
        settings: &settings,
        prompt: &prompt,
        system: system.as_deref(),
    };
    match factory.generate(request).await {
        Ok(generation) => {
            if generation.truncated {
                log::info!("completion was cut at num_predict, last line dropped");
            }
            println!("{}", generation.text);
            Ok(())
        }
        Err(e @ LlmError::ContextOverflow { .. }) => {
            eprintln!("codepilot: {}; no completion", e);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Prompt on stdout and read one trimmed line. None on end of input or `/exit`.
fn read_input(prompt: &str) -> anyhow::Result<Option<String>> {
    let mut stdout = io::stdout();
    write!(stdout, "{}", prompt)?;
    stdout.flush()?;
    let mut line = String::new();
    if io::stdin().read_line(&mut line)? == 0 {
        return Ok(None);
    }
    let input = line.trim();
    if input.eq_ignore_ascii_case("/exit") || input.eq_ignore_ascii_case("/quit") {
        return Ok(None);
    }
    Ok(Some(input.to_string()))
}

fn print_chunk(chunk: &str) {
    let mut stdout = io::stdout();
    let _ = stdout.write_all(chunk.as_bytes());
    let _ = stdout.flush();
}

async fn run_chat(config_path: Option<PathBuf>, system: Option<String>) -> anyhow::Result<()> {
    let (config, _) = config::load_config(config_path)?;
    let cache = Arc::new(DetectionCache::new());
    let factory = ClientFactory::new(RequestCategory::Instruction, Arc::clone(&cache));
    ensure_detected(&config, &factory, &cache).await?;
    let settings = config.request_settings(RequestCategory::Instruction);

    let mut history = system.map(Conversation::with_system).unwrap_or_default();
    while let Some(input) = read_input("> ")? {
        if input.is_empty() {
            continue;
        }
        let mark = history.len();
        history.push_user(input);
        let request = ChatRequest {
            settings: &settings,
            messages: history.turns(),
            tools: &[],
            think: config.agent.think,
        };
        match factory.chat(request, &mut |s: &str| print_chunk(s)).await {
            Ok(result) => {
                println!();
                if result.truncated {
                    eprintln!("(reply cut at num_predict)");
                }
                history.push_assistant(result.content, Vec::new());
            }
            Err(e) => {
                println!();
                eprintln!("chat error: {}", e);
                history.truncate(mark);
            }
        }
    }
    Ok(())
}

/// One user message through the agent loop. A failed run leaves no partial turns behind.
#[allow(clippy::too_many_arguments)]
async fn agent_exchange<B: LlmBackend + ?Sized>(
    backend: &B,
    settings: &RequestSettings,
    history: &mut Conversation,
    registry: &ToolRegistry,
    config: AgentConfig,
    input: String,
    on_chunk: &mut (dyn for<'a> FnMut(&'a str) + Send),
    cancel: &CancellationToken,
) -> Result<AgentOutcome, AgentError> {
    let mark = history.len();
    history.push_user(input);
    let outcome = agent::run_turn(backend, settings, history, registry, config, on_chunk, cancel).await;
    if outcome.is_err() {
        history.truncate(mark);
    }
    outcome
}

async fn run_agent(config_path: Option<PathBuf>, root: Option<PathBuf>) -> anyhow::Result<()> {
    let (config, _) = config::load_config(config_path)?;
    let cache = Arc::new(DetectionCache::new());
    let factory = ClientFactory::new(RequestCategory::Instruction, Arc::clone(&cache));
    ensure_detected(&config, &factory, &cache).await?;
    let settings = config.request_settings(RequestCategory::Instruction);

    let root = match root {
        Some(r) => r,
        None => std::env::current_dir().context("resolving current directory")?,
    };
    let registry = tools::workspace_tools(root.clone())?;
    log::info!("agent: tools {:?} rooted at {}", registry.names(), root.display());

    let mut history = Conversation::with_system(format!(
        "You are a coding assistant. The workspace root is {}. Use the tools to inspect files before answering.",
        root.display()
    ));
    while let Some(input) = read_input("agent> ")? {
        if input.is_empty() {
            continue;
        }
        let cancel = CancellationToken::new();
        let on_interrupt = cancel.clone();
        let watcher = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                on_interrupt.cancel();
            }
        });
        let outcome = agent_exchange(
            &factory,
            &settings,
            &mut history,
            &registry,
            config.agent.to_agent_config(),
            input,
            &mut |s: &str| print_chunk(s),
            &cancel,
        )
        .await;
        watcher.abort();
        println!();

        match outcome {
            Ok(outcome) => match outcome.stop {
                StopReason::Answered => {
                    log::debug!(
                        "agent: answered after {} round(s), {} tool call(s)",
                        outcome.rounds,
                        outcome.tool_calls_made
                    );
                }
                StopReason::RoundBudgetExhausted => eprintln!(
                    "(stopped after {} rounds; the model still wanted tools)",
                    outcome.rounds
                ),
                StopReason::Cancelled => eprintln!("(cancelled)"),
            },
            Err(e) => eprintln!("agent error: {}", e),
        }
    }
    Ok(())
}
