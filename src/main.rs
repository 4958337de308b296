//! llm-session: chat with a local model from the terminal.
//!
//! Runs one-shot (`--prompt`) or as a line-oriented REPL. Ctrl-C stops the
//! response being generated without ending the session.

use std::io::Write;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use llm_session::config::{Cli, Config};
use llm_session::inference::stub::StubEngine;
use llm_session::session::streaming::{spawn_generation, GenerationEvent};
use llm_session::{Engine, InferenceSession};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging. Logs go to stderr, responses to stdout.
    let filter = if cli.verbose {
        "llm_session=debug"
    } else {
        "llm_session=info"
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());
    if cli.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    }

    info!("llm-session v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let mut config = Config::load(&cli.config)?;
    if let Some(model) = cli.model {
        config.model.model_path = model;
    }

    info!(
        model = %config.model.model_path.display(),
        context_size = config.sampling.context_size,
        persist_history = config.sampling.persist_history,
        "Configuration loaded"
    );

    // No native engine is linked into this binary; the stub echoes prompts back.
    let engine = Arc::new(StubEngine::echo());
    let mut session =
        InferenceSession::load(engine, &config.model.model_path, config.sampling.clone())?;

    if let Some(system) = &cli.system {
        session.add_system_prompt(system)?;
    }

    match cli.prompt {
        Some(prompt) => session = run_turn(session, prompt).await?,
        None => {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                print!("> ");
                std::io::stdout().flush()?;
                let Some(line) = lines.next_line().await? else {
                    break;
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if line == "/quit" {
                    break;
                }
                session = run_turn(session, line.to_string()).await?;
            }
        }
    }

    if cli.metrics {
        print!("{}", session.render_metrics());
    }
    session.close()?;

    Ok(())
}

/// Stream one response to stdout, stopping it on Ctrl-C.
async fn run_turn<E: Engine + 'static>(
    session: InferenceSession<E>,
    prompt: String,
) -> anyhow::Result<InferenceSession<E>> {
    let mut stream = spawn_generation(session, prompt);
    let mut stdout = std::io::stdout();

    loop {
        tokio::select! {
            event = stream.recv() => match event {
                Some(GenerationEvent::Token { text }) => {
                    print!("{text}");
                    stdout.flush()?;
                }
                Some(GenerationEvent::Done {
                    reason,
                    completion_tokens,
                    context_used,
                    tokens_per_second,
                }) => {
                    println!();
                    info!(
                        ?reason,
                        completion_tokens,
                        context_used,
                        tokens_per_second,
                        "Response complete"
                    );
                }
                Some(GenerationEvent::Error(e)) => error!("Generation failed: {e}"),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping generation");
                stream.stop();
            }
        }
    }

    Ok(stream.finish().await?)
}
