use anyhow::{Context, Result};
use clap::Parser;

use patchup::infra::config;
use patchup::infra::logging::init_session_logging;
use patchup::llm::{LlmClient, OpenAiClient};
use patchup::session::{client, stream::SessionBus, Session, SessionOptions};
use patchup::Cli;

fn main() -> Result<std::process::ExitCode> {
    let cli = Cli::parse();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build runtime")?;

    let code = runtime.block_on(run(cli))?;
    Ok(std::process::ExitCode::from(code))
}

async fn run(cli: Cli) -> Result<u8> {
    let cwd = match cli.cwd {
        Some(dir) => dunce::canonicalize(&dir)
            .with_context(|| format!("Invalid --cwd {}", dir.display()))?,
        None => std::env::current_dir().context("Could not determine working directory")?,
    };

    if cli.init_config {
        let path = config::init_config_file(&cwd, false)?;
        println!("Created config file at {}", path.display());
        return Ok(0);
    }

    let log_path = init_session_logging()?;
    tracing::info!("session log at {}", log_path.display());

    let mut settings = config::load_settings(&cwd)?;
    if let Some(model) = cli.model {
        settings.model = model;
    }
    if let Some(prompt_tokens) = cli.prompt_tokens {
        settings.prompt_tokens = prompt_tokens;
    }
    if cli.auto_context {
        settings.auto_context = true;
    }
    if let Some(auto_tokens) = cli.auto_tokens {
        settings.auto_tokens = auto_tokens;
    }
    if cli.no_embeddings {
        settings.use_embeddings = false;
    }
    if let Some(format) = cli.format {
        settings.format = format;
    }
    if let Some(max_file_chars) = cli.max_file_chars {
        settings.max_file_chars = max_file_chars;
    }

    let llm = LlmClient::OpenAi(
        OpenAiClient::new(
            &settings.base_url,
            config::api_key(),
            &settings.model,
            &settings.embedding_model,
            settings.temperature,
        )
        .map_err(|e| anyhow::anyhow!("Failed to build provider client: {e}"))?,
    );

    let bus = SessionBus::new();
    let options = SessionOptions {
        cwd,
        paths: cli.paths,
        exclude: cli.exclude,
        ignore: cli.ignore,
        diff: cli.diff,
        pr_diff: cli.pr_diff,
        agent: cli.agent,
    };
    let session = Session::new(options, settings, llm, bus.clone())?;

    // The client is the only other task; it owns stdin and signals
    let local = tokio::task::LocalSet::new();
    let client_task = local.spawn_local(client::run(bus));

    let code = local
        .run_until(async move {
            let code = session.run().await;
            let _ = client_task.await;
            code
        })
        .await;

    Ok(code.clamp(0, u8::MAX as i32) as u8)
}
