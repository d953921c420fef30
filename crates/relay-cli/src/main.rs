//! relay - token-budgeted chat bot, driven from the terminal

mod config;
mod console;

use anyhow::{Context, bail};
use clap::Parser;
use relay_ai::providers::{ensure_model, openai::OpenAIProvider};
use relay_chat::{CommandInvocation, InboundMessage, TurnOrchestrator, TurnOutcome};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// relay - chat with a model under per-channel token budgets
#[derive(Parser, Debug)]
#[command(name = "relay")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file (default: ~/.config/relay/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// User id the console speaks as
    #[arg(short, long, default_value = "console")]
    user: String,

    /// Server to chat on (default: first configured)
    #[arg(long)]
    server: Option<String>,

    /// Channel to chat in (default: first configured on the server)
    #[arg(long)]
    channel: Option<String>,

    /// Run in non-interactive mode with a single prompt
    #[arg(short = 'c', long)]
    command: Option<String>,

    /// Wait for whole answers instead of streaming them
    #[arg(long)]
    no_stream: bool,

    /// Skip checking that the configured model exists
    #[arg(long)]
    skip_model_check: bool,

    /// Initialize config file
    #[arg(long)]
    init_config: bool,
}

/// Where console input is posted
struct Destination {
    server_id: String,
    channel_id: String,
    user_id: String,
}

impl Destination {
    fn message(&self, content: &str) -> InboundMessage {
        InboundMessage {
            id: uuid::Uuid::new_v4().to_string(),
            server_id: self.server_id.clone(),
            channel_id: self.channel_id.clone(),
            author_id: self.user_id.clone(),
            content: content.to_string(),
            from_self: false,
        }
    }

    fn command(&self, name: &str) -> CommandInvocation {
        CommandInvocation {
            server_id: self.server_id.clone(),
            user_id: self.user_id.clone(),
            name: name.to_string(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Logs go to stderr so they never interleave with answers
    let filter = if args.verbose {
        EnvFilter::new("relay=debug,relay_ai=debug,relay_chat=debug")
    } else {
        EnvFilter::from_default_env()
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let path = config::config_path(args.config.as_deref());

    if args.init_config {
        let path = config::init(&path)?;
        println!("Config file created at: {}", path.display());
        println!("\nExample config:\n{}", config::example_config());
        return Ok(());
    }

    let cfg = config::Config::load(&path)
        .with_context(|| format!("loading config from {}", path.display()))?;

    let mut settings = cfg.settings().context("invalid server configuration")?;
    if args.no_stream {
        settings.streaming = false;
    }

    let destination = resolve_destination(&cfg, &args)?;

    let api_key = cfg.api_key().context(
        "no OpenAI API key found; set [openai] token in the config, RELAY_OPENAI_TOKEN or OPENAI_API_KEY",
    )?;
    let mut provider = OpenAIProvider::new(api_key);
    if let Some(ref base_url) = cfg.openai.base_url {
        provider = provider.with_base_url(base_url);
    }
    let provider = Arc::new(provider);

    if !args.skip_model_check {
        ensure_model(provider.as_ref(), &settings.model_id)
            .await
            .with_context(|| format!("model {} is not available", settings.model_id))?;
    }

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::debug!("interrupt received");
                cancel.cancel();
            }
        }
    });

    let orchestrator = TurnOrchestrator::new(
        Arc::new(settings),
        provider,
        Arc::new(console::ConsoleDelivery::stdout()),
    )
    .with_tokenizer(cfg.tokenizer())
    .with_costs(Arc::new(cfg.cost_estimator()))
    .with_localizer(Arc::new(cfg.localizer()))
    .with_cancel_token(cancel.clone());

    if let Some(command) = args.command {
        println!("relay> {}", command);
        let outcome = orchestrator
            .handle_message(&destination.message(&command))
            .await;
        println!();
        return match outcome {
            TurnOutcome::Failed(err) => Err(err.into()),
            _ => Ok(()),
        };
    }

    run_interactive(&orchestrator, &destination, &cancel).await
}

/// Pick the server and channel console input goes to
fn resolve_destination(cfg: &config::Config, args: &Args) -> anyhow::Result<Destination> {
    let server = match args.server {
        Some(ref id) => cfg.servers.iter().find(|s| &s.id == id),
        None => cfg.servers.first(),
    };
    let Some(server) = server else {
        bail!("no chat server configured; run `relay --init-config` and edit the file");
    };

    let channel = match args.channel {
        Some(ref id) => server.chat_channels.iter().find(|c| &c.id == id),
        None => server.chat_channels.first(),
    };
    let Some(channel) = channel else {
        bail!("no chat channel configured on server {}", server.id);
    };

    Ok(Destination {
        server_id: server.id.clone(),
        channel_id: channel.id.clone(),
        user_id: args.user.clone(),
    })
}

async fn run_interactive(
    orchestrator: &TurnOrchestrator,
    destination: &Destination,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    if std::io::IsTerminal::is_terminal(&std::io::stderr()) {
        eprintln!(
            "relay ({}) on {}/{} as {}",
            orchestrator.settings().model_id,
            destination.server_id,
            destination.channel_id,
            destination.user_id
        );
        eprintln!();
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        io::stdout().flush()?;

        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line?,
        };
        // EOF
        let Some(line) = line else {
            break;
        };

        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        if let Some(name) = input.strip_prefix('/') {
            if name == "exit" || name == "quit" {
                break;
            }
            match orchestrator.handle_command(&destination.command(name)).await {
                Ok(Some(notice)) => println!("{}: {}", notice.title, notice.description),
                Ok(None) => println!("Unknown command: /{}", name),
                Err(e) => eprintln!("Error: {}", e),
            }
            continue;
        }

        let outcome = orchestrator
            .handle_message(&destination.message(input))
            .await;
        println!();
        if let TurnOutcome::Completed(report) = outcome {
            tracing::debug!(
                prompt_tokens = report.prompt_tokens,
                response_tokens = report.response_tokens,
                cost = report.cost,
                messages = report.messages,
                "turn completed"
            );
        }
        if cancel.is_cancelled() {
            break;
        }
    }

    Ok(())
}
