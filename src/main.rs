use std::path::PathBuf;

use agent_runtime::{ResolveFlags, Runner};
use clap::Parser;

/// Run an agent once against the configured environment.
#[derive(Parser, Debug)]
#[command(name = "agent-runtime", version, about)]
struct Cli {
    /// Path to the agent source (.ts, .js, ...).
    agent_path: PathBuf,

    /// Agent configuration as a JSON object. Defaults to ~/.nearai/config.json.
    config: Option<String>,

    /// Use the local development endpoint.
    #[arg(long)]
    local: bool,

    /// User message registered before the agent runs. Repeatable.
    #[arg(short, long = "message")]
    messages: Vec<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // stdout carries the reply.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> agent_runtime::Result<()> {
    let runner = Runner::from_env();
    let flags = ResolveFlags { local: cli.local };
    let prepared = runner
        .run(&cli.agent_path, cli.config.as_deref(), &flags)
        .await?;

    for message in cli.messages {
        prepared.env.set_local_user_message(message).await;
    }

    match prepared.invoke().await? {
        Some(reply) => println!("{}", reply),
        None => tracing::info!("Agent returned no reply"),
    }
    Ok(())
}
