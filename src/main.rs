use std::io::IsTerminal;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use weft_gateway::config::GatewayConfig;
use weft_gateway::runtime::echo::{EchoResolver, EchoRuntime};

#[derive(Parser)]
#[command(name = "weft", about = "Session-streaming gateway for agent runtimes")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server (default)
    Serve,

    /// Print the web auth token
    Token,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Token) => print_token(),
        Some(Commands::Serve) | None => serve().await,
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn serve() -> anyhow::Result<()> {
    let config = GatewayConfig::load()?;
    // The echo runtime stands in until a real agent runtime is attached.
    weft_gateway::run_gateway(config, Arc::new(EchoResolver), Arc::new(EchoRuntime)).await
}

fn print_token() -> anyhow::Result<()> {
    let config = GatewayConfig::load()?;
    let token = weft_gateway::auth::get_or_create_token(&config.auth_file())?;
    println!("{}", token.as_str());
    Ok(())
}
