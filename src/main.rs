use std::error::Error;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use parlance::collab::Disabled;
use parlance::core::capability::capability_suffix;
use parlance::probe::ConnectionProber;
use parlance::server::{router, ServerState};

#[derive(Parser)]
#[command(name = "parlance")]
#[command(about = "Chat orchestration engine for self-hosted and cloud LLM backends")]
#[command(
    long_about = "Parlance streams chat completions from OpenAI-compatible local servers \
(Ollama, LM Studio, text-generation-webui) and managed cloud providers through one \
SSE contract, with persona/framework/linguistic prompt presets.\n\n\
Environment Variables:\n\
  RUST_LOG          Log filter (e.g. parlance=debug)"
)]
struct Args {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the streaming chat server (the default)
    Serve {
        /// Address to bind
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        /// Port to listen on
        #[arg(short, long, default_value_t = 8098)]
        port: u16,
    },
    /// List models available at an inference endpoint
    Models {
        /// Base URL of the endpoint (e.g. http://localhost:11434)
        base_url: String,
        /// API key, if the endpoint requires one
        #[arg(short = 'k', long)]
        api_key: Option<String>,
    },
    /// Check whether an inference endpoint is reachable
    Probe {
        /// Base URL of the endpoint
        base_url: String,
        /// API key, if the endpoint requires one
        #[arg(short = 'k', long)]
        api_key: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let client = reqwest::Client::new();

    match args.command.unwrap_or(Commands::Serve {
        host: "127.0.0.1".to_string(),
        port: 8098,
    }) {
        Commands::Serve { host, port } => {
            let state = ServerState {
                client,
                searcher: Arc::new(Disabled),
            };
            let addr = format!("{host}:{port}");
            let listener = tokio::net::TcpListener::bind(&addr).await?;
            tracing::info!(addr = %addr, "listening");
            axum::serve(listener, router(state)).await?;
        }
        Commands::Models { base_url, api_key } => {
            let prober = ConnectionProber::new(client);
            let models = prober.list_models(&base_url, api_key.as_deref()).await;
            if models.is_empty() {
                println!("No models reported by {base_url}");
            } else {
                for model in models {
                    println!("{model}{}", capability_suffix(&model));
                }
            }
        }
        Commands::Probe { base_url, api_key } => {
            let prober = ConnectionProber::new(client);
            if prober.probe(&base_url, api_key.as_deref()).await {
                println!("{base_url}: online");
            } else {
                println!("{base_url}: offline");
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
