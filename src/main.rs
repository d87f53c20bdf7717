//! `ollama-gateway`: operator CLI over the gateway client.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use futures::StreamExt;

use ollama_gateway::gateway::config::{expand_tilde, find_config_path, load_gateway_config};
use ollama_gateway::gateway::{
    ChatFragment, ChatMessage, ChatRequest, FragmentStream, GatewayClient, GatewayConfig,
    GenerateRequest, NormalizedResponse,
};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to gateway.yaml (default: search upward for config/gateway.yaml)
    #[arg(short, long, global = true, env = "OLLAMA_GATEWAY_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Probe endpoints and show the active selection
    Status,
    /// List models installed on the active endpoint
    Models,
    /// Show details of one model
    Show { name: String },
    /// Pull a model onto the active endpoint
    Pull { name: String },
    /// Send a one-turn chat
    Chat {
        prompt: String,
        /// System prompt prepended to the conversation
        #[arg(long)]
        system: Option<String>,
        #[command(flatten)]
        opts: RequestOpts,
    },
    /// Send a raw generate request
    Generate {
        prompt: String,
        #[arg(long)]
        system: Option<String>,
        #[command(flatten)]
        opts: RequestOpts,
    },
}

#[derive(Args)]
struct RequestOpts {
    /// Model identifier (default from config)
    #[arg(short, long)]
    model: Option<String>,
    #[arg(short, long)]
    temperature: Option<f32>,
    #[arg(long)]
    max_tokens: Option<u32>,
    /// Print tokens as they arrive
    #[arg(short, long)]
    stream: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let config = load_config(cli.config.as_deref())?;
    let log_dir = config
        .log_dir
        .as_deref()
        .map(|d| PathBuf::from(expand_tilde(d)));
    if let Err(e) = ollama_gateway::init_tracing(log_dir.as_deref()) {
        eprintln!("warning: file logging disabled: {e}");
    }

    let client = GatewayClient::from_config(&config)?;
    match cli.command {
        Commands::Status => status(&client).await,
        Commands::Models => models(&client).await,
        Commands::Show { name } => {
            let detail = client.show_model(&name).await?;
            println!("{}", serde_json::to_string_pretty(&detail)?);
            Ok(())
        }
        Commands::Pull { name } => pull(&client, &name).await,
        Commands::Chat {
            prompt,
            system,
            opts,
        } => chat(&client, prompt, system, opts).await,
        Commands::Generate {
            prompt,
            system,
            opts,
        } => generate(&client, prompt, system, opts).await,
    }
}

fn load_config(explicit: Option<&std::path::Path>) -> Result<GatewayConfig> {
    if let Some(path) = explicit {
        return load_gateway_config(path)
            .with_context(|| format!("loading config from {}", path.display()));
    }
    let cwd = std::env::current_dir().context("reading current directory")?;
    match find_config_path(&cwd) {
        Ok(path) => Ok(load_gateway_config(&path)?),
        Err(_) => {
            eprintln!("note: no config/gateway.yaml found, using built-in LAN/WAN endpoints");
            Ok(GatewayConfig::default())
        }
    }
}

async fn status(client: &GatewayClient) -> Result<()> {
    let selection = client.ensure_active().await?;
    println!(
        "active: {} ({}) latency {} ms, verified {}",
        selection.endpoint.label,
        selection.endpoint.base_url,
        selection.latency.as_millis(),
        selection.verified_at_utc.format("%Y-%m-%d %H:%M:%S UTC"),
    );
    println!(
        "health cache ttl {}s",
        client.registry().health_cache_ttl().as_secs()
    );
    for endpoint in client.registry().endpoints() {
        println!(
            "  [{}] {} {} timeout {}s",
            endpoint.priority,
            endpoint.label,
            endpoint.base_url,
            endpoint.timeout.as_secs()
        );
    }
    Ok(())
}

async fn models(client: &GatewayClient) -> Result<()> {
    let models = client.list_models().await?;
    if models.is_empty() {
        println!("no models installed");
    }
    for m in models {
        println!(
            "{:<32} {:>8} {:<8} {:.1} GB",
            m.name,
            m.parameter_size,
            m.quantization_level,
            m.size_bytes as f64 / 1e9
        );
    }
    Ok(())
}

async fn pull(client: &GatewayClient, name: &str) -> Result<()> {
    let mut progress = client.pull_model(name).await?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                eprintln!("\ncancelled");
                return Ok(());
            }
            next = progress.next() => match next {
                Some(Ok(p)) if p.total > 0 => println!("{} {:.1}%", p.status, p.percent),
                Some(Ok(p)) => println!("{}", p.status),
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(()),
            }
        }
    }
}

async fn chat(
    client: &GatewayClient,
    prompt: String,
    system: Option<String>,
    opts: RequestOpts,
) -> Result<()> {
    let defaults = client.defaults();
    let mut messages = Vec::new();
    if let Some(system) = system {
        messages.push(ChatMessage::system(system));
    }
    messages.push(ChatMessage::user(prompt));

    let mut request = ChatRequest::new(opts.model.unwrap_or_else(|| defaults.model.clone()), messages)
        .with_temperature(opts.temperature.unwrap_or(defaults.temperature));
    if let Some(max) = opts.max_tokens.or(defaults.max_tokens) {
        request = request.with_max_tokens(max);
    }

    if opts.stream {
        print_stream(client.chat_stream(&request).await?).await
    } else {
        print_response(client.chat(&request).await?);
        Ok(())
    }
}

async fn generate(
    client: &GatewayClient,
    prompt: String,
    system: Option<String>,
    opts: RequestOpts,
) -> Result<()> {
    let defaults = client.defaults();
    let mut request = GenerateRequest::new(opts.model.unwrap_or_else(|| defaults.model.clone()), prompt)
        .with_temperature(opts.temperature.unwrap_or(defaults.temperature));
    if let Some(system) = system {
        request = request.with_system(system);
    }
    if let Some(max) = opts.max_tokens.or(defaults.max_tokens) {
        request = request.with_max_tokens(max);
    }

    if opts.stream {
        print_stream(client.generate_stream(&request).await?).await
    } else {
        print_response(client.generate(&request).await?);
        Ok(())
    }
}

fn print_response(response: NormalizedResponse) {
    println!("{}", response.content);
    eprintln!(
        "[{} {} ms{}]",
        response.meta.endpoint,
        response.meta.latency_ms,
        if response.meta.coerced { ", coerced" } else { "" }
    );
}

/// Print fragments as they arrive. Ctrl-C returns, dropping the stream and
/// with it the upstream connection.
async fn print_stream(mut fragments: FragmentStream) -> Result<()> {
    let mut stdout = std::io::stdout();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                eprintln!("\ncancelled");
                return Ok(());
            }
            next = fragments.next() => match next {
                Some(ChatFragment::Content(text)) => {
                    stdout.write_all(text.as_bytes())?;
                    stdout.flush()?;
                }
                Some(ChatFragment::Error { message }) => {
                    println!();
                    anyhow::bail!("stream interrupted: {message}");
                }
                Some(ChatFragment::Done) | None => {
                    println!();
                    return Ok(());
                }
            }
        }
    }
}
