//! salonbot: a messaging front desk that books salon appointments.

mod backends;
mod channels;
mod clock;
mod config;
mod context_store;
mod debounce;
mod gateway;
mod history;
mod interpreter;
mod outbound;
mod prompt;
mod reply;
mod routes;
mod server;
mod store;
mod tenants;
mod turn;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

#[derive(Debug, Parser)]
#[command(name = "salonbot", version, about = "Salon booking assistant for messaging channels")]
struct Cli {
    /// Config file (defaults to $SALONBOT_CONFIG or ~/.salonbot/config.toml).
    #[arg(long, global = true, env = "SALONBOT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the server (default).
    Serve,
    /// Validate config and check that every backend can be built.
    Doctor,
    /// One-shot send to a recipient via a tenant's channel.
    Send {
        tenant: String,
        channel: String,
        recipient: String,
        message: String,
    },
    /// Print the conversation key for a raw sender address.
    Normalize { tenant: String, raw: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing()?;
    install_panic_hook();

    let cli = Cli::parse();
    let config = cli.config;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => server::serve(config).await,
        Command::Doctor => server::doctor(config).await,
        Command::Send {
            tenant,
            channel,
            recipient,
            message,
        } => server::send_one_shot(config, &tenant, &channel, &recipient, &message).await,
        Command::Normalize { tenant, raw } => server::normalize(config, &tenant, &raw).await,
    }
}

fn init_tracing() -> anyhow::Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(v) => v,
        Err(_) => EnvFilter::new(
            "info,salonbot=debug,sb_app=debug,sb_booking=debug,sb_channels=debug,sb_llm=debug,tower_http=info",
        ),
    };
    let log_format = std::env::var("SALONBOT_LOG_FORMAT")
        .unwrap_or_else(|_| "json".to_string())
        .to_ascii_lowercase();

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    match log_format.as_str() {
        "json" => builder
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(false)
            .init(),
        "pretty" => builder.pretty().init(),
        "compact" => builder.compact().init(),
        other => {
            return Err(anyhow::anyhow!(
                "unsupported SALONBOT_LOG_FORMAT={other:?}; expected one of: json, pretty, compact"
            ));
        }
    }

    tracing::info!(log_format = %log_format, "tracing initialized");
    Ok(())
}

fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}", loc.file(), loc.line()))
            .unwrap_or_else(|| "unknown".to_string());
        let payload = panic_payload(panic_info.payload());
        tracing::error!(panic_location = %location, panic_payload = %payload, "panic captured");
        default_hook(panic_info);
    }));
}

fn panic_payload(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        return msg.to_string();
    }
    if let Some(msg) = payload.downcast_ref::<String>() {
        return msg.clone();
    }
    "non-string panic payload".to_string()
}
