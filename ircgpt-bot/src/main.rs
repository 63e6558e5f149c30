//! ircgpt-bot: joins one IRC channel and chats through a completion API.
//!
//! All settings come from the YAML config file (`config.yml` by default).
//! Log verbosity follows `RUST_LOG`.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use ircgpt_sdk::client::{self, ConnectConfig, ReconnectConfig};

use ircgpt_bot::bot::Bot;
use ircgpt_bot::config::{Config, DEFAULT_CONFIG_PATH};

#[derive(Parser)]
#[command(name = "ircgpt-bot", about = "IRC bot backed by a chat-completion model")]
struct Args {
    /// Path to the YAML config file
    #[arg(long, env = "IRCGPT_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ircgpt_bot=info,ircgpt_sdk=info".into()),
        )
        .init();

    let args = Args::parse();
    let config = Config::load(&args.config).context("Failed to load config")?;

    tracing::info!(
        server = %config.server_addr(),
        nick = %config.bot_name,
        channel = %config.chat_room,
        memory = config.memory_size,
        "Starting ircgpt-bot"
    );

    let connect = ConnectConfig {
        server_addr: config.server_addr(),
        nick: config.bot_name.clone(),
        user: config.bot_name.clone(),
        realname: config.bot_name.clone(),
        tls: config.use_tls,
        tls_insecure: config.tls_insecure,
    };

    let bot = Bot::spawn(args.config.clone(), config)?;
    let handler_bot = bot.clone();

    tokio::select! {
        result = client::run_with_reconnect(connect, ReconnectConfig::default(), move |handle, event| {
            let bot = handler_bot.clone();
            Box::pin(async move { bot.handle_event(&handle, event).await })
        }) => result,
        err = bot.fatal_error() => {
            bot.shutdown("Bye").await;
            tokio::time::sleep(Duration::from_millis(500)).await;
            Err(anyhow::Error::new(err).context("Config reload failed"))
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
            bot.shutdown("Bye").await;
            // Give the QUIT a moment to reach the wire.
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(())
        }
    }
}
