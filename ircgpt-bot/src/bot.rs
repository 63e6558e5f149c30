//! Event dispatch: what the bot does with each IRC event.
//!
//! Channel messages go onto a bounded queue. One consumer drains it in
//! arrival order and runs up to `MaxConcurrentReplies` turns at a time, so
//! with the default of one the bot answers strictly in order and has at
//! most one completion call in flight.
//!
//! A turn:
//! 1. ask the gate about the last few lines plus the new one
//! 2. record the new line
//! 3. if the gate said yes, prompt the model with the whole buffer, post
//!    each reply line, and record each posted line
//! 4. trim the buffer back to capacity

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{Semaphore, mpsc, watch};

use ircgpt_sdk::client::ClientHandle;
use ircgpt_sdk::event::Event;

use crate::config::{Config, ConfigError};
use crate::gate::{self, Gate};
use crate::llm::{CompletionClient, CompletionError};
use crate::memory::{Conversation, entry};
use crate::output::reply_lines;

/// Posted after rejoining from a kick.
pub const KICK_NOTICE: &str = "I was kicked from the room. My memory has been cleared.";
/// Pause before rejoining after a kick.
pub const KICK_REJOIN_DELAY: Duration = Duration::from_secs(5);

/// One channel line waiting for its turn.
#[derive(Clone)]
pub struct Inbound {
    pub from: String,
    pub text: String,
    /// Connection the line arrived on; replies go back over it.
    pub handle: ClientHandle,
}

/// How a turn ended.
#[derive(Debug)]
pub enum TurnOutcome {
    /// Gate said no (or failed); the line was only recorded.
    Silent,
    /// These lines were posted, in order.
    Replied { lines: Vec<String> },
    /// Gate said yes but the reply call failed. Nothing was posted.
    Failed(CompletionError),
}

pub struct Bot {
    config_path: PathBuf,
    config: RwLock<Arc<Config>>,
    client: RwLock<Arc<CompletionClient>>,
    conversation: Conversation,
    /// Nick confirmed by the server; may differ from `BotName` after a clash.
    nick: Mutex<Option<String>>,
    /// Most recent connection, for shutdown.
    handle: Mutex<Option<ClientHandle>>,
    queue: mpsc::Sender<Inbound>,
    kick_delay: Duration,
    /// Set once a reload hits a config that can't be parsed.
    fatal: watch::Sender<Option<Arc<ConfigError>>>,
}

impl Bot {
    /// Build the bot and start its queue consumer.
    pub fn spawn(config_path: PathBuf, config: Config) -> Result<Arc<Self>> {
        Self::spawn_with_kick_delay(config_path, config, KICK_REJOIN_DELAY)
    }

    pub fn spawn_with_kick_delay(
        config_path: PathBuf,
        config: Config,
        kick_delay: Duration,
    ) -> Result<Arc<Self>> {
        let client = CompletionClient::from_config(&config)?;
        let (queue, rx) = mpsc::channel(config.queue_depth.max(1));
        let concurrency = config.max_concurrent_replies.max(1);
        let bot = Arc::new(Self {
            config_path,
            conversation: Conversation::new(config.memory_size),
            config: RwLock::new(Arc::new(config)),
            client: RwLock::new(Arc::new(client)),
            nick: Mutex::new(None),
            handle: Mutex::new(None),
            queue,
            kick_delay,
            fatal: watch::channel(None).0,
        });
        tokio::spawn(Arc::clone(&bot).run_queue(rx, concurrency));
        Ok(bot)
    }

    pub fn config(&self) -> Arc<Config> {
        self.config.read().clone()
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    /// Resolves once the bot can't go on. The binary exits with this error.
    pub async fn fatal_error(&self) -> Arc<ConfigError> {
        let mut rx = self.fatal.subscribe();
        loop {
            if let Some(e) = rx.borrow_and_update().clone() {
                return e;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    fn client(&self) -> Arc<CompletionClient> {
        self.client.read().clone()
    }

    fn is_self(&self, nick: &str) -> bool {
        if let Some(ref current) = *self.nick.lock()
            && current.eq_ignore_ascii_case(nick)
        {
            return true;
        }
        self.config().bot_name.eq_ignore_ascii_case(nick)
    }

    /// React to one event from the IRC client.
    pub async fn handle_event(&self, handle: &ClientHandle, event: Event) -> Result<()> {
        *self.handle.lock() = Some(handle.clone());

        match event {
            Event::Connected => tracing::info!("Connected"),

            Event::Registered { nick } => {
                let config = self.config();
                tracing::info!(%nick, channel = %config.chat_room, "Registered, joining");
                *self.nick.lock() = Some(nick);
                handle.join(&config.chat_room).await?;
            }

            Event::Joined { channel, nick } if self.is_self(&nick) => {
                tracing::info!(%channel, "Joined");
            }

            Event::Kicked { channel, nick, by, reason } if self.is_self(&nick) => {
                tracing::warn!(%channel, %by, %reason, "Kicked");
                self.recover_from_kick(handle).await?;
            }

            Event::Message { from, target, text } => {
                if self.is_self(&from) {
                    return Ok(());
                }
                if !target.eq_ignore_ascii_case(&self.config().chat_room) {
                    return Ok(());
                }
                self.enqueue(Inbound { from, text, handle: handle.clone() });
            }

            Event::Notice { from, target, text } => {
                tracing::debug!(%from, %target, %text, "Notice, not answering");
            }

            Event::ServerNotice { text } => tracing::debug!(%text, "Server notice"),

            Event::Disconnected { reason } => tracing::warn!(%reason, "Disconnected"),

            _ => {}
        }
        Ok(())
    }

    /// Queue a line for a turn. When the queue is full the line is recorded
    /// as plain history and never considered for a reply.
    pub fn enqueue(&self, inbound: Inbound) {
        match self.queue.try_send(inbound) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(inbound)) => {
                tracing::warn!(from = %inbound.from, "Reply queue full, recording without a turn");
                self.conversation.record(entry(&inbound.from, &inbound.text));
            }
            Err(mpsc::error::TrySendError::Closed(inbound)) => {
                tracing::error!(from = %inbound.from, "Reply queue consumer is gone, recording without a turn");
                self.conversation.record(entry(&inbound.from, &inbound.text));
            }
        }
    }

    async fn run_queue(self: Arc<Self>, mut rx: mpsc::Receiver<Inbound>, concurrency: usize) {
        let permits = Arc::new(Semaphore::new(concurrency));
        while let Some(inbound) = rx.recv().await {
            let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                break;
            };
            let bot = Arc::clone(&self);
            tokio::spawn(async move {
                let outcome = bot.process(&inbound).await;
                tracing::debug!(from = %inbound.from, ?outcome, "Turn finished");
                drop(permit);
            });
        }
    }

    /// Run one turn for `inbound`.
    pub async fn process(&self, inbound: &Inbound) -> TurnOutcome {
        let config = self.config();
        let client = self.client();
        let line = entry(&inbound.from, &inbound.text);

        let history = self.conversation.context_with(&line, config.context_lines);
        let mode = self.conversation.choose_gate_mode(gate::roll_eager());
        let gate = Gate {
            client: &client,
            bot_name: &config.bot_name,
            model: &config.should_respond_model,
        };
        let respond = gate.should_respond(&history, mode).await;

        self.conversation.append(line);
        let outcome = if respond {
            self.reply(&config, &client, &inbound.handle).await
        } else {
            TurnOutcome::Silent
        };

        let evicted = self.conversation.trim_to_capacity();
        if evicted > 0 {
            tracing::debug!(evicted, "Trimmed conversation memory");
        }
        outcome
    }

    async fn reply(&self, config: &Config, client: &CompletionClient, handle: &ClientHandle) -> TurnOutcome {
        let prompt = self.conversation.prompt(&config.bot_name);
        tracing::debug!(%prompt, "Reply prompt");

        let text = match client
            .complete(&config.bot_context, &prompt, &config.response_model)
            .await
        {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(error = %e, transient = e.is_transient(), "Reply completion failed");
                return TurnOutcome::Failed(e);
            }
        };

        let mut posted = Vec::new();
        for line in reply_lines(&text, &config.bot_name) {
            if let Err(e) = handle.privmsg(&config.chat_room, &line).await {
                tracing::warn!(error = %e, "Connection gone mid-reply");
                break;
            }
            self.conversation.append(entry(&config.bot_name, &line));
            posted.push(line);
        }
        TurnOutcome::Replied { lines: posted }
    }

    /// Wait, reload config, forget everything, rejoin, and say so.
    ///
    /// A config file that no longer parses stops the bot instead.
    async fn recover_from_kick(&self, handle: &ClientHandle) -> Result<()> {
        tokio::time::sleep(self.kick_delay).await;
        if let Err(e) = self.reload() {
            tracing::error!(error = %e, "Config reload failed after kick");
            let e = Arc::new(e);
            self.fatal.send_replace(Some(Arc::clone(&e)));
            return Err(e.into());
        }

        let config = self.config();
        self.conversation.clear();
        self.conversation.set_capacity(config.memory_size);

        handle.join(&config.chat_room).await?;
        handle.privmsg(&config.chat_room, KICK_NOTICE).await?;
        Ok(())
    }

    /// Re-read the config file over the current settings.
    ///
    /// An unreadable file leaves everything as it was. A file that doesn't
    /// parse is returned as [`ConfigError::Parse`].
    pub fn reload(&self) -> Result<(), ConfigError> {
        let config = match self.config().reread(&self.config_path) {
            Ok(c) => c,
            Err(e @ ConfigError::Read { .. }) => {
                tracing::warn!(error = %e, "Config unreadable, keeping current settings");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        match CompletionClient::from_config(&config) {
            Ok(client) => *self.client.write() = Arc::new(client),
            Err(e) => {
                tracing::warn!(error = %e, "Couldn't rebuild completion client, keeping current settings");
                return Ok(());
            }
        }
        tracing::info!(path = %self.config_path.display(), "Config reloaded");
        *self.config.write() = Arc::new(config);
        Ok(())
    }

    /// Say goodbye on the current connection, if any.
    pub async fn shutdown(&self, message: &str) {
        let handle = self.handle.lock().clone();
        if let Some(handle) = handle {
            let _ = handle.quit(Some(message)).await;
        }
    }
}
