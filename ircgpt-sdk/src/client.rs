//! IRC client connection and event loop.
//!
//! This is the main entry point for SDK consumers. It manages the TCP
//! connection, optional TLS, IRC registration, keepalive, and emits events.
//!
//! ## Reconnection
//!
//! [`connect_with_stream`] runs a single session. Use
//! [`run_with_reconnect`] to keep a bot online across disconnects with
//! exponential backoff (2→4→8→16→30s cap).

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls;

use crate::event::Event;
use crate::irc::Message;

/// Configuration for connecting to an IRC server.
#[derive(Debug, Clone)]
pub struct ConnectConfig {
    /// Server address (host:port).
    pub server_addr: String,
    /// Desired nickname.
    pub nick: String,
    /// Username (ident).
    pub user: String,
    /// Real name.
    pub realname: String,
    /// Use TLS.
    pub tls: bool,
    /// Skip TLS certificate verification (for self-signed certs).
    pub tls_insecure: bool,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:6667".to_string(),
            nick: "ircgpt".to_string(),
            user: "ircgpt".to_string(),
            realname: "ircgpt".to_string(),
            tls: false,
            tls_insecure: false,
        }
    }
}

/// Commands the consumer can send to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Join(String),
    Privmsg { target: String, text: String },
    Quit(Option<String>),
}

/// A handle to a running IRC client connection.
#[derive(Clone)]
pub struct ClientHandle {
    cmd_tx: mpsc::Sender<Command>,
}

impl ClientHandle {
    /// Wrap a command sender. The protocol task owns the receiving end;
    /// anything else holding it sees exactly what would go on the wire.
    pub fn new(cmd_tx: mpsc::Sender<Command>) -> Self {
        Self { cmd_tx }
    }

    pub async fn join(&self, channel: &str) -> Result<()> {
        self.cmd_tx.send(Command::Join(channel.to_string())).await?;
        Ok(())
    }

    pub async fn privmsg(&self, target: &str, text: &str) -> Result<()> {
        self.cmd_tx
            .send(Command::Privmsg {
                target: target.to_string(),
                text: text.to_string(),
            })
            .await?;
        Ok(())
    }

    pub async fn quit(&self, message: Option<&str>) -> Result<()> {
        self.cmd_tx
            .send(Command::Quit(message.map(|s| s.to_string())))
            .await?;
        Ok(())
    }
}

/// Establish TCP (and optionally TLS) connection to the server.
///
/// Kept separate from [`connect_with_stream`] so connection errors surface
/// to the caller before any events are emitted.
pub async fn establish_connection(config: &ConnectConfig) -> Result<EstablishedConnection> {
    // Auto-detect TLS from port if not explicitly set
    let use_tls = config.tls || config.server_addr.ends_with(":6697");
    let mode = if use_tls { "TLS" } else { "plain" };

    tracing::debug!("Resolving {}...", config.server_addr);
    let tcp = TcpStream::connect(&config.server_addr)
        .await
        .with_context(|| format!("TCP connect to {} failed", config.server_addr))?;
    tracing::debug!("TCP connected to {} ({mode})", config.server_addr);

    if !use_tls {
        return Ok(EstablishedConnection::Plain(tcp));
    }

    let tls_config = if config.tls_insecure {
        tracing::debug!("TLS: insecure mode (skipping cert verification)");
        rustls_insecure_config()
    } else {
        tracing::debug!("TLS: verifying server certificate...");
        rustls_default_config()
    };
    let connector = TlsConnector::from(Arc::new(tls_config));
    let server_name = config
        .server_addr
        .rsplit_once(':')
        .map(|(host, _)| host)
        .unwrap_or(&config.server_addr);
    let dns_name = rustls::pki_types::ServerName::try_from(server_name.to_string())?;
    let tls_stream = connector
        .connect(dns_name, tcp)
        .await
        .with_context(|| format!("TLS handshake with {} failed", config.server_addr))?;
    tracing::debug!("TLS handshake complete");
    Ok(EstablishedConnection::Tls(Box::new(tls_stream)))
}

/// A connection that has completed TCP (and optionally TLS) but hasn't
/// started IRC registration yet.
pub enum EstablishedConnection {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

/// Connect using an already-established connection.
///
/// Returns a handle for sending commands and a receiver for events.
/// The IRC protocol runs in a spawned task.
pub fn connect_with_stream(
    conn: EstablishedConnection,
    config: ConnectConfig,
) -> (ClientHandle, mpsc::Receiver<Event>) {
    let (event_tx, event_rx) = mpsc::channel(4096);
    let (cmd_tx, cmd_rx) = mpsc::channel(256);
    let handle = ClientHandle::new(cmd_tx);

    tokio::spawn(async move {
        let _ = event_tx.send(Event::Connected).await;
        let result = match conn {
            EstablishedConnection::Plain(tcp) => {
                let (reader, writer) = tokio::io::split(tcp);
                run_irc(BufReader::new(reader), writer, &config, event_tx.clone(), cmd_rx).await
            }
            EstablishedConnection::Tls(tls) => {
                let (reader, writer) = tokio::io::split(*tls);
                run_irc(BufReader::new(reader), writer, &config, event_tx.clone(), cmd_rx).await
            }
        };
        if let Err(e) = result {
            let _ = event_tx
                .send(Event::Disconnected {
                    reason: e.to_string(),
                })
                .await;
        }
    });

    (handle, event_rx)
}

fn install_crypto_provider() {
    // ring when explicitly selected, aws-lc-rs otherwise.
    #[cfg(feature = "ring")]
    {
        let _ = rustls::crypto::ring::default_provider().install_default();
    }
    #[cfg(all(feature = "aws-lc-rs", not(feature = "ring")))]
    {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    }
}

fn rustls_default_config() -> rustls::ClientConfig {
    install_crypto_provider();
    let root_store =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth()
}

fn rustls_insecure_config() -> rustls::ClientConfig {
    install_crypto_provider();
    rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(InsecureVerifier))
        .with_no_client_auth()
}

#[derive(Debug)]
struct InsecureVerifier;

impl rustls::client::danger::ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::CryptoProvider::get_default()
            .map(|p| p.signature_verification_algorithms.supported_schemes())
            .unwrap_or_default()
    }
}

/// Drive one IRC session over an already-connected stream.
///
/// Returns `Ok(())` when the server closes the connection, the keepalive
/// times out, or the consumer quits.
pub async fn run_irc<R, W>(
    mut reader: R,
    mut writer: W,
    config: &ConnectConfig,
    event_tx: mpsc::Sender<Event>,
    mut cmd_rx: mpsc::Receiver<Command>,
) -> Result<()>
where
    R: tokio::io::AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    send_line(&mut writer, Message::new("NICK", vec![config.nick.as_str()])).await?;
    send_line(
        &mut writer,
        Message::new("USER", vec![config.user.as_str(), "0", "*", config.realname.as_str()]),
    )
    .await?;

    let mut registered = false;
    let mut nick_tries: u32 = 0;
    let mut pending_commands: Vec<Command> = Vec::new();

    let mut line_buf: Vec<u8> = Vec::new();
    let mut last_activity = tokio::time::Instant::now();
    let ping_interval = Duration::from_secs(60);
    let ping_timeout = Duration::from_secs(120);

    loop {
        tokio::select! {
            result = reader.read_until(b'\n', &mut line_buf) => {
                let n = result?;
                if n == 0 {
                    let _ = event_tx.send(Event::Disconnected { reason: "EOF".to_string() }).await;
                    break;
                }
                last_activity = tokio::time::Instant::now();
                // Not every client sends UTF-8.
                let line = String::from_utf8_lossy(&line_buf).into_owned();
                line_buf.clear();
                tracing::trace!(line = %line.trim_end(), "<<");

                if let Some(msg) = Message::parse(&line) {
                    match msg.command.as_str() {
                        // ERR_NICKNAMEINUSE
                        "433" if !registered => {
                            nick_tries = nick_tries.saturating_add(1);
                            if nick_tries <= 5 {
                                let alt = format!("{}{}", config.nick, nick_tries);
                                tracing::debug!(nick = %alt, "Nick in use, retrying");
                                send_line(&mut writer, Message::new("NICK", vec![alt.as_str()])).await?;
                            } else {
                                let _ = event_tx.send(Event::Disconnected { reason: "Nick in use".to_string() }).await;
                                break;
                            }
                        }
                        "001" => {
                            let nick = msg.params.first().cloned().unwrap_or_default();
                            let _ = event_tx.send(Event::Registered { nick }).await;
                            registered = true;
                            // Flush any commands that were queued before registration
                            for cmd in pending_commands.drain(..) {
                                execute_command(&mut writer, cmd).await?;
                            }
                        }
                        "PING" => {
                            let token = msg.params.first().map(|s| s.as_str()).unwrap_or("");
                            send_line(&mut writer, Message::new("PONG", vec![token])).await?;
                        }
                        "JOIN" => {
                            let channel = msg.params.first().cloned().unwrap_or_default();
                            let nick = msg.source_nick().unwrap_or("").to_string();
                            let _ = event_tx.send(Event::Joined { channel, nick }).await;
                        }
                        "PART" => {
                            let channel = msg.params.first().cloned().unwrap_or_default();
                            let nick = msg.source_nick().unwrap_or("").to_string();
                            let _ = event_tx.send(Event::Parted { channel, nick }).await;
                        }
                        "KICK" => {
                            if msg.params.len() >= 2 {
                                let channel = msg.params[0].clone();
                                let nick = msg.params[1].clone();
                                let reason = msg.params.get(2).cloned().unwrap_or_default();
                                let by = msg.source_nick().unwrap_or("server").to_string();
                                let _ = event_tx.send(Event::Kicked { channel, nick, by, reason }).await;
                            }
                        }
                        "PRIVMSG" | "NOTICE" => {
                            if msg.params.len() >= 2 {
                                let prefix = msg.prefix.as_deref().unwrap_or("");
                                let text = msg.params[1].clone();
                                let from = msg.source_nick().unwrap_or("").to_string();
                                let target = msg.params[0].clone();
                                let event = if msg.command == "PRIVMSG" {
                                    Event::Message { from, target, text }
                                } else if prefix.contains('!') {
                                    Event::Notice { from, target, text }
                                } else {
                                    // Server NOTICE (no hostmask in prefix)
                                    Event::ServerNotice { text }
                                };
                                let _ = event_tx.send(event).await;
                            }
                        }
                        "ERROR" => {
                            let reason = msg.params.join(" ");
                            let _ = event_tx.send(Event::Disconnected { reason }).await;
                            break;
                        }
                        _ => {
                            // Error numerics surface as notices so they reach the log.
                            if let Ok(num) = msg.command.parse::<u16>()
                                && ((400..600).contains(&num) || num == 372)
                            {
                                let text = if msg.params.len() > 1 {
                                    msg.params[1..].join(" ")
                                } else {
                                    msg.params.join(" ")
                                };
                                let _ = event_tx.send(Event::ServerNotice { text }).await;
                            }
                        }
                    }
                }
            }
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else {
                    // Every handle dropped; nothing left to drive the session.
                    break;
                };
                let quitting = matches!(cmd, Command::Quit(_));
                if registered || quitting {
                    execute_command(&mut writer, cmd).await?;
                    if quitting {
                        writer.flush().await?;
                        break;
                    }
                } else {
                    // Queue until registered
                    pending_commands.push(cmd);
                }
            }
            // Periodic client-to-server PING and timeout detection
            _ = tokio::time::sleep_until(last_activity + ping_interval) => {
                if last_activity.elapsed() > ping_timeout {
                    let _ = event_tx.send(Event::Disconnected { reason: "Ping timeout".to_string() }).await;
                    break;
                }
                send_line(&mut writer, Message::new("PING", vec!["keepalive"])).await?;
            }
        }
    }
    Ok(())
}

async fn send_line<W: AsyncWrite + Unpin>(writer: &mut W, msg: Message) -> Result<()> {
    tracing::trace!(line = %msg, ">>");
    writer.write_all(format!("{msg}\r\n").as_bytes()).await?;
    Ok(())
}

/// Execute a single IRC command on the wire.
async fn execute_command<W: AsyncWrite + Unpin>(writer: &mut W, cmd: Command) -> Result<()> {
    let msg = match cmd {
        Command::Join(channel) => Message::new("JOIN", vec![channel.as_str()]),
        Command::Privmsg { target, text } => {
            // A stray line break would smuggle a second command onto the wire.
            let text = text.replace(['\r', '\n'], " ");
            Message::new("PRIVMSG", vec![target.as_str(), text.as_str()])
        }
        Command::Quit(Some(m)) => Message::new("QUIT", vec![m.as_str()]),
        Command::Quit(None) => Message::new("QUIT", vec![]),
    };
    send_line(writer, msg).await
}

// ── Reconnect helper ──

/// Configuration for automatic reconnection.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Initial delay before first reconnect attempt.
    pub initial_delay: Duration,
    /// Maximum delay between reconnect attempts.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_factor: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
        }
    }
}

impl ReconnectConfig {
    /// Delay to use after `current`, with up to 25% jitter, capped at `max_delay`.
    pub fn next_delay(&self, current: Duration) -> Duration {
        let base = current.as_millis() as u64;
        let jitter = if base / 4 == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..base / 4)
        };
        let next = (base as f64 * self.backoff_factor) as u64 + jitter;
        Duration::from_millis(next.min(self.max_delay.as_millis() as u64))
    }
}

/// Run an event loop with automatic reconnection.
///
/// The `handler` is called for each event. When disconnected, the loop
/// reconnects with exponential backoff. Handler errors are logged and do
/// not end the session. Never returns under normal operation.
pub async fn run_with_reconnect<F>(
    config: ConnectConfig,
    reconnect_config: ReconnectConfig,
    handler: F,
) -> Result<()>
where
    F: Fn(ClientHandle, Event) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send>>
        + Send
        + Sync,
{
    let mut delay = reconnect_config.initial_delay;
    let mut consecutive_failures = 0u32;

    loop {
        let conn = match establish_connection(&config).await {
            Ok(c) => {
                consecutive_failures = 0;
                delay = reconnect_config.initial_delay;
                c
            }
            Err(e) => {
                consecutive_failures += 1;
                tracing::warn!(
                    error = %e,
                    attempt = consecutive_failures,
                    delay_secs = delay.as_secs(),
                    "Connection failed, retrying"
                );
                tokio::time::sleep(delay).await;
                delay = reconnect_config.next_delay(delay);
                continue;
            }
        };

        let (handle, mut events) = connect_with_stream(conn, config.clone());

        while let Some(event) = events.recv().await {
            let disconnected = matches!(&event, Event::Disconnected { .. });
            if let Err(e) = handler(handle.clone(), event).await {
                tracing::error!(error = %e, "Handler error");
            }
            if disconnected {
                break;
            }
        }

        tracing::info!(delay_secs = delay.as_secs(), "Disconnected, will reconnect");
        tokio::time::sleep(delay).await;
        delay = reconnect_config.next_delay(delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn test_config() -> ConnectConfig {
        ConnectConfig {
            nick: "gptbot".to_string(),
            user: "gptbot".to_string(),
            realname: "gptbot".to_string(),
            ..Default::default()
        }
    }

    /// Spawn `run_irc` over an in-memory pipe. Returns the server side of
    /// the pipe, the command sender, and the event receiver.
    fn spawn_session() -> (
        tokio::io::DuplexStream,
        mpsc::Sender<Command>,
        mpsc::Receiver<Event>,
    ) {
        let (client_side, server_side) = tokio::io::duplex(16 * 1024);
        let (event_tx, event_rx) = mpsc::channel(64);
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        tokio::spawn(async move {
            let (reader, writer) = tokio::io::split(client_side);
            let _ = run_irc(BufReader::new(reader), writer, &test_config(), event_tx, cmd_rx).await;
        });
        (server_side, cmd_tx, event_rx)
    }

    async fn read_until(server: &mut tokio::io::DuplexStream, needle: &str) -> String {
        let mut seen = String::new();
        let mut buf = [0u8; 1024];
        while !seen.contains(needle) {
            let n = tokio::time::timeout(Duration::from_secs(2), server.read(&mut buf))
                .await
                .expect("timed out waiting for client output")
                .unwrap();
            assert!(n > 0, "client closed before sending {needle:?}");
            seen.push_str(&String::from_utf8_lossy(&buf[..n]));
        }
        seen
    }

    #[tokio::test]
    async fn registers_and_queues_commands_until_welcome() {
        let (mut server, cmd_tx, mut events) = spawn_session();
        let sent = read_until(&mut server, "USER gptbot 0 * gptbot\r\n").await;
        assert!(sent.starts_with("NICK gptbot\r\n"));

        ClientHandle::new(cmd_tx).join("#chat").await.unwrap();
        server.write_all(b":irc.test 001 gptbot :Welcome\r\n").await.unwrap();

        assert_eq!(
            events.recv().await,
            Some(Event::Registered { nick: "gptbot".to_string() })
        );
        read_until(&mut server, "JOIN #chat\r\n").await;
    }

    #[tokio::test]
    async fn answers_ping() {
        let (mut server, _cmd_tx, _events) = spawn_session();
        read_until(&mut server, "USER").await;
        server.write_all(b"PING :abc123\r\n").await.unwrap();
        read_until(&mut server, "PONG abc123\r\n").await;
    }

    #[tokio::test]
    async fn retries_nick_when_taken() {
        let (mut server, _cmd_tx, _events) = spawn_session();
        read_until(&mut server, "USER").await;
        server
            .write_all(b":irc.test 433 * gptbot :Nickname is already in use\r\n")
            .await
            .unwrap();
        read_until(&mut server, "NICK gptbot1\r\n").await;
    }

    #[tokio::test]
    async fn emits_message_and_kick_events() {
        let (mut server, _cmd_tx, mut events) = spawn_session();
        read_until(&mut server, "USER").await;
        server
            .write_all(b":alice!a@h PRIVMSG #chat :hey gptbot\r\n:op!o@h KICK #chat gptbot :bye\r\n")
            .await
            .unwrap();

        assert_eq!(
            events.recv().await,
            Some(Event::Message {
                from: "alice".to_string(),
                target: "#chat".to_string(),
                text: "hey gptbot".to_string(),
            })
        );
        assert_eq!(
            events.recv().await,
            Some(Event::Kicked {
                channel: "#chat".to_string(),
                nick: "gptbot".to_string(),
                by: "op".to_string(),
                reason: "bye".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn privmsg_newlines_are_flattened() {
        let (mut server, cmd_tx, _events) = spawn_session();
        read_until(&mut server, "USER").await;
        server.write_all(b":irc.test 001 gptbot :Welcome\r\n").await.unwrap();
        ClientHandle::new(cmd_tx)
            .privmsg("#chat", "one\ntwo")
            .await
            .unwrap();
        read_until(&mut server, "PRIVMSG #chat :one two\r\n").await;
    }

    #[tokio::test]
    async fn user_notice_is_not_a_message() {
        let (mut server, _cmd_tx, mut events) = spawn_session();
        read_until(&mut server, "USER").await;
        server
            .write_all(b":otherbot!o@h NOTICE #chat :automated hello\r\n:irc.test NOTICE * :Looking up your hostname\r\n")
            .await
            .unwrap();

        assert_eq!(
            events.recv().await,
            Some(Event::Notice {
                from: "otherbot".to_string(),
                target: "#chat".to_string(),
                text: "automated hello".to_string(),
            })
        );
        assert_eq!(
            events.recv().await,
            Some(Event::ServerNotice { text: "Looking up your hostname".to_string() })
        );
    }

    #[tokio::test]
    async fn invalid_utf8_line_does_not_end_session() {
        let (mut server, _cmd_tx, mut events) = spawn_session();
        read_until(&mut server, "USER").await;
        server
            .write_all(b":bob!b@h PRIVMSG #chat :caf\xe9\r\n:alice!a@h PRIVMSG #chat :still there?\r\n")
            .await
            .unwrap();

        assert_eq!(
            events.recv().await,
            Some(Event::Message {
                from: "bob".to_string(),
                target: "#chat".to_string(),
                text: "caf\u{FFFD}".to_string(),
            })
        );
        assert_eq!(
            events.recv().await,
            Some(Event::Message {
                from: "alice".to_string(),
                target: "#chat".to_string(),
                text: "still there?".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn quit_is_sent_and_ends_session() {
        let (mut server, cmd_tx, _events) = spawn_session();
        read_until(&mut server, "USER").await;
        ClientHandle::new(cmd_tx).quit(Some("Bye")).await.unwrap();
        read_until(&mut server, "QUIT Bye\r\n").await;
    }

    #[tokio::test]
    async fn eof_reports_disconnect() {
        let (mut server, _cmd_tx, mut events) = spawn_session();
        read_until(&mut server, "USER").await;
        drop(server);
        let mut last = None;
        while let Some(ev) = events.recv().await {
            last = Some(ev);
        }
        assert!(matches!(last, Some(Event::Disconnected { .. })));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let rc = ReconnectConfig::default();
        let d = rc.next_delay(Duration::from_secs(2));
        assert!(d >= Duration::from_secs(4) && d < Duration::from_millis(4500));
        assert_eq!(rc.next_delay(Duration::from_secs(30)), Duration::from_secs(30));
    }
}
