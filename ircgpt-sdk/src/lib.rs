//! ircgpt-sdk: a small async IRC client.
//!
//! Handles the TCP/TLS connection, registration, keepalive, and turns
//! server lines into [`event::Event`]s. Consumers send commands through a
//! cloneable [`client::ClientHandle`].

pub mod client;
pub mod event;
pub mod irc;
