//! ircgpt-bot: an IRC regular backed by a chat-completion model.
//!
//! The bot keeps a short memory of the channel, asks a cheap model whether
//! the latest line calls for an answer, and if so asks a better one what to
//! say.
//!
//! - [`config`]: YAML settings
//! - [`llm`]: chat-completions client
//! - [`gate`]: the "should I respond" check
//! - [`memory`]: bounded conversation buffer
//! - [`output`]: reply line splitting
//! - [`bot`]: IRC event dispatch

pub mod bot;
pub mod config;
pub mod gate;
pub mod llm;
pub mod memory;
pub mod output;
