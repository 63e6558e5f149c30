//! Response gate: asks the model whether the bot should speak at all.
//!
//! The gate sends the last few channel lines to a cheaper model with a
//! yes/no system prompt and reads back a small JSON verdict:
//!
//! ```json
//! { "shouldRespond": true, "respondReason": "they asked me directly" }
//! ```
//!
//! Anything other than a clean boolean means "stay quiet".

use rand::Rng;
use serde_json::Value;
use thiserror::Error;

use crate::llm::{CompletionClient, CompletionError, strip_code_fences};

/// Odds of an eager roll: one in this many.
pub const EAGER_ODDS: u32 = 10;

/// Which system prompt the gate uses this turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateMode {
    /// Speak only when clearly addressed.
    Conservative,
    /// Also speak when the topic is one the bot would talk about.
    Eager,
}

#[derive(Debug, Error)]
pub enum GateError {
    #[error("gate completion failed: {0}")]
    Completion(#[from] CompletionError),
    #[error("unusable gate verdict: {0}")]
    Verdict(String),
}

/// The model's verdict for one inbound line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateDecision {
    pub respond: bool,
    pub reason: String,
}

/// Roll the 1-in-[`EAGER_ODDS`] dice.
pub fn roll_eager() -> bool {
    rand::thread_rng().gen_range(1..=EAGER_ODDS) == 1
}

/// System prompt for the gate call.
pub fn system_prompt(bot_name: &str, mode: GateMode) -> String {
    let topical = match mode {
        GateMode::Eager => {
            " Even if you are not mentioned, if it seems like the conversation is a topic you would talk about, return true."
        }
        GateMode::Conservative => "",
    };
    format!(
        "You are {bot_name}, a participant in a chat room.\n\
         Based on the following series of messages, give me a boolean indicating if you SHOULD respond to the last message in the stream.\n\
         If your name was mentioned, but it seems like you should not respond based on context, return false.{topical}\n\
         Give the response in valid JSON format like follows:\n\
         {{ \"shouldRespond\": boolean, \"respondReason\": string }}\n\n\
         shouldRespond is the boolean that indicates if {bot_name} should respond.\n\
         respondReason is the reasoning behind the boolean."
    )
}

/// Parse the model's verdict text.
pub fn parse_verdict(text: &str) -> Result<GateDecision, GateError> {
    let cleaned = strip_code_fences(text);
    let value: Value = serde_json::from_str(cleaned.trim())
        .map_err(|e| GateError::Verdict(format!("not JSON: {e}")))?;
    let respond = value
        .get("shouldRespond")
        .and_then(Value::as_bool)
        .ok_or_else(|| GateError::Verdict("missing boolean shouldRespond".to_string()))?;
    let reason = value
        .get("respondReason")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    Ok(GateDecision { respond, reason })
}

/// The gate itself. Borrows the completion client for its one call.
pub struct Gate<'a> {
    pub client: &'a CompletionClient,
    pub bot_name: &'a str,
    pub model: &'a str,
}

impl Gate<'_> {
    /// Ask the model about `history` (already clipped to the context window).
    pub async fn decide(&self, history: &[String], mode: GateMode) -> Result<GateDecision, GateError> {
        let joined = history.join("\n");
        tracing::debug!(?mode, history = %joined, "Checking whether to respond");
        let text = self
            .client
            .complete(&system_prompt(self.bot_name, mode), &joined, self.model)
            .await?;
        tracing::debug!(verdict = %text, "Gate verdict");
        parse_verdict(&text)
    }

    /// [`Gate::decide`], failing closed: any error is logged and means no.
    pub async fn should_respond(&self, history: &[String], mode: GateMode) -> bool {
        match self.decide(history, mode).await {
            Ok(decision) => {
                tracing::info!(respond = decision.respond, reason = %decision.reason, "Gate decided");
                decision.respond
            }
            Err(e) => {
                tracing::warn!(error = %e, "Gate failed, staying quiet");
                false
            }
        }
    }
}
