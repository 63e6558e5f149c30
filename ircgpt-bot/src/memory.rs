//! Conversation memory: the bounded list of recent channel lines.
//!
//! Every entry is a `"speaker: text"` line, oldest first. The buffer, its
//! capacity, and the gate's eager-mode counter live behind one lock, so a
//! snapshot taken to build a prompt never observes a half-applied update.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::gate::GateMode;

/// Messages that must pass before the gate may go eager again.
pub const EAGER_COOLDOWN: u32 = 5;

#[derive(Debug)]
struct State {
    lines: VecDeque<String>,
    capacity: usize,
    /// Turns since the gate last used the eager prompt.
    since_eager: u32,
}

/// Shared conversation state for one channel.
#[derive(Debug)]
pub struct Conversation {
    state: Mutex<State>,
}

/// Format a chat line the way it is stored and shown to the model.
pub fn entry(speaker: &str, text: &str) -> String {
    format!("{speaker}: {text}")
}

impl Conversation {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(State {
                lines: VecDeque::new(),
                capacity,
                // Starts at the cooldown, so the first eager roll needs one
                // more conservative turn before it can land.
                since_eager: EAGER_COOLDOWN,
            }),
        }
    }

    /// Append one line. May leave the buffer over capacity until the next
    /// [`Conversation::trim_to_capacity`].
    pub fn append(&self, line: impl Into<String>) {
        self.state.lock().lines.push_back(line.into());
    }

    /// Evict oldest lines until the buffer fits. Returns how many were dropped.
    pub fn trim_to_capacity(&self) -> usize {
        let mut state = self.state.lock();
        Self::trim_locked(&mut state)
    }

    /// Append and trim under one acquisition.
    pub fn record(&self, line: impl Into<String>) {
        let mut state = self.state.lock();
        state.lines.push_back(line.into());
        Self::trim_locked(&mut state);
    }

    fn trim_locked(state: &mut State) -> usize {
        let excess = state.lines.len().saturating_sub(state.capacity);
        state.lines.drain(..excess);
        excess
    }

    /// Forget everything. The eager counter is left alone.
    pub fn clear(&self) {
        self.state.lock().lines.clear();
    }

    /// Change the capacity (after a config reload). Does not trim.
    pub fn set_capacity(&self, capacity: usize) {
        self.state.lock().capacity = capacity;
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    pub fn len(&self) -> usize {
        self.state.lock().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().lines.is_empty()
    }

    /// Snapshot of the buffer, oldest first.
    pub fn lines(&self) -> Vec<String> {
        self.state.lock().lines.iter().cloned().collect()
    }

    /// The last `n` lines of the buffer followed by `incoming`, for the gate.
    /// `n` is clipped to what's available.
    pub fn context_with(&self, incoming: &str, n: usize) -> Vec<String> {
        let state = self.state.lock();
        let total = state.lines.len() + 1;
        let take = n.min(total);
        let skip = total - take;
        state
            .lines
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(incoming))
            .skip(skip)
            .map(str::to_string)
            .collect()
    }

    /// The reply prompt: every buffered line, then an open `"BotName: "` turn.
    pub fn prompt(&self, bot_name: &str) -> String {
        let state = self.state.lock();
        let mut out = String::new();
        for line in &state.lines {
            out.push_str(line);
            out.push('\n');
        }
        out.push_str(bot_name);
        out.push_str(": ");
        out
    }

    /// Pick the gate prompt for this turn. `hit` is the 1-in-10 roll.
    ///
    /// Eager mode needs the roll to land and more than [`EAGER_COOLDOWN`]
    /// turns since the last eager one; it then resets the counter. Every
    /// other turn bumps the counter and stays conservative.
    pub fn choose_gate_mode(&self, hit: bool) -> GateMode {
        let mut state = self.state.lock();
        if hit && state.since_eager > EAGER_COOLDOWN {
            state.since_eager = 0;
            GateMode::Eager
        } else {
            state.since_eager = state.since_eager.saturating_add(1);
            GateMode::Conservative
        }
    }
}
