//! Turning a model reply into IRC lines.
//!
//! Replies come back as free text, sometimes with blank lines, leading
//! spaces, or the bot's own `"name: "` prefix copied from the prompt.
//! Each surviving line must also fit an IRC message, so long ones are
//! wrapped on word boundaries.

/// Longest line (in bytes) the bot posts in one PRIVMSG.
pub const MAX_LINE_LEN: usize = 384;

/// Split a reply into the lines the bot will post, in order.
pub fn reply_lines(reply: &str, bot_name: &str) -> Vec<String> {
    let self_prefix = format!("{bot_name}: ");
    let mut out = Vec::new();
    for raw in reply.split('\n') {
        let line = raw.trim_end_matches('\r').trim_start_matches(' ');
        let line = line.strip_prefix(self_prefix.as_str()).unwrap_or(line);
        if line.trim().is_empty() {
            continue;
        }
        out.extend(wrap_line(line, MAX_LINE_LEN));
    }
    out
}

/// Wrap one line into chunks of at most `max_len` bytes, breaking only on
/// spaces. A single word longer than `max_len` is kept whole on its own.
pub fn wrap_line(line: &str, max_len: usize) -> Vec<String> {
    if line.len() <= max_len {
        return vec![line.to_string()];
    }
    let mut result = Vec::new();
    let mut current = String::new();
    for word in line.split(' ').filter(|w| !w.is_empty()) {
        if !current.is_empty() && current.len() + 1 + word.len() > max_len {
            result.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        result.push(current);
    }
    result
}
