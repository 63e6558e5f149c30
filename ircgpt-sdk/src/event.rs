//! Events emitted by the IRC client for the bot layer to consume.

/// Events that the SDK emits to the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Socket is up; registration has been sent.
    Connected,

    /// IRC registration complete (001). `nick` is our confirmed nick.
    Registered {
        nick: String,
    },

    /// Someone (possibly us) joined a channel.
    Joined {
        channel: String,
        nick: String,
    },

    /// Someone left a channel.
    Parted {
        channel: String,
        nick: String,
    },

    /// A PRIVMSG in a channel or private message.
    Message {
        from: String,
        target: String,
        text: String,
    },

    /// A NOTICE from a user. Never to be answered automatically.
    Notice {
        from: String,
        target: String,
        text: String,
    },

    /// Someone was kicked from a channel.
    Kicked {
        channel: String,
        nick: String,
        by: String,
        reason: String,
    },

    /// Server notice, error numeric, or MOTD line.
    ServerNotice {
        text: String,
    },

    /// Connection was closed.
    Disconnected {
        reason: String,
    },
}
