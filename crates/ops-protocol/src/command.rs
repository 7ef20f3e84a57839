//! Command vocabulary understood by the agent
//!
//! The gateway only ever sends a single bare token over `exec`. The agent
//! maps it through its allow-list; anything it does not know is answered
//! with [`unknown_command_reply`].

use std::fmt;

/// Stream the configured log files
pub const COMMAND_LOGS: &str = "logs";

/// Stream a system monitor
pub const COMMAND_PROCESS: &str = "process";

/// A command token parsed from an `exec` request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandToken {
    /// The command name (first word of the request)
    name: String,
    /// Words following the name. Never forwarded to a process.
    ignored: Vec<String>,
}

impl CommandToken {
    /// Parse the raw `exec` payload. Returns `None` for an empty request.
    pub fn parse(raw: &[u8]) -> Option<Self> {
        let text = String::from_utf8_lossy(raw);
        let mut words = text.split_whitespace();
        let name = words.next()?.to_string();
        let ignored = words.map(str::to_string).collect();
        Some(Self { name, ignored })
    }

    /// The command name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Arguments the client sent along with the name
    pub fn ignored_args(&self) -> &[String] {
        &self.ignored
    }
}

impl fmt::Display for CommandToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Reply line for a token outside the allow-list
pub fn unknown_command_reply(token: &str) -> String {
    format!("{} <- Unknown command.", token)
}
