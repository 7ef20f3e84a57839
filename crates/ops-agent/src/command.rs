//! Allow-listed command table
//!
//! Every token a client may send maps to exactly one fixed invocation.
//! Nothing the client sends besides the token reaches the process.

use std::collections::BTreeMap;

use ops_core::config::AgentConfig;
use ops_protocol::{CommandToken, COMMAND_LOGS, COMMAND_PROCESS};

use crate::runner::ProcessRunner;

/// Sent ahead of each screen of a repainting command
pub const CLEAR_SCREEN: &str = "\x1b[2J\x1b[1;1H";

/// Header that opens every `top -b` screen
const TOP_HEADER: &str = "top -";

/// A fixed local invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// Executable
    pub program: String,
    /// Fixed arguments
    pub args: Vec<String>,
    /// Stdout line prefix that starts a new screen
    pub repaint_on: Option<String>,
}

impl CommandSpec {
    /// Create a spec
    pub fn new<I>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            repaint_on: None,
        }
    }

    /// Clear the client's screen before every stdout line starting with
    /// `prefix`
    pub fn repaint_on(mut self, prefix: impl Into<String>) -> Self {
        self.repaint_on = Some(prefix.into());
        self
    }

    /// A runner for this invocation
    pub fn runner(&self) -> ProcessRunner {
        ProcessRunner::new(&self.program).args(self.args.iter().cloned())
    }
}

/// Result of looking a request up in the table
#[derive(Debug)]
pub enum Dispatch<'a> {
    /// No command was given
    Empty,
    /// Token is not on the allow-list
    Unknown(CommandToken),
    /// Token maps to a process
    Run {
        token: CommandToken,
        spec: &'a CommandSpec,
    },
}

/// Process-wide immutable mapping from token to invocation
#[derive(Debug, Clone, Default)]
pub struct CommandTable {
    entries: BTreeMap<String, CommandSpec>,
}

impl CommandTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard vocabulary: `logs` and `process`
    pub fn from_config(config: &AgentConfig) -> Self {
        let mut tail_args = vec!["-f".to_string()];
        tail_args.extend(
            config
                .log_files
                .iter()
                .map(|path| path.display().to_string()),
        );

        Self::new()
            .with(COMMAND_LOGS, CommandSpec::new("tail", tail_args))
            .with(
                COMMAND_PROCESS,
                CommandSpec::new(
                    "top",
                    ["-b".to_string(), "-d".to_string(), config.monitor_interval.to_string()],
                )
                .repaint_on(TOP_HEADER),
            )
    }

    /// Add or replace an entry
    pub fn with(mut self, name: impl Into<String>, spec: CommandSpec) -> Self {
        self.entries.insert(name.into(), spec);
        self
    }

    /// Look up a token
    pub fn get(&self, name: &str) -> Option<&CommandSpec> {
        self.entries.get(name)
    }

    /// Known tokens
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Classify a request
    pub fn dispatch(&self, request: Option<CommandToken>) -> Dispatch<'_> {
        let Some(token) = request else {
            return Dispatch::Empty;
        };

        match self.entries.get(token.name()) {
            Some(spec) => Dispatch::Run { token, spec },
            None => Dispatch::Unknown(token),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_default_vocabulary() {
        let mut config = AgentConfig::default();
        config.log_files = vec![PathBuf::from("/tmp/a.log"), PathBuf::from("/tmp/b.log")];
        let table = CommandTable::from_config(&config);

        assert_eq!(table.names().collect::<Vec<_>>(), vec!["logs", "process"]);
        assert_eq!(
            table.get("logs").unwrap(),
            &CommandSpec::new("tail", ["-f", "/tmp/a.log", "/tmp/b.log"])
        );
        assert_eq!(
            table.get("process").unwrap(),
            &CommandSpec::new("top", ["-b", "-d", "2"]).repaint_on("top -")
        );
    }

    #[test]
    fn test_dispatch() {
        let table = CommandTable::new().with("logs", CommandSpec::new("true", Vec::<String>::new()));

        assert!(matches!(table.dispatch(None), Dispatch::Empty));
        assert!(matches!(
            table.dispatch(CommandToken::parse(b"foo")),
            Dispatch::Unknown(token) if token.name() == "foo"
        ));
        assert!(matches!(
            table.dispatch(CommandToken::parse(b"logs")),
            Dispatch::Run { spec, .. } if spec.program == "true"
        ));
    }

    #[test]
    fn test_client_arguments_never_reach_the_spec() {
        let table = CommandTable::new().with("logs", CommandSpec::new("tail", ["-f", "/var/log/x"]));

        match table.dispatch(CommandToken::parse(b"logs /etc/shadow")) {
            Dispatch::Run { token, spec } => {
                assert_eq!(token.ignored_args(), &["/etc/shadow"]);
                assert_eq!(spec.args, vec!["-f", "/var/log/x"]);
            }
            other => panic!("unexpected dispatch: {:?}", other),
        }
    }
}
