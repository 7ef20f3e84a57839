//! Shared agent state

use std::sync::Arc;

use ops_core::config::AgentConfig;

use crate::auth::Authenticator;
use crate::command::CommandTable;

/// State shared by every connection
pub struct AgentState {
    /// Configuration
    pub config: AgentConfig,
    /// Allow-listed commands
    pub commands: Arc<CommandTable>,
    /// Authentication policy
    pub auth: Authenticator,
}

impl AgentState {
    /// Build state with the standard command table
    pub fn new(config: AgentConfig, auth: Authenticator) -> Self {
        let commands = Arc::new(CommandTable::from_config(&config));
        Self::with_commands(config, auth, commands)
    }

    /// Build state with a custom command table
    pub fn with_commands(config: AgentConfig, auth: Authenticator, commands: Arc<CommandTable>) -> Self {
        Self {
            config,
            commands,
            auth,
        }
    }
}
