//! Named command registry
//!
//! The inference stage and the Lua sandbox both dispatch assistant-issued
//! commands through this registry. Handlers are injected closures, so the
//! registry carries no compiled-in knowledge of concrete hardware.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Instant;

/// Outcome of a command or script execution
#[derive(Debug, Clone, Default)]
pub struct CommandResult {
    /// Whether the command succeeded
    pub success: bool,

    /// Human-readable output or diagnostic
    pub message: String,
}

impl CommandResult {
    /// Successful result with a message
    #[must_use]
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    /// Failed result with a diagnostic
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// Name and description of a registered command, for prompt building
#[derive(Debug, Clone)]
pub struct CommandInfo {
    /// Command name as the model must emit it
    pub name: String,

    /// One-line description
    pub description: String,
}

/// Handler closure for a named command
pub type CommandHandler = Box<dyn Fn(&[String]) -> CommandResult + Send + Sync>;

struct CommandEntry {
    description: String,
    handler: CommandHandler,
}

/// Registry of named commands with descriptions
pub struct CommandRegistry {
    commands: RwLock<HashMap<String, CommandEntry>>,
    started: Instant,
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRegistry {
    /// Empty registry with only the system introspection builtins
    #[must_use]
    pub fn new() -> Self {
        let registry = Self {
            commands: RwLock::new(HashMap::new()),
            started: Instant::now(),
        };
        registry.register_builtins();
        registry
    }

    /// Register a command; returns false (and keeps the existing
    /// handler) if the name is already taken
    pub fn register(
        &self,
        name: &str,
        description: &str,
        handler: CommandHandler,
    ) -> bool {
        let Ok(mut commands) = self.commands.write() else {
            return false;
        };
        if commands.contains_key(name) {
            tracing::warn!(name, "command already registered");
            return false;
        }
        commands.insert(
            name.to_string(),
            CommandEntry {
                description: description.to_string(),
                handler,
            },
        );
        true
    }

    /// Execute a command by name
    #[must_use]
    pub fn execute(&self, name: &str, args: &[String]) -> CommandResult {
        let Ok(commands) = self.commands.read() else {
            return CommandResult::failed("command registry unavailable");
        };
        match commands.get(name) {
            Some(entry) => {
                tracing::debug!(name, ?args, "executing command");
                (entry.handler)(args)
            }
            None => CommandResult::failed(format!("unknown command: {name}")),
        }
    }

    /// Registered commands sorted by name
    #[must_use]
    pub fn list(&self) -> Vec<CommandInfo> {
        let Ok(commands) = self.commands.read() else {
            return Vec::new();
        };
        let mut infos: Vec<CommandInfo> = commands
            .iter()
            .map(|(name, entry)| CommandInfo {
                name: name.clone(),
                description: entry.description.clone(),
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    fn register_builtins(&self) {
        self.register("ping", "liveness check", Box::new(|_| CommandResult::ok("pong")));

        let started = self.started;
        self.register(
            "uptime",
            "seconds since startup",
            Box::new(move |_| CommandResult::ok(format!("{}s", started.elapsed().as_secs()))),
        );
    }
}
