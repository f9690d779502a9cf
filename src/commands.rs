//! Command dispatch.
//!
//! Every command is a [`Handler`] registered under its name. Commands that act
//! on behalf of a user implement [`UserHandler`] instead and are registered
//! wrapped in [`LoggedIn`], which resolves the configured current user first.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, ConfigError};
use crate::db::{Database, StoreError, User};
use crate::fetcher::Fetcher;
use crate::handlers;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("{0}")]
    Config(String),

    #[error("not logged in: {0}")]
    Unauthenticated(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error(transparent)]
    Store(StoreError),

    #[error(transparent)]
    Settings(#[from] ConfigError),
}

impl From<StoreError> for CommandError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => CommandError::NotFound(what),
            other => CommandError::Store(other),
        }
    }
}

/// Shared resources handed to every command.
pub struct State {
    pub db: Arc<Database>,
    pub config: Config,
    pub fetcher: Fetcher,
    pub shutdown: CancellationToken,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub name: String,
    pub args: Vec<String>,
}

impl Command {
    pub fn new(name: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }

    /// The argument at `index`, or a usage error naming what is missing.
    pub fn arg(&self, index: usize, what: &str) -> Result<&str, CommandError> {
        self.args
            .get(index)
            .map(String::as_str)
            .ok_or_else(|| CommandError::Config(format!("{}: {} is required", self.name, what)))
    }
}

#[async_trait]
pub trait Handler: Send + Sync {
    async fn run(&self, state: &mut State, cmd: &Command) -> Result<(), CommandError>;
}

#[async_trait]
pub trait UserHandler: Send + Sync {
    async fn run(&self, state: &mut State, cmd: &Command, user: User) -> Result<(), CommandError>;
}

/// Resolve the configured current user, failing with `Unauthenticated`.
pub async fn current_user(state: &State) -> Result<User, CommandError> {
    let name = state.config.current_user_name.as_deref().ok_or_else(|| {
        CommandError::Unauthenticated("no current user, run `register` or `login`".to_string())
    })?;

    match state.db.get_user_by_name(name).await {
        Ok(user) => Ok(user),
        Err(StoreError::NotFound(_)) => Err(CommandError::Unauthenticated(format!(
            "user '{}' does not exist",
            name
        ))),
        Err(e) => Err(e.into()),
    }
}

/// Runs the inner handler with the resolved current user.
pub struct LoggedIn<H>(pub H);

#[async_trait]
impl<H: UserHandler> Handler for LoggedIn<H> {
    async fn run(&self, state: &mut State, cmd: &Command) -> Result<(), CommandError> {
        let user = current_user(state).await?;
        self.0.run(state, cmd, user).await
    }
}

#[derive(Default)]
pub struct Commands {
    handlers: HashMap<String, Box<dyn Handler>>,
}

impl Commands {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H: Handler + 'static>(&mut self, name: &str, handler: H) {
        self.handlers.insert(name.to_string(), Box::new(handler));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub async fn run(&self, state: &mut State, cmd: &Command) -> Result<(), CommandError> {
        let handler = self
            .handlers
            .get(&cmd.name)
            .ok_or_else(|| CommandError::UnknownCommand(cmd.name.clone()))?;
        handler.run(state, cmd).await
    }
}

/// The full command table.
pub fn registry() -> Commands {
    let mut commands = Commands::new();
    commands.register("login", handlers::Login);
    commands.register("register", handlers::Register);
    commands.register("reset", handlers::Reset);
    commands.register("users", handlers::Users);
    commands.register("agg", handlers::Agg);
    commands.register("feeds", handlers::Feeds);
    commands.register("addfeed", LoggedIn(handlers::AddFeed));
    commands.register("follow", LoggedIn(handlers::Follow));
    commands.register("following", LoggedIn(handlers::Following));
    commands.register("unfollow", LoggedIn(handlers::Unfollow));
    commands.register("browse", LoggedIn(handlers::Browse));
    commands
}
